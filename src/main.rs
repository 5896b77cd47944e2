//! modsuite CLI - module-based test suite runner.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use modsuite::config::{self, Config};
use modsuite::device::{HostDevice, InvocationContext};
use modsuite::framework::shell::ShellModuleLoader;
use modsuite::listener::ResultForwarder;
use modsuite::log_saver::FileLogSaver;
use modsuite::report::{ConsoleReporter, JUnitReporter, ResultReporter};
use modsuite::suite::module::PreparerOwnership;
use modsuite::suite::scheduler::run_invocation;
use modsuite::suite::TestSuite;

#[derive(Parser)]
#[command(name = "modsuite")]
#[command(about = "Module-based test suite runner", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "modsuite.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the suite
    Run {
        /// Override the shard count
        #[arg(short, long)]
        shards: Option<usize>,

        /// JUnit XML output path
        #[arg(long)]
        junit: Option<PathBuf>,
    },

    /// Show the modules that would run, after filtering and sharding
    Plan {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run { shards, junit } => {
            let code = run_suite(&cli.config, shards, junit, cli.verbose).await?;
            std::process::exit(code);
        }
        Commands::Plan { format } => plan_suite(&cli.config, &format),
        Commands::Validate => validate_config(&cli.config),
    }
}

fn load(config_path: &Path) -> Result<Config> {
    let config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    config::validate(&config)
        .with_context(|| format!("Invalid config {}", config_path.display()))?;
    Ok(config)
}

fn build_context(config: &Config) -> InvocationContext {
    config
        .devices
        .iter()
        .fold(InvocationContext::new(), |context, device| {
            context.with_device(
                device.name.clone(),
                Arc::new(HostDevice::new(device.serial.clone())),
                device.build.clone(),
            )
        })
}

fn build_suite(config: &Config) -> TestSuite {
    let loader = Arc::new(ShellModuleLoader::new(config.modules.clone()));
    TestSuite::new(config.suite.clone(), loader).with_failure_options(config.failure.clone())
}

async fn run_suite(
    config_path: &Path,
    shards_override: Option<usize>,
    junit_path: Option<PathBuf>,
    verbose: bool,
) -> Result<i32> {
    let config = load(config_path)?;
    info!("Loaded configuration from {}", config_path.display());

    let context = build_context(&config);
    let log_dir = config
        .logs
        .output_dir
        .join(format!("{}-{}", config.suite.name, uuid::Uuid::new_v4()));
    info!("Saving logs under {}", log_dir.display());
    let suite = build_suite(&config).with_log_saver(Arc::new(FileLogSaver::new(log_dir)));

    let results = Arc::new(ResultReporter::new());
    let mut listeners = ResultForwarder::new()
        .with_listener(results.clone())
        .with_listener(Arc::new(ConsoleReporter::new(verbose)));
    if config.report.junit || junit_path.is_some() {
        let path = junit_path
            .unwrap_or_else(|| config.report.output_dir.join(&config.report.junit_name));
        listeners = listeners.with_listener(Arc::new(
            JUnitReporter::new(path).with_testsuites_name(config.suite.name.clone()),
        ));
    }

    let shard_count = shards_override.unwrap_or(config.suite.shard_count);
    match run_invocation(suite, &context, Arc::new(listeners), shard_count).await {
        Ok(()) => {}
        Err(e) if e.is_fatal() => error!("Invocation aborted: {}", e),
        Err(e) => return Err(e).context("Suite run failed"),
    }

    Ok(results.summary().exit_code())
}

#[derive(Serialize)]
struct PlannedModule {
    id: String,
    delegates: usize,
    expected_tests: usize,
    shared_preparers: bool,
}

fn plan_suite(config_path: &Path, format: &str) -> Result<()> {
    let config = load(config_path)?;
    let modules = build_suite(&config)
        .create_execution_list(config.suite.shard_count)
        .context("Failed to build execution list")?;

    let planned: Vec<PlannedModule> = modules
        .iter()
        .map(|m| PlannedModule {
            id: m.id().to_string(),
            delegates: m.tests().len(),
            expected_tests: m.expected_test_case_count(),
            shared_preparers: matches!(m.preparers(), PreparerOwnership::Shared(_)),
        })
        .collect();

    match format {
        "json" => {
            let json = serde_json::to_string_pretty(&planned)?;
            println!("{}", json);
        }
        _ => {
            println!("Planned {} modules:", planned.len());
            for module in &planned {
                let shared = if module.shared_preparers {
                    " [shared preparers]"
                } else {
                    ""
                };
                println!(
                    "  {} ({} tests, {} delegates){}",
                    module.id, module.expected_tests, module.delegates, shared
                );
            }
        }
    }

    Ok(())
}

fn validate_config(config_path: &Path) -> Result<()> {
    match load(config_path) {
        Ok(config) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!("  Suite: {}", config.suite.name);
            println!("  Max run count: {}", config.suite.max_run_count);
            println!("  Shard count: {}", config.suite.shard_count);
            println!("  Dynamic sharding: {}", config.suite.dynamic_sharding);
            println!("  Devices: {}", config.devices.len());
            println!("  Modules: {}", config.modules.len());
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}
