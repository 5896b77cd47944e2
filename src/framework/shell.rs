//! Shell-command collaborators.
//!
//! These back the modules declared in the TOML config:
//!
//! - [`ShellTest`]: one delegate per module; every test case is a command,
//!   exit code 0 passes
//! - [`CommandPreparer`]: setup/teardown commands around a module
//! - [`ShellModuleLoader`]: turns [`ModuleSpec`]s into [`ModuleConfig`]s
//!
//! # Platform Requirements
//!
//! **POSIX shell required**: commands run as `{shell} -c "{command}"`.
//!
//! # Environment
//!
//! Every command sees the invocation's first device:
//!
//! | Variable | Value |
//! |----------|-------|
//! | `MODSUITE_SERIAL` | device serial |
//! | `MODSUITE_BUILD_ID` | build id |
//! | `MODSUITE_TEST` | `Class#name` (test cases only) |

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{
    ModuleConfig, ModuleLoader, RemoteTest, Shardability, StaticController, TargetPreparer,
    TestDelegate, TestFilterReceiver,
};
use crate::config::{ModuleSpec, PreparerSpec};
use crate::device::{BuildInfo, Device, InvocationContext};
use crate::error::{SuiteError, SuiteResult};
use crate::listener::TestListener;
use crate::log_saver::LogDataType;
use crate::result::{Metrics, TestDescription};

/// Runner name reported by [`ShellTest`].
pub const SHELL_RUNNER: &str = "shell";

/// How commands are executed.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: String,
    working_dir: Option<PathBuf>,
    timeout: Duration,
}

/// Outcome of one command.
#[derive(Debug)]
enum CommandOutcome {
    Exited {
        code: Option<i32>,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    },
    TimedOut,
}

impl ShellRunner {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            working_dir: None,
            timeout: Duration::from_secs(300),
        }
    }

    pub fn with_working_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.working_dir = dir;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self, command: &str, env: &[(&str, String)]) -> std::io::Result<CommandOutcome> {
        let mut process = tokio::process::Command::new(&self.shell);
        process.arg("-c").arg(command);
        if let Some(dir) = &self.working_dir {
            process.current_dir(dir);
        }
        for (key, value) in env {
            process.env(key, value);
        }
        process.stdin(Stdio::null());
        process.stdout(Stdio::piped());
        process.stderr(Stdio::piped());
        process.kill_on_drop(true);

        debug!("Running `{}` via {}", command, self.shell);

        match tokio::time::timeout(self.timeout, process.output()).await {
            Ok(output) => {
                let output = output?;
                Ok(CommandOutcome::Exited {
                    code: output.status.code(),
                    stdout: output.stdout,
                    stderr: output.stderr,
                })
            }
            Err(_) => Ok(CommandOutcome::TimedOut),
        }
    }
}

fn device_env(device: Option<(&dyn Device, &BuildInfo)>) -> Vec<(&'static str, String)> {
    match device {
        Some((device, build)) => vec![
            ("MODSUITE_SERIAL", device.serial().to_string()),
            ("MODSUITE_BUILD_ID", build.build_id.clone()),
        ],
        None => Vec::new(),
    }
}

/// One test case of a [`ShellTest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellTestCase {
    pub id: TestDescription,
    pub command: String,
}

/// A delegate whose test cases are shell commands.
///
/// Include filters restrict which cases run; retries use them to re-run only
/// failed cases. Splitting produces contiguous, balanced chunks.
pub struct ShellTest {
    run_name: String,
    cases: Vec<ShellTestCase>,
    runner: ShellRunner,
    shardability: Shardability,
    include_filters: Mutex<BTreeSet<TestDescription>>,
}

impl ShellTest {
    pub fn new(run_name: impl Into<String>, cases: Vec<ShellTestCase>, runner: ShellRunner) -> Self {
        Self {
            run_name: run_name.into(),
            cases,
            runner,
            shardability: Shardability::None,
            include_filters: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn with_shardability(mut self, shardability: Shardability) -> Self {
        self.shardability = shardability;
        self
    }

    fn selected_cases(&self) -> Vec<ShellTestCase> {
        let filters = self
            .include_filters
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        self.cases
            .iter()
            .filter(|c| filters.is_empty() || filters.contains(&c.id))
            .cloned()
            .collect()
    }

    async fn run_case(
        &self,
        case: &ShellTestCase,
        env: &[(&str, String)],
        listener: &dyn TestListener,
    ) {
        listener.test_started(&case.id).await;
        let started = Instant::now();

        let mut env = env.to_vec();
        env.push(("MODSUITE_TEST", case.id.to_string()));

        match self.runner.run(&case.command, &env).await {
            Ok(CommandOutcome::Exited {
                code,
                stdout,
                stderr,
            }) => {
                if !stdout.is_empty() {
                    let name = format!("{}-stdout", case.id);
                    listener.test_log(&name, LogDataType::Text, &stdout).await;
                }
                if code != Some(0) {
                    let code = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
                    let trace = format!(
                        "`{}` exited with {}\n{}",
                        case.command,
                        code,
                        String::from_utf8_lossy(&stderr)
                    );
                    listener.test_failed(&case.id, trace.trim_end()).await;
                }
            }
            Ok(CommandOutcome::TimedOut) => {
                let trace = format!(
                    "`{}` timed out after {}s",
                    case.command,
                    self.runner.timeout.as_secs()
                );
                listener.test_failed(&case.id, &trace).await;
            }
            Err(e) => {
                warn!("Failed to spawn `{}`: {}", case.command, e);
                let trace = format!("failed to spawn `{}`: {}", case.command, e);
                listener.test_failed(&case.id, &trace).await;
            }
        }

        let mut metrics = Metrics::new();
        metrics.insert(
            "duration_ms".to_string(),
            started.elapsed().as_millis().to_string(),
        );
        listener.test_ended(&case.id, &metrics).await;
    }
}

#[async_trait]
impl RemoteTest for ShellTest {
    fn runner_name(&self) -> &str {
        SHELL_RUNNER
    }

    async fn run(
        &self,
        context: &InvocationContext,
        listener: &dyn TestListener,
    ) -> SuiteResult<()> {
        let cases = self.selected_cases();
        let env = device_env(
            context
                .devices()
                .first()
                .map(|d| (d.device.as_ref(), &d.build)),
        );

        listener.test_run_started(&self.run_name, cases.len()).await;
        let started = Instant::now();

        for case in &cases {
            self.run_case(case, &env, listener).await;
        }

        listener
            .test_run_ended(started.elapsed(), &Metrics::new())
            .await;
        Ok(())
    }

    fn shardability(&self) -> Shardability {
        self.shardability
    }

    fn split(&self, shard_count_hint: usize) -> Option<Vec<TestDelegate>> {
        if shard_count_hint < 2 || self.cases.len() < 2 {
            return None;
        }

        let shards = shard_count_hint.min(self.cases.len());
        let base = self.cases.len() / shards;
        let extra = self.cases.len() % shards;
        let filters = self
            .include_filters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let mut start = 0;
        let mut delegates = Vec::with_capacity(shards);
        for i in 0..shards {
            let size = base + usize::from(i < extra);
            let chunk = self.cases[start..start + size].to_vec();
            start += size;

            let shard = ShellTest {
                run_name: self.run_name.clone(),
                cases: chunk,
                runner: self.runner.clone(),
                shardability: self.shardability,
                include_filters: Mutex::new(filters.clone()),
            };
            delegates.push(TestDelegate::filterable(shard));
        }
        Some(delegates)
    }

    fn test_case_count(&self) -> Option<usize> {
        Some(self.cases.len())
    }
}

impl TestFilterReceiver for ShellTest {
    fn add_include_filter(&self, test: &TestDescription) {
        self.include_filters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(test.clone());
    }

    fn clear_include_filters(&self) {
        self.include_filters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

/// A target preparer running setup and teardown commands.
#[derive(Debug, Clone)]
pub struct CommandPreparer {
    spec: PreparerSpec,
    runner: ShellRunner,
}

impl CommandPreparer {
    pub fn new(spec: PreparerSpec, runner: ShellRunner) -> Self {
        Self { spec, runner }
    }

    async fn run_step(
        &self,
        step: &str,
        command: &str,
        device: &dyn Device,
        build: &BuildInfo,
    ) -> Result<(), String> {
        let env = device_env(Some((device, build)));
        match self.runner.run(command, &env).await {
            Ok(CommandOutcome::Exited { code: Some(0), .. }) => Ok(()),
            Ok(CommandOutcome::Exited { code, stderr, .. }) => Err(format!(
                "{} {} `{}` exited with {:?}: {}",
                self.spec.name,
                step,
                command,
                code,
                String::from_utf8_lossy(&stderr).trim_end()
            )),
            Ok(CommandOutcome::TimedOut) => Err(format!(
                "{} {} `{}` timed out",
                self.spec.name, step, command
            )),
            Err(e) => Err(format!("{} {} `{}`: {}", self.spec.name, step, command, e)),
        }
    }
}

#[async_trait]
impl TargetPreparer for CommandPreparer {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn is_disabled(&self) -> bool {
        self.spec.disabled
    }

    fn is_tear_down_disabled(&self) -> bool {
        self.spec.teardown_disabled
    }

    async fn set_up(&self, device: &dyn Device, build: &BuildInfo) -> SuiteResult<()> {
        let Some(command) = &self.spec.setup else {
            return Ok(());
        };
        info!("{}: setting up on {}", self.spec.name, device.serial());
        self.run_step("setup", command, device, build)
            .await
            .map_err(SuiteError::TargetSetup)
    }

    async fn tear_down(
        &self,
        device: &dyn Device,
        build: &BuildInfo,
        error: Option<&SuiteError>,
    ) -> SuiteResult<()> {
        let Some(command) = &self.spec.teardown else {
            return Ok(());
        };
        if let Some(e) = error {
            debug!("{}: tearing down after error: {}", self.spec.name, e);
        }
        self.run_step("teardown", command, device, build)
            .await
            .map_err(SuiteError::Harness)
    }

    fn duplicate(&self) -> Arc<dyn TargetPreparer> {
        Arc::new(self.clone())
    }
}

/// Builds modules from [`ModuleSpec`]s.
pub struct ShellModuleLoader {
    modules: Vec<ModuleSpec>,
}

impl ShellModuleLoader {
    pub fn new(modules: Vec<ModuleSpec>) -> Self {
        Self { modules }
    }

    fn build(spec: &ModuleSpec) -> ModuleConfig {
        let runner = ShellRunner::new(&spec.shell)
            .with_working_dir(spec.working_dir.clone())
            .with_timeout(Duration::from_secs(spec.timeout_secs));

        let cases = spec
            .tests
            .iter()
            .map(|t| ShellTestCase {
                id: TestDescription::new(&t.class, &t.name),
                command: t.command.clone(),
            })
            .collect();

        let mut config = ModuleConfig::new(&spec.name);
        config.abi = spec.abi.clone();
        config.metadata = spec.metadata.clone();
        config.shardable = spec.shardable;
        config.controller = Some(Arc::new(StaticController(spec.strategy)));

        let run_name = config.id();
        config.tests.push(TestDelegate::filterable(
            ShellTest::new(run_name, cases, runner.clone()).with_shardability(spec.shard_mode),
        ));

        for preparer in &spec.preparers {
            config = config.with_preparer(Arc::new(CommandPreparer::new(
                preparer.clone(),
                runner.clone(),
            )));
        }
        config
    }
}

impl ModuleLoader for ShellModuleLoader {
    fn load_modules(&self, abis: &[String]) -> SuiteResult<Vec<ModuleConfig>> {
        let configs: Vec<ModuleConfig> = self
            .modules
            .iter()
            .filter(|m| match &m.abi {
                Some(abi) => abis.is_empty() || abis.contains(abi),
                None => true,
            })
            .map(Self::build)
            .collect();
        debug!("Loaded {} shell modules", configs.len());
        Ok(configs)
    }

    fn known_runners(&self) -> BTreeSet<String> {
        BTreeSet::from([SHELL_RUNNER.to_string()])
    }
}
