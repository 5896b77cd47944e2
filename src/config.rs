//! Configuration loading and schema definitions for modsuite.
//!
//! This module provides types and functions for loading suite configuration
//! from TOML files or strings, plus the checks run before any device work.

pub mod schema;

pub use schema::*;

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result, bail};

/// Loads configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the schema
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads configuration from a TOML string.
///
/// ```
/// use modsuite::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [suite]
///     shard_count = 4
/// "#)?;
///
/// assert_eq!(config.suite.shard_count, 4);
/// assert_eq!(config.devices.len(), 1);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}

/// Checks a loaded configuration for mistakes serde cannot catch.
///
/// # Errors
///
/// Returns an error on duplicate module ids or device names, zero
/// run/shard counts, or commands that are not valid shell words.
pub fn validate(config: &Config) -> Result<()> {
    if config.suite.max_run_count == 0 {
        bail!("suite.max_run_count must be at least 1");
    }
    if config.suite.shard_count == 0 {
        bail!("suite.shard_count must be at least 1");
    }
    if config.devices.is_empty() {
        bail!("at least one device must be configured");
    }

    let mut device_names = HashSet::new();
    for device in &config.devices {
        if !device_names.insert(device.name.as_str()) {
            bail!("duplicate device name: {}", device.name);
        }
    }

    let mut module_ids = HashSet::new();
    for module in &config.modules {
        let id = match &module.abi {
            Some(abi) => format!("{} {}", abi, module.name),
            None => module.name.clone(),
        };
        if !module_ids.insert(id.clone()) {
            bail!("duplicate module: {}", id);
        }

        let mut test_ids = HashSet::new();
        for test in &module.tests {
            if !test_ids.insert((test.class.as_str(), test.name.as_str())) {
                bail!("module {}: duplicate test {}#{}", id, test.class, test.name);
            }
            shell_words::split(&test.command).with_context(|| {
                format!("module {}: invalid command for {}#{}", id, test.class, test.name)
            })?;
        }

        for preparer in &module.preparers {
            for command in preparer.setup.iter().chain(preparer.teardown.iter()) {
                shell_words::split(command).with_context(|| {
                    format!("module {}: invalid command in preparer {}", id, preparer.name)
                })?;
            }
        }
    }

    Ok(())
}
