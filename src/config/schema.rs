//! Configuration schema definitions for modsuite.
//!
//! All types deserialize from TOML. Everything except `[suite]` has defaults.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── SuiteConfig        - Retry, sharding, reboot, checker and filter options
//! ├── FailureConfig      - Diagnostics captured when a test fails
//! ├── LogsConfig         - Where log artifacts are saved
//! ├── ReportConfig       - Result output settings
//! ├── DeviceConfig[]     - Devices allocated to the invocation
//! └── ModuleSpec[]       - Modules built from shell commands
//!     ├── TestSpec[]
//!     └── PreparerSpec[]
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::device::{BuildInfo, DEFAULT_DEVICE_NAME};
use crate::framework::{RunStrategy, Shardability};

/// Root configuration structure.
///
/// # Example
///
/// ```
/// use modsuite::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [suite]
///     name = "smoke"
///     max_run_count = 3
///
///     [[modules]]
///     name = "suite/stub1"
///
///     [[modules.tests]]
///     class = "Stub"
///     name = "testOne"
///     command = "true"
/// "#).unwrap();
///
/// assert_eq!(config.suite.max_run_count, 3);
/// assert_eq!(config.modules[0].tests.len(), 1);
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Suite-level execution settings.
    pub suite: SuiteConfig,

    /// Diagnostics captured on test failure.
    #[serde(default)]
    pub failure: FailureConfig,

    /// Log artifact settings.
    #[serde(default)]
    pub logs: LogsConfig,

    /// Report settings.
    #[serde(default)]
    pub report: ReportConfig,

    /// Devices allocated to the invocation. Defaults to one host device.
    #[serde(default = "default_devices")]
    pub devices: Vec<DeviceConfig>,

    /// Modules of the suite, in execution order.
    #[serde(default)]
    pub modules: Vec<ModuleSpec>,
}

/// When devices get rebooted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RebootPolicy {
    #[default]
    None,
    /// Reboot every device once before the first module.
    BeforeSuite,
    /// Reboot before every module. Skipped on `user` builds.
    PerModule,
}

/// Suite-level execution settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `max_run_count` | 1 (no retries) |
/// | `shard_count` | 1 |
/// | `dynamic_sharding` | false |
/// | `reboot` | `none` |
/// | `system_checkers` | true |
/// | `per_module_checkers` | false |
/// | `report_checkers_as_failures` | false |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SuiteConfig {
    /// Suite name, used in reports.
    #[serde(default = "default_suite_name")]
    pub name: String,

    /// Maximum number of attempts per delegate. 1 disables retries.
    #[serde(default = "default_max_run_count")]
    pub max_run_count: usize,

    /// Number of shards to split the suite into.
    #[serde(default = "default_shard_count")]
    pub shard_count: usize,

    /// Allow pool-based sharding of standard-shardable delegates.
    #[serde(default)]
    pub dynamic_sharding: bool,

    #[serde(default)]
    pub reboot: RebootPolicy,

    /// Run system status checkers before and after the suite.
    #[serde(default = "default_true")]
    pub system_checkers: bool,

    /// Also run system status checkers around every module.
    #[serde(default)]
    pub per_module_checkers: bool,

    /// Report a failed checker as a failed test run.
    #[serde(default)]
    pub report_checkers_as_failures: bool,

    /// Only run modules for these abis. Empty means all.
    #[serde(default)]
    pub abis: Vec<String>,

    /// Only run modules whose delegates use these runners. Empty means all.
    #[serde(default)]
    pub runner_whitelist: Vec<String>,

    /// Metadata key/values a module must match (any of) to be included.
    #[serde(default)]
    pub include_metadata: BTreeMap<String, Vec<String>>,

    /// Metadata key/values excluding a module.
    #[serde(default)]
    pub exclude_metadata: BTreeMap<String, Vec<String>>,
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            name: default_suite_name(),
            max_run_count: default_max_run_count(),
            shard_count: default_shard_count(),
            dynamic_sharding: false,
            reboot: RebootPolicy::None,
            system_checkers: true,
            per_module_checkers: false,
            report_checkers_as_failures: false,
            abis: Vec::new(),
            runner_whitelist: Vec::new(),
            include_metadata: BTreeMap::new(),
            exclude_metadata: BTreeMap::new(),
        }
    }
}

fn default_suite_name() -> String {
    "modsuite".to_string()
}

fn default_max_run_count() -> usize {
    1
}

fn default_shard_count() -> usize {
    1
}

fn default_true() -> bool {
    true
}

/// Diagnostics captured on each allocated device when a test fails.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FailureConfig {
    #[serde(default)]
    pub bugreport: bool,

    #[serde(default)]
    pub screenshot: bool,

    #[serde(default = "default_true")]
    pub logcat: bool,

    /// Reboot the device after capturing.
    #[serde(default)]
    pub reboot: bool,

    /// Upper bound on captured logcat size.
    #[serde(default = "default_max_logcat_bytes")]
    pub max_logcat_bytes: usize,
}

impl FailureConfig {
    /// Returns `true` if any capture is enabled.
    pub fn any_enabled(&self) -> bool {
        self.bugreport || self.screenshot || self.logcat || self.reboot
    }
}

impl Default for FailureConfig {
    fn default() -> Self {
        Self {
            bugreport: false,
            screenshot: false,
            logcat: true,
            reboot: false,
            max_logcat_bytes: default_max_logcat_bytes(),
        }
    }
}

fn default_max_logcat_bytes() -> usize {
    512 * 1024
}

/// Where log artifacts are written.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogsConfig {
    #[serde(default = "default_logs_dir")]
    pub output_dir: PathBuf,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            output_dir: default_logs_dir(),
        }
    }
}

fn default_logs_dir() -> PathBuf {
    PathBuf::from("suite-logs")
}

/// Result output settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Write a JUnit XML report.
    #[serde(default = "default_true")]
    pub junit: bool,

    #[serde(default = "default_junit_name")]
    pub junit_name: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            junit: true,
            junit_name: default_junit_name(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("suite-results")
}

fn default_junit_name() -> String {
    "junit.xml".to_string()
}

/// A device allocated to the invocation.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    #[serde(default = "default_device_name")]
    pub name: String,

    #[serde(default = "default_serial")]
    pub serial: String,

    #[serde(default)]
    pub build: BuildInfo,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: default_device_name(),
            serial: default_serial(),
            build: BuildInfo::default(),
        }
    }
}

fn default_devices() -> Vec<DeviceConfig> {
    vec![DeviceConfig::default()]
}

fn default_device_name() -> String {
    DEFAULT_DEVICE_NAME.to_string()
}

fn default_serial() -> String {
    "localhost".to_string()
}

/// A module whose test cases are shell commands.
///
/// ```toml
/// [[modules]]
/// name = "suite/net"
/// abi = "x86_64"
/// shard_mode = "strict"
/// metadata = { component = ["networking"] }
///
/// [[modules.preparers]]
/// name = "start-server"
/// setup = "./server.sh start"
/// teardown = "./server.sh stop"
///
/// [[modules.tests]]
/// class = "NetTest"
/// name = "testPing"
/// command = "ping -c1 127.0.0.1"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModuleSpec {
    pub name: String,

    pub abi: Option<String>,

    /// Whether the module may be sharded at all.
    #[serde(default = "default_true")]
    pub shardable: bool,

    /// Static module controller decision.
    #[serde(default)]
    pub strategy: RunStrategy,

    #[serde(default)]
    pub metadata: BTreeMap<String, Vec<String>>,

    /// How the module's tests can be split.
    #[serde(default)]
    pub shard_mode: Shardability,

    /// Per-command timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Shell used to run commands, as `{shell} -c "{command}"`.
    #[serde(default = "default_shell")]
    pub shell: String,

    pub working_dir: Option<PathBuf>,

    #[serde(default)]
    pub tests: Vec<TestSpec>,

    #[serde(default)]
    pub preparers: Vec<PreparerSpec>,
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

/// One test case run as a shell command. Exit code 0 passes.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TestSpec {
    pub class: String,
    pub name: String,
    pub command: String,
}

/// A target preparer run as shell commands.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PreparerSpec {
    pub name: String,

    pub setup: Option<String>,

    pub teardown: Option<String>,

    #[serde(default)]
    pub disabled: bool,

    #[serde(default)]
    pub teardown_disabled: bool,
}
