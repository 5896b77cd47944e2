//! Collaborator interfaces consumed by the engine.
//!
//! The engine drives injected collaborators and never implements test content
//! itself:
//!
//! | Trait | Role |
//! |-------|------|
//! | [`RemoteTest`] | a test payload; reports through a [`TestListener`] |
//! | [`TestFilterReceiver`] | a payload that can be narrowed to given test cases |
//! | [`TargetPreparer`] | per-device setup/teardown around a module |
//! | [`MultiTargetPreparer`] | setup/teardown over the whole invocation context |
//! | [`ModuleController`] | decides whether a module runs, is bypassed or skipped |
//! | [`SystemStatusChecker`] | device health checks around suites and modules |
//! | [`ModuleLoader`] | supplies the ordered module list |
//!
//! Payloads travel as the closed [`TestDelegate`] enum so the filtering
//! capability is known statically instead of being probed at retry time.
//!
//! # Built-in Collaborators
//!
//! [`shell`] provides shell-command implementations used by the CLI.

pub mod shell;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::device::{BuildInfo, DEFAULT_DEVICE_NAME, Device, InvocationContext};
use crate::error::{SuiteError, SuiteResult};
use crate::listener::TestListener;
use crate::result::TestDescription;

/// Decision of a [`ModuleController`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStrategy {
    /// Run the module normally.
    #[default]
    Run,
    /// Skip the module entirely: no setup, no test events.
    #[serde(rename = "bypass")]
    FullModuleBypass,
    /// Run the module but report every started test case as ignored.
    #[serde(rename = "skip-testcases")]
    SkipModuleTestcases,
}

/// How a payload can be split into shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Shardability {
    /// Never split.
    #[default]
    None,
    /// Split only when dynamic (pool) sharding is allowed.
    Standard,
    /// Split into independent shards, each with its own preparers.
    Strict,
}

/// A test payload.
#[async_trait]
pub trait RemoteTest: Send + Sync {
    /// Name of the runner implementation, checked against the runner whitelist.
    fn runner_name(&self) -> &str;

    /// Runs the payload, reporting through `listener`.
    ///
    /// # Errors
    ///
    /// `DeviceNotAvailable` aborts the shard; `DeviceUnresponsive` fails the
    /// module; anything else is recorded as a run failure.
    async fn run(&self, context: &InvocationContext, listener: &dyn TestListener)
    -> SuiteResult<()>;

    fn shardability(&self) -> Shardability {
        Shardability::None
    }

    /// Splits into shards. `None` (or a single shard) means "not split".
    fn split(&self, _shard_count_hint: usize) -> Option<Vec<TestDelegate>> {
        None
    }

    /// Number of test cases this payload owns, if known up front.
    fn test_case_count(&self) -> Option<usize> {
        None
    }
}

/// A payload that can be restricted to a set of test cases.
pub trait TestFilterReceiver: RemoteTest {
    fn add_include_filter(&self, test: &TestDescription);

    fn add_all_include_filters(&self, tests: &BTreeSet<TestDescription>) {
        for test in tests {
            self.add_include_filter(test);
        }
    }

    fn clear_include_filters(&self);
}

/// A test payload together with its filtering capability.
#[derive(Clone)]
pub enum TestDelegate {
    Filterable(Arc<dyn TestFilterReceiver>),
    Opaque(Arc<dyn RemoteTest>),
}

impl TestDelegate {
    pub fn filterable(test: impl TestFilterReceiver + 'static) -> Self {
        TestDelegate::Filterable(Arc::new(test))
    }

    pub fn opaque(test: impl RemoteTest + 'static) -> Self {
        TestDelegate::Opaque(Arc::new(test))
    }

    pub fn is_filterable(&self) -> bool {
        matches!(self, TestDelegate::Filterable(_))
    }

    pub fn runner_name(&self) -> &str {
        match self {
            TestDelegate::Filterable(t) => t.runner_name(),
            TestDelegate::Opaque(t) => t.runner_name(),
        }
    }

    pub async fn run(
        &self,
        context: &InvocationContext,
        listener: &dyn TestListener,
    ) -> SuiteResult<()> {
        match self {
            TestDelegate::Filterable(t) => t.run(context, listener).await,
            TestDelegate::Opaque(t) => t.run(context, listener).await,
        }
    }

    pub fn shardability(&self) -> Shardability {
        match self {
            TestDelegate::Filterable(t) => t.shardability(),
            TestDelegate::Opaque(t) => t.shardability(),
        }
    }

    pub fn split(&self, shard_count_hint: usize) -> Option<Vec<TestDelegate>> {
        match self {
            TestDelegate::Filterable(t) => t.split(shard_count_hint),
            TestDelegate::Opaque(t) => t.split(shard_count_hint),
        }
    }

    pub fn test_case_count(&self) -> Option<usize> {
        match self {
            TestDelegate::Filterable(t) => t.test_case_count(),
            TestDelegate::Opaque(t) => t.test_case_count(),
        }
    }

    /// Returns `true` if both handles point at the same payload instance.
    pub fn same_instance(&self, other: &TestDelegate) -> bool {
        match (self, other) {
            (TestDelegate::Filterable(a), TestDelegate::Filterable(b)) => Arc::ptr_eq(a, b),
            (TestDelegate::Opaque(a), TestDelegate::Opaque(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for TestDelegate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_filterable() {
            "Filterable"
        } else {
            "Opaque"
        };
        f.debug_tuple(kind).field(&self.runner_name()).finish()
    }
}

/// Per-device setup and teardown around a module.
#[async_trait]
pub trait TargetPreparer: Send + Sync {
    fn name(&self) -> &str;

    fn is_disabled(&self) -> bool {
        false
    }

    fn is_tear_down_disabled(&self) -> bool {
        false
    }

    async fn set_up(&self, device: &dyn Device, build: &BuildInfo) -> SuiteResult<()>;

    /// Undoes `set_up`. `error` is the failure that ended the module, if any.
    async fn tear_down(
        &self,
        _device: &dyn Device,
        _build: &BuildInfo,
        _error: Option<&SuiteError>,
    ) -> SuiteResult<()> {
        Ok(())
    }

    /// Deep copy used when a module is sharded.
    fn duplicate(&self) -> Arc<dyn TargetPreparer>;
}

/// Setup and teardown spanning every device of the invocation.
#[async_trait]
pub trait MultiTargetPreparer: Send + Sync {
    fn name(&self) -> &str;

    fn is_disabled(&self) -> bool {
        false
    }

    fn is_tear_down_disabled(&self) -> bool {
        false
    }

    async fn set_up(&self, context: &InvocationContext) -> SuiteResult<()>;

    async fn tear_down(
        &self,
        _context: &InvocationContext,
        _error: Option<&SuiteError>,
    ) -> SuiteResult<()> {
        Ok(())
    }

    fn duplicate(&self) -> Arc<dyn MultiTargetPreparer>;
}

/// Policy hook deciding how a module runs.
pub trait ModuleController: Send + Sync {
    fn should_run(&self, context: &InvocationContext) -> RunStrategy;
}

/// A controller that always returns the same decision.
#[derive(Debug, Clone, Copy)]
pub struct StaticController(pub RunStrategy);

impl ModuleController for StaticController {
    fn should_run(&self, _context: &InvocationContext) -> RunStrategy {
        self.0
    }
}

/// Outcome of a system status check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Success,
    Failed,
}

/// Result of a system status check.
#[derive(Debug, Clone)]
pub struct StatusCheckerResult {
    pub status: CheckStatus,
    pub message: Option<String>,
    /// Capture a bugreport when the check failed.
    pub bugreport_needed: bool,
}

impl StatusCheckerResult {
    pub fn success() -> Self {
        Self {
            status: CheckStatus::Success,
            message: None,
            bugreport_needed: false,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Failed,
            message: Some(message.into()),
            bugreport_needed: true,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == CheckStatus::Success
    }
}

/// Verifies device health before and after execution.
#[async_trait]
pub trait SystemStatusChecker: Send + Sync {
    fn name(&self) -> &str;

    async fn pre_execution_check(&self, _device: &dyn Device) -> SuiteResult<StatusCheckerResult> {
        Ok(StatusCheckerResult::success())
    }

    async fn post_execution_check(
        &self,
        _device: &dyn Device,
    ) -> SuiteResult<StatusCheckerResult> {
        Ok(StatusCheckerResult::success())
    }
}

/// Target preparers of one device.
#[derive(Clone)]
pub struct DevicePreparers {
    pub device_name: String,
    pub preparers: Vec<Arc<dyn TargetPreparer>>,
}

/// Builds the unique module id, `"<abi> <name>"` when an abi is set.
pub fn module_id(abi: Option<&str>, name: &str) -> String {
    match abi {
        Some(abi) => format!("{} {}", abi, name),
        None => name.to_string(),
    }
}

/// Immutable description of one module, as supplied by a [`ModuleLoader`].
#[derive(Clone)]
pub struct ModuleConfig {
    pub name: String,
    pub abi: Option<String>,
    pub metadata: BTreeMap<String, Vec<String>>,
    /// Whether the module may be sharded at all.
    pub shardable: bool,
    pub controller: Option<Arc<dyn ModuleController>>,
    pub tests: Vec<TestDelegate>,
    pub preparers: Vec<DevicePreparers>,
    pub multi_preparers: Vec<Arc<dyn MultiTargetPreparer>>,
}

impl ModuleConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            abi: None,
            metadata: BTreeMap::new(),
            shardable: true,
            controller: None,
            tests: Vec::new(),
            preparers: Vec::new(),
            multi_preparers: Vec::new(),
        }
    }

    pub fn id(&self) -> String {
        module_id(self.abi.as_deref(), &self.name)
    }

    pub fn with_abi(mut self, abi: impl Into<String>) -> Self {
        self.abi = Some(abi.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata
            .entry(key.into())
            .or_default()
            .push(value.into());
        self
    }

    pub fn with_test(mut self, test: TestDelegate) -> Self {
        self.tests.push(test);
        self
    }

    pub fn with_controller(mut self, controller: Arc<dyn ModuleController>) -> Self {
        self.controller = Some(controller);
        self
    }

    /// Adds a preparer for the default device.
    pub fn with_preparer(self, preparer: Arc<dyn TargetPreparer>) -> Self {
        self.with_device_preparer(DEFAULT_DEVICE_NAME, preparer)
    }

    pub fn with_device_preparer(
        mut self,
        device_name: &str,
        preparer: Arc<dyn TargetPreparer>,
    ) -> Self {
        match self
            .preparers
            .iter_mut()
            .find(|p| p.device_name == device_name)
        {
            Some(existing) => existing.preparers.push(preparer),
            None => self.preparers.push(DevicePreparers {
                device_name: device_name.to_string(),
                preparers: vec![preparer],
            }),
        }
        self
    }

    pub fn with_multi_preparer(mut self, preparer: Arc<dyn MultiTargetPreparer>) -> Self {
        self.multi_preparers.push(preparer);
        self
    }

    pub fn not_shardable(mut self) -> Self {
        self.shardable = false;
        self
    }
}

impl fmt::Debug for ModuleConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleConfig")
            .field("id", &self.id())
            .field("shardable", &self.shardable)
            .field("tests", &self.tests)
            .finish()
    }
}

/// Supplies the modules of a suite.
pub trait ModuleLoader: Send + Sync {
    /// Returns modules in execution order. `abis` is a hint; the suite filters
    /// by abi again.
    fn load_modules(&self, abis: &[String]) -> SuiteResult<Vec<ModuleConfig>>;

    /// Names of every runner this loader can produce.
    fn known_runners(&self) -> BTreeSet<String>;
}
