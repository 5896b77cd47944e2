//! Lifecycle of one module.
//!
//! ```text
//!  Created ──► Preparing ──► Running ──► TearingDown ──► Done
//!                  │                          ▲
//!                  └── setup failure ─────────┘
//!                                  (any state) ──► Aborted on DeviceNotAvailable
//! ```
//!
//! A [`ModuleDefinition`] runs its preparers, drives every delegate through a
//! [`GranularRetriableTestWrapper`], tears the preparers down on every exit
//! path and only then replays the merged result to the listener, so teardown
//! failures still show up as run failures of the module.
//!
//! # Preparer Ownership
//!
//! | Ownership | Setup | Teardown |
//! |-----------|-------|----------|
//! | `Exclusive` | by this module | by this module |
//! | `Shared` | once per device, by the first shard on it | once per device, by the last registered shard or on release |

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, info, warn};

use super::retry::GranularRetriableTestWrapper;
use crate::config::FailureConfig;
use crate::device::{DeviceAllocation, InvocationContext};
use crate::error::{SuiteError, SuiteResult};
use crate::framework::{
    DevicePreparers, ModuleConfig, ModuleController, MultiTargetPreparer, RunStrategy,
    TestDelegate,
};
use crate::listener::{ModuleInfo, TestListener};
use crate::log_saver::LogSaver;
use crate::result::TestRunResult;

/// State of a [`ModuleDefinition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Created,
    Preparing,
    Running,
    TearingDown,
    Done,
    /// The device went away; remaining work was abandoned.
    Aborted,
}

/// Options applied to every module of a suite run.
#[derive(Clone)]
pub struct ModuleRunOptions {
    pub max_run_count: usize,
    pub failure: FailureConfig,
    pub log_saver: Option<Arc<dyn LogSaver>>,
}

impl Default for ModuleRunOptions {
    fn default() -> Self {
        Self {
            max_run_count: 1,
            failure: FailureConfig::default(),
            log_saver: None,
        }
    }
}

/// Per-device and multi-device preparers of a module.
#[derive(Clone, Default)]
pub struct ModulePreparers {
    pub devices: Vec<DevicePreparers>,
    pub multi: Vec<Arc<dyn MultiTargetPreparer>>,
}

impl ModulePreparers {
    pub fn from_config(config: &ModuleConfig) -> Self {
        Self {
            devices: config.preparers.clone(),
            multi: config.multi_preparers.clone(),
        }
    }

    /// Deep copy of every preparer.
    pub fn duplicate(&self) -> Self {
        Self {
            devices: self
                .devices
                .iter()
                .map(|group| DevicePreparers {
                    device_name: group.device_name.clone(),
                    preparers: group.preparers.iter().map(|p| p.duplicate()).collect(),
                })
                .collect(),
            multi: self.multi.iter().map(|p| p.duplicate()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.devices.iter().map(|g| g.preparers.len()).sum::<usize>() + self.multi.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sets up device preparers in order, then multi-device preparers.
    async fn set_up(&self, module_id: &str, context: &InvocationContext) -> SuiteResult<()> {
        for group in &self.devices {
            let allocation = resolve_device(context, &group.device_name).ok_or_else(|| {
                SuiteError::TargetSetup(format!(
                    "no device named {} for module {}",
                    group.device_name, module_id
                ))
            })?;
            for preparer in &group.preparers {
                if preparer.is_disabled() {
                    debug!("{}: preparer {} is disabled", module_id, preparer.name());
                    continue;
                }
                debug!("{}: set_up {}", module_id, preparer.name());
                preparer
                    .set_up(allocation.device.as_ref(), &allocation.build)
                    .await?;
            }
        }

        for preparer in &self.multi {
            if preparer.is_disabled() {
                continue;
            }
            debug!("{}: set_up {}", module_id, preparer.name());
            preparer.set_up(context).await?;
        }
        Ok(())
    }

    /// Tears down in reverse order. Returns the first teardown error.
    async fn tear_down(
        &self,
        module_id: &str,
        context: &InvocationContext,
        error: Option<&SuiteError>,
    ) -> Option<SuiteError> {
        let mut first_error = None;

        for preparer in self.multi.iter().rev() {
            if preparer.is_disabled() || preparer.is_tear_down_disabled() {
                continue;
            }
            debug!("{}: tear_down {}", module_id, preparer.name());
            if let Err(e) = preparer.tear_down(context, error).await {
                warn!("{}: teardown of {} failed: {}", module_id, preparer.name(), e);
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        for group in self.devices.iter().rev() {
            let Some(allocation) = resolve_device(context, &group.device_name) else {
                warn!("{}: no device {} to tear down", module_id, group.device_name);
                continue;
            };
            for preparer in group.preparers.iter().rev() {
                if preparer.is_disabled() || preparer.is_tear_down_disabled() {
                    continue;
                }
                debug!("{}: tear_down {}", module_id, preparer.name());
                if let Err(e) = preparer
                    .tear_down(allocation.device.as_ref(), &allocation.build, error)
                    .await
                {
                    warn!("{}: teardown of {} failed: {}", module_id, preparer.name(), e);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        first_error
    }
}

/// Finds the allocation for `name`, falling back to the only device of a
/// single-device context.
fn resolve_device<'a>(context: &'a InvocationContext, name: &str) -> Option<&'a DeviceAllocation> {
    context.device(name).or_else(|| match context.devices() {
        [only] => Some(only),
        _ => None,
    })
}

/// Preparers shared by the pool shards of one module.
///
/// Setup state is kept per device allocation: the first shard to run on a
/// device sets it up, later shards on that device reuse the outcome. A device
/// is torn down once, either by the last registered shard when it finishes
/// there, or by [`SharedPreparers::release`] once the device has no more work
/// for the pool.
pub struct SharedPreparers {
    preparers: ModulePreparers,
    registered: AtomicUsize,
    devices: Mutex<HashMap<String, Arc<tokio::sync::Mutex<DeviceSetup>>>>,
}

#[derive(Default)]
struct DeviceSetup {
    /// `None` while the device is not set up.
    outcome: Option<Result<(), String>>,
    /// Shards currently running on the device.
    holders: usize,
}

impl SharedPreparers {
    pub fn new(preparers: ModulePreparers, registered: usize) -> Arc<Self> {
        Arc::new(Self {
            preparers,
            registered: AtomicUsize::new(registered),
            devices: Mutex::new(HashMap::new()),
        })
    }

    /// Number of shards still expected to finish.
    pub fn registered(&self) -> usize {
        self.registered.load(Ordering::SeqCst)
    }

    /// Drops one shard registration, e.g. when two shards are merged or a
    /// shard never gets to run.
    pub fn unregister(&self) -> usize {
        match self
            .registered
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        {
            Ok(previous) => previous - 1,
            Err(_) => 0,
        }
    }

    fn slot(&self, context: &InvocationContext) -> Arc<tokio::sync::Mutex<DeviceSetup>> {
        let key = device_key(context);
        self.devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key)
            .or_default()
            .clone()
    }

    async fn set_up(&self, module_id: &str, context: &InvocationContext) -> SuiteResult<()> {
        let slot = self.slot(context);
        let mut setup = slot.lock().await;
        setup.holders += 1;
        if let Some(outcome) = setup.outcome.as_ref() {
            debug!("{}: shared preparers already set up on {}", module_id, device_key(context));
            return outcome.clone().map_err(SuiteError::TargetSetup);
        }
        let outcome = self.preparers.set_up(module_id, context).await;
        setup.outcome = Some(outcome.as_ref().map(|_| ()).map_err(|e| e.to_string()));
        outcome
    }

    async fn finish(
        &self,
        module_id: &str,
        context: &InvocationContext,
        error: Option<&SuiteError>,
    ) -> Option<SuiteError> {
        let remaining = self.unregister();
        let slot = self.slot(context);
        let mut setup = slot.lock().await;
        setup.holders = setup.holders.saturating_sub(1);
        if setup.holders > 0 || remaining > 0 {
            debug!(
                "{}: pool shard finished on {}, {} still registered",
                module_id,
                device_key(context),
                remaining
            );
            return None;
        }
        info!("{}: last pool shard finished, tearing down", module_id);
        self.tear_down_device(&mut setup, module_id, context, error)
            .await
    }

    /// Tears the preparers down on the device of `context` if it is set up
    /// and no shard is running there.
    pub async fn release(&self, module_id: &str, context: &InvocationContext) -> Option<SuiteError> {
        let slot = self.slot(context);
        let mut setup = slot.lock().await;
        if setup.holders > 0 {
            return None;
        }
        self.tear_down_device(&mut setup, module_id, context, None)
            .await
    }

    async fn tear_down_device(
        &self,
        setup: &mut DeviceSetup,
        module_id: &str,
        context: &InvocationContext,
        error: Option<&SuiteError>,
    ) -> Option<SuiteError> {
        setup.outcome.take()?;
        debug!("{}: tearing down shared preparers on {}", module_id, device_key(context));
        self.preparers.tear_down(module_id, context, error).await
    }
}

/// Serials of the allocated devices, identifying one device allocation.
fn device_key(context: &InvocationContext) -> String {
    context
        .devices()
        .iter()
        .map(|d| d.device.serial())
        .collect::<Vec<_>>()
        .join(",")
}

/// Who owns a module's preparers.
#[derive(Clone)]
pub enum PreparerOwnership {
    Exclusive(ModulePreparers),
    Shared(Arc<SharedPreparers>),
}

/// One runnable module.
pub struct ModuleDefinition {
    id: String,
    name: String,
    abi: Option<String>,
    metadata: BTreeMap<String, Vec<String>>,
    controller: Option<Arc<dyn ModuleController>>,
    tests: Vec<TestDelegate>,
    preparers: PreparerOwnership,
    state: ModuleState,
    final_result: Option<TestRunResult>,
}

impl ModuleDefinition {
    pub fn new(config: &ModuleConfig, tests: Vec<TestDelegate>, preparers: PreparerOwnership) -> Self {
        Self {
            id: config.id(),
            name: config.name.clone(),
            abi: config.abi.clone(),
            metadata: config.metadata.clone(),
            controller: config.controller.clone(),
            tests,
            preparers,
            state: ModuleState::Created,
            final_result: None,
        }
    }

    /// Unique id, `"<abi> <name>"` when an abi is set.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn abi(&self) -> Option<&str> {
        self.abi.as_deref()
    }

    /// Id of the module this definition was split from. Every shard of one
    /// module shares it, whatever owns its preparers.
    pub fn origin(&self) -> &str {
        &self.id
    }

    pub fn info(&self) -> ModuleInfo {
        ModuleInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            abi: self.abi.clone(),
            metadata: self.metadata.clone(),
        }
    }

    pub fn state(&self) -> ModuleState {
        self.state
    }

    pub fn tests(&self) -> &[TestDelegate] {
        &self.tests
    }

    pub fn add_tests(&mut self, tests: Vec<TestDelegate>) {
        self.tests.extend(tests);
    }

    pub(crate) fn take_tests(&mut self) -> Vec<TestDelegate> {
        std::mem::take(&mut self.tests)
    }

    pub fn preparers(&self) -> &PreparerOwnership {
        &self.preparers
    }

    /// Sum of the test case counts of every delegate that knows its count.
    pub fn expected_test_case_count(&self) -> usize {
        self.tests.iter().filter_map(|t| t.test_case_count()).sum()
    }

    /// The merged result, once the module ran.
    pub fn final_result(&self) -> Option<&TestRunResult> {
        self.final_result.as_ref()
    }

    async fn set_up(&self, context: &InvocationContext) -> SuiteResult<()> {
        match &self.preparers {
            PreparerOwnership::Exclusive(p) => p.set_up(&self.id, context).await,
            PreparerOwnership::Shared(p) => p.set_up(&self.id, context).await,
        }
    }

    async fn tear_down(
        &self,
        context: &InvocationContext,
        error: Option<&SuiteError>,
    ) -> Option<SuiteError> {
        match &self.preparers {
            PreparerOwnership::Exclusive(p) => p.tear_down(&self.id, context, error).await,
            PreparerOwnership::Shared(p) => p.finish(&self.id, context, error).await,
        }
    }

    /// Releases shared preparers held on the device of `context` once this
    /// device has nothing left to run for the pool.
    pub(crate) async fn release(&self, context: &InvocationContext) -> Option<SuiteError> {
        match &self.preparers {
            PreparerOwnership::Exclusive(_) => None,
            PreparerOwnership::Shared(p) => p.release(&self.id, context).await,
        }
    }

    /// Drops the pool registration of a module that will never run.
    pub(crate) fn abandon(&self) {
        if let PreparerOwnership::Shared(p) = &self.preparers {
            p.unregister();
        }
    }

    /// Runs the module and replays its result to `listener`.
    ///
    /// # Errors
    ///
    /// Only `DeviceNotAvailable` is returned, after teardown was attempted and
    /// the partial result was reported.
    pub async fn run(
        &mut self,
        context: &InvocationContext,
        listener: &dyn TestListener,
        options: &ModuleRunOptions,
    ) -> SuiteResult<()> {
        let strategy = self
            .controller
            .as_ref()
            .map(|c| c.should_run(context))
            .unwrap_or_default();

        if strategy == RunStrategy::FullModuleBypass {
            info!("{}: bypassed by module controller", self.id);
            self.state = ModuleState::TearingDown;
            let teardown_error = match &self.preparers {
                PreparerOwnership::Exclusive(p) => p.tear_down(&self.id, context, None).await,
                PreparerOwnership::Shared(p) => {
                    p.unregister();
                    p.release(&self.id, context).await
                }
            };
            self.state = ModuleState::Done;
            return match teardown_error {
                Some(e) if e.is_fatal() => {
                    self.state = ModuleState::Aborted;
                    Err(e)
                }
                _ => Ok(()),
            };
        }

        info!("{}: starting ({} delegates)", self.id, self.tests.len());
        self.state = ModuleState::Preparing;

        let mut results = Vec::new();
        let mut module_error: Option<SuiteError> = None;

        match self.set_up(context).await {
            Err(e) => {
                error!("{}: setup failed: {}", self.id, e);
                let mut result = TestRunResult::new(&self.id);
                result.started = true;
                result.add_run_failure(e.to_string());
                results.push(result);
                module_error = Some(e);
            }
            Ok(()) => {
                self.state = ModuleState::Running;
                let skip = strategy == RunStrategy::SkipModuleTestcases;
                if skip {
                    info!("{}: test cases will be reported as skipped", self.id);
                }

                for delegate in &self.tests {
                    let mut wrapper = GranularRetriableTestWrapper::new(
                        delegate.clone(),
                        &self.id,
                        options.max_run_count,
                    )
                    .with_failure_options(options.failure.clone())
                    .with_log_saver(options.log_saver.clone())
                    .mark_test_cases_skipped(skip);

                    let outcome = wrapper.run(context).await;
                    results.push(wrapper.merged_result());
                    if let Err(e) = outcome {
                        module_error = Some(e);
                        break;
                    }
                }
            }
        }

        let mut result = TestRunResult::combine(&self.id, results);
        let completed = result.num_completed();
        if completed < result.expected_count {
            result.add_run_failure(format!(
                "Module {} only ran {} out of {} expected tests.",
                self.id, completed, result.expected_count
            ));
        }

        self.state = ModuleState::TearingDown;
        if let Some(e) = self.tear_down(context, module_error.as_ref()).await {
            result.add_run_failure(e.to_string());
            if e.is_fatal() && module_error.as_ref().is_none_or(|m| !m.is_fatal()) {
                module_error = Some(e);
            }
        }

        result.replay(listener).await;

        let fatal = module_error.filter(SuiteError::is_fatal);
        self.state = if fatal.is_some() {
            ModuleState::Aborted
        } else {
            ModuleState::Done
        };
        info!(
            "{}: finished, {} of {} tests completed",
            self.id, completed, result.expected_count
        );
        self.final_result = Some(result);

        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
