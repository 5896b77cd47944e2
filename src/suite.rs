//! Suite orchestration.
//!
//! A [`TestSuite`] loads modules from a [`ModuleLoader`], filters them, splits
//! them into [`ModuleDefinition`]s and runs them in order against one
//! invocation context.
//!
//! # Execution Flow
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │ create_execution_list: load ─► filter ─► split                   │
//! └──────────────────────────────────────────────────────────────────┘
//!                                  │
//!       reboot (before-suite) ─► pre-suite checkers
//!                                  │
//!   ┌──────────────────────────── per module ────────────────────────┐
//!   │ reboot (per-module) ─► pre-module checkers ─► module_started   │
//!   │   ─► ModuleDefinition::run ─► module_ended ─► post checkers    │
//!   └────────────────────────────────────────────────────────────────┘
//!                                  │
//!                        post-suite checkers
//! ```
//!
//! Only `DeviceNotAvailable` stops a run. The modules that did not get to run
//! are still reported, as empty failed runs, so they count in the totals.
//!
//! # Sharding
//!
//! [`TestSuite::split`] produces one suite per module shard, each holding a
//! *direct module*. See [`scheduler`] for how shard suites are distributed
//! and [`merger`] for how shards of the same module are recombined.

pub mod filter;
pub mod merger;
pub mod module;
pub mod pool;
pub mod retry;
pub mod scheduler;
pub mod splitter;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::{FailureConfig, RebootPolicy, SuiteConfig};
use crate::device::{BuildType, DeviceAllocation, InvocationContext};
use crate::error::{SuiteError, SuiteResult};
use crate::framework::{ModuleLoader, StatusCheckerResult, SystemStatusChecker};
use crate::listener::TestListener;
use crate::log_saver::{LogDataType, LogSaver};
use crate::result::Metrics;

pub use filter::ModuleFilter;
pub use merger::{are_part_of_same_suite, merge_splitted_suites};
pub use module::{ModuleDefinition, ModuleRunOptions, ModuleState};
pub use retry::{GranularRetriableTestWrapper, RetryScope};
pub use splitter::ModuleSplitter;

/// When system status checkers run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckPhase {
    PreSuite,
    PostSuite,
    PreModule,
    PostModule,
}

impl CheckPhase {
    fn is_pre(self) -> bool {
        matches!(self, CheckPhase::PreSuite | CheckPhase::PreModule)
    }
}

impl fmt::Display for CheckPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CheckPhase::PreSuite => "pre_suite",
            CheckPhase::PostSuite => "post_suite",
            CheckPhase::PreModule => "pre_module",
            CheckPhase::PostModule => "post_module",
        };
        f.write_str(name)
    }
}

/// A suite of modules run against one invocation context.
pub struct TestSuite {
    options: SuiteConfig,
    failure: FailureConfig,
    loader: Arc<dyn ModuleLoader>,
    checkers: Vec<Arc<dyn SystemStatusChecker>>,
    log_saver: Option<Arc<dyn LogSaver>>,
    direct_module: Option<ModuleDefinition>,
}

impl TestSuite {
    pub fn new(options: SuiteConfig, loader: Arc<dyn ModuleLoader>) -> Self {
        Self {
            options,
            failure: FailureConfig::default(),
            loader,
            checkers: Vec::new(),
            log_saver: None,
            direct_module: None,
        }
    }

    /// Diagnostics captured when a test fails.
    pub fn with_failure_options(mut self, failure: FailureConfig) -> Self {
        self.failure = failure;
        self
    }

    pub fn with_checker(mut self, checker: Arc<dyn SystemStatusChecker>) -> Self {
        self.checkers.push(checker);
        self
    }

    pub fn with_log_saver(mut self, saver: Arc<dyn LogSaver>) -> Self {
        self.log_saver = Some(saver);
        self
    }

    pub fn options(&self) -> &SuiteConfig {
        &self.options
    }

    /// The single module of a shard suite.
    pub fn direct_module(&self) -> Option<&ModuleDefinition> {
        self.direct_module.as_ref()
    }

    pub(crate) fn direct_module_mut(&mut self) -> Option<&mut ModuleDefinition> {
        self.direct_module.as_mut()
    }

    pub(crate) fn take_direct_module(&mut self) -> Option<ModuleDefinition> {
        self.direct_module.take()
    }

    /// A suite with the same settings holding `module` as its direct module.
    pub fn with_direct_module(&self, module: ModuleDefinition) -> TestSuite {
        TestSuite {
            options: self.options.clone(),
            failure: self.failure.clone(),
            loader: self.loader.clone(),
            checkers: self.checkers.clone(),
            log_saver: self.log_saver.clone(),
            direct_module: Some(module),
        }
    }

    fn run_options(&self) -> ModuleRunOptions {
        ModuleRunOptions {
            max_run_count: self.options.max_run_count.max(1),
            failure: self.failure.clone(),
            log_saver: self.log_saver.clone(),
        }
    }

    /// Loads, filters and splits the modules of the suite.
    ///
    /// # Errors
    ///
    /// Fails with [`SuiteError::Config`] on a bad runner whitelist, before
    /// anything is loaded.
    pub fn create_execution_list(
        &self,
        shard_count_hint: usize,
    ) -> SuiteResult<Vec<ModuleDefinition>> {
        let filter = ModuleFilter::new(&self.options, &self.loader.known_runners())?;
        let loaded = self.loader.load_modules(&self.options.abis)?;
        let loaded_count = loaded.len();
        let selected = filter.apply(loaded);
        info!(
            "Selected {} of {} modules",
            selected.len(),
            loaded_count
        );
        Ok(ModuleSplitter::split_configuration(
            selected,
            shard_count_hint,
            self.options.dynamic_sharding,
        ))
    }

    /// Splits the suite into one suite per module shard.
    ///
    /// Returns `None` when the suite is already a shard or `shard_count` is
    /// below 2.
    pub fn split(&self, shard_count: usize) -> SuiteResult<Option<Vec<TestSuite>>> {
        if self.direct_module.is_some() || shard_count < 2 {
            return Ok(None);
        }
        let modules = self.create_execution_list(shard_count)?;
        debug!("Split suite into {} shard suites", modules.len());
        Ok(Some(
            modules
                .into_iter()
                .map(|m| self.with_direct_module(m))
                .collect(),
        ))
    }

    /// Runs the suite: its direct module if it is a shard, every selected
    /// module otherwise.
    ///
    /// # Errors
    ///
    /// `Config` before any device work on misconfiguration;
    /// `DeviceNotAvailable` after the remaining modules were reported.
    pub async fn run(
        &mut self,
        context: &InvocationContext,
        listener: &dyn TestListener,
    ) -> SuiteResult<()> {
        match self.direct_module.take() {
            Some(module) => {
                let mut modules = vec![module];
                let outcome = self.run_modules(&mut modules, context, listener).await;
                self.direct_module = modules.pop();
                outcome
            }
            None => {
                let mut modules = self.create_execution_list(1)?;
                self.run_modules(&mut modules, context, listener).await
            }
        }
    }

    /// Runs `modules` in order with the suite's reboot and checker policy.
    ///
    /// Pool preparers still set up on this device are released afterwards,
    /// and modules that never ran give up their pool registration.
    pub async fn run_modules(
        &self,
        modules: &mut [ModuleDefinition],
        context: &InvocationContext,
        listener: &dyn TestListener,
    ) -> SuiteResult<()> {
        let outcome = self.run_module_sequence(modules, context, listener).await;

        for module in modules.iter() {
            if module.state() == ModuleState::Created {
                module.abandon();
            } else if let Some(e) = module.release(context).await {
                warn!("{}: releasing shared preparers failed: {}", module.id(), e);
            }
        }
        outcome
    }

    async fn run_module_sequence(
        &self,
        modules: &mut [ModuleDefinition],
        context: &InvocationContext,
        listener: &dyn TestListener,
    ) -> SuiteResult<()> {
        let options = self.run_options();

        if self.options.reboot == RebootPolicy::BeforeSuite {
            self.reboot_devices(context, false).await?;
        }
        if self.options.system_checkers {
            self.run_checkers(CheckPhase::PreSuite, context, listener)
                .await?;
        }

        let mut fatal = None;
        let mut next = 0;
        while next < modules.len() {
            let index = next;
            next += 1;

            if let Err(e) = self.before_module(context, listener).await {
                fatal = Some(e);
                next = index;
                break;
            }

            let module = &mut modules[index];
            listener.test_module_started(&module.info()).await;
            let outcome = module.run(context, listener, &options).await;
            listener.test_module_ended().await;

            if let Err(e) = outcome {
                error!("{}: {}, aborting remaining modules", module.id(), e);
                fatal = Some(e);
                break;
            }

            if self.options.per_module_checkers
                && let Err(e) = self
                    .run_checkers(CheckPhase::PostModule, context, listener)
                    .await
            {
                fatal = Some(e);
                break;
            }
        }

        if let Some(e) = fatal {
            for module in &modules[next..] {
                report_not_executed(module, &e, listener).await;
            }
            warn!("Skipping post-suite checks, device not available");
            return Err(e);
        }

        if self.options.system_checkers {
            self.run_checkers(CheckPhase::PostSuite, context, listener)
                .await?;
        }
        Ok(())
    }

    async fn before_module(
        &self,
        context: &InvocationContext,
        listener: &dyn TestListener,
    ) -> SuiteResult<()> {
        if self.options.reboot == RebootPolicy::PerModule {
            self.reboot_devices(context, true).await?;
        }
        if self.options.per_module_checkers {
            self.run_checkers(CheckPhase::PreModule, context, listener)
                .await?;
        }
        Ok(())
    }

    /// Reboots every device. `per_module` reboots skip `user` builds.
    async fn reboot_devices(&self, context: &InvocationContext, per_module: bool) -> SuiteResult<()> {
        for allocation in context.devices() {
            if per_module && allocation.build.build_type == BuildType::User {
                debug!(
                    "Not rebooting {} between modules: user build",
                    allocation.device.serial()
                );
                continue;
            }
            info!("Rebooting {}", allocation.device.serial());
            match allocation.device.reboot().await {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("Reboot of {} failed: {}", allocation.device.serial(), e),
            }
        }
        Ok(())
    }

    /// Runs every checker on every device.
    ///
    /// Failures are logged, evidenced with a bugreport and optionally
    /// reported as a failed run; only `DeviceNotAvailable` is returned.
    async fn run_checkers(
        &self,
        phase: CheckPhase,
        context: &InvocationContext,
        listener: &dyn TestListener,
    ) -> SuiteResult<()> {
        for allocation in context.devices() {
            for checker in &self.checkers {
                let device = allocation.device.as_ref();
                let outcome = if phase.is_pre() {
                    checker.pre_execution_check(device).await
                } else {
                    checker.post_execution_check(device).await
                };
                let result = match outcome {
                    Ok(result) => result,
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => StatusCheckerResult::failed(e.to_string()),
                };
                if result.is_success() {
                    continue;
                }

                let message = result
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("{} failed", checker.name()));
                warn!(
                    "System checker {} failed {} on {}: {}",
                    checker.name(),
                    phase,
                    device.serial(),
                    message
                );

                if result.bugreport_needed {
                    self.capture_bugreport(allocation, checker.name(), phase, listener)
                        .await;
                }

                if self.options.report_checkers_as_failures {
                    let run_name = format!("{}_{}_check", checker.name(), phase);
                    listener.test_run_started(&run_name, 0).await;
                    listener.test_run_failed(&message).await;
                    listener
                        .test_run_ended(Duration::ZERO, &Metrics::new())
                        .await;
                }
            }
        }
        Ok(())
    }

    async fn capture_bugreport(
        &self,
        allocation: &DeviceAllocation,
        checker: &str,
        phase: CheckPhase,
        listener: &dyn TestListener,
    ) {
        let serial = allocation.device.serial();
        let data = match allocation.device.take_bugreport().await {
            Ok(data) => data,
            Err(e) => {
                warn!("Bugreport on {} after {} failed: {}", serial, checker, e);
                return;
            }
        };

        let name = format!("bugreport_{}_{}_{}", checker, phase, serial);
        match &self.log_saver {
            Some(saver) => match saver
                .save_log_data(&name, LogDataType::Bugreport, &data)
                .await
            {
                Ok(file) => {
                    listener
                        .test_log_saved(&name, LogDataType::Bugreport, &file)
                        .await
                }
                Err(e) => warn!("Failed to save {}: {}", name, e),
            },
            None => listener.test_log(&name, LogDataType::Bugreport, &data).await,
        }
    }
}

/// Reports a module that never ran because the device went away.
async fn report_not_executed(
    module: &ModuleDefinition,
    cause: &SuiteError,
    listener: &dyn TestListener,
) {
    listener.test_module_started(&module.info()).await;
    listener
        .test_run_started(module.id(), module.expected_test_case_count())
        .await;
    listener
        .test_run_failed(&format!(
            "Module {} did not run: {}",
            module.id(),
            cause
        ))
        .await;
    listener
        .test_run_ended(Duration::ZERO, &Metrics::new())
        .await;
    listener.test_module_ended().await;
}
