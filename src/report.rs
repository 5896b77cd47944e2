//! Result reporting and console output.
//!
//! [`ResultReporter`] collects every module's events into [`TestRunResult`]s
//! and summarizes them. [`ConsoleReporter`] and [`junit::JUnitReporter`] build
//! on it to print progress and write JUnit XML.
//!
//! # Counting Rules
//!
//! | Quantity | Counted as |
//! |----------|------------|
//! | total modules | distinct module ids that started at least one run |
//! | complete modules | modules whose every run finished without a run failure |
//! | total tests | sum of the test counts announced by `test_run_started` |
//!
//! Shards of one module report under the same id and are counted once.
//! A bypassed module never starts a run and is not counted.

pub mod junit;

pub use junit::JUnitReporter;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::device::InvocationContext;
use crate::listener::{ModuleInfo, ModuleListener, TestListener};
use crate::log_saver::{LogDataType, LogFile};
use crate::result::{Metrics, TestDescription, TestRunResult, TestStatus};

/// Aggregate outcome of an invocation.
///
/// # Exit Codes
///
/// | Code | Meaning |
/// |------|---------|
/// | 0 | Every module complete, no failed test |
/// | 1 | Failed tests, run failures or incomplete modules |
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SuiteSummary {
    pub total_modules: usize,
    pub complete_modules: usize,
    pub total_tests: usize,
    pub passed: usize,
    pub failed: usize,
    pub ignored: usize,
    pub assumption_failures: usize,
    /// Runs, in or out of modules, that ended with a run failure.
    pub run_failures: usize,
    pub elapsed: Duration,
}

impl SuiteSummary {
    pub fn success(&self) -> bool {
        self.failed == 0 && self.run_failures == 0 && self.complete_modules == self.total_modules
    }

    pub fn exit_code(&self) -> i32 {
        if self.success() { 0 } else { 1 }
    }
}

/// One module occurrence as seen by a reporter.
#[derive(Debug, Clone)]
pub struct ModuleRecord {
    pub info: ModuleInfo,
    pub result: TestRunResult,
}

impl ModuleRecord {
    /// The module ran and no run failure was reported.
    pub fn is_complete(&self) -> bool {
        self.result.started && !self.result.is_run_failure()
    }
}

#[derive(Default)]
struct CollectorState {
    module: Option<(ModuleInfo, Arc<ModuleListener>)>,
    /// Run outside any module, e.g. a system checker failure.
    loose: Option<Arc<ModuleListener>>,
    records: Vec<ModuleRecord>,
    loose_runs: Vec<TestRunResult>,
    elapsed: Duration,
}

/// Collects invocation results and computes the [`SuiteSummary`].
#[derive(Default)]
pub struct ResultReporter {
    state: Mutex<CollectorState>,
}

impl ResultReporter {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, CollectorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Listener for the events of the current run, if one is open.
    fn target(&self) -> Option<Arc<ModuleListener>> {
        let state = self.state();
        match &state.module {
            Some((_, listener)) => Some(listener.clone()),
            None => state.loose.clone(),
        }
    }

    /// Every finished module occurrence, in reporting order.
    pub fn records(&self) -> Vec<ModuleRecord> {
        self.state().records.clone()
    }

    /// The most recently finished module.
    pub fn last_record(&self) -> Option<ModuleRecord> {
        self.state().records.last().cloned()
    }

    /// Runs reported outside of any module.
    pub fn loose_runs(&self) -> Vec<TestRunResult> {
        self.state().loose_runs.clone()
    }

    pub fn summary(&self) -> SuiteSummary {
        let state = self.state();
        let mut summary = SuiteSummary {
            elapsed: state.elapsed,
            ..SuiteSummary::default()
        };

        let mut modules: Vec<(&str, bool)> = Vec::new();
        for record in state.records.iter().filter(|r| r.result.started) {
            let result = &record.result;
            summary.total_tests += result.expected_count;
            summary.passed += result.num_with_status(TestStatus::Passed);
            summary.failed += result.num_with_status(TestStatus::Failure);
            summary.ignored += result.num_with_status(TestStatus::Ignored);
            summary.assumption_failures += result.num_with_status(TestStatus::AssumptionFailure);
            if result.is_run_failure() {
                summary.run_failures += 1;
            }

            match modules.iter_mut().find(|(id, _)| *id == record.info.id) {
                Some((_, complete)) => *complete &= record.is_complete(),
                None => modules.push((&record.info.id, record.is_complete())),
            }
        }
        summary.run_failures += state
            .loose_runs
            .iter()
            .filter(|r| r.is_run_failure())
            .count();

        summary.total_modules = modules.len();
        summary.complete_modules = modules.iter().filter(|(_, complete)| *complete).count();
        summary
    }
}

#[async_trait]
impl TestListener for ResultReporter {
    async fn invocation_ended(&self, elapsed: Duration) {
        self.state().elapsed = elapsed;
    }

    async fn test_module_started(&self, module: &ModuleInfo) {
        self.state().module = Some((module.clone(), Arc::new(ModuleListener::new(&module.id))));
    }

    async fn test_module_ended(&self) {
        let mut state = self.state();
        if let Some((info, listener)) = state.module.take() {
            let result = listener.current_result();
            state.records.push(ModuleRecord { info, result });
        }
    }

    async fn test_run_started(&self, name: &str, test_count: usize) {
        let target = {
            let mut guard = self.state();
            let state = &mut *guard;
            match &state.module {
                Some((_, listener)) => listener.clone(),
                None => state
                    .loose
                    .get_or_insert_with(|| Arc::new(ModuleListener::new(name)))
                    .clone(),
            }
        };
        target.test_run_started(name, test_count).await;
    }

    async fn test_started(&self, test: &TestDescription) {
        if let Some(target) = self.target() {
            target.test_started(test).await;
        }
    }

    async fn test_failed(&self, test: &TestDescription, trace: &str) {
        if let Some(target) = self.target() {
            target.test_failed(test, trace).await;
        }
    }

    async fn test_assumption_failure(&self, test: &TestDescription, trace: &str) {
        if let Some(target) = self.target() {
            target.test_assumption_failure(test, trace).await;
        }
    }

    async fn test_ignored(&self, test: &TestDescription) {
        if let Some(target) = self.target() {
            target.test_ignored(test).await;
        }
    }

    async fn test_ended(&self, test: &TestDescription, metrics: &Metrics) {
        if let Some(target) = self.target() {
            target.test_ended(test, metrics).await;
        }
    }

    async fn test_run_failed(&self, message: &str) {
        if let Some(target) = self.target() {
            target.test_run_failed(message).await;
        }
    }

    async fn test_run_ended(&self, elapsed: Duration, metrics: &Metrics) {
        if let Some(target) = self.target() {
            target.test_run_ended(elapsed, metrics).await;
        }
        let mut state = self.state();
        if state.module.is_none()
            && let Some(loose) = state.loose.take()
        {
            let result = loose.current_result();
            state.loose_runs.push(result);
        }
    }

    async fn test_log_saved(&self, name: &str, data_type: LogDataType, file: &LogFile) {
        if let Some(target) = self.target() {
            target.test_log_saved(name, data_type, file).await;
        }
    }
}

/// Prints one line per module and a colored summary at the end.
pub struct ConsoleReporter {
    collector: ResultReporter,
    verbose: bool,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self {
            collector: ResultReporter::new(),
            verbose,
        }
    }

    pub fn summary(&self) -> SuiteSummary {
        self.collector.summary()
    }

    fn print_module(&self, record: &ModuleRecord) {
        let result = &record.result;
        if !result.started {
            println!("{} {}", console::style("SKIP").dim(), record.info.id);
            return;
        }

        let passed = result.num_with_status(TestStatus::Passed);
        let status = if record.is_complete() && result.num_with_status(TestStatus::Failure) == 0 {
            console::style("PASS").green()
        } else {
            console::style("FAIL").red()
        };
        println!(
            "{} {} ({}/{} passed, {:.1}s)",
            status,
            record.info.id,
            passed,
            result.expected_count,
            result.elapsed.as_secs_f64()
        );

        for test in result.failed_tests() {
            println!("    {} {}", console::style("failed").red(), test);
            if self.verbose
                && let Some(trace) = result.tests.get(&test).and_then(|t| t.stack_trace.as_ref())
            {
                println!("{}", console::style(trace).dim());
            }
        }
        if let Some(message) = &result.run_failure {
            println!("    {} {}", console::style("run failure:").red().bold(), message);
        }
    }
}

/// Prints the invocation summary with colored counts.
pub fn print_summary(summary: &SuiteSummary) {
    println!();
    println!("Suite Results:");
    println!(
        "  Modules: {}/{} complete",
        summary.complete_modules, summary.total_modules
    );
    println!("  Tests:   {}", summary.total_tests);
    println!("  Passed:  {}", console::style(summary.passed).green());
    println!("  Failed:  {}", console::style(summary.failed).red());
    println!("  Ignored: {}", console::style(summary.ignored).yellow());

    if summary.assumption_failures > 0 {
        println!(
            "  Assumption failures: {}",
            console::style(summary.assumption_failures).yellow()
        );
    }
    if summary.run_failures > 0 {
        println!(
            "  Run failures: {}",
            console::style(summary.run_failures).red().bold()
        );
    }

    println!("  Duration: {:?}", summary.elapsed);

    println!();
    if summary.success() {
        println!("{}", console::style("All modules passed!").green().bold());
    } else if summary.failed == 0 {
        println!(
            "{}",
            console::style("Some modules did not complete.").red().bold()
        );
    } else {
        println!("{}", console::style("Some tests failed.").red().bold());
    }
}

#[async_trait]
impl TestListener for ConsoleReporter {
    async fn invocation_started(&self, context: &InvocationContext) {
        let serials: Vec<&str> = context.devices().iter().map(|d| d.device.serial()).collect();
        println!("Running on {}", serials.join(", "));
    }

    async fn invocation_ended(&self, elapsed: Duration) {
        self.collector.invocation_ended(elapsed).await;
        print_summary(&self.collector.summary());
    }

    async fn test_module_started(&self, module: &ModuleInfo) {
        self.collector.test_module_started(module).await;
    }

    async fn test_module_ended(&self) {
        self.collector.test_module_ended().await;
        if let Some(record) = self.collector.last_record() {
            self.print_module(&record);
        }
    }

    async fn test_run_started(&self, name: &str, test_count: usize) {
        self.collector.test_run_started(name, test_count).await;
    }

    async fn test_started(&self, test: &TestDescription) {
        self.collector.test_started(test).await;
    }

    async fn test_failed(&self, test: &TestDescription, trace: &str) {
        self.collector.test_failed(test, trace).await;
    }

    async fn test_assumption_failure(&self, test: &TestDescription, trace: &str) {
        self.collector.test_assumption_failure(test, trace).await;
    }

    async fn test_ignored(&self, test: &TestDescription) {
        self.collector.test_ignored(test).await;
    }

    async fn test_ended(&self, test: &TestDescription, metrics: &Metrics) {
        self.collector.test_ended(test, metrics).await;
    }

    async fn test_run_failed(&self, message: &str) {
        self.collector.test_run_failed(message).await;
    }

    async fn test_run_ended(&self, elapsed: Duration, metrics: &Metrics) {
        self.collector.test_run_ended(elapsed, metrics).await;
    }

    async fn test_log_saved(&self, name: &str, data_type: LogDataType, file: &LogFile) {
        self.collector.test_log_saved(name, data_type, file).await;
    }
}
