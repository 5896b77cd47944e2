//! Buffering listener for one test run attempt.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use super::TestListener;
use crate::log_saver::{LogDataType, LogFile, LogSaver};
use crate::result::{Metrics, TestDescription, TestResult, TestRunResult, TestStatus};

#[derive(Default)]
struct AttemptState {
    result: TestRunResult,
    current: Option<TestDescription>,
}

/// Collects the events of one attempt into a [`TestRunResult`].
///
/// Logs are persisted through the log saver as soon as they are emitted and
/// attached to the test case running at that moment.
///
/// When test cases are marked skipped, every started test is recorded as
/// ignored and failures are dropped.
pub struct ModuleListener {
    module_id: String,
    log_saver: Option<Arc<dyn LogSaver>>,
    skip_test_cases: bool,
    state: Mutex<AttemptState>,
}

impl ModuleListener {
    pub fn new(module_id: impl Into<String>) -> Self {
        let module_id = module_id.into();
        Self {
            state: Mutex::new(AttemptState {
                result: TestRunResult::new(module_id.clone()),
                current: None,
            }),
            module_id,
            log_saver: None,
            skip_test_cases: false,
        }
    }

    pub fn with_log_saver(mut self, saver: Option<Arc<dyn LogSaver>>) -> Self {
        self.log_saver = saver;
        self
    }

    /// Reports every started test case as ignored.
    pub fn mark_test_cases_skipped(mut self, skip: bool) -> Self {
        self.skip_test_cases = skip;
        self
    }

    fn state(&self) -> MutexGuard<'_, AttemptState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of tests announced by `test_run_started`.
    pub fn num_total_tests(&self) -> usize {
        self.state().result.expected_count
    }

    /// Number of tests that reached an end state.
    pub fn num_completed_tests(&self) -> usize {
        self.state().result.num_completed()
    }

    pub fn has_failed_tests(&self) -> bool {
        self.state().result.num_with_status(TestStatus::Failure) > 0
    }

    pub fn is_run_failure(&self) -> bool {
        self.state().result.is_run_failure()
    }

    /// Snapshot of what was collected so far.
    pub fn current_result(&self) -> TestRunResult {
        self.state().result.clone()
    }

    /// Consumes the listener and returns the attempt's result.
    pub fn into_result(self) -> TestRunResult {
        self.state
            .into_inner()
            .unwrap_or_else(|e| e.into_inner())
            .result
    }
}

#[async_trait]
impl TestListener for ModuleListener {
    async fn test_run_started(&self, _name: &str, test_count: usize) {
        let mut state = self.state();
        state.result.started = true;
        state.result.expected_count += test_count;
    }

    async fn test_started(&self, test: &TestDescription) {
        let status = if self.skip_test_cases {
            TestStatus::Ignored
        } else {
            TestStatus::Incomplete
        };
        let mut result = TestResult::new(status);
        result.start_time = Some(Utc::now());

        let mut state = self.state();
        state.result.tests.insert(test.clone(), result);
        state.current = Some(test.clone());
    }

    async fn test_failed(&self, test: &TestDescription, trace: &str) {
        if self.skip_test_cases {
            debug!("{}: dropping failure of skipped test {}", self.module_id, test);
            return;
        }
        let mut state = self.state();
        let result = state
            .result
            .tests
            .entry(test.clone())
            .or_insert_with(|| TestResult::new(TestStatus::Incomplete));
        result.status = TestStatus::Failure;
        result.stack_trace = Some(trace.to_string());
    }

    async fn test_assumption_failure(&self, test: &TestDescription, trace: &str) {
        if self.skip_test_cases {
            return;
        }
        let mut state = self.state();
        let result = state
            .result
            .tests
            .entry(test.clone())
            .or_insert_with(|| TestResult::new(TestStatus::Incomplete));
        result.status = TestStatus::AssumptionFailure;
        result.stack_trace = Some(trace.to_string());
    }

    async fn test_ignored(&self, test: &TestDescription) {
        let mut state = self.state();
        state
            .result
            .tests
            .entry(test.clone())
            .or_insert_with(|| TestResult::new(TestStatus::Ignored))
            .status = TestStatus::Ignored;
    }

    async fn test_ended(&self, test: &TestDescription, metrics: &Metrics) {
        let mut state = self.state();
        if let Some(result) = state.result.tests.get_mut(test) {
            if result.status == TestStatus::Incomplete {
                result.status = TestStatus::Passed;
            }
            result.end_time = Some(Utc::now());
            result.metrics.extend(metrics.clone());
        }
        if state.current.as_ref() == Some(test) {
            state.current = None;
        }
    }

    async fn test_run_failed(&self, message: &str) {
        self.state().result.add_run_failure(message);
    }

    async fn test_run_ended(&self, elapsed: Duration, metrics: &Metrics) {
        let mut state = self.state();
        state.result.elapsed += elapsed;
        state.result.metrics.extend(metrics.clone());
    }

    async fn test_log(&self, name: &str, data_type: LogDataType, data: &[u8]) {
        let Some(saver) = &self.log_saver else {
            debug!("{}: no log saver, dropping log {}", self.module_id, name);
            return;
        };
        match saver.save_log_data(name, data_type, data).await {
            Ok(file) => self.test_log_saved(name, data_type, &file).await,
            Err(e) => warn!("{}: failed to save log {}: {}", self.module_id, name, e),
        }
    }

    async fn test_log_saved(&self, name: &str, _data_type: LogDataType, file: &LogFile) {
        let mut state = self.state();
        let current = state.current.clone();
        state.result.attach_log(current.as_ref(), name, file.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryLogSaver;

    fn id(name: &str) -> TestDescription {
        TestDescription::new("com.example.Stub", name)
    }

    #[tokio::test]
    async fn test_collects_counts() {
        let listener = ModuleListener::new("arm64 suite/stub");
        listener.test_run_started("arm64 suite/stub", 3).await;
        for (i, name) in ["a", "b"].iter().enumerate() {
            listener.test_started(&id(name)).await;
            if i == 1 {
                listener.test_failed(&id(name), "boom").await;
            }
            listener.test_ended(&id(name), &Metrics::new()).await;
        }
        listener.test_run_ended(Duration::from_millis(5), &Metrics::new()).await;

        assert_eq!(listener.num_total_tests(), 3);
        assert_eq!(listener.num_completed_tests(), 2);
        assert!(listener.has_failed_tests());
        assert!(!listener.is_run_failure());

        let result = listener.into_result();
        assert_eq!(result.num_with_status(TestStatus::Passed), 1);
        assert_eq!(result.failed_tests().len(), 1);
        assert_eq!(result.elapsed, Duration::from_millis(5));
    }

    #[tokio::test]
    async fn test_skip_mode_marks_ignored_and_drops_failures() {
        let listener = ModuleListener::new("m").mark_test_cases_skipped(true);
        listener.test_run_started("m", 2).await;
        listener.test_started(&id("a")).await;
        listener.test_failed(&id("a"), "assert").await;
        listener.test_ended(&id("a"), &Metrics::new()).await;
        listener.test_started(&id("b")).await;
        listener.test_ended(&id("b"), &Metrics::new()).await;

        let result = listener.into_result();
        assert_eq!(result.num_with_status(TestStatus::Ignored), 2);
        assert_eq!(result.num_with_status(TestStatus::Failure), 0);
    }

    #[tokio::test]
    async fn test_logs_attach_to_active_test() {
        let saver = Arc::new(MemoryLogSaver::default());
        let listener = ModuleListener::new("m").with_log_saver(Some(saver.clone()));
        listener.test_run_started("m", 1).await;
        listener.test_log("setup-log", LogDataType::Text, b"x").await;
        listener.test_started(&id("a")).await;
        listener.test_log("a-logcat", LogDataType::Logcat, b"y").await;
        listener.test_ended(&id("a"), &Metrics::new()).await;

        let result = listener.into_result();
        assert_eq!(result.logged_files.len(), 1);
        assert_eq!(result.logged_files[0].name, "setup-log");
        assert_eq!(result.tests[&id("a")].logged_files[0].name, "a-logcat");
        assert_eq!(saver.saved_names(), vec!["setup-log", "a-logcat"]);
    }

    #[tokio::test]
    async fn test_run_failures_accumulate() {
        let listener = ModuleListener::new("m");
        listener.test_run_failed("first").await;
        listener.test_run_failed("second").await;
        assert_eq!(
            listener.current_result().run_failure.as_deref(),
            Some("first\nsecond")
        );
    }
}
