//! Bounded retry of one delegate.
//!
//! [`GranularRetriableTestWrapper`] runs a delegate up to `max_run_count`
//! times. Each attempt reports into a fresh
//! [`ModuleListener`](crate::listener::ModuleListener); attempts are merged
//! with [`TestRunResult::merge_attempts`].
//!
//! ```text
//! attempt 1: all tests ──► failed {A, C}
//! attempt 2: include {A, C} ──► failed {C}
//! attempt 3: include {C} ──► failed {C}
//! merged: A passed, C failed (3 traces)
//! ```
//!
//! Delegates that cannot be filtered are retried whole. An attempt that ended
//! in a run failure is also retried whole, since its unfinished tests are not
//! in any failed set.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::FailureConfig;
use crate::device::InvocationContext;
use crate::error::{SuiteError, SuiteResult};
use crate::framework::TestDelegate;
use crate::listener::{ModuleListener, TestFailureListener};
use crate::log_saver::LogSaver;
use crate::result::TestRunResult;

/// What a retry attempt re-runs, fixed when the wrapper is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryScope {
    /// Only the test cases that failed in the previous attempt.
    FailedTestCases,
    /// The whole delegate.
    WholeDelegate,
}

/// Runs one delegate with bounded retries.
pub struct GranularRetriableTestWrapper {
    delegate: TestDelegate,
    module_id: String,
    scope: RetryScope,
    max_run_count: usize,
    failure_options: FailureConfig,
    log_saver: Option<Arc<dyn LogSaver>>,
    skip_test_cases: bool,
    attempts: Vec<TestRunResult>,
}

impl GranularRetriableTestWrapper {
    pub fn new(delegate: TestDelegate, module_id: impl Into<String>, max_run_count: usize) -> Self {
        let scope = if delegate.is_filterable() {
            RetryScope::FailedTestCases
        } else {
            RetryScope::WholeDelegate
        };
        Self {
            delegate,
            module_id: module_id.into(),
            scope,
            max_run_count: max_run_count.max(1),
            failure_options: FailureConfig {
                bugreport: false,
                screenshot: false,
                logcat: false,
                reboot: false,
                ..Default::default()
            },
            log_saver: None,
            skip_test_cases: false,
            attempts: Vec::new(),
        }
    }

    /// Diagnostics captured on test failure.
    pub fn with_failure_options(mut self, options: FailureConfig) -> Self {
        self.failure_options = options;
        self
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

    pub fn scope(&self) -> RetryScope {
        self.scope
    }

    /// Results of every attempt so far, in order.
    pub fn attempts(&self) -> &[TestRunResult] {
        &self.attempts
    }

    /// All attempts merged into one result.
    pub fn merged_result(&self) -> TestRunResult {
        let mut merged = TestRunResult::merge_attempts(&self.attempts);
        if merged.name.is_empty() {
            merged.name = self.module_id.clone();
        }
        merged
    }

    /// Runs the delegate once and records the attempt.
    ///
    /// # Errors
    ///
    /// Only `DeviceNotAvailable` is returned, after the partial attempt was
    /// recorded. Every other error becomes a run failure of the attempt.
    pub async fn intra_module_run(&mut self, context: &InvocationContext) -> SuiteResult<()> {
        let listener = ModuleListener::new(&self.module_id)
            .with_log_saver(self.log_saver.clone())
            .mark_test_cases_skipped(self.skip_test_cases);

        let capture = !self.skip_test_cases && self.failure_options.any_enabled();
        let outcome = if capture && !context.is_empty() {
            let failure_listener =
                TestFailureListener::new(&listener, context.devices(), &self.failure_options);
            self.delegate.run(context, &failure_listener).await
        } else {
            self.delegate.run(context, &listener).await
        };

        let mut result = listener.into_result();
        result.name = self.module_id.clone();

        let fatal = match outcome {
            Ok(()) => None,
            Err(e @ SuiteError::DeviceUnresponsive(_)) => {
                warn!("{}: {}", self.module_id, e);
                result.add_run_failure(e.to_string());
                None
            }
            Err(e) if e.is_fatal() => {
                warn!("{}: {}, keeping partial results", self.module_id, e);
                result.add_run_failure(e.to_string());
                Some(e)
            }
            Err(e) => {
                warn!("{}: delegate failed: {}", self.module_id, e);
                result.add_run_failure(e.to_string());
                None
            }
        };

        self.attempts.push(result);
        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Runs up to `max_run_count` attempts.
    ///
    /// Stops early once an attempt has neither failed tests nor a run failure.
    pub async fn run(&mut self, context: &InvocationContext) -> SuiteResult<()> {
        let outcome = self.run_attempts(context).await;
        if let TestDelegate::Filterable(test) = &self.delegate {
            test.clear_include_filters();
        }
        outcome
    }

    async fn run_attempts(&mut self, context: &InvocationContext) -> SuiteResult<()> {
        for attempt in 1..=self.max_run_count {
            if let Some(previous) = self.attempts.last() {
                let failed = previous.failed_tests();
                if failed.is_empty() && !previous.is_run_failure() {
                    debug!("{}: no failures after attempt {}", self.module_id, attempt - 1);
                    break;
                }

                match (&self.delegate, self.scope, previous.is_run_failure()) {
                    (TestDelegate::Filterable(test), RetryScope::FailedTestCases, false) => {
                        info!(
                            "{}: retrying {} failed test(s), attempt {}/{}",
                            self.module_id,
                            failed.len(),
                            attempt,
                            self.max_run_count
                        );
                        test.clear_include_filters();
                        test.add_all_include_filters(&failed);
                    }
                    (delegate, _, _) => {
                        info!(
                            "{}: retrying whole delegate, attempt {}/{}",
                            self.module_id, attempt, self.max_run_count
                        );
                        if let TestDelegate::Filterable(test) = delegate {
                            test.clear_include_filters();
                        }
                    }
                }
            }

            self.intra_module_run(context).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::{TestDescription, TestStatus};
    use crate::device::BuildInfo;
    use crate::testing::{FakeDevice, MemoryLogSaver, StubEnding, StubTest, fake_context};

    fn wrapper(test: StubTest, max_run_count: usize) -> GranularRetriableTestWrapper {
        GranularRetriableTestWrapper::new(TestDelegate::filterable(test), "m", max_run_count)
    }

    #[tokio::test]
    async fn test_always_failing_test_uses_every_attempt() {
        let mut w = wrapper(StubTest::new("Stub", 3).failing("test1", usize::MAX), 3);
        w.run(&fake_context("s")).await.unwrap();

        assert_eq!(w.attempts().len(), 3);
        let merged = w.merged_result();
        let failed = &merged.tests[&TestDescription::new("Stub", "test1")];
        assert_eq!(failed.status, TestStatus::Failure);
        assert_eq!(
            failed.stack_trace.as_deref(),
            Some("stub failure 0\nstub failure 1\nstub failure 2")
        );
        assert_eq!(merged.num_with_status(TestStatus::Passed), 2);
        assert_eq!(merged.expected_count, 3);
    }

    #[tokio::test]
    async fn test_retry_only_runs_failed_tests() {
        let mut w = wrapper(StubTest::new("Stub", 3).failing("test2", 1), 3);
        w.run(&fake_context("s")).await.unwrap();

        assert_eq!(w.attempts().len(), 2);
        assert_eq!(w.attempts()[1].num_tests(), 1);
        assert!(
            w.attempts()[1]
                .tests
                .contains_key(&TestDescription::new("Stub", "test2"))
        );
        assert_eq!(w.merged_result().num_with_status(TestStatus::Passed), 3);
    }

    #[tokio::test]
    async fn test_opaque_delegate_is_retried_whole() {
        let delegate = TestDelegate::opaque(StubTest::new("Stub", 3).failing("test0", 1));
        let mut w = GranularRetriableTestWrapper::new(delegate, "m", 2);
        assert_eq!(w.scope(), RetryScope::WholeDelegate);

        w.run(&fake_context("s")).await.unwrap();
        assert_eq!(w.attempts().len(), 2);
        assert_eq!(w.attempts()[1].num_tests(), 3);
    }

    #[tokio::test]
    async fn test_attempt_count_is_bounded() {
        for max_run_count in 1..=4 {
            for failing_attempts in 0..=4 {
                let test = StubTest::new("Stub", 2).failing("test0", failing_attempts);
                let mut w = wrapper(test, max_run_count);
                w.run(&fake_context("s")).await.unwrap();
                assert_eq!(
                    w.attempts().len(),
                    max_run_count.min(1 + failing_attempts),
                    "max_run_count={} failing_attempts={}",
                    max_run_count,
                    failing_attempts
                );
            }
        }
    }

    #[tokio::test]
    async fn test_unresponsive_device_is_run_failure() {
        let mut w = wrapper(
            StubTest::new("Stub", 2).ending(StubEnding::DeviceUnresponsive),
            1,
        );
        w.run(&fake_context("s")).await.unwrap();
        let merged = w.merged_result();
        assert!(merged.is_run_failure());
        assert!(merged.run_failure.unwrap().contains("unresponsive"));
    }

    #[tokio::test]
    async fn test_device_not_available_keeps_partial_attempt() {
        let mut w = wrapper(
            StubTest::new("Stub", 2).ending(StubEnding::DeviceNotAvailable),
            3,
        );
        let err = w.run(&fake_context("s")).await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(w.attempts().len(), 1);
        assert_eq!(w.attempts()[0].num_with_status(TestStatus::Passed), 2);
    }

    #[tokio::test]
    async fn test_failure_diagnostics_are_saved() {
        let saver = Arc::new(MemoryLogSaver::default());
        let mut w = wrapper(StubTest::new("Stub", 1).failing("test0", 1), 1)
            .with_failure_options(FailureConfig::default())
            .with_log_saver(Some(saver.clone()));
        w.run(&fake_context("serial-9")).await.unwrap();

        assert_eq!(saver.saved_names(), vec!["Stub#test0-serial-9-logcat"]);
        let merged = w.merged_result();
        let result = &merged.tests[&TestDescription::new("Stub", "test0")];
        assert_eq!(result.logged_files.len(), 1);
    }

    #[tokio::test]
    async fn test_skipped_failures_capture_no_diagnostics() {
        let device = Arc::new(FakeDevice::new("s"));
        let ctx = InvocationContext::new().with_device("device", device.clone(), BuildInfo::default());
        let saver = Arc::new(MemoryLogSaver::default());
        let mut w = wrapper(StubTest::new("Stub", 1).failing("test0", usize::MAX), 1)
            .with_failure_options(FailureConfig {
                bugreport: true,
                screenshot: true,
                logcat: true,
                reboot: true,
                ..FailureConfig::default()
            })
            .with_log_saver(Some(saver.clone()))
            .mark_test_cases_skipped(true);

        w.run(&ctx).await.unwrap();

        assert!(saver.saved_names().is_empty());
        assert_eq!(device.reboots(), 0);
        let merged = w.merged_result();
        assert_eq!(merged.num_with_status(TestStatus::Ignored), 1);
        assert!(merged.tests[&TestDescription::new("Stub", "test0")].logged_files.is_empty());
    }

    #[tokio::test]
    async fn test_skipped_test_cases_are_not_retried() {
        let mut w = wrapper(StubTest::new("Stub", 2).failing("test0", usize::MAX), 3)
            .mark_test_cases_skipped(true);
        w.run(&fake_context("s")).await.unwrap();
        assert_eq!(w.attempts().len(), 1);
        assert_eq!(w.merged_result().num_with_status(TestStatus::Ignored), 2);
    }
}
