//! Test identities and run results.
//!
//! A [`TestRunResult`] is the outcome of one execution attempt of a delegate
//! (or, after merging, of a whole module). Results are built from listener
//! events by [`ModuleListener`](crate::listener::ModuleListener) and replayed
//! to the invocation-level listeners with [`TestRunResult::replay`].
//!
//! # Merging attempts
//!
//! [`TestRunResult::merge_attempts`] folds the results of successive retry
//! attempts of the same delegate:
//!
//! - the test set is the union of every attempt
//! - a test is `Failure` only if it failed on every attempt that ran it
//! - failure traces of all failing attempts are joined with `\n`, in order
//!
//! [`TestRunResult::combine`] concatenates results of *different* delegates of
//! the same module.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::listener::TestListener;
use crate::log_saver::{LogDataType, LogFile};

/// Metrics attached to a test case or a run.
pub type Metrics = HashMap<String, String>;

/// Identity of one test case: `(class name, method name)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TestDescription {
    pub class_name: String,
    pub test_name: String,
}

impl TestDescription {
    pub fn new(class_name: impl Into<String>, test_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            test_name: test_name.into(),
        }
    }
}

impl fmt::Display for TestDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.class_name, self.test_name)
    }
}

/// Status of a single test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    Failure,
    Ignored,
    AssumptionFailure,
    /// Started but never ended.
    Incomplete,
}

/// A named log artifact attached to a run or a test case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedFile {
    pub name: String,
    pub file: LogFile,
}

/// Result of one test case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub status: TestStatus,
    pub stack_trace: Option<String>,
    pub metrics: Metrics,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub logged_files: Vec<LoggedFile>,
}

impl TestResult {
    pub fn new(status: TestStatus) -> Self {
        Self {
            status,
            stack_trace: None,
            metrics: Metrics::new(),
            start_time: None,
            end_time: None,
            logged_files: Vec::new(),
        }
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.stack_trace = Some(trace.into());
        self
    }
}

/// Outcome of one test run attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestRunResult {
    /// Run name, normally the module id.
    pub name: String,
    /// Number of tests the delegate announced in `test_run_started`.
    pub expected_count: usize,
    /// Per-test results, ordered by identity.
    pub tests: BTreeMap<TestDescription, TestResult>,
    /// Run-level failure, if any.
    pub run_failure: Option<String>,
    pub elapsed: Duration,
    pub metrics: Metrics,
    /// Logs emitted outside of any test case.
    pub logged_files: Vec<LoggedFile>,
    /// Whether `test_run_started` was ever received.
    pub started: bool,
}

impl TestRunResult {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Number of test cases seen.
    pub fn num_tests(&self) -> usize {
        self.tests.len()
    }

    /// Number of test cases with the given status.
    pub fn num_with_status(&self, status: TestStatus) -> usize {
        self.tests.values().filter(|r| r.status == status).count()
    }

    /// Number of test cases that reached an end state.
    pub fn num_completed(&self) -> usize {
        self.tests.len() - self.num_with_status(TestStatus::Incomplete)
    }

    pub fn is_run_failure(&self) -> bool {
        self.run_failure.is_some()
    }

    /// Test cases that failed in this run.
    pub fn failed_tests(&self) -> BTreeSet<TestDescription> {
        self.tests
            .iter()
            .filter(|(_, r)| r.status == TestStatus::Failure)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Appends a run failure message, keeping earlier ones.
    pub fn add_run_failure(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.run_failure = Some(match self.run_failure.take() {
            Some(existing) if !existing.is_empty() => format!("{}\n{}", existing, message),
            _ => message,
        });
    }

    /// Merges retry attempts of the same delegate.
    ///
    /// The expected count is taken from the first attempt, the run is failed
    /// if the last attempt failed at run level (with messages of every failed
    /// attempt), and elapsed times add up.
    pub fn merge_attempts(attempts: &[TestRunResult]) -> TestRunResult {
        let Some(first) = attempts.first() else {
            return TestRunResult::default();
        };

        let mut merged = TestRunResult::new(first.name.clone());
        merged.expected_count = first.expected_count;
        merged.started = attempts.iter().any(|a| a.started);

        let mut history: BTreeMap<TestDescription, Vec<&TestResult>> = BTreeMap::new();
        for attempt in attempts {
            for (id, result) in &attempt.tests {
                history.entry(id.clone()).or_default().push(result);
            }
            merged.elapsed += attempt.elapsed;
            merged.metrics.extend(attempt.metrics.clone());
            merged.logged_files.extend(attempt.logged_files.iter().cloned());
        }

        for (id, results) in history {
            merged.tests.insert(id, merge_test_history(&results));
        }

        if attempts.last().is_some_and(|a| a.is_run_failure()) {
            let messages: Vec<&str> = attempts
                .iter()
                .filter_map(|a| a.run_failure.as_deref())
                .collect();
            merged.run_failure = Some(messages.join("\n"));
        }

        merged
    }

    /// Concatenates the results of different delegates of one module.
    pub fn combine(name: impl Into<String>, results: Vec<TestRunResult>) -> TestRunResult {
        let mut combined = TestRunResult::new(name);
        for result in results {
            combined.expected_count += result.expected_count;
            combined.started |= result.started;
            combined.elapsed += result.elapsed;
            combined.metrics.extend(result.metrics);
            combined.logged_files.extend(result.logged_files);
            combined.tests.extend(result.tests);
            if let Some(failure) = result.run_failure {
                combined.add_run_failure(failure);
            }
        }
        combined
    }

    /// Replays this result as listener events.
    ///
    /// Logs attached to a test case are replayed between its start and end
    /// events so they stay associated with it.
    pub async fn replay(&self, listener: &dyn TestListener) {
        listener.test_run_started(&self.name, self.expected_count).await;

        for (id, result) in &self.tests {
            listener.test_started(id).await;
            match result.status {
                TestStatus::Failure => {
                    listener
                        .test_failed(id, result.stack_trace.as_deref().unwrap_or_default())
                        .await
                }
                TestStatus::AssumptionFailure => {
                    listener
                        .test_assumption_failure(
                            id,
                            result.stack_trace.as_deref().unwrap_or_default(),
                        )
                        .await
                }
                TestStatus::Ignored => listener.test_ignored(id).await,
                TestStatus::Passed | TestStatus::Incomplete => {}
            }
            for logged in &result.logged_files {
                listener
                    .test_log_saved(&logged.name, logged.file.data_type, &logged.file)
                    .await;
            }
            if result.status != TestStatus::Incomplete {
                listener.test_ended(id, &result.metrics).await;
            }
        }

        for logged in &self.logged_files {
            listener
                .test_log_saved(&logged.name, logged.file.data_type, &logged.file)
                .await;
        }

        if let Some(failure) = &self.run_failure {
            listener.test_run_failed(failure).await;
        }
        listener.test_run_ended(self.elapsed, &self.metrics).await;
    }

    /// Attaches a saved log to `test`, or to the run when `test` is `None`.
    pub fn attach_log(&mut self, test: Option<&TestDescription>, name: &str, file: LogFile) {
        let logged = LoggedFile {
            name: name.to_string(),
            file,
        };
        match test.and_then(|id| self.tests.get_mut(id)) {
            Some(result) => result.logged_files.push(logged),
            None => self.logged_files.push(logged),
        }
    }

    /// Logged files of the run and of every test case, with their data type.
    pub fn all_logged_files(&self) -> Vec<(&str, LogDataType)> {
        self.logged_files
            .iter()
            .chain(self.tests.values().flat_map(|r| r.logged_files.iter()))
            .map(|l| (l.name.as_str(), l.file.data_type))
            .collect()
    }
}

fn merge_test_history(results: &[&TestResult]) -> TestResult {
    let Some(last) = results.last() else {
        return TestResult::new(TestStatus::Incomplete);
    };

    let all_failed = results.iter().all(|r| r.status == TestStatus::Failure);
    let any_passed = results.iter().any(|r| r.status == TestStatus::Passed);

    let status = if all_failed {
        TestStatus::Failure
    } else if any_passed {
        TestStatus::Passed
    } else {
        // Never passed but not always failing: keep the latest non-failure status.
        results
            .iter()
            .rev()
            .map(|r| r.status)
            .find(|s| *s != TestStatus::Failure)
            .unwrap_or(last.status)
    };

    let traces: Vec<&str> = results
        .iter()
        .filter(|r| r.status == TestStatus::Failure)
        .filter_map(|r| r.stack_trace.as_deref())
        .collect();

    let mut merged = TestResult::new(status);
    if !traces.is_empty() {
        merged.stack_trace = Some(traces.join("\n"));
    }
    merged.start_time = results.first().and_then(|r| r.start_time);
    merged.end_time = last.end_time;
    merged.metrics = last.metrics.clone();
    merged.logged_files = results
        .iter()
        .flat_map(|r| r.logged_files.iter().cloned())
        .collect();
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(entries: &[(&str, TestStatus, Option<&str>)]) -> TestRunResult {
        let mut run = TestRunResult::new("module");
        run.started = true;
        run.expected_count = entries.len();
        for (name, status, trace) in entries {
            let mut result = TestResult::new(*status);
            result.stack_trace = trace.map(|t| t.to_string());
            run.tests.insert(TestDescription::new("Class", *name), result);
        }
        run
    }

    #[test]
    fn test_display_description() {
        assert_eq!(TestDescription::new("a.B", "testC").to_string(), "a.B#testC");
    }

    #[test]
    fn test_merge_always_failing_concatenates_traces() {
        let attempts = vec![
            attempt(&[("t1", TestStatus::Failure, Some("trace 1"))]),
            attempt(&[("t1", TestStatus::Failure, Some("trace 2"))]),
            attempt(&[("t1", TestStatus::Failure, Some("trace 3"))]),
        ];

        let merged = TestRunResult::merge_attempts(&attempts);
        let result = &merged.tests[&TestDescription::new("Class", "t1")];
        assert_eq!(result.status, TestStatus::Failure);
        assert_eq!(result.stack_trace.as_deref(), Some("trace 1\ntrace 2\ntrace 3"));
    }

    #[test]
    fn test_merge_pass_on_retry_is_passed() {
        let attempts = vec![
            attempt(&[
                ("t1", TestStatus::Passed, None),
                ("t2", TestStatus::Failure, Some("boom")),
            ]),
            attempt(&[("t2", TestStatus::Passed, None)]),
        ];

        let merged = TestRunResult::merge_attempts(&attempts);
        assert_eq!(merged.num_tests(), 2);
        assert_eq!(merged.num_with_status(TestStatus::Passed), 2);
        assert_eq!(merged.expected_count, 2);
        let t2 = &merged.tests[&TestDescription::new("Class", "t2")];
        assert_eq!(t2.stack_trace.as_deref(), Some("boom"));
    }

    #[test]
    fn test_merge_pass_then_fail_on_whole_retry_is_passed() {
        let attempts = vec![
            attempt(&[("t1", TestStatus::Passed, None)]),
            attempt(&[("t1", TestStatus::Failure, Some("flake"))]),
        ];
        let merged = TestRunResult::merge_attempts(&attempts);
        assert_eq!(
            merged.tests[&TestDescription::new("Class", "t1")].status,
            TestStatus::Passed
        );
    }

    #[test]
    fn test_merge_run_failure_only_if_last_attempt_failed() {
        let mut first = attempt(&[("t1", TestStatus::Failure, Some("x"))]);
        first.run_failure = Some("crashed".into());
        let second = attempt(&[("t1", TestStatus::Passed, None)]);

        let merged = TestRunResult::merge_attempts(&[first.clone(), second]);
        assert!(!merged.is_run_failure());

        let mut third = attempt(&[("t1", TestStatus::Failure, Some("y"))]);
        third.run_failure = Some("crashed again".into());
        let merged = TestRunResult::merge_attempts(&[first, third]);
        assert_eq!(merged.run_failure.as_deref(), Some("crashed\ncrashed again"));
    }

    #[test]
    fn test_combine_sums_expected_counts() {
        let a = attempt(&[("t1", TestStatus::Passed, None)]);
        let mut b = attempt(&[("t2", TestStatus::Passed, None), ("t3", TestStatus::Ignored, None)]);
        b.run_failure = Some("oops".into());

        let combined = TestRunResult::combine("m", vec![a, b]);
        assert_eq!(combined.name, "m");
        assert_eq!(combined.expected_count, 3);
        assert_eq!(combined.num_tests(), 3);
        assert_eq!(combined.run_failure.as_deref(), Some("oops"));
    }

    #[test]
    fn test_failed_tests_and_completed_count() {
        let run = attempt(&[
            ("t1", TestStatus::Failure, Some("x")),
            ("t2", TestStatus::Incomplete, None),
            ("t3", TestStatus::Passed, None),
        ]);
        assert_eq!(run.num_completed(), 2);
        let failed = run.failed_tests();
        assert_eq!(failed.len(), 1);
        assert!(failed.contains(&TestDescription::new("Class", "t1")));
    }
}
