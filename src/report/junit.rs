//! JUnit XML report generation.
//!
//! Every module occurrence becomes one `<testsuite>`. Shards of a module show
//! up as several suites with the same name, which CI dashboards aggregate.
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <testsuites name="modsuite" tests="3" failures="1" errors="1" time="1.234">
//!   <testsuite name="arm64-v8a net" tests="3" failures="1" errors="1" skipped="0" time="1.234">
//!     <testcase classname="NetTest" name="test_dns" time="0.100"/>
//!     <testcase classname="NetTest" name="test_tcp" time="0.150">
//!       <failure message="connection refused">connection refused</failure>
//!     </testcase>
//!     <testcase classname="arm64-v8a net" name="module_run">
//!       <error message="Module arm64-v8a net only ran 2 out of 3 expected tests."/>
//!     </testcase>
//!   </testsuite>
//! </testsuites>
//! ```

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use super::{ModuleRecord, ResultReporter};
use crate::listener::{ModuleInfo, TestListener};
use crate::log_saver::{LogDataType, LogFile};
use crate::result::{Metrics, TestDescription, TestResult, TestStatus};

/// Name of the synthetic test case carrying a module's run failure.
const RUN_FAILURE_CASE: &str = "module_run";

/// Writes a JUnit XML file when the invocation ends.
///
/// Parent directories of the output path are created as needed.
pub struct JUnitReporter {
    output_path: PathBuf,
    testsuites_name: String,
    collector: ResultReporter,
}

impl JUnitReporter {
    pub fn new(output_path: PathBuf) -> Self {
        Self {
            output_path,
            testsuites_name: "modsuite".to_string(),
            collector: ResultReporter::new(),
        }
    }

    /// Sets the `name` attribute of the root element.
    pub fn with_testsuites_name(mut self, name: impl Into<String>) -> Self {
        self.testsuites_name = name.into();
        self
    }

    pub fn output_path(&self) -> &PathBuf {
        &self.output_path
    }

    /// Renders everything collected so far.
    pub fn generate_xml(&self) -> anyhow::Result<String> {
        let records: Vec<ModuleRecord> = self
            .collector
            .records()
            .into_iter()
            .filter(|r| r.result.started)
            .collect();
        let summary = self.collector.summary();

        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let tests: usize = records.iter().map(|r| r.result.num_tests()).sum();
        let errors = records.iter().map(errors_in).sum::<usize>();

        let mut testsuites = BytesStart::new("testsuites");
        testsuites.push_attribute(("name", self.testsuites_name.as_str()));
        testsuites.push_attribute(("tests", tests.to_string().as_str()));
        testsuites.push_attribute(("failures", summary.failed.to_string().as_str()));
        testsuites.push_attribute(("errors", errors.to_string().as_str()));
        testsuites.push_attribute(("time", seconds(summary.elapsed).as_str()));
        writer.write_event(Event::Start(testsuites))?;

        for record in &records {
            write_testsuite(&mut writer, record)?;
        }

        writer.write_event(Event::End(BytesEnd::new("testsuites")))?;
        Ok(String::from_utf8(writer.into_inner())?)
    }

    fn write_report(&self) {
        let xml = match self.generate_xml() {
            Ok(xml) => xml,
            Err(e) => {
                tracing::error!("Failed to generate JUnit XML: {}", e);
                return;
            }
        };

        if let Some(parent) = self.output_path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
            && let Err(e) = std::fs::create_dir_all(parent)
        {
            tracing::error!("Failed to create output directory: {}", e);
            return;
        }

        if let Err(e) = std::fs::write(&self.output_path, xml) {
            tracing::error!("Failed to write JUnit XML: {}", e);
        } else {
            tracing::info!("JUnit XML written to: {}", self.output_path.display());
        }
    }
}

/// Incomplete test cases plus the run failure, if any.
fn errors_in(record: &ModuleRecord) -> usize {
    record.result.num_with_status(TestStatus::Incomplete)
        + usize::from(record.result.is_run_failure())
}

fn write_testsuite<W: std::io::Write>(
    writer: &mut Writer<W>,
    record: &ModuleRecord,
) -> anyhow::Result<()> {
    let result = &record.result;
    let skipped = result.num_with_status(TestStatus::Ignored)
        + result.num_with_status(TestStatus::AssumptionFailure);

    let mut testsuite = BytesStart::new("testsuite");
    testsuite.push_attribute(("name", record.info.id.as_str()));
    testsuite.push_attribute(("tests", result.num_tests().to_string().as_str()));
    testsuite.push_attribute((
        "failures",
        result
            .num_with_status(TestStatus::Failure)
            .to_string()
            .as_str(),
    ));
    testsuite.push_attribute(("errors", errors_in(record).to_string().as_str()));
    testsuite.push_attribute(("skipped", skipped.to_string().as_str()));
    testsuite.push_attribute(("time", seconds(result.elapsed).as_str()));
    writer.write_event(Event::Start(testsuite))?;

    for (test, test_result) in &result.tests {
        write_testcase(writer, test, test_result)?;
    }

    if let Some(message) = &result.run_failure {
        let mut testcase = BytesStart::new("testcase");
        testcase.push_attribute(("classname", record.info.id.as_str()));
        testcase.push_attribute(("name", RUN_FAILURE_CASE));
        writer.write_event(Event::Start(testcase))?;
        let mut error = BytesStart::new("error");
        error.push_attribute(("message", sanitize(message).as_str()));
        writer.write_event(Event::Empty(error))?;
        writer.write_event(Event::End(BytesEnd::new("testcase")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
    Ok(())
}

fn write_testcase<W: std::io::Write>(
    writer: &mut Writer<W>,
    test: &TestDescription,
    result: &TestResult,
) -> anyhow::Result<()> {
    let mut testcase = BytesStart::new("testcase");
    testcase.push_attribute(("classname", test.class_name.as_str()));
    testcase.push_attribute(("name", test.test_name.as_str()));
    testcase.push_attribute(("time", seconds(test_duration(result)).as_str()));

    let (element, message) = match result.status {
        TestStatus::Passed => {
            writer.write_event(Event::Empty(testcase))?;
            return Ok(());
        }
        TestStatus::Failure => ("failure", result.stack_trace.as_deref()),
        TestStatus::Incomplete => ("error", Some("test did not finish")),
        TestStatus::Ignored | TestStatus::AssumptionFailure => {
            ("skipped", result.stack_trace.as_deref())
        }
    };

    writer.write_event(Event::Start(testcase))?;
    let mut child = BytesStart::new(element);
    match message {
        Some(message) => {
            let message = sanitize(message);
            let first_line = message.lines().next().unwrap_or_default();
            child.push_attribute(("message", first_line));
            writer.write_event(Event::Start(child))?;
            writer.write_event(Event::Text(BytesText::new(&message)))?;
            writer.write_event(Event::End(BytesEnd::new(element)))?;
        }
        None => writer.write_event(Event::Empty(child))?,
    }
    writer.write_event(Event::End(BytesEnd::new("testcase")))?;
    Ok(())
}

fn test_duration(result: &TestResult) -> Duration {
    match (result.start_time, result.end_time) {
        (Some(start), Some(end)) => (end - start).to_std().unwrap_or_default(),
        _ => Duration::ZERO,
    }
}

fn seconds(duration: Duration) -> String {
    format!("{:.3}", duration.as_secs_f64())
}

/// Drops characters that are not allowed in XML 1.0.
fn sanitize(s: &str) -> String {
    s.chars()
        .filter(|c| matches!(c, '\t' | '\n' | '\r' | ' '..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}' | '\u{10000}'..='\u{10FFFF}'))
        .collect()
}

#[async_trait]
impl TestListener for JUnitReporter {
    async fn invocation_ended(&self, elapsed: Duration) {
        self.collector.invocation_ended(elapsed).await;
        self.write_report();
    }

    async fn test_module_started(&self, module: &ModuleInfo) {
        self.collector.test_module_started(module).await;
    }

    async fn test_module_ended(&self) {
        self.collector.test_module_ended().await;
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

#[cfg(test)]
mod tests {
    use super::*;

    async fn sample(reporter: &JUnitReporter) {
        let module = ModuleInfo {
            id: "arm64-v8a net".into(),
            name: "net".into(),
            abi: Some("arm64-v8a".into()),
            metadata: Default::default(),
        };
        let ok = TestDescription::new("NetTest", "test_dns");
        let bad = TestDescription::new("NetTest", "test_tcp");
        let skipped = TestDescription::new("NetTest", "test_udp");

        reporter.test_module_started(&module).await;
        reporter.test_run_started("arm64-v8a net", 4).await;
        for test in [&ok, &bad, &skipped] {
            reporter.test_started(test).await;
            if test == &bad {
                reporter.test_failed(test, "refused <127.0.0.1>\nat connect").await;
            }
            if test == &skipped {
                reporter.test_ignored(test).await;
            }
            reporter.test_ended(test, &Metrics::new()).await;
        }
        reporter
            .test_run_failed("Module arm64-v8a net only ran 3 out of 4 expected tests.")
            .await;
        reporter
            .test_run_ended(Duration::from_millis(1500), &Metrics::new())
            .await;
        reporter.test_module_ended().await;
    }

    #[tokio::test]
    async fn test_generate_xml() {
        let reporter = JUnitReporter::new("unused.xml".into());
        sample(&reporter).await;

        let xml = reporter.generate_xml().unwrap();
        assert!(xml.contains(r#"<testsuites name="modsuite" tests="3" failures="1" errors="1""#));
        assert!(xml.contains(r#"<testsuite name="arm64-v8a net" tests="3" failures="1" errors="1" skipped="1" time="1.500">"#));
        assert!(xml.contains(r#"<testcase classname="NetTest" name="test_dns""#));
        assert!(xml.contains("refused &lt;127.0.0.1&gt;"));
        assert!(xml.contains(r#"<skipped/>"#));
        assert!(xml.contains(r#"name="module_run""#));
    }

    #[tokio::test]
    async fn test_written_on_invocation_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports").join("junit.xml");
        let reporter = JUnitReporter::new(path.clone()).with_testsuites_name("nightly");
        sample(&reporter).await;
        assert!(!path.exists());

        reporter.invocation_ended(Duration::from_secs(2)).await;
        let xml = std::fs::read_to_string(&path).unwrap();
        assert!(xml.starts_with("<?xml"));
        assert!(xml.contains(r#"name="nightly""#));
        assert!(xml.contains(r#"time="2.000""#));
    }

    #[test]
    fn test_sanitize_drops_control_characters() {
        assert_eq!(sanitize("a\u{0}b\tc"), "ab\tc");
    }
}
