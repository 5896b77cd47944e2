//! Test doubles shared by the unit tests.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::device::{BuildInfo, Device, InvocationContext};
use crate::error::{SuiteError, SuiteResult};
use crate::framework::{
    ModuleConfig, ModuleLoader, MultiTargetPreparer, RemoteTest, Shardability,
    StatusCheckerResult, SystemStatusChecker, TargetPreparer, TestDelegate, TestFilterReceiver,
};
use crate::listener::{ModuleInfo, TestListener};
use crate::log_saver::{LogDataType, LogFile, LogSaver};
use crate::result::{Metrics, TestDescription};

/// Records every event as a short string.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<String>>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events().iter().filter(|e| e.starts_with(prefix)).count()
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl TestListener for RecordingListener {
    async fn invocation_started(&self, _context: &InvocationContext) {
        self.push("invocation_started".into());
    }

    async fn invocation_ended(&self, _elapsed: Duration) {
        self.push("invocation_ended".into());
    }

    async fn test_module_started(&self, module: &ModuleInfo) {
        self.push(format!("module_started {}", module.id));
    }

    async fn test_module_ended(&self) {
        self.push("module_ended".into());
    }

    async fn test_run_started(&self, name: &str, test_count: usize) {
        self.push(format!("run_started {} {}", name, test_count));
    }

    async fn test_started(&self, test: &TestDescription) {
        self.push(format!("started {}", test));
    }

    async fn test_failed(&self, test: &TestDescription, _trace: &str) {
        self.push(format!("failed {}", test));
    }

    async fn test_assumption_failure(&self, test: &TestDescription, _trace: &str) {
        self.push(format!("assumption_failure {}", test));
    }

    async fn test_ignored(&self, test: &TestDescription) {
        self.push(format!("ignored {}", test));
    }

    async fn test_ended(&self, test: &TestDescription, _metrics: &Metrics) {
        self.push(format!("ended {}", test));
    }

    async fn test_run_failed(&self, message: &str) {
        self.push(format!("run_failed {}", message));
    }

    async fn test_run_ended(&self, _elapsed: Duration, _metrics: &Metrics) {
        self.push("run_ended".into());
    }

    async fn test_log(&self, name: &str, _data_type: LogDataType, _data: &[u8]) {
        self.push(format!("log {}", name));
    }

    async fn test_log_saved(&self, name: &str, _data_type: LogDataType, _file: &LogFile) {
        self.push(format!("log_saved {}", name));
    }
}

/// Keeps saved logs in memory.
#[derive(Default)]
pub struct MemoryLogSaver {
    saved: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MemoryLogSaver {
    pub fn saved_names(&self) -> Vec<String> {
        self.saved
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }
}

#[async_trait]
impl LogSaver for MemoryLogSaver {
    async fn save_log_data(
        &self,
        name: &str,
        data_type: LogDataType,
        data: &[u8],
    ) -> SuiteResult<LogFile> {
        self.saved
            .lock()
            .unwrap()
            .push((name.to_string(), data.to_vec()));
        Ok(LogFile {
            path: format!("/mem/{}", name).into(),
            url: format!("mem://{}", name),
            data_type,
        })
    }
}

/// A device that records reboots.
pub struct FakeDevice {
    serial: String,
    reboots: AtomicUsize,
    failing: bool,
}

impl FakeDevice {
    pub fn new(serial: &str) -> Self {
        Self {
            serial: serial.to_string(),
            reboots: AtomicUsize::new(0),
            failing: false,
        }
    }

    /// Every diagnostic capture fails.
    pub fn failing_diagnostics(mut self) -> Self {
        self.failing = true;
        self
    }

    pub fn reboots(&self) -> usize {
        self.reboots.load(Ordering::SeqCst)
    }

    fn capture(&self, what: &str) -> SuiteResult<Vec<u8>> {
        if self.failing {
            Err(SuiteError::DeviceUnresponsive(format!("{} on {}", what, self.serial)))
        } else {
            Ok(format!("{} of {}", what, self.serial).into_bytes())
        }
    }
}

#[async_trait]
impl Device for FakeDevice {
    fn serial(&self) -> &str {
        &self.serial
    }

    async fn reboot(&self) -> SuiteResult<()> {
        self.reboots.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn take_bugreport(&self) -> SuiteResult<Vec<u8>> {
        self.capture("bugreport")
    }

    async fn take_screenshot(&self) -> SuiteResult<Vec<u8>> {
        self.capture("screenshot")
    }

    async fn logcat_since(&self, _since: DateTime<Utc>, _max_bytes: usize) -> SuiteResult<Vec<u8>> {
        self.capture("logcat")
    }
}

/// Context with a single [`FakeDevice`] named `device`.
pub fn fake_context(serial: &str) -> InvocationContext {
    InvocationContext::new().with_device(
        "device",
        Arc::new(FakeDevice::new(serial)),
        BuildInfo::default(),
    )
}

/// How a [`StubTest`] ends its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StubEnding {
    #[default]
    Normal,
    DeviceNotAvailable,
    DeviceUnresponsive,
    HarnessError,
}

#[derive(Clone)]
struct StubBehavior {
    class: String,
    runner: String,
    failing: HashMap<String, usize>,
    missing: usize,
    ending: StubEnding,
    shardability: Shardability,
    logs: bool,
}

/// A scripted delegate with test cases `test0..testN`.
pub struct StubTest {
    behavior: StubBehavior,
    names: Vec<String>,
    runs: Arc<AtomicUsize>,
    filters: Mutex<BTreeSet<TestDescription>>,
}

impl StubTest {
    pub fn new(class: &str, count: usize) -> Self {
        Self {
            behavior: StubBehavior {
                class: class.to_string(),
                runner: "stub".to_string(),
                failing: HashMap::new(),
                missing: 0,
                ending: StubEnding::Normal,
                shardability: Shardability::None,
                logs: false,
            },
            names: (0..count).map(|i| format!("test{}", i)).collect(),
            runs: Arc::new(AtomicUsize::new(0)),
            filters: Mutex::new(BTreeSet::new()),
        }
    }

    /// `test` fails on its first `attempts` runs.
    pub fn failing(mut self, test: &str, attempts: usize) -> Self {
        self.behavior.failing.insert(test.to_string(), attempts);
        self
    }

    /// Announces `missing` more tests than it runs.
    pub fn short_by(mut self, missing: usize) -> Self {
        self.behavior.missing = missing;
        self
    }

    pub fn ending(mut self, ending: StubEnding) -> Self {
        self.behavior.ending = ending;
        self
    }

    /// Emits a text log `<test>-log` while each test runs.
    pub fn emitting_logs(mut self) -> Self {
        self.behavior.logs = true;
        self
    }

    pub fn with_runner(mut self, runner: &str) -> Self {
        self.behavior.runner = runner.to_string();
        self
    }

    pub fn with_shardability(mut self, shardability: Shardability) -> Self {
        self.behavior.shardability = shardability;
        self
    }

    /// Counter of `run` calls, shared with shards.
    pub fn run_counter(&self) -> Arc<AtomicUsize> {
        self.runs.clone()
    }

    pub fn id(&self, name: &str) -> TestDescription {
        TestDescription::new(&self.behavior.class, name)
    }
}

#[async_trait]
impl RemoteTest for StubTest {
    fn runner_name(&self) -> &str {
        &self.behavior.runner
    }

    async fn run(
        &self,
        _context: &InvocationContext,
        listener: &dyn TestListener,
    ) -> SuiteResult<()> {
        let attempt = self.runs.fetch_add(1, Ordering::SeqCst);
        let selected: Vec<TestDescription> = {
            let filters = self.filters.lock().unwrap();
            self.names
                .iter()
                .map(|n| self.id(n))
                .filter(|id| filters.is_empty() || filters.contains(id))
                .collect()
        };

        listener
            .test_run_started(&self.behavior.class, selected.len() + self.behavior.missing)
            .await;
        for id in &selected {
            listener.test_started(id).await;
            if self.behavior.logs {
                let name = format!("{}-log", id);
                listener.test_log(&name, LogDataType::Text, b"stub log").await;
            }
            let fails = self
                .behavior
                .failing
                .get(&id.test_name)
                .is_some_and(|n| attempt < *n);
            if fails {
                listener
                    .test_failed(id, &format!("stub failure {}", attempt))
                    .await;
            }
            listener.test_ended(id, &Metrics::new()).await;
        }

        match self.behavior.ending {
            StubEnding::Normal => {}
            StubEnding::DeviceNotAvailable => {
                return Err(SuiteError::DeviceNotAvailable("stub device gone".into()));
            }
            StubEnding::DeviceUnresponsive => {
                return Err(SuiteError::DeviceUnresponsive("stub device hung".into()));
            }
            StubEnding::HarnessError => {
                return Err(SuiteError::Harness("stub crashed".into()));
            }
        }

        listener.test_run_ended(Duration::from_millis(1), &Metrics::new()).await;
        Ok(())
    }

    fn shardability(&self) -> Shardability {
        self.behavior.shardability
    }

    fn split(&self, shard_count_hint: usize) -> Option<Vec<TestDelegate>> {
        if self.behavior.shardability == Shardability::None || shard_count_hint < 2 {
            return None;
        }
        let per_shard = self.names.len().div_ceil(shard_count_hint).max(1);
        Some(
            self.names
                .chunks(per_shard)
                .map(|chunk| {
                    TestDelegate::filterable(StubTest {
                        behavior: self.behavior.clone(),
                        names: chunk.to_vec(),
                        runs: self.runs.clone(),
                        filters: Mutex::new(BTreeSet::new()),
                    })
                })
                .collect(),
        )
    }

    fn test_case_count(&self) -> Option<usize> {
        Some(self.names.len())
    }
}

impl TestFilterReceiver for StubTest {
    fn add_include_filter(&self, test: &TestDescription) {
        self.filters.lock().unwrap().insert(test.clone());
    }

    fn clear_include_filters(&self) {
        self.filters.lock().unwrap().clear();
    }
}

/// Shared log of preparer calls, e.g. `"setup p1"`, `"teardown p1"`.
pub type Journal = Arc<Mutex<Vec<String>>>;

/// A preparer recording its calls into a [`Journal`].
#[derive(Clone)]
pub struct FakePreparer {
    name: String,
    journal: Journal,
    copies: Arc<AtomicUsize>,
    fail_setup: bool,
    fail_teardown: bool,
    disabled: bool,
    teardown_disabled: bool,
    tag_device: bool,
}

impl FakePreparer {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            journal: Journal::default(),
            copies: Arc::new(AtomicUsize::new(0)),
            fail_setup: false,
            fail_teardown: false,
            disabled: false,
            teardown_disabled: false,
            tag_device: false,
        }
    }

    pub fn with_journal(mut self, journal: &Journal) -> Self {
        self.journal = journal.clone();
        self
    }

    pub fn failing_setup(mut self) -> Self {
        self.fail_setup = true;
        self
    }

    pub fn failing_teardown(mut self) -> Self {
        self.fail_teardown = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    pub fn teardown_disabled(mut self) -> Self {
        self.teardown_disabled = true;
        self
    }

    /// Journal entries carry the device serial, e.g. `setup p a`.
    pub fn tagging_device(mut self) -> Self {
        self.tag_device = true;
        self
    }

    /// Number of `duplicate` calls on this preparer and its copies.
    pub fn copy_counter(&self) -> Arc<AtomicUsize> {
        self.copies.clone()
    }

    pub fn into_arc(self) -> Arc<dyn TargetPreparer> {
        Arc::new(self)
    }

    pub fn into_multi_arc(self) -> Arc<dyn MultiTargetPreparer> {
        Arc::new(self)
    }

    fn record(&self, step: &str, device: Option<&dyn Device>) {
        let entry = match device {
            Some(device) if self.tag_device => {
                format!("{} {} {}", step, self.name, device.serial())
            }
            _ => format!("{} {}", step, self.name),
        };
        self.journal.lock().unwrap().push(entry);
    }

    fn setup_result(&self, device: Option<&dyn Device>) -> SuiteResult<()> {
        self.record("setup", device);
        if self.fail_setup {
            Err(SuiteError::TargetSetup(format!("{} failed", self.name)))
        } else {
            Ok(())
        }
    }

    fn teardown_result(&self, device: Option<&dyn Device>) -> SuiteResult<()> {
        self.record("teardown", device);
        if self.fail_teardown {
            Err(SuiteError::Harness(format!("{} teardown failed", self.name)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TargetPreparer for FakePreparer {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_disabled(&self) -> bool {
        self.disabled
    }

    fn is_tear_down_disabled(&self) -> bool {
        self.teardown_disabled
    }

    async fn set_up(&self, device: &dyn Device, _build: &BuildInfo) -> SuiteResult<()> {
        self.setup_result(Some(device))
    }

    async fn tear_down(
        &self,
        device: &dyn Device,
        _build: &BuildInfo,
        _error: Option<&SuiteError>,
    ) -> SuiteResult<()> {
        self.teardown_result(Some(device))
    }

    fn duplicate(&self) -> Arc<dyn TargetPreparer> {
        self.copies.fetch_add(1, Ordering::SeqCst);
        Arc::new(self.clone())
    }
}

#[async_trait]
impl MultiTargetPreparer for FakePreparer {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_disabled(&self) -> bool {
        self.disabled
    }

    fn is_tear_down_disabled(&self) -> bool {
        self.teardown_disabled
    }

    async fn set_up(&self, _context: &InvocationContext) -> SuiteResult<()> {
        self.setup_result(None)
    }

    async fn tear_down(
        &self,
        _context: &InvocationContext,
        _error: Option<&SuiteError>,
    ) -> SuiteResult<()> {
        self.teardown_result(None)
    }

    fn duplicate(&self) -> Arc<dyn MultiTargetPreparer> {
        self.copies.fetch_add(1, Ordering::SeqCst);
        Arc::new(self.clone())
    }
}

/// A checker returning fixed results.
pub struct FakeChecker {
    name: String,
    pre: Option<String>,
    post: Option<String>,
    calls: AtomicUsize,
}

impl FakeChecker {
    pub fn passing(name: &str) -> Self {
        Self {
            name: name.to_string(),
            pre: None,
            post: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing_pre(mut self, message: &str) -> Self {
        self.pre = Some(message.to_string());
        self
    }

    pub fn failing_post(mut self, message: &str) -> Self {
        self.post = Some(message.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn result(&self, failure: &Option<String>) -> StatusCheckerResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match failure {
            Some(message) => StatusCheckerResult::failed(message.clone()),
            None => StatusCheckerResult::success(),
        }
    }
}

#[async_trait]
impl SystemStatusChecker for FakeChecker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn pre_execution_check(&self, _device: &dyn Device) -> SuiteResult<StatusCheckerResult> {
        Ok(self.result(&self.pre))
    }

    async fn post_execution_check(
        &self,
        _device: &dyn Device,
    ) -> SuiteResult<StatusCheckerResult> {
        Ok(self.result(&self.post))
    }
}

/// A loader handing out fixed module configurations.
pub struct FakeLoader {
    modules: Vec<ModuleConfig>,
    runners: BTreeSet<String>,
}

impl FakeLoader {
    pub fn new(modules: Vec<ModuleConfig>) -> Self {
        Self {
            modules,
            runners: BTreeSet::from(["stub".to_string()]),
        }
    }

    pub fn with_runner(mut self, runner: &str) -> Self {
        self.runners.insert(runner.to_string());
        self
    }
}

impl ModuleLoader for FakeLoader {
    fn load_modules(&self, _abis: &[String]) -> SuiteResult<Vec<ModuleConfig>> {
        Ok(self.modules.clone())
    }

    fn known_runners(&self) -> BTreeSet<String> {
        self.runners.clone()
    }
}
