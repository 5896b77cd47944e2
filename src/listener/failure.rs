//! Diagnostic capture on test failure.
//!
//! [`TestFailureListener`] sits between a delegate and the attempt's
//! [`ModuleListener`](super::ModuleListener). Every event is forwarded
//! unchanged; on `test_failed` it additionally collects the diagnostics enabled
//! in [`FailureConfig`] from every allocated device and emits them as
//! `test_log` events while the failing test is still active, so they get
//! attached to it.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::{ModuleInfo, TestListener};
use crate::config::FailureConfig;
use crate::device::{DeviceAllocation, InvocationContext};
use crate::log_saver::{LogDataType, LogFile};
use crate::result::{Metrics, TestDescription};

/// Forwards events and captures diagnostics when a test fails.
pub struct TestFailureListener<'a> {
    inner: &'a dyn TestListener,
    devices: &'a [DeviceAllocation],
    options: &'a FailureConfig,
    start_times: Mutex<HashMap<TestDescription, DateTime<Utc>>>,
}

impl<'a> TestFailureListener<'a> {
    pub fn new(
        inner: &'a dyn TestListener,
        devices: &'a [DeviceAllocation],
        options: &'a FailureConfig,
    ) -> Self {
        Self {
            inner,
            devices,
            options,
            start_times: Mutex::new(HashMap::new()),
        }
    }

    fn start_time(&self, test: &TestDescription) -> DateTime<Utc> {
        self.start_times
            .lock()
            .ok()
            .and_then(|times| times.get(test).copied())
            .unwrap_or_else(Utc::now)
    }

    async fn capture(&self, test: &TestDescription) {
        let since = self.start_time(test);

        for allocation in self.devices {
            let device = &allocation.device;
            let serial = device.serial();

            if self.options.screenshot {
                match device.take_screenshot().await {
                    Ok(data) => {
                        let name = format!("{}-{}-screenshot", test, serial);
                        self.inner.test_log(&name, LogDataType::Png, &data).await;
                    }
                    Err(e) => warn!("Failed to take screenshot on {}: {}", serial, e),
                }
            }

            if self.options.bugreport {
                match device.take_bugreport().await {
                    Ok(data) => {
                        let name = format!("{}-{}-bugreport", test, serial);
                        self.inner.test_log(&name, LogDataType::Bugreport, &data).await;
                    }
                    Err(e) => warn!("Failed to take bugreport on {}: {}", serial, e),
                }
            }

            if self.options.logcat {
                match device.logcat_since(since, self.options.max_logcat_bytes).await {
                    Ok(data) => {
                        let name = format!("{}-{}-logcat", test, serial);
                        self.inner.test_log(&name, LogDataType::Logcat, &data).await;
                    }
                    Err(e) => warn!("Failed to capture logcat on {}: {}", serial, e),
                }
            }

            if self.options.reboot {
                info!("Rebooting {} after failure of {}", serial, test);
                if let Err(e) = device.reboot().await {
                    warn!("Reboot of {} after failure failed: {}", serial, e);
                }
            }
        }
    }
}

#[async_trait]
impl TestListener for TestFailureListener<'_> {
    async fn invocation_started(&self, context: &InvocationContext) {
        self.inner.invocation_started(context).await;
    }

    async fn invocation_ended(&self, elapsed: Duration) {
        self.inner.invocation_ended(elapsed).await;
    }

    async fn test_module_started(&self, module: &ModuleInfo) {
        self.inner.test_module_started(module).await;
    }

    async fn test_module_ended(&self) {
        self.inner.test_module_ended().await;
    }

    async fn test_run_started(&self, name: &str, test_count: usize) {
        self.inner.test_run_started(name, test_count).await;
    }

    async fn test_started(&self, test: &TestDescription) {
        if let Ok(mut times) = self.start_times.lock() {
            times.insert(test.clone(), Utc::now());
        }
        self.inner.test_started(test).await;
    }

    async fn test_failed(&self, test: &TestDescription, trace: &str) {
        self.inner.test_failed(test, trace).await;
        self.capture(test).await;
    }

    async fn test_assumption_failure(&self, test: &TestDescription, trace: &str) {
        self.inner.test_assumption_failure(test, trace).await;
    }

    async fn test_ignored(&self, test: &TestDescription) {
        self.inner.test_ignored(test).await;
    }

    async fn test_ended(&self, test: &TestDescription, metrics: &Metrics) {
        if let Ok(mut times) = self.start_times.lock() {
            times.remove(test);
        }
        self.inner.test_ended(test, metrics).await;
    }

    async fn test_run_failed(&self, message: &str) {
        self.inner.test_run_failed(message).await;
    }

    async fn test_run_ended(&self, elapsed: Duration, metrics: &Metrics) {
        self.inner.test_run_ended(elapsed, metrics).await;
    }

    async fn test_log(&self, name: &str, data_type: LogDataType, data: &[u8]) {
        self.inner.test_log(name, data_type, data).await;
    }

    async fn test_log_saved(&self, name: &str, data_type: LogDataType, file: &LogFile) {
        self.inner.test_log_saved(name, data_type, file).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::device::BuildInfo;
    use crate::testing::{FakeDevice, RecordingListener};

    fn allocation(device: Arc<FakeDevice>) -> Vec<DeviceAllocation> {
        vec![DeviceAllocation {
            name: "device".into(),
            device,
            build: BuildInfo::default(),
        }]
    }

    #[tokio::test]
    async fn test_failure_captures_enabled_diagnostics() {
        let device = Arc::new(FakeDevice::new("serial-1"));
        let devices = allocation(device.clone());
        let options = FailureConfig {
            bugreport: true,
            screenshot: true,
            logcat: true,
            reboot: true,
            ..Default::default()
        };
        let recorder = RecordingListener::default();
        let listener = TestFailureListener::new(&recorder, &devices, &options);

        let test = TestDescription::new("C", "t");
        listener.test_started(&test).await;
        listener.test_failed(&test, "boom").await;
        listener.test_ended(&test, &Metrics::new()).await;

        assert_eq!(
            recorder.events(),
            vec![
                "started C#t",
                "failed C#t",
                "log C#t-serial-1-screenshot",
                "log C#t-serial-1-bugreport",
                "log C#t-serial-1-logcat",
                "ended C#t",
            ]
        );
        assert_eq!(device.reboots(), 1);
    }

    #[tokio::test]
    async fn test_passing_test_captures_nothing() {
        let device = Arc::new(FakeDevice::new("s"));
        let devices = allocation(device.clone());
        let options = FailureConfig {
            bugreport: true,
            ..Default::default()
        };
        let recorder = RecordingListener::default();
        let listener = TestFailureListener::new(&recorder, &devices, &options);

        let test = TestDescription::new("C", "t");
        listener.test_started(&test).await;
        listener.test_ended(&test, &Metrics::new()).await;

        assert_eq!(recorder.events(), vec!["started C#t", "ended C#t"]);
        assert_eq!(device.reboots(), 0);
    }

    #[tokio::test]
    async fn test_capture_errors_do_not_break_forwarding() {
        let device = Arc::new(FakeDevice::new("s").failing_diagnostics());
        let devices = allocation(device);
        let options = FailureConfig {
            bugreport: true,
            logcat: true,
            ..Default::default()
        };
        let recorder = RecordingListener::default();
        let listener = TestFailureListener::new(&recorder, &devices, &options);

        let test = TestDescription::new("C", "t");
        listener.test_started(&test).await;
        listener.test_failed(&test, "boom").await;
        listener.test_ended(&test, &Metrics::new()).await;

        assert_eq!(recorder.events(), vec!["started C#t", "failed C#t", "ended C#t"]);
    }
}
