//! Devices, builds and the invocation context.
//!
//! The engine never talks to a device directly: everything goes through the
//! [`Device`] trait, which a harness implements on top of its own transport.
//! [`HostDevice`] is the stand-in used by the CLI, where "the device" is the
//! machine running the suite.
//!
//! ```text
//! InvocationContext
//! ├── DeviceAllocation "device"   ── Arc<dyn Device> + BuildInfo
//! ├── DeviceAllocation "companion" ── Arc<dyn Device> + BuildInfo
//! └── attributes
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::SuiteResult;

/// Name given to the device of single-device invocations.
pub const DEFAULT_DEVICE_NAME: &str = "device";

/// Kind of build flashed on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildType {
    /// Production build. Never rebooted automatically between modules.
    User,
    Userdebug,
    Eng,
    #[default]
    Unknown,
}

/// The build under test on one device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildInfo {
    pub build_id: String,
    pub build_flavor: String,
    pub build_type: BuildType,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl BuildInfo {
    pub fn new(build_id: impl Into<String>, build_type: BuildType) -> Self {
        Self {
            build_id: build_id.into(),
            build_type,
            ..Default::default()
        }
    }
}

/// A target device allocated to the invocation.
#[async_trait]
pub trait Device: Send + Sync {
    /// Serial number identifying the device.
    fn serial(&self) -> &str;

    /// Reboots the device and waits for it to come back.
    async fn reboot(&self) -> SuiteResult<()>;

    /// Captures a bugreport.
    async fn take_bugreport(&self) -> SuiteResult<Vec<u8>>;

    /// Captures a screenshot as PNG data.
    async fn take_screenshot(&self) -> SuiteResult<Vec<u8>>;

    /// Returns at most `max_bytes` of logcat recorded since `since`.
    async fn logcat_since(&self, since: DateTime<Utc>, max_bytes: usize) -> SuiteResult<Vec<u8>>;
}

/// One device of the invocation together with its build.
#[derive(Clone)]
pub struct DeviceAllocation {
    pub name: String,
    pub device: Arc<dyn Device>,
    pub build: BuildInfo,
}

impl fmt::Debug for DeviceAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceAllocation")
            .field("name", &self.name)
            .field("serial", &self.device.serial())
            .field("build", &self.build)
            .finish()
    }
}

/// Devices and builds shared read-only by every module of a suite run.
///
/// Each shard owns its own context; contexts are never mutated while modules
/// execute.
#[derive(Clone, Debug, Default)]
pub struct InvocationContext {
    devices: Vec<DeviceAllocation>,
    attributes: BTreeMap<String, String>,
}

impl InvocationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a device under `name`.
    pub fn with_device(
        mut self,
        name: impl Into<String>,
        device: Arc<dyn Device>,
        build: BuildInfo,
    ) -> Self {
        self.devices.push(DeviceAllocation {
            name: name.into(),
            device,
            build,
        });
        self
    }

    /// Adds an invocation attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// All devices in allocation order.
    pub fn devices(&self) -> &[DeviceAllocation] {
        &self.devices
    }

    /// Looks up a device by its allocation name.
    pub fn device(&self, name: &str) -> Option<&DeviceAllocation> {
        self.devices.iter().find(|d| d.name == name)
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Splits a multi-device context into one single-device context per
    /// device, each carrying the same attributes.
    ///
    /// Used to hand every shard worker its own allocation.
    pub fn per_device(&self) -> Vec<InvocationContext> {
        self.devices
            .iter()
            .map(|d| InvocationContext {
                devices: vec![d.clone()],
                attributes: self.attributes.clone(),
            })
            .collect()
    }
}

/// The machine running the suite, presented as a device.
///
/// Reboots are logged and skipped; diagnostics are short text snapshots.
pub struct HostDevice {
    serial: String,
}

impl HostDevice {
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
        }
    }
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new("localhost")
    }
}

#[async_trait]
impl Device for HostDevice {
    fn serial(&self) -> &str {
        &self.serial
    }

    async fn reboot(&self) -> SuiteResult<()> {
        info!("Skipping reboot of host device {}", self.serial);
        Ok(())
    }

    async fn take_bugreport(&self) -> SuiteResult<Vec<u8>> {
        Ok(format!(
            "host bugreport\nserial: {}\ntime: {}\nos: {}\narch: {}\n",
            self.serial,
            Utc::now().to_rfc3339(),
            std::env::consts::OS,
            std::env::consts::ARCH
        )
        .into_bytes())
    }

    async fn take_screenshot(&self) -> SuiteResult<Vec<u8>> {
        Ok(Vec::new())
    }

    async fn logcat_since(&self, since: DateTime<Utc>, max_bytes: usize) -> SuiteResult<Vec<u8>> {
        let mut data = format!("no logcat on host {} since {}\n", self.serial, since.to_rfc3339())
            .into_bytes();
        data.truncate(max_bytes);
        Ok(data)
    }
}
