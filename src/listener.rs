//! The listener chain.
//!
//! Delegates report what happens during a run through [`TestListener`]
//! callbacks. Listeners are stacked: a delegate talks to a
//! [`TestFailureListener`], which talks to a [`ModuleListener`] buffering one
//! attempt; the module replays merged results to the invocation-level
//! listeners (reporters), possibly through a [`ShardListener`].
//!
//! ```text
//!  RemoteTest ──► TestFailureListener ──► ModuleListener   (one attempt)
//!                                              │
//!                                   merge attempts, teardown
//!                                              ▼
//!  ModuleDefinition ── replay ──► ShardListener ──► ResultForwarder ──► reporters
//! ```
//!
//! Every method has an empty default body so listeners only implement the
//! events they care about. Implementations must be safe under concurrent
//! invocation from several shard workers.

pub mod failure;
pub mod module;
pub mod shard;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::device::InvocationContext;
use crate::log_saver::{LogDataType, LogFile};
use crate::result::{Metrics, TestDescription};

pub use failure::TestFailureListener;
pub use module::ModuleListener;
pub use shard::ShardListener;

/// Description of a module, sent with `test_module_started`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInfo {
    /// Unique id, `"<abi> <name>"` when an abi is set.
    pub id: String,
    /// Module name without abi.
    pub name: String,
    pub abi: Option<String>,
    pub metadata: BTreeMap<String, Vec<String>>,
}

/// Receives events during suite execution.
#[async_trait]
pub trait TestListener: Send + Sync {
    async fn invocation_started(&self, _context: &InvocationContext) {}

    async fn invocation_ended(&self, _elapsed: Duration) {}

    async fn test_module_started(&self, _module: &ModuleInfo) {}

    async fn test_module_ended(&self) {}

    async fn test_run_started(&self, _name: &str, _test_count: usize) {}

    async fn test_started(&self, _test: &TestDescription) {}

    async fn test_failed(&self, _test: &TestDescription, _trace: &str) {}

    async fn test_assumption_failure(&self, _test: &TestDescription, _trace: &str) {}

    async fn test_ignored(&self, _test: &TestDescription) {}

    async fn test_ended(&self, _test: &TestDescription, _metrics: &Metrics) {}

    async fn test_run_failed(&self, _message: &str) {}

    async fn test_run_ended(&self, _elapsed: Duration, _metrics: &Metrics) {}

    /// Raw log data emitted by a delegate or a diagnostic capture.
    async fn test_log(&self, _name: &str, _data_type: LogDataType, _data: &[u8]) {}

    /// A log that was already persisted by a log saver.
    async fn test_log_saved(&self, _name: &str, _data_type: LogDataType, _file: &LogFile) {}
}

/// A listener that ignores every event.
pub struct NullListener;

#[async_trait]
impl TestListener for NullListener {}

/// Fans every event out to several listeners, in order.
#[derive(Default)]
pub struct ResultForwarder {
    listeners: Vec<Arc<dyn TestListener>>,
}

impl ResultForwarder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listener(mut self, listener: Arc<dyn TestListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

#[async_trait]
impl TestListener for ResultForwarder {
    async fn invocation_started(&self, context: &InvocationContext) {
        for l in &self.listeners {
            l.invocation_started(context).await;
        }
    }

    async fn invocation_ended(&self, elapsed: Duration) {
        for l in &self.listeners {
            l.invocation_ended(elapsed).await;
        }
    }

    async fn test_module_started(&self, module: &ModuleInfo) {
        for l in &self.listeners {
            l.test_module_started(module).await;
        }
    }

    async fn test_module_ended(&self) {
        for l in &self.listeners {
            l.test_module_ended().await;
        }
    }

    async fn test_run_started(&self, name: &str, test_count: usize) {
        for l in &self.listeners {
            l.test_run_started(name, test_count).await;
        }
    }

    async fn test_started(&self, test: &TestDescription) {
        for l in &self.listeners {
            l.test_started(test).await;
        }
    }

    async fn test_failed(&self, test: &TestDescription, trace: &str) {
        for l in &self.listeners {
            l.test_failed(test, trace).await;
        }
    }

    async fn test_assumption_failure(&self, test: &TestDescription, trace: &str) {
        for l in &self.listeners {
            l.test_assumption_failure(test, trace).await;
        }
    }

    async fn test_ignored(&self, test: &TestDescription) {
        for l in &self.listeners {
            l.test_ignored(test).await;
        }
    }

    async fn test_ended(&self, test: &TestDescription, metrics: &Metrics) {
        for l in &self.listeners {
            l.test_ended(test, metrics).await;
        }
    }

    async fn test_run_failed(&self, message: &str) {
        for l in &self.listeners {
            l.test_run_failed(message).await;
        }
    }

    async fn test_run_ended(&self, elapsed: Duration, metrics: &Metrics) {
        for l in &self.listeners {
            l.test_run_ended(elapsed, metrics).await;
        }
    }

    async fn test_log(&self, name: &str, data_type: LogDataType, data: &[u8]) {
        for l in &self.listeners {
            l.test_log(name, data_type, data).await;
        }
    }

    async fn test_log_saved(&self, name: &str, data_type: LogDataType, file: &LogFile) {
        for l in &self.listeners {
            l.test_log_saved(name, data_type, file).await;
        }
    }
}
