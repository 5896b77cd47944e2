//! Per-worker listener that keeps module events together.
//!
//! When shards run concurrently, their module events would interleave in the
//! shared reporters. Each worker therefore reports through its own
//! [`ShardListener`], which buffers everything between `test_module_started`
//! and `test_module_ended` and replays the whole module at once while holding
//! a lock shared by all workers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{ModuleInfo, TestListener};
use crate::device::InvocationContext;
use crate::log_saver::{LogDataType, LogFile};
use crate::result::{Metrics, TestDescription};

/// An owned listener event.
#[derive(Debug, Clone)]
enum ListenerEvent {
    ModuleStarted(ModuleInfo),
    RunStarted(String, usize),
    TestStarted(TestDescription),
    TestFailed(TestDescription, String),
    AssumptionFailure(TestDescription, String),
    TestIgnored(TestDescription),
    TestEnded(TestDescription, Metrics),
    RunFailed(String),
    RunEnded(Duration, Metrics),
    Log(String, LogDataType, Vec<u8>),
    LogSaved(String, LogDataType, LogFile),
}

impl ListenerEvent {
    async fn replay(&self, listener: &dyn TestListener) {
        match self {
            ListenerEvent::ModuleStarted(m) => listener.test_module_started(m).await,
            ListenerEvent::RunStarted(name, count) => listener.test_run_started(name, *count).await,
            ListenerEvent::TestStarted(t) => listener.test_started(t).await,
            ListenerEvent::TestFailed(t, trace) => listener.test_failed(t, trace).await,
            ListenerEvent::AssumptionFailure(t, trace) => {
                listener.test_assumption_failure(t, trace).await
            }
            ListenerEvent::TestIgnored(t) => listener.test_ignored(t).await,
            ListenerEvent::TestEnded(t, metrics) => listener.test_ended(t, metrics).await,
            ListenerEvent::RunFailed(message) => listener.test_run_failed(message).await,
            ListenerEvent::RunEnded(elapsed, metrics) => {
                listener.test_run_ended(*elapsed, metrics).await
            }
            ListenerEvent::Log(name, data_type, data) => {
                listener.test_log(name, *data_type, data).await
            }
            ListenerEvent::LogSaved(name, data_type, file) => {
                listener.test_log_saved(name, *data_type, file).await
            }
        }
    }
}

/// Buffers one module's events and forwards them atomically.
pub struct ShardListener {
    main: Arc<dyn TestListener>,
    replay_lock: Arc<tokio::sync::Mutex<()>>,
    buffer: Mutex<Option<Vec<ListenerEvent>>>,
}

impl ShardListener {
    /// Creates a shard listener forwarding to `main`.
    ///
    /// All shard listeners of one invocation must share `replay_lock`.
    pub fn new(main: Arc<dyn TestListener>, replay_lock: Arc<tokio::sync::Mutex<()>>) -> Self {
        Self {
            main,
            replay_lock,
            buffer: Mutex::new(None),
        }
    }

    /// Buffers `event` if a module is in progress; returns it otherwise.
    fn buffer(&self, event: ListenerEvent) -> Option<ListenerEvent> {
        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        match buffer.as_mut() {
            Some(events) => {
                events.push(event);
                None
            }
            None => Some(event),
        }
    }

    async fn record(&self, event: ListenerEvent) {
        if let Some(event) = self.buffer(event) {
            let _guard = self.replay_lock.lock().await;
            event.replay(self.main.as_ref()).await;
        }
    }
}

#[async_trait]
impl TestListener for ShardListener {
    async fn invocation_started(&self, context: &InvocationContext) {
        self.main.invocation_started(context).await;
    }

    async fn invocation_ended(&self, elapsed: Duration) {
        self.main.invocation_ended(elapsed).await;
    }

    async fn test_module_started(&self, module: &ModuleInfo) {
        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        *buffer = Some(vec![ListenerEvent::ModuleStarted(module.clone())]);
    }

    async fn test_module_ended(&self) {
        let events = self
            .buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .unwrap_or_default();

        let _guard = self.replay_lock.lock().await;
        for event in &events {
            event.replay(self.main.as_ref()).await;
        }
        self.main.test_module_ended().await;
    }

    async fn test_run_started(&self, name: &str, test_count: usize) {
        self.record(ListenerEvent::RunStarted(name.to_string(), test_count))
            .await;
    }

    async fn test_started(&self, test: &TestDescription) {
        self.record(ListenerEvent::TestStarted(test.clone())).await;
    }

    async fn test_failed(&self, test: &TestDescription, trace: &str) {
        self.record(ListenerEvent::TestFailed(test.clone(), trace.to_string()))
            .await;
    }

    async fn test_assumption_failure(&self, test: &TestDescription, trace: &str) {
        self.record(ListenerEvent::AssumptionFailure(
            test.clone(),
            trace.to_string(),
        ))
        .await;
    }

    async fn test_ignored(&self, test: &TestDescription) {
        self.record(ListenerEvent::TestIgnored(test.clone())).await;
    }

    async fn test_ended(&self, test: &TestDescription, metrics: &Metrics) {
        self.record(ListenerEvent::TestEnded(test.clone(), metrics.clone()))
            .await;
    }

    async fn test_run_failed(&self, message: &str) {
        self.record(ListenerEvent::RunFailed(message.to_string()))
            .await;
    }

    async fn test_run_ended(&self, elapsed: Duration, metrics: &Metrics) {
        self.record(ListenerEvent::RunEnded(elapsed, metrics.clone()))
            .await;
    }

    async fn test_log(&self, name: &str, data_type: LogDataType, data: &[u8]) {
        self.record(ListenerEvent::Log(name.to_string(), data_type, data.to_vec()))
            .await;
    }

    async fn test_log_saved(&self, name: &str, data_type: LogDataType, file: &LogFile) {
        self.record(ListenerEvent::LogSaved(
            name.to_string(),
            data_type,
            file.clone(),
        ))
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingListener;

    fn module(id: &str) -> ModuleInfo {
        ModuleInfo {
            id: id.to_string(),
            name: id.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_interleaved_modules_are_replayed_whole() {
        let main = Arc::new(RecordingListener::default());
        let lock = Arc::new(tokio::sync::Mutex::new(()));
        let shard_a = ShardListener::new(main.clone(), lock.clone());
        let shard_b = ShardListener::new(main.clone(), lock);

        shard_a.test_module_started(&module("a")).await;
        shard_b.test_module_started(&module("b")).await;
        shard_a.test_run_started("a", 0).await;
        shard_b.test_run_started("b", 0).await;
        shard_b.test_run_ended(Duration::ZERO, &Metrics::new()).await;
        shard_b.test_module_ended().await;
        shard_a.test_run_ended(Duration::ZERO, &Metrics::new()).await;
        shard_a.test_module_ended().await;

        assert_eq!(
            main.events(),
            vec![
                "module_started b",
                "run_started b 0",
                "run_ended",
                "module_ended",
                "module_started a",
                "run_started a 0",
                "run_ended",
                "module_ended",
            ]
        );
    }

    #[tokio::test]
    async fn test_events_outside_module_pass_through() {
        let main = Arc::new(RecordingListener::default());
        let shard = ShardListener::new(main.clone(), Arc::new(tokio::sync::Mutex::new(())));
        shard.test_run_started("checker", 0).await;
        assert_eq!(main.events(), vec!["run_started checker 0"]);
    }
}
