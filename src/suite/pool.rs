//! Pool of delegates shared by dynamically sharded modules.
//!
//! With dynamic sharding, a module's delegate is split and the pieces go into
//! a [`TestPool`]. Every shard module gets a [`PoolPoller`] that keeps taking
//! pieces until the pool is empty, so faster workers naturally run more.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::device::InvocationContext;
use crate::error::SuiteResult;
use crate::framework::{RemoteTest, TestDelegate};
use crate::listener::TestListener;

/// Delegates waiting to be run by some shard.
pub struct TestPool {
    queue: Mutex<VecDeque<TestDelegate>>,
    /// Pollers that have not started polling yet.
    waiting: AtomicUsize,
}

impl TestPool {
    pub fn new(delegates: Vec<TestDelegate>) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(delegates.into()),
            waiting: AtomicUsize::new(0),
        })
    }

    /// Test cases left in the pool, counting delegates that know their count.
    pub fn remaining_test_cases(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter_map(|d| d.test_case_count())
            .sum()
    }

    /// Even share of the remaining test cases for one waiting poller.
    fn share_per_waiting_poller(&self) -> usize {
        let waiting = self.waiting.load(Ordering::SeqCst).max(1);
        self.remaining_test_cases().div_ceil(waiting)
    }

    /// Takes the next delegate, if any is left.
    pub fn take_one(&self) -> Option<TestDelegate> {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Runs delegates from a shared [`TestPool`].
///
/// The first run drains the pool. Later runs (retries) re-run exactly the
/// delegates this poller took.
pub struct PoolPoller {
    pool: Arc<TestPool>,
    runner: String,
    taken: Mutex<Vec<TestDelegate>>,
    drained: AtomicBool,
}

impl PoolPoller {
    pub fn new(pool: Arc<TestPool>, runner: impl Into<String>) -> Self {
        pool.waiting.fetch_add(1, Ordering::SeqCst);
        Self {
            pool,
            runner: runner.into(),
            taken: Mutex::new(Vec::new()),
            drained: AtomicBool::new(false),
        }
    }

    /// Number of delegates this poller has taken from the pool.
    pub fn taken(&self) -> usize {
        self.taken.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn taken_test_cases(&self) -> usize {
        self.taken
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter_map(|d| d.test_case_count())
            .sum()
    }

    async fn run_one(
        &self,
        delegate: &TestDelegate,
        context: &InvocationContext,
        listener: &dyn TestListener,
    ) -> SuiteResult<()> {
        match delegate.run(context, listener).await {
            Err(e) if !e.is_fatal() => {
                warn!("Pooled delegate failed: {}", e);
                listener.test_run_failed(&e.to_string()).await;
                Ok(())
            }
            other => other,
        }
    }
}

#[async_trait]
impl RemoteTest for PoolPoller {
    fn runner_name(&self) -> &str {
        &self.runner
    }

    /// Cases taken so far once polling started, an even share of the pool
    /// before that.
    fn test_case_count(&self) -> Option<usize> {
        if self.drained.load(Ordering::SeqCst) {
            Some(self.taken_test_cases())
        } else {
            Some(self.pool.share_per_waiting_poller())
        }
    }

    async fn run(
        &self,
        context: &InvocationContext,
        listener: &dyn TestListener,
    ) -> SuiteResult<()> {
        if self.drained.swap(true, Ordering::SeqCst) {
            let taken = self.taken.lock().unwrap_or_else(|e| e.into_inner()).clone();
            debug!("Re-running {} pooled delegates", taken.len());
            for delegate in &taken {
                self.run_one(delegate, context, listener).await?;
            }
            return Ok(());
        }

        let _ = self
            .pool
            .waiting
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        while let Some(delegate) = self.pool.take_one() {
            self.taken
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(delegate.clone());
            self.run_one(&delegate, context, listener).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::ModuleListener;
    use crate::testing::{StubEnding, StubTest, fake_context};

    #[tokio::test]
    async fn test_first_poller_drains_pool() {
        let pool = TestPool::new(vec![
            TestDelegate::filterable(StubTest::new("A", 2)),
            TestDelegate::filterable(StubTest::new("B", 1)),
        ]);
        let first = PoolPoller::new(pool.clone(), "stub");
        let second = PoolPoller::new(pool.clone(), "stub");
        let ctx = fake_context("s");

        let listener = ModuleListener::new("m");
        first.run(&ctx, &listener).await.unwrap();
        assert_eq!(listener.num_total_tests(), 3);
        assert_eq!(first.taken(), 2);

        let listener = ModuleListener::new("m");
        second.run(&ctx, &listener).await.unwrap();
        assert_eq!(listener.num_total_tests(), 0);
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_case_count_tracks_share_then_taken() {
        let pool = TestPool::new(vec![
            TestDelegate::filterable(StubTest::new("A", 2)),
            TestDelegate::filterable(StubTest::new("B", 2)),
        ]);
        let first = PoolPoller::new(pool.clone(), "stub");
        let second = PoolPoller::new(pool.clone(), "stub");
        assert_eq!(pool.remaining_test_cases(), 4);
        assert_eq!(first.test_case_count(), Some(2));
        assert_eq!(second.test_case_count(), Some(2));

        first
            .run(&fake_context("s"), &ModuleListener::new("m"))
            .await
            .unwrap();
        assert_eq!(first.test_case_count(), Some(4));
        assert_eq!(second.test_case_count(), Some(0));
    }

    #[tokio::test]
    async fn test_retry_reruns_taken_delegates() {
        let pool = TestPool::new(vec![TestDelegate::filterable(StubTest::new("A", 2))]);
        let poller = PoolPoller::new(pool, "stub");
        let ctx = fake_context("s");

        poller.run(&ctx, &ModuleListener::new("m")).await.unwrap();
        let listener = ModuleListener::new("m");
        poller.run(&ctx, &listener).await.unwrap();
        assert_eq!(listener.num_completed_tests(), 2);
    }

    #[tokio::test]
    async fn test_non_fatal_errors_keep_polling() {
        let pool = TestPool::new(vec![
            TestDelegate::filterable(StubTest::new("A", 1).ending(StubEnding::HarnessError)),
            TestDelegate::filterable(StubTest::new("B", 1)),
        ]);
        let poller = PoolPoller::new(pool, "stub");
        let listener = ModuleListener::new("m");

        poller.run(&fake_context("s"), &listener).await.unwrap();
        assert!(listener.is_run_failure());
        assert_eq!(listener.num_completed_tests(), 2);
    }
}
