//! Distribution of shard suites across devices.
//!
//! A sharded invocation splits the suite into one [`TestSuite`] per module
//! shard, deals them round-robin onto one worker per device, and runs the
//! workers concurrently. Shards of the same module that land on the same
//! worker are merged back together first, so the module's preparers run
//! once on that device.
//!
//! # Example
//!
//! ```
//! use modsuite::suite::scheduler::ShardScheduler;
//!
//! let scheduler = ShardScheduler::new(2);
//! assert_eq!(scheduler.workers(), 2);
//! assert!(scheduler.schedule(Vec::new()).is_empty());
//! ```

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::merger::{are_part_of_same_suite, merge_splitted_suites};
use super::{ModuleDefinition, TestSuite, report_not_executed};
use crate::device::InvocationContext;
use crate::error::{SuiteError, SuiteResult};
use crate::listener::{ShardListener, TestListener};

/// Deals shard suites onto a fixed number of workers.
pub struct ShardScheduler {
    workers: usize,
}

impl ShardScheduler {
    /// Creates a scheduler for `workers` parallel workers (at least 1).
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Round-robin distribution, then merging of same-module shards within
    /// each batch. Empty batches are removed.
    pub fn schedule(&self, suites: Vec<TestSuite>) -> Vec<Vec<TestSuite>> {
        if suites.is_empty() {
            return Vec::new();
        }

        let mut batches: Vec<Vec<TestSuite>> = (0..self.workers).map(|_| Vec::new()).collect();
        for (i, suite) in suites.into_iter().enumerate() {
            let batch = &mut batches[i % self.workers];
            match batch.iter_mut().find(|s| are_part_of_same_suite(s, &suite)) {
                Some(existing) => {
                    if let Err(e) = merge_splitted_suites(existing, suite) {
                        warn!("Could not merge shards: {}", e);
                    }
                }
                None => batch.push(suite),
            }
        }

        batches.retain(|b| !b.is_empty());
        batches
    }
}

/// Runs a whole invocation, sharded across the devices of `context` when
/// `shard_count` and the number of devices allow it.
///
/// Brackets everything in `invocation_started` / `invocation_ended`. Each
/// worker reports through its own [`ShardListener`] so module events reach
/// `listener` contiguously.
///
/// # Errors
///
/// Returns the first `DeviceNotAvailable` raised by any worker, after every
/// worker has finished. Configuration errors are returned before any event is
/// emitted.
pub async fn run_invocation(
    mut suite: TestSuite,
    context: &InvocationContext,
    listener: Arc<dyn TestListener>,
    shard_count: usize,
) -> SuiteResult<()> {
    let devices = context.per_device();
    let workers = shard_count.min(devices.len());

    let plan = if suite.direct_module().is_some() {
        Plan::Direct
    } else if workers >= 2
        && let Some(shards) = suite.split(shard_count)?
    {
        Plan::Sharded(shards)
    } else {
        Plan::Modules(suite.create_execution_list(1)?)
    };

    let started = Instant::now();
    listener.invocation_started(context).await;

    let outcome = match plan {
        Plan::Direct => suite.run(context, listener.as_ref()).await,
        Plan::Modules(mut modules) => {
            info!("Running {} modules unsharded", modules.len());
            suite
                .run_modules(&mut modules, context, listener.as_ref())
                .await
        }
        Plan::Sharded(shards) => {
            let batches = ShardScheduler::new(workers).schedule(shards);
            info!(
                "Running {} shard batches on {} devices",
                batches.len(),
                devices.len()
            );
            run_batches(batches, &devices, listener.clone()).await
        }
    };

    listener.invocation_ended(started.elapsed()).await;
    outcome
}

enum Plan {
    /// A shard suite, run as is.
    Direct,
    Modules(Vec<ModuleDefinition>),
    Sharded(Vec<TestSuite>),
}

async fn run_batches(
    batches: Vec<Vec<TestSuite>>,
    devices: &[InvocationContext],
    listener: Arc<dyn TestListener>,
) -> SuiteResult<()> {
    let replay_lock = Arc::new(Mutex::new(()));
    let first_error: Mutex<Option<SuiteError>> = Mutex::new(None);

    tokio_scoped::scope(|scope| {
        for (batch, device) in batches.into_iter().zip(devices) {
            let shard_listener = ShardListener::new(listener.clone(), replay_lock.clone());
            let first_error = &first_error;

            scope.spawn(async move {
                let serial = device
                    .devices()
                    .first()
                    .map(|d| d.device.serial().to_string())
                    .unwrap_or_default();
                let mut pending = batch.into_iter();

                while let Some(mut shard) = pending.next() {
                    if let Err(e) = shard.run(device, &shard_listener).await {
                        error!("Worker on {} stopped: {}", serial, e);
                        for rest in pending.by_ref() {
                            if let Some(module) = rest.direct_module() {
                                module.abandon();
                                report_not_executed(module, &e, &shard_listener).await;
                            }
                        }
                        let mut slot = first_error.lock().await;
                        if slot.is_none() {
                            *slot = Some(e);
                        }
                        return;
                    }
                }
                debug!("Worker on {} finished", serial);
            });
        }
    });

    match first_error.into_inner() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
