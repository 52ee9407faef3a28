//! Partitioning, dispatch and collection of one batch.
//!
//! The scheduler owns a fixed-size rayon pool that lives as long as it does.
//! Every task is one job on that pool, whether it is computed in place or
//! forwarded to a remote worker over a blocking call. Results come back over
//! a channel in whatever order the jobs finish.
//!
//! ## Phases
//!
//! | Phase | Span |
//! |-------|------|
//! | separation | splitting the batch into tasks |
//! | distribution | submitting every task to the pool |
//! | consolidation | waiting for every task's result |

use std::sync::Arc;
use std::time::Instant;

use crossbeam::channel;
use log::{debug, info, warn};
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::compute::LocalWorker;
use crate::consolidate::{merge, PhaseTimings};
use crate::error::{EngineError, Result};
use crate::task::{partition, GlobalResult, PartialResult, Task};
use crate::worker::{TaskWorker, WorkerRegistry};
use crate::ArcCrossingEvent;

/// One finished task and how it got there.
struct Completed {
    partial: PartialResult,
    fell_back: bool,
}

/// Batch driver for the master.
pub struct TaskScheduler {
    pool: ThreadPool,
    pool_size: usize,
    local: Arc<LocalWorker>,
}

impl TaskScheduler {
    /// Build the worker pool.
    pub fn new(pool_size: usize, max_speed_kmh: f64) -> Result<Self> {
        let pool_size = pool_size.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(pool_size)
            .thread_name(|i| format!("arc-speed-worker-{}", i))
            .build()
            .map_err(|e| EngineError::ThreadPool(e.to_string()))?;

        info!("[Scheduler] Started pool with {} threads", pool_size);

        Ok(Self {
            pool,
            pool_size,
            local: Arc::new(LocalWorker::new(max_speed_kmh)),
        })
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Partition `events`, run every task and merge the results.
    ///
    /// With remote workers registered, task `i` goes to worker `i % n` of a
    /// snapshot taken at dispatch time; a task whose remote call fails is
    /// computed locally once instead. Without remote workers every task
    /// runs on the local pool. An empty batch yields a zeroed result.
    pub fn partition_and_dispatch(
        &self,
        events: &[ArcCrossingEvent],
        num_tasks: usize,
        registry: &WorkerRegistry,
    ) -> GlobalResult {
        let mut timings = PhaseTimings::start();

        let separation_start = Instant::now();
        let tasks = partition(events, num_tasks);
        timings.separation_ms = separation_start.elapsed().as_millis() as u64;

        let remotes = registry.snapshot();
        if tasks.is_empty() {
            return GlobalResult {
                worker_count: self.pool_size as u32,
                active_workers: remotes.len() as u32,
                ..GlobalResult::default()
            };
        }

        info!(
            "[Scheduler] Dispatching {} events as {} tasks ({} remote workers)",
            events.len(),
            tasks.len(),
            remotes.len()
        );

        let distribution_start = Instant::now();
        let task_count = tasks.len();
        let (tx, rx) = channel::unbounded::<Completed>();
        for (i, task) in tasks.into_iter().enumerate() {
            let target = if remotes.is_empty() {
                None
            } else {
                Some(Arc::clone(&remotes[i % remotes.len()]))
            };
            let local = Arc::clone(&self.local);
            let tx = tx.clone();
            self.pool.spawn(move || {
                let completed = run_task(&task, target.as_deref(), &local);
                // The receiver outlives every job.
                let _ = tx.send(completed);
            });
        }
        drop(tx);
        timings.distribution_ms = distribution_start.elapsed().as_millis() as u64;

        let consolidation_start = Instant::now();
        let mut partials = Vec::with_capacity(task_count);
        let mut fallback_tasks = 0u32;
        for completed in rx.iter() {
            if completed.fell_back {
                fallback_tasks += 1;
            }
            partials.push(completed.partial);
        }
        partials.sort_by_key(|p| p.task_id);
        timings.consolidation_ms = consolidation_start.elapsed().as_millis() as u64;

        if partials.len() != task_count {
            warn!(
                "[Scheduler] Only {} of {} tasks reported back",
                partials.len(),
                task_count
            );
        }

        let mut result = merge(&partials, &timings);
        result.worker_count = self.pool_size as u32;
        result.active_workers = remotes.len() as u32;
        result.fallback_tasks = fallback_tasks;

        info!(
            "[Scheduler] Batch done in {}ms (separation={}ms distribution={}ms consolidation={}ms, {} fallbacks)",
            result.total_processing_time_ms,
            result.separation_time_ms,
            result.distribution_time_ms,
            result.consolidation_time_ms,
            fallback_tasks
        );

        result
    }
}

fn run_task(task: &Task, remote: Option<&dyn TaskWorker>, local: &LocalWorker) -> Completed {
    let Some(worker) = remote else {
        return Completed {
            partial: local.compute(task),
            fell_back: false,
        };
    };

    match worker.process_task(task) {
        Ok(partial) => {
            debug!("[Scheduler] Task {} done by {}", task.task_id, worker.name());
            Completed {
                partial,
                fell_back: false,
            }
        }
        Err(e) => {
            warn!(
                "[Scheduler] Task {} failed on {}: {}; computing locally",
                task.task_id,
                worker.name(),
                e
            );
            Completed {
                partial: local.compute(task),
                fell_back: true,
            }
        }
    }
}
