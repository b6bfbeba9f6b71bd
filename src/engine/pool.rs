//! Bounded worker pool for blocking data work.
//!
//! Admission is limited to `workers + queue_depth` tasks. Admitted tasks
//! wait for one of `workers` execution slots, then run on the blocking
//! thread pool. Once admission is exhausted, submitters either wait or are
//! refused, depending on the saturation policy.

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{PoolConfig, Saturation};
use crate::{AppError, Result};

/// Lifecycle of a pool task.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Admitted, waiting for a slot.
    Queued,
    /// Executing.
    Running,
    /// Finished with a value.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled before or during execution.
    Cancelled,
}

impl TaskState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Queued,
            1 => Self::Running,
            2 => Self::Completed,
            3 => Self::Failed,
            _ => Self::Cancelled,
        }
    }
}

#[derive(Debug, Default)]
struct PoolCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    rejected: AtomicU64,
    queued: AtomicUsize,
    running: AtomicUsize,
}

/// Pool counters for `/stats`.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct PoolStats {
    /// Execution slots.
    pub workers: usize,
    /// Waiting-area size.
    pub queue_depth: usize,
    /// Tasks admitted.
    pub submitted: u64,
    /// Tasks finished with a value.
    pub completed: u64,
    /// Tasks finished with an error.
    pub failed: u64,
    /// Tasks cancelled.
    pub cancelled: u64,
    /// Submissions refused under the reject policy.
    pub rejected: u64,
    /// Tasks currently waiting for a slot.
    pub queued: usize,
    /// Tasks currently executing.
    pub running: usize,
}

/// A submitted task, correlated by its caller key.
pub struct TaskHandle<K, T> {
    key: K,
    state: Arc<AtomicU8>,
    cancel: CancellationToken,
    join: JoinHandle<Result<T>>,
}

impl<K, T> TaskHandle<K, T> {
    /// Caller-supplied key.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Request cooperative cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the task and return its key with the outcome.
    pub async fn join(self) -> (K, Result<T>) {
        let outcome = match self.join.await {
            Ok(outcome) => outcome,
            Err(err) => Err(AppError::Internal(format!("pool task panicked: {err}"))),
        };
        (self.key, outcome)
    }
}

/// Fixed-size pool of execution slots with bounded admission.
pub struct WorkerPool {
    admission: Arc<Semaphore>,
    slots: Arc<Semaphore>,
    workers: usize,
    queue_depth: usize,
    saturation: Saturation,
    queue_timeout: Option<Duration>,
    counters: Arc<PoolCounters>,
}

impl WorkerPool {
    /// Build a pool from configuration.
    #[must_use]
    pub fn new(config: &PoolConfig) -> Self {
        let workers = config.workers.max(1);
        let queue_depth = config.queue_depth;
        Self {
            admission: Arc::new(Semaphore::new(workers + queue_depth)),
            slots: Arc::new(Semaphore::new(workers)),
            workers,
            queue_depth,
            saturation: config.saturation,
            queue_timeout: (config.queue_timeout_seconds > 0)
                .then(|| Duration::from_secs(config.queue_timeout_seconds)),
            counters: Arc::new(PoolCounters::default()),
        }
    }

    /// Execution slots.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Submit a blocking job.
    ///
    /// The job receives a cancellation token it should check at its safe
    /// points. A job cancelled while still queued never runs.
    ///
    /// # Errors
    ///
    /// Returns `AppError::CapacityExceeded` when admission is full and the
    /// saturation policy is `reject`.
    pub async fn submit<K, T, F>(
        &self,
        key: K,
        cancel: CancellationToken,
        job: F,
    ) -> Result<TaskHandle<K, T>>
    where
        T: Send + 'static,
        F: FnOnce(&CancellationToken) -> Result<T> + Send + 'static,
    {
        let admitted = self.admit().await?;
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        self.counters.queued.fetch_add(1, Ordering::Relaxed);

        let state = Arc::new(AtomicU8::new(0));
        let task_state = Arc::clone(&state);
        let slots = Arc::clone(&self.slots);
        let counters = Arc::clone(&self.counters);
        let queue_timeout = self.queue_timeout;
        let token = cancel.clone();

        let join = tokio::spawn(async move {
            let _admitted = admitted;
            let slot = tokio::select! {
                biased;
                () = token.cancelled() => Err(AppError::Cancelled("cancelled while queued".into())),
                slot = wait_for_slot(slots, queue_timeout) => slot,
            };
            counters.queued.fetch_sub(1, Ordering::Relaxed);
            let _slot = match slot {
                Ok(slot) => slot,
                Err(err) => {
                    finish(&task_state, &counters, &err);
                    return Err(err);
                }
            };

            task_state.store(1, Ordering::Release);
            counters.running.fetch_add(1, Ordering::Relaxed);
            let job_token = token.clone();
            let outcome = tokio::task::spawn_blocking(move || {
                if job_token.is_cancelled() {
                    return Err(AppError::Cancelled("cancelled before start".into()));
                }
                job(&job_token)
            })
            .await
            .unwrap_or_else(|err| Err(AppError::Internal(format!("pool job panicked: {err}"))));
            counters.running.fetch_sub(1, Ordering::Relaxed);

            match &outcome {
                Ok(_) => {
                    task_state.store(2, Ordering::Release);
                    counters.completed.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => finish(&task_state, &counters, err),
            }
            outcome
        });

        Ok(TaskHandle {
            key,
            state,
            cancel,
            join,
        })
    }

    /// Run every job and return `(key, outcome)` pairs in submission order.
    ///
    /// Submission failures are reported against their key rather than
    /// aborting the batch.
    pub async fn run_keyed<K, T, F>(
        &self,
        jobs: Vec<(K, F)>,
        cancel: &CancellationToken,
    ) -> Vec<(K, Result<T>)>
    where
        K: Clone + Send + 'static,
        T: Send + 'static,
        F: FnOnce(&CancellationToken) -> Result<T> + Send + 'static,
    {
        let mut pending = Vec::with_capacity(jobs.len());
        let mut refused = Vec::new();
        for (index, (key, job)) in jobs.into_iter().enumerate() {
            match self.submit(key.clone(), cancel.child_token(), job).await {
                Ok(handle) => pending.push((index, handle)),
                Err(err) => refused.push((index, key, err)),
            }
        }
        let mut results: Vec<(usize, K, Result<T>)> = join_all(
            pending
                .into_iter()
                .map(|(index, handle)| async move {
                    let (key, outcome) = handle.join().await;
                    (index, key, outcome)
                }),
        )
        .await;
        results.extend(refused.into_iter().map(|(i, k, e)| (i, k, Err(e))));
        results.sort_by_key(|(index, _, _)| *index);
        results.into_iter().map(|(_, k, r)| (k, r)).collect()
    }

    /// Counters snapshot.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.workers,
            queue_depth: self.queue_depth,
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            queued: self.counters.queued.load(Ordering::Relaxed),
            running: self.counters.running.load(Ordering::Relaxed),
        }
    }

    async fn admit(&self) -> Result<OwnedSemaphorePermit> {
        match self.saturation {
            Saturation::Block => Arc::clone(&self.admission)
                .acquire_owned()
                .await
                .map_err(|_| AppError::Internal("worker pool closed".into())),
            Saturation::Reject => {
                Arc::clone(&self.admission).try_acquire_owned().map_err(|_| {
                    self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        workers = self.workers,
                        queue_depth = self.queue_depth,
                        "worker pool saturated; rejecting task"
                    );
                    AppError::CapacityExceeded(format!(
                        "worker pool full ({} running, {} queued)",
                        self.workers, self.queue_depth
                    ))
                })
            }
        }
    }
}

async fn wait_for_slot(
    slots: Arc<Semaphore>,
    queue_timeout: Option<Duration>,
) -> Result<OwnedSemaphorePermit> {
    let acquire = slots.acquire_owned();
    let permit = match queue_timeout {
        Some(limit) => tokio::time::timeout(limit, acquire).await.map_err(|_| {
            debug!(?limit, "task exceeded queue timeout");
            AppError::CapacityExceeded(format!("task queued longer than {}s", limit.as_secs()))
        })?,
        None => acquire.await,
    };
    permit.map_err(|_| AppError::Internal("worker pool closed".into()))
}

fn finish(state: &AtomicU8, counters: &PoolCounters, err: &AppError) {
    if matches!(err, AppError::Cancelled(_)) {
        state.store(4, Ordering::Release);
        counters.cancelled.fetch_add(1, Ordering::Relaxed);
    } else {
        state.store(3, Ordering::Release);
        counters.failed.fetch_add(1, Ordering::Relaxed);
    }
}
