//! Local worker pool and its memory budget.
//!
//! The budget math mirrors accelerator-style pool sizing: a buffer pool is
//! carved out of `memory_limit` (rounded down to a 256-byte boundary), a
//! spill threshold caps how many partition bytes may be in flight at once,
//! and `frac_size` of the pool bounds a single partition. Workers pull
//! partition tasks from a bounded channel and each task is admitted against
//! the spill threshold before it starts.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam::channel;
use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::info;

/// Errors crossing the worker boundary are type-erased; the executor wraps
/// them back up with the failing partition index.
pub type WorkError = Box<dyn std::error::Error + Send + Sync>;

/// Floor for the derived partition size so tiny budgets still make progress.
pub const MIN_PARTITION_BYTES: u64 = 1 << 20;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("invalid executor config: {reason}")]
    InvalidConfig { reason: String },
    #[error("partition task {index} failed: {source}")]
    TaskFailed {
        index: usize,
        #[source]
        source: WorkError,
    },
}

/// Anything scheduled on the pool declares how many bytes it will pin.
pub trait Weighted {
    fn weight_bytes(&self) -> u64;
}

pub fn default_n_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Worker threads processing partitions.
    pub n_workers: usize,
    /// Fraction of the buffer pool one partition may occupy.
    pub frac_size: f64,
    /// Total memory budget in bytes.
    pub memory_limit: u64,
    /// Fraction of the budget admitted for in-flight partitions.
    pub device_limit_frac: f64,
    /// Fraction of the budget granted to the buffer pool.
    pub device_pool_frac: f64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            n_workers: default_n_workers(),
            frac_size: 0.10,
            memory_limit: 100_000_000_000,
            device_limit_frac: 0.60,
            device_pool_frac: 0.90,
        }
    }
}

impl ExecutorConfig {
    pub fn validate(&self) -> Result<(), ExecutorError> {
        let invalid = |reason: String| ExecutorError::InvalidConfig { reason };
        if self.n_workers == 0 {
            return Err(invalid("n_workers must be at least 1".into()));
        }
        if self.memory_limit == 0 {
            return Err(invalid("memory_limit must be positive".into()));
        }
        for (name, value) in [
            ("frac_size", self.frac_size),
            ("device_limit_frac", self.device_limit_frac),
            ("device_pool_frac", self.device_pool_frac),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(invalid(format!("{name} must be in (0, 1], got {value}")));
            }
        }
        Ok(())
    }

    /// Buffer pool size: `device_pool_frac` of the budget, rounded down to a
    /// 256-byte boundary the way allocator pools are.
    pub fn pool_bytes(&self) -> u64 {
        let raw = (self.device_pool_frac * self.memory_limit as f64) as u64;
        (raw / 256) * 256
    }

    /// Admission threshold for in-flight partition bytes.
    pub fn spill_bytes(&self) -> u64 {
        (self.device_limit_frac * self.memory_limit as f64) as u64
    }

    /// Target size of one dataset partition.
    pub fn partition_bytes(&self) -> u64 {
        let raw = (self.frac_size * self.pool_bytes() as f64) as u64;
        raw.max(MIN_PARTITION_BYTES)
    }
}

// ============================================================================
// Memory throttle
// ============================================================================

/// Counting gate over in-flight bytes. A task larger than the whole limit is
/// still admitted once the gate is empty, so progress never deadlocks on an
/// oversized partition.
struct MemoryThrottle {
    limit: u64,
    in_flight: Mutex<u64>,
    available: Condvar,
}

impl MemoryThrottle {
    fn new(limit: u64) -> Self {
        Self {
            limit: limit.max(1),
            in_flight: Mutex::new(0),
            available: Condvar::new(),
        }
    }

    fn acquire(&self, bytes: u64) {
        let mut in_flight = self.in_flight.lock();
        while *in_flight > 0 && *in_flight + bytes > self.limit {
            self.available.wait(&mut in_flight);
        }
        *in_flight += bytes;
    }

    fn release(&self, bytes: u64) {
        let mut in_flight = self.in_flight.lock();
        *in_flight = in_flight.saturating_sub(bytes);
        drop(in_flight);
        self.available.notify_all();
    }
}

/// RAII admission token; dropping it returns the bytes to the throttle.
pub struct AdmissionGuard {
    throttle: Arc<MemoryThrottle>,
    bytes: u64,
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        self.throttle.release(self.bytes);
    }
}

// ============================================================================
// Executor
// ============================================================================

pub struct LocalExecutor {
    config: ExecutorConfig,
    throttle: Arc<MemoryThrottle>,
}

impl LocalExecutor {
    pub fn new(config: ExecutorConfig) -> Result<Self, ExecutorError> {
        config.validate()?;
        info!(
            "local executor ready: {} workers, pool {} B, spill threshold {} B, partition {} B",
            config.n_workers,
            config.pool_bytes(),
            config.spill_bytes(),
            config.partition_bytes(),
        );
        let throttle = Arc::new(MemoryThrottle::new(config.spill_bytes()));
        Ok(Self { config, throttle })
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn n_workers(&self) -> usize {
        self.config.n_workers
    }

    /// Block until `bytes` fit under the spill threshold, then hold them
    /// until the guard drops.
    pub fn admit(&self, bytes: u64) -> AdmissionGuard {
        self.throttle.acquire(bytes);
        AdmissionGuard {
            throttle: Arc::clone(&self.throttle),
            bytes,
        }
    }

    /// Run `work` over every task and fold the results on the calling thread
    /// in completion order. The first failure cancels the remaining tasks and
    /// becomes the returned error; results already produced are folded.
    pub fn run_fold<T, R, A, F, G>(
        &self,
        tasks: Vec<T>,
        work: F,
        init: A,
        mut fold: G,
    ) -> Result<A, ExecutorError>
    where
        T: Send + Weighted,
        R: Send,
        F: Fn(usize, T) -> Result<R, WorkError> + Sync,
        G: FnMut(A, usize, R) -> A,
    {
        if tasks.is_empty() {
            return Ok(init);
        }
        let n_workers = self.config.n_workers.min(tasks.len());
        let cancel = AtomicBool::new(false);
        let (task_tx, task_rx) = channel::bounded::<(usize, T)>(n_workers * 2);
        let (result_tx, result_rx) = channel::unbounded::<(usize, Result<R, WorkError>)>();
        let work = &work;
        let cancel = &cancel;

        std::thread::scope(|scope| {
            for worker_id in 0..n_workers {
                let task_rx = task_rx.clone();
                let result_tx = result_tx.clone();
                scope.spawn(move || {
                    for (index, task) in task_rx.iter() {
                        // Drain without processing once a failure is seen.
                        if cancel.load(Ordering::Relaxed) {
                            continue;
                        }
                        let _permit = self.admit(task.weight_bytes());
                        let outcome =
                            match panic::catch_unwind(AssertUnwindSafe(|| work(worker_id, task))) {
                                Ok(result) => result,
                                Err(_) => Err(WorkError::from("worker panicked")),
                            };
                        if outcome.is_err() {
                            cancel.store(true, Ordering::Relaxed);
                        }
                        if result_tx.send((index, outcome)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(task_rx);
            drop(result_tx);

            // Feed every task, then fold; the result channel is unbounded so
            // feeding cannot deadlock against a slow fold.
            for pair in tasks.into_iter().enumerate() {
                if cancel.load(Ordering::Relaxed) {
                    break;
                }
                if task_tx.send(pair).is_err() {
                    break;
                }
            }
            drop(task_tx);

            let mut acc = init;
            let mut first_error: Option<(usize, WorkError)> = None;
            for (index, outcome) in result_rx.iter() {
                match outcome {
                    Ok(result) => acc = fold(acc, index, result),
                    Err(source) => {
                        if first_error.is_none() {
                            first_error = Some((index, source));
                        }
                    }
                }
            }
            match first_error {
                None => Ok(acc),
                Some((index, source)) => Err(ExecutorError::TaskFailed { index, source }),
            }
        })
    }

    /// Run `work` over every task and collect results in task order.
    pub fn run<T, R, F>(&self, tasks: Vec<T>, work: F) -> Result<Vec<R>, ExecutorError>
    where
        T: Send + Weighted,
        R: Send,
        F: Fn(usize, T) -> Result<R, WorkError> + Sync,
    {
        let mut indexed = self.run_fold(
            tasks,
            work,
            Vec::new(),
            |mut acc: Vec<(usize, R)>, index, result| {
                acc.push((index, result));
                acc
            },
        )?;
        indexed.sort_by_key(|&(index, _)| index);
        Ok(indexed.into_iter().map(|(_, result)| result).collect())
    }
}

// ============================================================================
// Tests
// ============================================================================
