//! Bounded worker pool.
//!
//! Items go into a shared queue drained by a fixed number of workers. A
//! failing item is retried up to the attempt budget; a kill is never retried.
//! The first unrecoverable failure clears the queue, so workers stop pulling
//! new items while in-flight ones finish, and is returned once all workers
//! have joined.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use tracing::{debug, error, warn};

use super::types::ProcessError;

/// Default number of concurrent workers.
pub const DEFAULT_POOL_SIZE: usize = 4;

/// Default attempt budget per item (first attempt included).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// A worker body handed to an [`ExecutionStrategy`].
pub type Worker<'a> = Box<dyn FnOnce() + Send + 'a>;

/// How the pool's workers are actually run.
///
/// Production uses [`ThreadedStrategy`]; tests can swap in
/// [`InlineStrategy`] for deterministic single-threaded execution.
pub trait ExecutionStrategy: Send + Sync {
    /// Run every worker to completion and block until all have finished.
    ///
    /// Returns the number of workers that did not finish normally
    /// (panicked or could not be started).
    fn run_workers<'a>(&self, workers: Vec<Worker<'a>>) -> usize;
}

/// One scoped OS thread per worker.
#[derive(Debug, Clone)]
pub struct ThreadedStrategy {
    name: String,
}

impl ThreadedStrategy {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for ThreadedStrategy {
    fn default() -> Self {
        Self::new("raven-worker")
    }
}

impl ExecutionStrategy for ThreadedStrategy {
    fn run_workers<'a>(&self, workers: Vec<Worker<'a>>) -> usize {
        thread::scope(|scope| {
            let mut failed = 0;
            let mut handles = Vec::with_capacity(workers.len());

            for (i, worker) in workers.into_iter().enumerate() {
                match thread::Builder::new()
                    .name(format!("{}-{}", self.name, i))
                    .spawn_scoped(scope, worker)
                {
                    Ok(handle) => handles.push(handle),
                    Err(e) => {
                        error!(worker = i, error = %e, "failed to spawn pool worker");
                        failed += 1;
                    }
                }
            }

            for handle in handles {
                if handle.join().is_err() {
                    failed += 1;
                }
            }
            failed
        })
    }
}

/// Runs workers one after another on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineStrategy;

impl ExecutionStrategy for InlineStrategy {
    fn run_workers<'a>(&self, workers: Vec<Worker<'a>>) -> usize {
        workers
            .into_iter()
            .map(|worker| panic::catch_unwind(AssertUnwindSafe(worker)))
            .filter(Result::is_err)
            .count()
    }
}

/// Fixed-size pool with per-item retry and fail-fast on fatal errors.
#[derive(Clone)]
pub struct WorkerPool {
    strategy: Arc<dyn ExecutionStrategy>,
    size: usize,
    max_attempts: u32,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_SIZE)
    }
}

impl WorkerPool {
    /// Threaded pool with `size` workers.
    pub fn new(size: usize) -> Self {
        Self {
            strategy: Arc::new(ThreadedStrategy::default()),
            size: size.max(1),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Single-threaded pool for deterministic tests.
    pub fn inline() -> Self {
        Self::new(1).with_strategy(Arc::new(InlineStrategy))
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn ExecutionStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size.max(1);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Process every item with `f` and block until done.
    ///
    /// Results come back in completion order. On a fatal error (a kill, or an
    /// item out of attempts) unstarted items are abandoned and that error is
    /// returned after every worker has joined.
    pub fn run<T, R, F>(&self, items: Vec<T>, f: F) -> Result<Vec<R>, ProcessError>
    where
        T: Send,
        R: Send,
        F: Fn(&T) -> Result<R, ProcessError> + Sync,
    {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let len = items.len();
        let workers = self.size.min(len);
        let queue = Mutex::new(VecDeque::from(items));
        let results = Mutex::new(Vec::with_capacity(len));
        let failure: Mutex<Option<ProcessError>> = Mutex::new(None);

        debug!(items = len, workers, "starting worker pool");

        let work = || {
            loop {
                let Some(item) = lock(&queue).pop_front() else {
                    break;
                };
                match self.attempt(&item, &f) {
                    Ok(result) => lock(&results).push(result),
                    Err(e) => {
                        lock(&queue).clear();
                        let mut slot = lock(&failure);
                        if slot.is_none() {
                            *slot = Some(e);
                        }
                        break;
                    }
                }
            }
        };

        let work = &work;
        let bodies: Vec<Worker<'_>> = (0..workers)
            .map(|_| Box::new(move || work()) as Worker<'_>)
            .collect();
        let failed_workers = self.strategy.run_workers(bodies);

        if let Some(e) = failure.into_inner().unwrap_or_else(PoisonError::into_inner) {
            return Err(e);
        }
        if failed_workers > 0 {
            return Err(ProcessError::failed(format!(
                "{failed_workers} pool worker(s) did not finish"
            )));
        }
        Ok(results.into_inner().unwrap_or_else(PoisonError::into_inner))
    }

    fn attempt<T, R, F>(&self, item: &T, f: &F) -> Result<R, ProcessError>
    where
        F: Fn(&T) -> Result<R, ProcessError>,
    {
        let mut attempt = 1;
        loop {
            match f(item) {
                Ok(result) => return Ok(result),
                Err(ProcessError::Killed) => return Err(ProcessError::Killed),
                Err(e) if attempt < self.max_attempts => {
                    warn!(
                        attempt,
                        remaining = self.max_attempts - attempt,
                        error = %e,
                        "error in worker pool"
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
