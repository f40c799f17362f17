//! The processor extension point.
//!
//! A processor defines what a job actually does: `before` runs once, then
//! `process` runs concurrently for every pending unit, then `after` runs once.
//! Processors are resolved from the key stored on the job through an explicit
//! [`ProcessorRegistry`] populated at startup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::de::DeserializeOwned;

use raven_core::JobId;

use super::pool::DEFAULT_MAX_ATTEMPTS;
use super::types::{JobOptions, ProcessError};

/// Behaviour bound to a job.
///
/// `process` must tolerate concurrent calls for different units and repeated
/// calls for the same unit after a failed attempt.
pub trait Processor: Send + Sync {
    /// One-time setup before any unit is processed.
    fn before(&self, _ctx: &JobContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Process one unit's payload.
    fn process(&self, ctx: &JobContext, payload: &serde_json::Value) -> Result<(), ProcessError>;

    /// One-time teardown after every unit has been processed.
    fn after(&self, _ctx: &JobContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Static description of a processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorInfo {
    /// Stable key stored on the job record
    pub key: String,
    /// Display name, also used as the job title
    pub name: String,
    /// Suggestion shown to the user when the job errors or is killed
    pub kill_message: String,
    /// Attempts per unit before it is marked as failed
    pub max_attempts: u32,
}

impl ProcessorInfo {
    pub const DEFAULT_NAME: &'static str = "Processing";
    pub const DEFAULT_KILL_MESSAGE: &'static str = "Job may have been partially completed.";

    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: Self::DEFAULT_NAME.to_string(),
            kill_message: Self::DEFAULT_KILL_MESSAGE.to_string(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_kill_message(mut self, message: impl Into<String>) -> Self {
        self.kill_message = message.into();
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }
}

impl Default for ProcessorInfo {
    fn default() -> Self {
        Self::new("")
    }
}

/// Builds a fresh processor for one execution.
pub type ProcessorFactory = Box<dyn Fn() -> Box<dyn Processor> + Send + Sync>;

struct Registration {
    info: ProcessorInfo,
    factory: ProcessorFactory,
}

/// Key-to-factory table for processors.
#[derive(Default)]
pub struct ProcessorRegistry {
    entries: HashMap<String, Registration>,
    fallback: ProcessorInfo,
}

impl std::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.entries.keys().collect();
        keys.sort();
        f.debug_struct("ProcessorRegistry")
            .field("keys", &keys)
            .finish_non_exhaustive()
    }
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a processor under `info.key`, replacing any previous entry.
    pub fn register<F>(&mut self, info: ProcessorInfo, factory: F)
    where
        F: Fn() -> Box<dyn Processor> + Send + Sync + 'static,
    {
        self.entries.insert(
            info.key.clone(),
            Registration {
                info,
                factory: Box::new(factory),
            },
        );
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn info(&self, key: &str) -> Option<&ProcessorInfo> {
        self.entries.get(key).map(|r| &r.info)
    }

    /// Info for a job's stored key; unknown or missing keys get the defaults.
    pub fn info_or_default(&self, key: Option<&str>) -> &ProcessorInfo {
        key.and_then(|k| self.info(k)).unwrap_or(&self.fallback)
    }

    pub fn build(&self, key: &str) -> Option<Box<dyn Processor>> {
        self.entries.get(key).map(|r| (r.factory)())
    }
}

/// Receives progress from a running job and answers kill checks.
pub trait ProgressSink: Send + Sync {
    /// `num` of `total` steps are complete.
    fn at(&self, num: u64, total: u64);

    /// Whether termination has been requested for this execution.
    fn kill_requested(&self) -> bool {
        false
    }
}

/// Sink that discards progress and never requests a kill.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn at(&self, _num: u64, _total: u64) {}
}

#[derive(Debug, Default)]
struct SharedState {
    total: u64,
    completed: u64,
    once: HashMap<String, String>,
}

/// Per-execution state shared by the hooks and every worker.
///
/// Counters and one-time side effects sit behind a single mutex.
pub struct JobContext {
    job_id: JobId,
    options: JobOptions,
    items: Vec<serde_json::Value>,
    progress: Arc<dyn ProgressSink>,
    state: Mutex<SharedState>,
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job_id)
            .field("options", &self.options)
            .field("items", &self.items.len())
            .finish_non_exhaustive()
    }
}

impl JobContext {
    pub fn new(
        job_id: JobId,
        options: JobOptions,
        items: Vec<serde_json::Value>,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            job_id,
            options,
            items,
            progress,
            state: Mutex::new(SharedState::default()),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn options(&self) -> &JobOptions {
        &self.options
    }

    /// Payloads of every unit in the job, not only the pending ones.
    pub fn items(&self) -> &[serde_json::Value] {
        &self.items
    }

    pub fn total(&self) -> u64 {
        self.lock().total
    }

    pub fn completed(&self) -> u64 {
        self.lock().completed
    }

    pub fn set_total(&self, total: u64) {
        let mut state = self.lock();
        state.total = total;
        self.progress.at(state.completed, state.total);
    }

    /// Count one more step as complete and report progress.
    pub fn increment_completion(&self) {
        let mut state = self.lock();
        state.completed += 1;
        self.progress.at(state.completed, state.total);
    }

    /// Run `f` at most once per `key` for this execution and share its value.
    ///
    /// Runs under the context lock, so concurrent callers wait for the first
    /// one. A failed `f` is not remembered and the next caller runs it again.
    pub fn once<E, F>(&self, key: &str, f: F) -> Result<String, E>
    where
        F: FnOnce() -> Result<String, E>,
    {
        let mut state = self.lock();
        if let Some(value) = state.once.get(key) {
            return Ok(value.clone());
        }
        let value = f()?;
        state.once.insert(key.to_string(), value.clone());
        Ok(value)
    }

    /// Fail with [`ProcessError::Killed`] if termination was requested.
    pub fn checkpoint(&self) -> Result<(), ProcessError> {
        if self.progress.kill_requested() {
            Err(ProcessError::Killed)
        } else {
            Ok(())
        }
    }

    fn lock(&self) -> MutexGuard<'_, SharedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Decode a unit payload into the processor's item type.
pub fn decode_payload<T: DeserializeOwned>(payload: &serde_json::Value) -> Result<T, ProcessError> {
    serde_json::from_value(payload.clone())
        .map_err(|e| ProcessError::Failed(anyhow::Error::new(e).context("invalid payload")))
}
