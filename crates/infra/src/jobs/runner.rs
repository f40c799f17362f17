//! External runner interface and the in-process [`LocalRunner`].

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use raven_core::JobId;

use super::executor::JobExecutor;
use super::processor::ProgressSink;
use super::types::{ExecutionHandle, JobOptions, ProcessError};

/// Everything a runner needs to locate a job and its work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dispatch {
    pub job_id: JobId,
    /// Registry key of the processor to run
    pub processor: String,
    #[serde(default)]
    pub options: JobOptions,
}

impl Dispatch {
    pub fn new(job_id: JobId, processor: impl Into<String>, options: JobOptions) -> Self {
        Self {
            job_id,
            processor: processor.into(),
            options,
        }
    }
}

/// Coarse state reported by a runner for one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    Queued,
    Working,
    Completed,
    Failed,
    Killed,
    #[serde(other)]
    Unknown,
}

/// A runner's status report for one execution handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerReport {
    pub state: RunnerState,
    /// Self-reported completion, nominally 0..=100
    #[serde(default)]
    pub pct_complete: f64,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub num: u64,
    #[serde(default)]
    pub message: Option<String>,
    /// Whether the execution can still be killed
    #[serde(default)]
    pub killable: bool,
}

impl RunnerReport {
    pub fn queued() -> Self {
        Self {
            state: RunnerState::Queued,
            pct_complete: 0.0,
            total: 0,
            num: 0,
            message: None,
            killable: true,
        }
    }
}

/// Runner error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RunnerError {
    #[error("unknown execution handle: {0}")]
    UnknownHandle(ExecutionHandle),
    #[error("failed to start execution: {0}")]
    Spawn(String),
    #[error("runner unavailable: {0}")]
    Unavailable(String),
}

/// The asynchronous job runner the engine hands dispatches to.
pub trait JobRunner: Send + Sync {
    /// Schedule a processor run and return its handle.
    fn create(&self, dispatch: &Dispatch) -> Result<ExecutionHandle, RunnerError>;

    /// Current report for `handle`; `None` if the runner has no record of it.
    fn get_status(&self, handle: &ExecutionHandle) -> Result<Option<RunnerReport>, RunnerError>;

    /// Request termination. Asynchronous: the report changes once acknowledged.
    fn kill(&self, handle: &ExecutionHandle) -> Result<(), RunnerError>;
}

impl<R: JobRunner + ?Sized> JobRunner for Arc<R> {
    fn create(&self, dispatch: &Dispatch) -> Result<ExecutionHandle, RunnerError> {
        (**self).create(dispatch)
    }

    fn get_status(&self, handle: &ExecutionHandle) -> Result<Option<RunnerReport>, RunnerError> {
        (**self).get_status(handle)
    }

    fn kill(&self, handle: &ExecutionHandle) -> Result<(), RunnerError> {
        (**self).kill(handle)
    }
}

/// Where [`LocalRunner`] executes dispatches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DispatchMode {
    /// On a dedicated background thread; `create` returns immediately
    #[default]
    Background,
    /// Synchronously inside `create`
    Inline,
}

impl FromStr for DispatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "background" => Ok(DispatchMode::Background),
            "inline" => Ok(DispatchMode::Inline),
            other => Err(format!("unknown dispatch mode: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
struct RunnerRecord {
    report: RunnerReport,
    kill_requested: bool,
}

type StatusTable = Arc<RwLock<HashMap<ExecutionHandle, RunnerRecord>>>;

/// Progress sink bound to one execution's status record.
struct Tracker {
    handle: ExecutionHandle,
    table: StatusTable,
}

impl Tracker {
    fn update(&self, f: impl FnOnce(&mut RunnerRecord)) {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(record) = table.get_mut(&self.handle) {
            f(record);
        }
    }

    fn finish(&self, outcome: Result<(), ProcessError>) {
        self.update(|record| {
            let report = &mut record.report;
            report.killable = false;
            match outcome {
                Ok(()) => {
                    report.state = RunnerState::Completed;
                    report.pct_complete = 100.0;
                    report.message = None;
                }
                Err(ProcessError::Killed) => {
                    report.state = RunnerState::Killed;
                    report.message = Some("Killed".to_string());
                }
                Err(ProcessError::Failed(e)) => {
                    report.state = RunnerState::Failed;
                    report.message = Some(format!("{e:#}"));
                }
            }
        });
    }
}

impl ProgressSink for Tracker {
    fn at(&self, num: u64, total: u64) {
        self.update(|record| {
            let report = &mut record.report;
            report.num = num;
            report.total = total;
            report.pct_complete = if total == 0 {
                0.0
            } else {
                num as f64 * 100.0 / total as f64
            };
        });
    }

    fn kill_requested(&self) -> bool {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&self.handle)
            .is_some_and(|record| record.kill_requested)
    }
}

/// In-process runner backed by a [`JobExecutor`].
///
/// Keeps the status table in memory, so reports do not survive a restart.
pub struct LocalRunner {
    executor: Arc<JobExecutor>,
    mode: DispatchMode,
    table: StatusTable,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl std::fmt::Debug for LocalRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRunner")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl LocalRunner {
    pub fn new(executor: Arc<JobExecutor>, mode: DispatchMode) -> Self {
        Self {
            executor,
            mode,
            table: Arc::new(RwLock::new(HashMap::new())),
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn background(executor: Arc<JobExecutor>) -> Self {
        Self::new(executor, DispatchMode::Background)
    }

    pub fn inline(executor: Arc<JobExecutor>) -> Self {
        Self::new(executor, DispatchMode::Inline)
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    /// Wait for every background execution started so far.
    pub fn join_all(&self) {
        let handles: Vec<_> = self
            .threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();

        for handle in handles {
            if handle.join().is_err() {
                warn!("job execution thread panicked");
            }
        }
    }

    /// Background executions not yet joined.
    pub fn outstanding_threads(&self) -> usize {
        self.threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Join executions that already exited so their handles are not kept.
    fn reap_finished(threads: &mut Vec<thread::JoinHandle<()>>) {
        let (finished, running): (Vec<_>, Vec<_>) =
            threads.drain(..).partition(|handle| handle.is_finished());
        *threads = running;

        for handle in finished {
            if handle.join().is_err() {
                warn!("job execution thread panicked");
            }
        }
    }

    fn execute(executor: &JobExecutor, tracker: Arc<Tracker>, dispatch: &Dispatch) {
        tracker.update(|record| record.report.state = RunnerState::Working);
        debug!(job_id = %dispatch.job_id, handle = %tracker.handle, "execution started");

        let outcome = executor.perform(dispatch, tracker.clone());
        tracker.finish(outcome);
    }
}

impl JobRunner for LocalRunner {
    fn create(&self, dispatch: &Dispatch) -> Result<ExecutionHandle, RunnerError> {
        let handle = ExecutionHandle::new(Uuid::now_v7().simple().to_string());
        {
            let mut table = self
                .table
                .write()
                .map_err(|_| RunnerError::Unavailable("status table lock poisoned".to_string()))?;
            table.insert(
                handle.clone(),
                RunnerRecord {
                    report: RunnerReport::queued(),
                    kill_requested: false,
                },
            );
        }

        let tracker = Arc::new(Tracker {
            handle: handle.clone(),
            table: self.table.clone(),
        });

        info!(
            job_id = %dispatch.job_id,
            processor = %dispatch.processor,
            handle = %handle,
            mode = ?self.mode,
            "job dispatched"
        );

        match self.mode {
            DispatchMode::Inline => Self::execute(&self.executor, tracker, dispatch),
            DispatchMode::Background => {
                let executor = self.executor.clone();
                let owned = dispatch.clone();
                let spawned = thread::Builder::new()
                    .name(format!("raven-job-{}", dispatch.job_id))
                    .spawn(move || Self::execute(&executor, tracker, &owned));

                match spawned {
                    Ok(join) => {
                        let mut threads =
                            self.threads.lock().unwrap_or_else(PoisonError::into_inner);
                        Self::reap_finished(&mut threads);
                        threads.push(join);
                    }
                    Err(e) => {
                        self.table
                            .write()
                            .unwrap_or_else(PoisonError::into_inner)
                            .remove(&handle);
                        return Err(RunnerError::Spawn(e.to_string()));
                    }
                }
            }
        }

        Ok(handle)
    }

    fn get_status(&self, handle: &ExecutionHandle) -> Result<Option<RunnerReport>, RunnerError> {
        let table = self
            .table
            .read()
            .map_err(|_| RunnerError::Unavailable("status table lock poisoned".to_string()))?;
        Ok(table.get(handle).map(|record| record.report.clone()))
    }

    fn kill(&self, handle: &ExecutionHandle) -> Result<(), RunnerError> {
        let mut table = self
            .table
            .write()
            .map_err(|_| RunnerError::Unavailable("status table lock poisoned".to_string()))?;
        let record = table
            .get_mut(handle)
            .ok_or_else(|| RunnerError::UnknownHandle(handle.clone()))?;

        if record.report.killable {
            record.kill_requested = true;
            info!(handle = %handle, "kill requested");
        }
        Ok(())
    }
}
