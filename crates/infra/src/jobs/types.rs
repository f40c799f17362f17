//! Core job types: the job record, its work units, and the processing error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use raven_core::{EvaluationId, JobId, WorkUnitId};

/// Identifier issued by the external runner for one dispatch of a job.
///
/// Opaque to the engine; replaced on every `retry`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionHandle(String);

impl ExecutionHandle {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ExecutionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Status of a single work unit.
///
/// Stored as a small integer: pending = 0, done = 1, error = 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkUnitStatus {
    /// Not yet processed in the current attempt
    Pending,
    /// Processed successfully
    Done,
    /// Processing exhausted its attempts
    Error,
}

impl WorkUnitStatus {
    pub fn code(self) -> i16 {
        match self {
            WorkUnitStatus::Pending => 0,
            WorkUnitStatus::Done => 1,
            WorkUnitStatus::Error => 2,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(WorkUnitStatus::Pending),
            1 => Some(WorkUnitStatus::Done),
            2 => Some(WorkUnitStatus::Error),
            _ => None,
        }
    }
}

/// One individually tracked item of work within a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub id: WorkUnitId,
    pub job_id: JobId,
    /// Serialized input, meaningful only to the bound processor
    pub payload: serde_json::Value,
    pub status: WorkUnitStatus,
    /// Failure detail, present only when `status` is `Error`
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkUnit {
    pub fn new(job_id: JobId, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: WorkUnitId::new(),
            job_id,
            payload,
            status: WorkUnitStatus::Pending,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn mark_done(&mut self) {
        self.status = WorkUnitStatus::Done;
        self.error = None;
        self.updated_at = Utc::now();
    }

    pub fn mark_error(&mut self, detail: impl Into<String>) {
        self.status = WorkUnitStatus::Error;
        self.error = Some(detail.into());
        self.updated_at = Utc::now();
    }

    /// Make a failed unit eligible for another attempt.
    ///
    /// Returns `false` (and changes nothing) unless the unit is in `Error`.
    pub fn reset_error(&mut self) -> bool {
        if self.status != WorkUnitStatus::Error {
            return false;
        }
        self.status = WorkUnitStatus::Pending;
        self.error = None;
        self.updated_at = Utc::now();
        true
    }
}

/// Work unit counts for one job, by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UnitCounts {
    pub pending: u64,
    pub done: u64,
    pub error: u64,
}

impl UnitCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.done + self.error
    }

    pub fn record(&mut self, status: WorkUnitStatus) {
        match status {
            WorkUnitStatus::Pending => self.pending += 1,
            WorkUnitStatus::Done => self.done += 1,
            WorkUnitStatus::Error => self.error += 1,
        }
    }
}

/// Attributes supplied by the caller when creating a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    pub title: String,
    /// Where to send the user once the job has completed
    pub complete_url: String,
    /// Where to send the user if they leave while the job executes
    pub back_url: String,
}

impl NewJob {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            complete_url: String::new(),
            back_url: String::new(),
        }
    }

    pub fn with_complete_url(mut self, url: impl Into<String>) -> Self {
        self.complete_url = url.into();
        self
    }

    pub fn with_back_url(mut self, url: impl Into<String>) -> Self {
        self.back_url = url.into();
        self
    }
}

/// The externally visible handle for one batch of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub title: String,
    pub complete_url: String,
    pub back_url: String,
    /// Registry key of the bound processor; `None` until dispatched
    pub processor: Option<String>,
    /// Handle issued by the external runner; `None` until dispatched
    pub execution_handle: Option<ExecutionHandle>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(attrs: NewJob) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            title: attrs.title,
            complete_url: attrs.complete_url,
            back_url: attrs.back_url,
            processor: None,
            execution_handle: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_dispatched(&self) -> bool {
        self.execution_handle.is_some()
    }

    /// Bind the processor and (re)place the execution handle.
    pub fn mark_dispatched(&mut self, processor: impl Into<String>, handle: ExecutionHandle) {
        self.processor = Some(processor.into());
        self.execution_handle = Some(handle);
        self.updated_at = Utc::now();
    }
}

/// Coarse externally visible job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusName {
    /// Never dispatched, or queued but not yet picked up
    New,
    Running,
    Done,
    Error,
    Killed,
}

impl StatusName {
    pub fn is_terminal(self) -> bool {
        matches!(self, StatusName::Done | StatusName::Error | StatusName::Killed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StatusName::New => "new",
            StatusName::Running => "running",
            StatusName::Done => "done",
            StatusName::Error => "error",
            StatusName::Killed => "killed",
        }
    }
}

impl std::fmt::Display for StatusName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options handed to the runner and on to the processor hooks.
///
/// Recognized keys are fixed: add a field here rather than passing
/// free-form maps through the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Evaluation the job acts on, for processors that update it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation_id: Option<EvaluationId>,
}

impl JobOptions {
    pub fn for_evaluation(evaluation_id: EvaluationId) -> Self {
        Self {
            evaluation_id: Some(evaluation_id),
        }
    }
}

/// Failure of one processing attempt.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// Forced termination. Never retried; aborts scheduling of further units.
    #[error("killed")]
    Killed,
    /// Any other failure; retried within the attempt budget.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl ProcessError {
    pub fn failed(msg: impl std::fmt::Display + std::fmt::Debug + Send + Sync + 'static) -> Self {
        Self::Failed(anyhow::Error::msg(msg))
    }

    pub fn is_killed(&self) -> bool {
        matches!(self, ProcessError::Killed)
    }
}
