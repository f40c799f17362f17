//! Remote marketplace client interface.

use serde::{Deserialize, Serialize};

use raven_core::{EvaluationId, TaskId};
use raven_infra::jobs::ProcessError;

/// Status of a worker's assignment on a published task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Submitted,
    Approved,
    Rejected,
}

/// One worker's response slot on a published task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub id: String,
    pub status: AssignmentStatus,
}

impl Assignment {
    pub fn new(id: impl Into<String>, status: AssignmentStatus) -> Self {
        Self {
            id: id.into(),
            status,
        }
    }
}

/// Marketplace error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MarketplaceError {
    /// The marketplace already holds this task (duplicate request token).
    #[error("task {0} already exists on the marketplace")]
    AlreadyExists(TaskId),
    #[error("task {0} has not been published")]
    NotPublished(TaskId),
    #[error("marketplace request failed: {0}")]
    Remote(String),
}

impl From<MarketplaceError> for ProcessError {
    fn from(e: MarketplaceError) -> Self {
        ProcessError::Failed(anyhow::Error::new(e))
    }
}

/// Remote calls made by the processors.
///
/// Every call may fail transiently; callers rely on the engine's retries.
pub trait Marketplace: Send + Sync {
    /// Register the evaluation's task type and return its identifier.
    fn register_hit_type(&self, evaluation_id: EvaluationId) -> Result<String, MarketplaceError>;

    /// Publish a task under `hit_type`.
    fn submit_task(&self, task_id: TaskId, hit_type: &str) -> Result<(), MarketplaceError>;

    /// Stop accepting work on a published task.
    fn force_expire(&self, task_id: TaskId) -> Result<(), MarketplaceError>;

    /// Download and store the responses to a task.
    fn fetch_results(&self, task_id: TaskId) -> Result<(), MarketplaceError>;

    fn assignments(&self, task_id: TaskId) -> Result<Vec<Assignment>, MarketplaceError>;

    fn approve_assignment(&self, assignment_id: &str) -> Result<(), MarketplaceError>;

    /// Remove a task from the marketplace.
    fn dispose(&self, task_id: TaskId) -> Result<(), MarketplaceError>;
}
