//! The evaluation side of the processors: status updates and task lookups.

use serde::{Deserialize, Serialize};

use raven_core::{EvaluationId, JobId, TaskId};
use raven_infra::jobs::JobContext;

/// Lifecycle of an evaluation on the marketplace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationStatus {
    New,
    Submitted,
    Closed,
    Approved,
    Purged,
}

/// Access to evaluations and their tasks.
pub trait EvaluationRepository: Send + Sync {
    fn set_status(&self, evaluation_id: EvaluationId, status: EvaluationStatus) -> anyhow::Result<()>;

    /// IDs of the evaluation's tasks, in a stable order.
    fn task_ids(&self, evaluation_id: EvaluationId) -> anyhow::Result<Vec<TaskId>>;

    /// Delete the response left over from an earlier close, if any.
    fn clear_task_response(&self, task_id: TaskId) -> anyhow::Result<()>;

    /// Turn the task's metadata columns into answered questions.
    fn add_metadata_as_questions(&self, task_id: TaskId) -> anyhow::Result<()>;

    /// The most recent job launched for the evaluation.
    fn current_job(&self, evaluation_id: EvaluationId) -> anyhow::Result<Option<JobId>>;

    fn set_job(&self, evaluation_id: EvaluationId, job_id: JobId) -> anyhow::Result<()>;
}

/// The evaluation a processor run acts on.
pub(crate) fn evaluation_of(ctx: &JobContext) -> anyhow::Result<EvaluationId> {
    ctx.options()
        .evaluation_id
        .ok_or_else(|| anyhow::anyhow!("job {} was dispatched without an evaluation", ctx.job_id()))
}
