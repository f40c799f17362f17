use std::sync::Arc;

use raven_core::TaskId;
use raven_infra::jobs::{decode_payload, JobContext, ProcessError, Processor, ProcessorInfo};

use crate::evaluation::{evaluation_of, EvaluationRepository, EvaluationStatus};
use crate::marketplace::{AssignmentStatus, Marketplace};

pub const KEY: &str = "approve";

pub fn info() -> ProcessorInfo {
    ProcessorInfo::new(KEY)
        .with_name("Approving Tasks")
        .with_kill_message(
            "Not all tasks have been approved. To finish approving tasks, use the \
             \"Approve All\" button again.",
        )
}

/// Approves every submitted assignment of each task.
///
/// Assignments already approved or rejected are skipped.
pub struct ApproveProcessor {
    marketplace: Arc<dyn Marketplace>,
    evaluations: Arc<dyn EvaluationRepository>,
}

impl ApproveProcessor {
    pub fn new(marketplace: Arc<dyn Marketplace>, evaluations: Arc<dyn EvaluationRepository>) -> Self {
        Self {
            marketplace,
            evaluations,
        }
    }
}

impl Processor for ApproveProcessor {
    fn process(&self, ctx: &JobContext, payload: &serde_json::Value) -> Result<(), ProcessError> {
        let task_id: TaskId = decode_payload(payload)?;
        for assignment in self.marketplace.assignments(task_id)? {
            if assignment.status != AssignmentStatus::Submitted {
                continue;
            }
            ctx.checkpoint()?;
            self.marketplace.approve_assignment(&assignment.id)?;
        }
        Ok(())
    }

    fn after(&self, ctx: &JobContext) -> anyhow::Result<()> {
        let evaluation_id = evaluation_of(ctx)?;
        self.evaluations
            .set_status(evaluation_id, EvaluationStatus::Approved)
    }
}
