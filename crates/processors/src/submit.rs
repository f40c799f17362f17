use std::sync::Arc;

use raven_core::TaskId;
use raven_infra::jobs::{decode_payload, JobContext, ProcessError, Processor, ProcessorInfo};
use tracing::debug;

use crate::evaluation::{evaluation_of, EvaluationRepository, EvaluationStatus};
use crate::marketplace::{Marketplace, MarketplaceError};

pub const KEY: &str = "submit";

pub fn info() -> ProcessorInfo {
    ProcessorInfo::new(KEY)
        .with_name("Submitting Tasks")
        .with_kill_message(
            "Some tasks may have been submitted. To close these tasks, use the \"Close \
             Evaluation\" button. To re-submit this evaluation, use the \"retry\" button. \
             To re-submit this evaluation with changes, copy it and submit the copy.",
        )
}

/// Publishes each task of an evaluation on the marketplace.
pub struct SubmitProcessor {
    marketplace: Arc<dyn Marketplace>,
    evaluations: Arc<dyn EvaluationRepository>,
}

impl SubmitProcessor {
    pub fn new(marketplace: Arc<dyn Marketplace>, evaluations: Arc<dyn EvaluationRepository>) -> Self {
        Self {
            marketplace,
            evaluations,
        }
    }
}

impl Processor for SubmitProcessor {
    fn before(&self, ctx: &JobContext) -> anyhow::Result<()> {
        let evaluation_id = evaluation_of(ctx)?;
        self.evaluations
            .set_status(evaluation_id, EvaluationStatus::Submitted)
    }

    fn process(&self, ctx: &JobContext, payload: &serde_json::Value) -> Result<(), ProcessError> {
        let task_id: TaskId = decode_payload(payload)?;
        let evaluation_id = evaluation_of(ctx)?;

        // Registered once per run, shared by every worker.
        let hit_type = ctx.once("hit_type", || self.marketplace.register_hit_type(evaluation_id))?;

        match self.marketplace.submit_task(task_id, &hit_type) {
            Ok(()) => Ok(()),
            Err(MarketplaceError::AlreadyExists(_)) => {
                debug!(task_id = %task_id, "task already on marketplace");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
