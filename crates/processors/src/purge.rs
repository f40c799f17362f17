use std::sync::Arc;

use raven_core::TaskId;
use raven_infra::jobs::{decode_payload, JobContext, ProcessError, Processor, ProcessorInfo};

use crate::evaluation::{evaluation_of, EvaluationRepository, EvaluationStatus};
use crate::marketplace::Marketplace;

pub const KEY: &str = "purge";

pub fn info() -> ProcessorInfo {
    ProcessorInfo::new(KEY)
        .with_name("Removing Tasks")
        .with_kill_message(
            "Not all tasks have been removed. To finish removing tasks, use the \
             \"Remove from MTurk\" button again.",
        )
}

/// Removes each task from the marketplace.
pub struct PurgeProcessor {
    marketplace: Arc<dyn Marketplace>,
    evaluations: Arc<dyn EvaluationRepository>,
}

impl PurgeProcessor {
    pub fn new(marketplace: Arc<dyn Marketplace>, evaluations: Arc<dyn EvaluationRepository>) -> Self {
        Self {
            marketplace,
            evaluations,
        }
    }
}

impl Processor for PurgeProcessor {
    fn process(&self, _ctx: &JobContext, payload: &serde_json::Value) -> Result<(), ProcessError> {
        let task_id: TaskId = decode_payload(payload)?;
        self.marketplace.dispose(task_id)?;
        Ok(())
    }

    fn after(&self, ctx: &JobContext) -> anyhow::Result<()> {
        let evaluation_id = evaluation_of(ctx)?;
        self.evaluations
            .set_status(evaluation_id, EvaluationStatus::Purged)
    }
}
