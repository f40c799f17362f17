use std::sync::Arc;

use anyhow::Context;
use raven_core::TaskId;
use raven_infra::jobs::{decode_payload, JobContext, ProcessError, Processor, ProcessorInfo};

use crate::evaluation::{evaluation_of, EvaluationRepository, EvaluationStatus};
use crate::marketplace::Marketplace;

pub const KEY: &str = "close";

pub fn info() -> ProcessorInfo {
    ProcessorInfo::new(KEY)
        .with_name("Closing Tasks")
        .with_kill_message(
            "Some tasks may have been closed, some may still be open. To finish closing \
             tasks, use the \"Close Evaluation\" button again.",
        )
}

/// Expires each task and imports its results.
///
/// Stale responses are cleared first, so closing again after a failure is safe.
pub struct CloseProcessor {
    marketplace: Arc<dyn Marketplace>,
    evaluations: Arc<dyn EvaluationRepository>,
}

impl CloseProcessor {
    pub fn new(marketplace: Arc<dyn Marketplace>, evaluations: Arc<dyn EvaluationRepository>) -> Self {
        Self {
            marketplace,
            evaluations,
        }
    }
}

impl Processor for CloseProcessor {
    // `after` walks every item, pending or not, one step each.
    fn before(&self, ctx: &JobContext) -> anyhow::Result<()> {
        ctx.set_total(ctx.total() + ctx.items().len() as u64);
        Ok(())
    }

    fn process(&self, _ctx: &JobContext, payload: &serde_json::Value) -> Result<(), ProcessError> {
        let task_id: TaskId = decode_payload(payload)?;
        self.evaluations.clear_task_response(task_id)?;
        self.marketplace.force_expire(task_id)?;
        self.marketplace.fetch_results(task_id)?;
        Ok(())
    }

    fn after(&self, ctx: &JobContext) -> anyhow::Result<()> {
        for item in ctx.items() {
            let task_id: TaskId =
                serde_json::from_value(item.clone()).context("invalid task id in job items")?;
            self.evaluations.add_metadata_as_questions(task_id)?;
            ctx.increment_completion();
        }

        let evaluation_id = evaluation_of(ctx)?;
        self.evaluations
            .set_status(evaluation_id, EvaluationStatus::Closed)
    }
}
