//! Starting evaluation-level jobs.

use std::sync::Arc;

use raven_core::{EvaluationId, JobId};
use raven_infra::jobs::{Job, JobError, JobOptions, JobService, NewJob, StatusCache};
use tracing::info;

use crate::evaluation::EvaluationRepository;
use crate::{approve, close, purge, submit};

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("evaluation is busy with job {0}")]
    Busy(JobId),
    #[error("unknown processor: {0}")]
    UnknownProcessor(String),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Evaluation(#[from] anyhow::Error),
}

/// Runs processors over all the tasks of an evaluation.
#[derive(Clone)]
pub struct EvaluationJobs {
    service: JobService,
    evaluations: Arc<dyn EvaluationRepository>,
}

impl EvaluationJobs {
    pub fn new(service: JobService, evaluations: Arc<dyn EvaluationRepository>) -> Self {
        Self {
            service,
            evaluations,
        }
    }

    pub fn submit(&self, evaluation_id: EvaluationId) -> Result<Job, LaunchError> {
        self.launch(evaluation_id, submit::KEY)
    }

    pub fn close(&self, evaluation_id: EvaluationId) -> Result<Job, LaunchError> {
        self.launch(evaluation_id, close::KEY)
    }

    /// Tasks must be closed before they can be approved.
    pub fn approve(&self, evaluation_id: EvaluationId) -> Result<Job, LaunchError> {
        self.launch(evaluation_id, approve::KEY)
    }

    pub fn purge(&self, evaluation_id: EvaluationId) -> Result<Job, LaunchError> {
        self.launch(evaluation_id, purge::KEY)
    }

    /// Create a job for `processor` and dispatch it over the evaluation's tasks.
    ///
    /// The job is recorded on the evaluation before it is dispatched, so a
    /// status page can find it even while it is still queued. Fails with
    /// [`LaunchError::Busy`] while the previous job is still running.
    pub fn launch(&self, evaluation_id: EvaluationId, processor: &str) -> Result<Job, LaunchError> {
        let Some(info) = self.service.registry().info(processor) else {
            return Err(LaunchError::UnknownProcessor(processor.to_string()));
        };

        if let Some(current) = self.evaluations.current_job(evaluation_id)? {
            let job = self.service.get_job(current)?;
            if job.is_dispatched()
                && !self.service.job_status(&job, &mut StatusCache::new())?.ended()
            {
                return Err(LaunchError::Busy(current));
            }
        }

        let url = format!("/evaluations/{evaluation_id}");
        let job = self.service.create_job(
            NewJob::new(info.name.clone())
                .with_complete_url(url.clone())
                .with_back_url(url),
        )?;
        self.evaluations.set_job(evaluation_id, job.id)?;

        let tasks = self.evaluations.task_ids(evaluation_id)?;
        self.service
            .run(job.id, processor, &tasks, JobOptions::for_evaluation(evaluation_id))?;
        info!(evaluation_id = %evaluation_id, job_id = %job.id, processor, tasks = tasks.len(), "evaluation job launched");

        Ok(self.service.get_job(job.id)?)
    }
}
