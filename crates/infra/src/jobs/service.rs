//! Job facade used by the rest of the application: create, run, retry, kill,
//! and query status.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use raven_core::{DomainError, JobId};

use super::processor::ProcessorRegistry;
use super::runner::{Dispatch, JobRunner, RunnerError};
use super::status::{JobStatus, JobStatusView, StatusCache, StatusError};
use super::store::{JobStore, JobStoreError};
use super::types::{ExecutionHandle, Job, JobOptions, NewJob};

/// Job service error.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error("failed to serialize work item: {0}")]
    Payload(#[from] serde_json::Error),
}

impl From<StatusError> for JobError {
    fn from(e: StatusError) -> Self {
        match e {
            StatusError::Store(e) => JobError::Store(e),
            StatusError::Runner(e) => JobError::Runner(e),
        }
    }
}

/// Entry point for dispatching and observing jobs.
#[derive(Clone)]
pub struct JobService {
    store: Arc<dyn JobStore>,
    runner: Arc<dyn JobRunner>,
    registry: Arc<ProcessorRegistry>,
}

impl std::fmt::Debug for JobService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobService")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl JobService {
    pub fn new(
        store: Arc<dyn JobStore>,
        runner: Arc<dyn JobRunner>,
        registry: Arc<ProcessorRegistry>,
    ) -> Self {
        Self {
            store,
            runner,
            registry,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ProcessorRegistry> {
        &self.registry
    }

    pub fn create_job(&self, attrs: NewJob) -> Result<Job, JobError> {
        let job = Job::new(attrs);
        self.store.insert_job(job.clone())?;
        debug!(job_id = %job.id, title = %job.title, "job created");
        Ok(job)
    }

    pub fn get_job(&self, job_id: JobId) -> Result<Job, JobError> {
        self.store
            .get_job(job_id)?
            .ok_or_else(|| DomainError::not_found(format!("job {job_id}")).into())
    }

    /// Create one pending unit per item and hand the job to the runner.
    ///
    /// Returns as soon as the runner has accepted the dispatch. Units and
    /// dispatch are written under the job's dispatch claim, so concurrent
    /// runs of one job cannot both succeed. If the runner refuses the
    /// dispatch, the units are removed again and the run can be repeated.
    pub fn run<T: Serialize>(
        &self,
        job_id: JobId,
        processor: &str,
        items: &[T],
        options: JobOptions,
    ) -> Result<ExecutionHandle, JobError> {
        let job = self.get_job(job_id)?;
        if job.is_dispatched() {
            return Err(already_run(job_id));
        }
        if !self.registry.contains(processor) {
            return Err(DomainError::validation(format!("unknown processor: {processor}")).into());
        }

        let payloads = items
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        let units = payloads.len();

        self.claim(job_id)?;
        // Re-read under the claim: another run may have finished meanwhile.
        let checked = self.get_job(job_id).and_then(|job| {
            if job.is_dispatched() {
                Err(already_run(job_id))
            } else if self.store.count_units(job_id)?.total() > 0 {
                Err(DomainError::invalid_state(format!("job {job_id} already has work units")).into())
            } else {
                Ok(())
            }
        });
        if let Err(e) = checked.and_then(|()| Ok(self.store.insert_units(job_id, payloads)?)) {
            self.release(job_id);
            return Err(e);
        }

        let handle = self.hand_off(job_id, processor, options, Rollback::Units)?;
        info!(job_id = %job_id, processor, units, handle = %handle, "job run");
        Ok(handle)
    }

    /// Reset failed units to pending and dispatch again under a new handle.
    ///
    /// Units already done are left alone, so they are not processed again.
    /// Like [`JobService::run`], this holds the dispatch claim, so two
    /// retries cannot hand the same pending units to two executions.
    pub fn retry(&self, job_id: JobId, options: JobOptions) -> Result<ExecutionHandle, JobError> {
        if self.get_job(job_id)?.processor.is_none() {
            return Err(never_run(job_id));
        }

        self.claim(job_id)?;
        let checked = self.get_job(job_id).and_then(|job| {
            let processor = job.processor.clone().ok_or_else(|| never_run(job_id))?;
            let mut cache = StatusCache::new();
            if JobStatus::load(&job, self.store.as_ref(), self.runner.as_ref(), &mut cache)?.ended() {
                Ok(processor)
            } else {
                Err(DomainError::invalid_state(format!("job {job_id} is still running")).into())
            }
        });
        let (processor, reset) = match checked
            .and_then(|processor| Ok((processor, self.store.reset_errors(job_id)?)))
        {
            Ok(ready) => ready,
            Err(e) => {
                self.release(job_id);
                return Err(e);
            }
        };

        let handle = self.hand_off(job_id, &processor, options, Rollback::Nothing)?;
        info!(job_id = %job_id, processor = %processor, reset, handle = %handle, "job retried");
        Ok(handle)
    }

    /// Ask the runner to stop the job. No-op for jobs that are new or ended.
    pub fn kill(&self, job_id: JobId) -> Result<(), JobError> {
        let job = self.get_job(job_id)?;
        let Some(handle) = job.execution_handle.as_ref() else {
            return Ok(());
        };

        let mut cache = StatusCache::new();
        if JobStatus::load(&job, self.store.as_ref(), self.runner.as_ref(), &mut cache)?.ended() {
            debug!(job_id = %job_id, "kill ignored, job already ended");
            return Ok(());
        }

        self.runner.kill(handle)?;
        info!(job_id = %job_id, handle = %handle, "kill requested");
        Ok(())
    }

    /// Fresh status snapshot of a job.
    pub fn status(&self, job_id: JobId) -> Result<JobStatusView, JobError> {
        self.status_with(job_id, &mut StatusCache::new())
    }

    /// Status snapshot sharing runner reports with other queries in `cache`.
    pub fn status_with(
        &self,
        job_id: JobId,
        cache: &mut StatusCache,
    ) -> Result<JobStatusView, JobError> {
        let job = self.get_job(job_id)?;
        let info = self.registry.info_or_default(job.processor.as_deref());
        Ok(JobStatusView::build(
            &job,
            info,
            self.store.as_ref(),
            self.runner.as_ref(),
            cache,
        )?)
    }

    /// Projection inputs for a job, for callers that only need a few fields.
    pub fn job_status(&self, job: &Job, cache: &mut StatusCache) -> Result<JobStatus, JobError> {
        Ok(JobStatus::load(
            job,
            self.store.as_ref(),
            self.runner.as_ref(),
            cache,
        )?)
    }

    fn claim(&self, job_id: JobId) -> Result<(), JobError> {
        if self.store.claim_dispatch(job_id)? {
            Ok(())
        } else {
            Err(DomainError::invalid_state(format!("job {job_id} is already being dispatched")).into())
        }
    }

    fn release(&self, job_id: JobId) {
        if let Err(e) = self.store.release_dispatch(job_id) {
            warn!(job_id = %job_id, error = %e, "failed to release dispatch claim");
        }
    }

    /// Give the claimed job to the runner and record the handle.
    ///
    /// If the runner refuses, `rollback` is undone and the claim released.
    /// If the runner accepted but the handle could not be recorded, the
    /// claim stays held: the execution is live and must not be doubled.
    fn hand_off(
        &self,
        job_id: JobId,
        processor: &str,
        options: JobOptions,
        rollback: Rollback,
    ) -> Result<ExecutionHandle, JobError> {
        let handle = match self
            .runner
            .create(&Dispatch::new(job_id, processor, options))
        {
            Ok(handle) => handle,
            Err(e) => {
                if rollback == Rollback::Units {
                    if let Err(cleanup) = self.store.delete_units(job_id) {
                        warn!(job_id = %job_id, error = %cleanup, "failed to remove units of refused dispatch");
                    }
                }
                self.release(job_id);
                return Err(e.into());
            }
        };

        if let Err(e) = self.store.set_dispatch(job_id, processor, &handle) {
            error!(job_id = %job_id, handle = %handle, error = %e, "dispatch accepted but not recorded");
            return Err(e.into());
        }
        Ok(handle)
    }
}

/// What to undo when the runner refuses a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rollback {
    Units,
    Nothing,
}

fn already_run(job_id: JobId) -> JobError {
    DomainError::invalid_state(format!("job {job_id} has already been run")).into()
}

fn never_run(job_id: JobId) -> JobError {
    DomainError::invalid_state(format!("job {job_id} has never been run")).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Barrier, Mutex};
    use std::thread;
    use std::time::Duration;

    use crate::jobs::processor::{JobContext, Processor, ProcessorInfo};
    use crate::jobs::runner::{RunnerReport, RunnerState};
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::{ProcessError, StatusName, WorkUnitStatus};

    struct Noop;

    impl Processor for Noop {
        fn process(&self, _ctx: &JobContext, _payload: &serde_json::Value) -> Result<(), ProcessError> {
            Ok(())
        }
    }

    /// Runner that never executes anything and reports whatever the test sets.
    #[derive(Default)]
    struct ScriptedRunner {
        next: Mutex<u32>,
        reports: Mutex<HashMap<ExecutionHandle, RunnerReport>>,
        created: Mutex<Vec<Dispatch>>,
        killed: Mutex<Vec<ExecutionHandle>>,
        /// Time `create` takes before accepting
        delay: Duration,
        /// Number of upcoming `create` calls to refuse
        refuse: Mutex<u32>,
    }

    impl ScriptedRunner {
        fn set(&self, handle: &ExecutionHandle, state: RunnerState) {
            let killable = matches!(state, RunnerState::Queued | RunnerState::Working);
            self.reports.lock().unwrap().insert(
                handle.clone(),
                RunnerReport {
                    state,
                    pct_complete: 0.0,
                    total: 0,
                    num: 0,
                    message: None,
                    killable,
                },
            );
        }
    }

    impl JobRunner for ScriptedRunner {
        fn create(&self, dispatch: &Dispatch) -> Result<ExecutionHandle, RunnerError> {
            thread::sleep(self.delay);
            {
                let mut refuse = self.refuse.lock().unwrap();
                if *refuse > 0 {
                    *refuse -= 1;
                    return Err(RunnerError::Unavailable("runner is down".to_string()));
                }
            }
            let mut next = self.next.lock().unwrap();
            *next += 1;
            let handle = ExecutionHandle::new(format!("h{next}"));
            self.created.lock().unwrap().push(dispatch.clone());
            self.set(&handle, RunnerState::Queued);
            Ok(handle)
        }

        fn get_status(&self, handle: &ExecutionHandle) -> Result<Option<RunnerReport>, RunnerError> {
            Ok(self.reports.lock().unwrap().get(handle).cloned())
        }

        fn kill(&self, handle: &ExecutionHandle) -> Result<(), RunnerError> {
            self.killed.lock().unwrap().push(handle.clone());
            Ok(())
        }
    }

    fn service() -> (JobService, Arc<ScriptedRunner>, Arc<InMemoryJobStore>) {
        service_with(ScriptedRunner::default())
    }

    fn service_with(runner: ScriptedRunner) -> (JobService, Arc<ScriptedRunner>, Arc<InMemoryJobStore>) {
        let store = InMemoryJobStore::arc();
        let runner = Arc::new(runner);
        let mut registry = ProcessorRegistry::new();
        registry.register(
            ProcessorInfo::new("noop").with_name("Doing Nothing"),
            || Box::new(Noop),
        );
        let service = JobService::new(store.clone(), runner.clone(), Arc::new(registry));
        (service, runner, store)
    }

    #[test]
    fn run_creates_units_and_records_dispatch() {
        let (service, runner, store) = service();
        let job = service.create_job(NewJob::new("Doing Nothing")).unwrap();

        let handle = service
            .run(job.id, "noop", &[10, 20, 30], JobOptions::default())
            .unwrap();

        let stored = service.get_job(job.id).unwrap();
        assert_eq!(stored.processor.as_deref(), Some("noop"));
        assert_eq!(stored.execution_handle, Some(handle));
        assert_eq!(store.count_units(job.id).unwrap().pending, 3);
        assert_eq!(runner.created.lock().unwrap().len(), 1);
        assert_eq!(service.status(job.id).unwrap().status_name, StatusName::New);
    }

    #[test]
    fn run_twice_is_rejected() {
        let (service, _runner, _store) = service();
        let job = service.create_job(NewJob::new("t")).unwrap();
        service.run(job.id, "noop", &[1], JobOptions::default()).unwrap();

        let err = service.run(job.id, "noop", &[1], JobOptions::default()).unwrap_err();
        assert!(matches!(err, JobError::Domain(DomainError::InvalidState(_))));
    }

    #[test]
    fn concurrent_runs_create_units_once() {
        let (service, runner, store) = service_with(ScriptedRunner {
            delay: Duration::from_millis(100),
            ..Default::default()
        });
        let job = service.create_job(NewJob::new("t")).unwrap();
        let job_id = job.id;
        let barrier = Arc::new(Barrier::new(2));

        let results: Vec<_> = (0..2)
            .map(|_| {
                let (service, barrier) = (service.clone(), barrier.clone());
                thread::spawn(move || {
                    barrier.wait();
                    service.run(job_id, "noop", &[1, 2, 3], JobOptions::default())
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|t| t.join().unwrap())
            .collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results.iter().any(|r| matches!(
            r,
            Err(JobError::Domain(DomainError::InvalidState(_)))
        )));
        assert_eq!(store.count_units(job.id).unwrap().total(), 3);
        assert_eq!(runner.created.lock().unwrap().len(), 1);
    }

    #[test]
    fn refused_dispatch_removes_units_so_run_can_be_repeated() {
        let (service, runner, store) = service_with(ScriptedRunner {
            refuse: Mutex::new(1),
            ..Default::default()
        });
        let job = service.create_job(NewJob::new("t")).unwrap();

        let err = service
            .run(job.id, "noop", &[1, 2, 3], JobOptions::default())
            .unwrap_err();
        assert!(matches!(err, JobError::Runner(RunnerError::Unavailable(_))));
        assert_eq!(store.count_units(job.id).unwrap().total(), 0);
        assert!(!service.get_job(job.id).unwrap().is_dispatched());

        service
            .run(job.id, "noop", &[1, 2, 3], JobOptions::default())
            .unwrap();
        assert_eq!(store.count_units(job.id).unwrap().pending, 3);
        assert_eq!(runner.created.lock().unwrap().len(), 1);
    }

    #[test]
    fn run_is_rejected_while_another_dispatch_holds_the_claim() {
        let (service, runner, store) = service();
        let job = service.create_job(NewJob::new("t")).unwrap();
        assert!(store.claim_dispatch(job.id).unwrap());

        let err = service.run(job.id, "noop", &[1], JobOptions::default()).unwrap_err();
        assert!(matches!(err, JobError::Domain(DomainError::InvalidState(_))));
        assert_eq!(store.count_units(job.id).unwrap().total(), 0);
        assert!(runner.created.lock().unwrap().is_empty());
    }

    #[test]
    fn concurrent_retries_dispatch_once() {
        let (service, runner, store) = service_with(ScriptedRunner {
            delay: Duration::from_millis(100),
            ..Default::default()
        });
        let job = service.create_job(NewJob::new("t")).unwrap();
        let first = service.run(job.id, "noop", &[1, 2], JobOptions::default()).unwrap();
        let ids = store.list_unit_ids(job.id, None).unwrap();
        store.mark_done(ids[0]).unwrap();
        store.mark_error(ids[1], "boom").unwrap();
        runner.set(&first, RunnerState::Failed);
        let job_id = job.id;
        let barrier = Arc::new(Barrier::new(2));

        let results: Vec<_> = (0..2)
            .map(|_| {
                let (service, barrier) = (service.clone(), barrier.clone());
                thread::spawn(move || {
                    barrier.wait();
                    service.retry(job_id, JobOptions::default())
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|t| t.join().unwrap())
            .collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(runner.created.lock().unwrap().len(), 2);
        assert_eq!(store.count_units(job.id).unwrap().pending, 1);
    }

    #[test]
    fn refused_retry_releases_the_claim() {
        let (service, runner, store) = service();
        let job = service.create_job(NewJob::new("t")).unwrap();
        let first = service.run(job.id, "noop", &[1], JobOptions::default()).unwrap();
        let ids = store.list_unit_ids(job.id, None).unwrap();
        store.mark_error(ids[0], "boom").unwrap();
        runner.set(&first, RunnerState::Failed);

        *runner.refuse.lock().unwrap() = 1;
        assert!(service.retry(job.id, JobOptions::default()).is_err());
        assert_eq!(service.get_job(job.id).unwrap().execution_handle, Some(first));

        assert!(service.retry(job.id, JobOptions::default()).is_ok());
        assert_eq!(store.count_units(job.id).unwrap().pending, 1);
    }

    #[test]
    fn unknown_processor_is_rejected_before_units_are_created() {
        let (service, runner, store) = service();
        let job = service.create_job(NewJob::new("t")).unwrap();

        let err = service.run(job.id, "nope", &[1], JobOptions::default()).unwrap_err();
        assert!(matches!(err, JobError::Domain(DomainError::Validation(_))));
        assert_eq!(store.count_units(job.id).unwrap().total(), 0);
        assert!(runner.created.lock().unwrap().is_empty());
    }

    #[test]
    fn retry_requires_an_ended_job() {
        let (service, runner, _store) = service();
        let job = service.create_job(NewJob::new("t")).unwrap();

        let never_run = service.retry(job.id, JobOptions::default()).unwrap_err();
        assert!(matches!(never_run, JobError::Domain(DomainError::InvalidState(_))));

        let handle = service.run(job.id, "noop", &[1], JobOptions::default()).unwrap();
        runner.set(&handle, RunnerState::Working);
        let running = service.retry(job.id, JobOptions::default()).unwrap_err();
        assert!(matches!(running, JobError::Domain(DomainError::InvalidState(_))));
    }

    #[test]
    fn retry_resets_errors_and_replaces_handle() {
        let (service, runner, store) = service();
        let job = service.create_job(NewJob::new("t")).unwrap();
        let first = service.run(job.id, "noop", &[1, 2], JobOptions::default()).unwrap();

        let ids = store.list_unit_ids(job.id, None).unwrap();
        store.mark_done(ids[0]).unwrap();
        store.mark_error(ids[1], "boom").unwrap();
        runner.set(&first, RunnerState::Failed);

        let second = service.retry(job.id, JobOptions::default()).unwrap();

        assert_ne!(first, second);
        assert_eq!(service.get_job(job.id).unwrap().execution_handle, Some(second));
        assert_eq!(
            store.list_unit_ids(job.id, Some(WorkUnitStatus::Pending)).unwrap(),
            vec![ids[1]]
        );
        assert_eq!(runner.created.lock().unwrap()[1].processor, "noop");
    }

    #[test]
    fn kill_is_forwarded_only_while_running() {
        let (service, runner, _store) = service();
        let job = service.create_job(NewJob::new("t")).unwrap();

        service.kill(job.id).unwrap();
        assert!(runner.killed.lock().unwrap().is_empty());

        let handle = service.run(job.id, "noop", &[1], JobOptions::default()).unwrap();
        runner.set(&handle, RunnerState::Working);
        service.kill(job.id).unwrap();
        assert_eq!(*runner.killed.lock().unwrap(), vec![handle.clone()]);

        runner.set(&handle, RunnerState::Completed);
        service.kill(job.id).unwrap();
        assert_eq!(runner.killed.lock().unwrap().len(), 1);
    }

    #[test]
    fn status_uses_processor_name_and_job_fields() {
        let (service, _runner, _store) = service();
        let job = service
            .create_job(NewJob::new("Doing Nothing").with_complete_url("/evaluations/1"))
            .unwrap();
        service.run(job.id, "noop", &[1], JobOptions::default()).unwrap();

        let view = service.status(job.id).unwrap();
        assert_eq!(view.processor_name, "Doing Nothing");
        assert_eq!(view.complete_url, "/evaluations/1");
        assert_eq!(view.total, 1);
    }

    #[test]
    fn missing_job_is_not_found() {
        let (service, _runner, _store) = service();
        assert!(matches!(
            service.status(JobId::new()),
            Err(JobError::Domain(DomainError::NotFound(_)))
        ));
    }
}
