//! Runs one dispatch of a job: `before`, the pool of `process` calls, `after`.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use raven_core::WorkUnitId;

use super::pool::WorkerPool;
use super::processor::{JobContext, Processor, ProcessorInfo, ProcessorRegistry, ProgressSink};
use super::runner::Dispatch;
use super::store::{JobStore, JobStoreError};
use super::types::{ProcessError, WorkUnitStatus};

/// Executes dispatched jobs against the store.
///
/// This is what an external runner calls when it picks a dispatch up; the
/// runner decides the job's terminal state from the returned result.
pub struct JobExecutor {
    store: Arc<dyn JobStore>,
    registry: Arc<ProcessorRegistry>,
    pool: WorkerPool,
}

impl std::fmt::Debug for JobExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobExecutor")
            .field("registry", &self.registry)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl JobExecutor {
    pub fn new(store: Arc<dyn JobStore>, registry: Arc<ProcessorRegistry>) -> Self {
        Self {
            store,
            registry,
            pool: WorkerPool::default(),
        }
    }

    pub fn with_pool(mut self, pool: WorkerPool) -> Self {
        self.pool = pool;
        self
    }

    pub fn registry(&self) -> &Arc<ProcessorRegistry> {
        &self.registry
    }

    /// Run the dispatched processor over the job's pending units.
    ///
    /// Units that exhaust their attempts are marked `error` and do not fail
    /// the run. A kill, or a storage failure that outlasts the pool's
    /// retries, aborts the run; `after` is skipped in that case.
    pub fn perform(
        &self,
        dispatch: &Dispatch,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<(), ProcessError> {
        let job_id = dispatch.job_id;
        let info = self
            .registry
            .info(&dispatch.processor)
            .ok_or_else(|| ProcessError::failed(format!("unknown processor: {}", dispatch.processor)))?;
        let processor = self
            .registry
            .build(&dispatch.processor)
            .ok_or_else(|| ProcessError::failed(format!("unknown processor: {}", dispatch.processor)))?;

        if self.store.get_job(job_id).map_err(storage)?.is_none() {
            return Err(ProcessError::from(anyhow::Error::new(JobStoreError::JobNotFound(job_id))));
        }

        let pending = self
            .store
            .list_unit_ids(job_id, Some(WorkUnitStatus::Pending))
            .map_err(storage)?;
        let items = self
            .store
            .list_units(job_id, None)
            .map_err(storage)?
            .into_iter()
            .map(|unit| unit.payload)
            .collect();

        let ctx = JobContext::new(job_id, dispatch.options.clone(), items, progress);
        ctx.set_total(pending.len() as u64);
        ctx.checkpoint()?;

        info!(
            job_id = %job_id,
            processor = %info.key,
            pending = pending.len(),
            "starting job"
        );

        processor.before(&ctx).map_err(ProcessError::Failed)?;

        if let Err(e) = self.pool.run(pending, |unit_id| {
            self.safe_process(&ctx, processor.as_ref(), info, *unit_id)
        }) {
            if e.is_killed() {
                warn!(job_id = %job_id, "job killed");
            } else {
                error!(job_id = %job_id, error = %e, "job aborted");
            }
            return Err(e);
        }

        processor.after(&ctx).map_err(ProcessError::Failed)?;

        info!(job_id = %job_id, processor = %info.key, "job finished");
        Ok(())
    }

    /// Process one unit with the processor's attempt budget.
    ///
    /// A kill propagates without touching the unit. Any other failure is
    /// retried, then recorded on the unit once attempts run out.
    fn safe_process(
        &self,
        ctx: &JobContext,
        processor: &dyn Processor,
        info: &ProcessorInfo,
        unit_id: WorkUnitId,
    ) -> Result<(), ProcessError> {
        let unit = self
            .store
            .get_unit(unit_id)
            .map_err(storage)?
            .ok_or_else(|| ProcessError::from(anyhow::Error::new(JobStoreError::UnitNotFound(unit_id))))?;

        let mut attempt = 1;
        loop {
            ctx.checkpoint()?;

            match processor.process(ctx, &unit.payload) {
                Ok(()) => {
                    self.store.mark_done(unit_id).map_err(storage)?;
                    ctx.increment_completion();
                    debug!(unit_id = %unit_id, attempt, "unit done");
                    return Ok(());
                }
                Err(ProcessError::Killed) => return Err(ProcessError::Killed),
                Err(ProcessError::Failed(e)) if attempt < info.max_attempts => {
                    warn!(
                        unit_id = %unit_id,
                        attempt,
                        remaining = info.max_attempts - attempt,
                        error = %e,
                        "unit failed, retrying"
                    );
                    attempt += 1;
                }
                Err(ProcessError::Failed(e)) => {
                    let detail = format!("{e:#}");
                    error!(unit_id = %unit_id, attempts = attempt, error = %detail, "unit failed");
                    self.store.mark_error(unit_id, &detail).map_err(storage)?;
                    ctx.increment_completion();
                    return Ok(());
                }
            }
        }
    }
}

fn storage(e: JobStoreError) -> ProcessError {
    ProcessError::Failed(anyhow::Error::new(e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use serde_json::json;

    use crate::jobs::processor::NoopProgress;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::{Job, JobOptions, NewJob, UnitCounts};

    /// Fails payloads listed in `failing` a fixed number of times.
    struct Flaky {
        failures: Mutex<std::collections::HashMap<i64, u32>>,
        calls: Arc<AtomicUsize>,
    }

    impl Flaky {
        fn new(failing: &[(i64, u32)], calls: Arc<AtomicUsize>) -> Self {
            Self {
                failures: Mutex::new(failing.iter().copied().collect()),
                calls,
            }
        }
    }

    impl Processor for Flaky {
        fn process(&self, _ctx: &JobContext, payload: &serde_json::Value) -> Result<(), ProcessError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let n = payload.as_i64().unwrap_or_default();
            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(&n) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    Err(ProcessError::failed(format!("item {n} failed")))
                }
                _ => Ok(()),
            }
        }
    }

    fn setup(
        items: Vec<serde_json::Value>,
        processor: impl Fn() -> Box<dyn Processor> + Send + Sync + 'static,
    ) -> (JobExecutor, Arc<InMemoryJobStore>, Dispatch) {
        let store = InMemoryJobStore::arc();
        let job_id = store.insert_job(Job::new(NewJob::new("t"))).unwrap();
        store.insert_units(job_id, items).unwrap();

        let mut registry = ProcessorRegistry::new();
        registry.register(ProcessorInfo::new("flaky"), processor);

        let executor = JobExecutor::new(store.clone(), Arc::new(registry)).with_pool(WorkerPool::inline());
        let dispatch = Dispatch::new(job_id, "flaky", JobOptions::default());
        (executor, store, dispatch)
    }

    #[test]
    fn failure_then_success_marks_unit_done() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let (executor, store, dispatch) = setup(vec![json!(1)], move || {
            Box::new(Flaky::new(&[(1, 2)], c.clone()))
        });

        executor.perform(&dispatch, Arc::new(NoopProgress)).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            store.count_units(dispatch.job_id).unwrap(),
            UnitCounts { pending: 0, done: 1, error: 0 }
        );
    }

    #[test]
    fn exhausted_unit_is_marked_error_and_siblings_continue() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let (executor, store, dispatch) = setup(vec![json!(1), json!(2), json!(3)], move || {
            Box::new(Flaky::new(&[(2, 10)], c.clone()))
        });

        executor.perform(&dispatch, Arc::new(NoopProgress)).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        let failed = store
            .list_units(dispatch.job_id, Some(WorkUnitStatus::Error))
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].payload, json!(2));
        assert_eq!(failed[0].error.as_deref(), Some("item 2 failed"));
    }

    #[test]
    fn only_pending_units_are_processed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let (executor, store, dispatch) = setup(vec![json!(1), json!(2)], move || {
            Box::new(Flaky::new(&[], c.clone()))
        });
        let ids = store.list_unit_ids(dispatch.job_id, None).unwrap();
        store.mark_done(ids[0]).unwrap();

        executor.perform(&dispatch, Arc::new(NoopProgress)).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_processor_fails_the_run() {
        let (executor, _store, dispatch) = setup(vec![], || Box::new(Flaky::new(&[], Arc::default())));
        let dispatch = Dispatch::new(dispatch.job_id, "nope", JobOptions::default());

        let err = executor.perform(&dispatch, Arc::new(NoopProgress)).unwrap_err();
        assert!(err.to_string().contains("unknown processor"));
    }

    #[test]
    fn kill_skips_after_and_leaves_units_pending() {
        struct KillSwitch(AtomicBool);
        impl ProgressSink for KillSwitch {
            fn at(&self, _num: u64, _total: u64) {}
            fn kill_requested(&self) -> bool {
                self.0.load(Ordering::SeqCst)
            }
        }

        struct KillsOnFirst {
            switch: Arc<KillSwitch>,
            after_ran: Arc<AtomicBool>,
        }
        impl Processor for KillsOnFirst {
            fn process(&self, _ctx: &JobContext, _payload: &serde_json::Value) -> Result<(), ProcessError> {
                self.switch.0.store(true, Ordering::SeqCst);
                Err(ProcessError::Killed)
            }
            fn after(&self, _ctx: &JobContext) -> anyhow::Result<()> {
                self.after_ran.store(true, Ordering::SeqCst);
                Ok(())
            }
        }

        let switch = Arc::new(KillSwitch(AtomicBool::new(false)));
        let after_ran = Arc::new(AtomicBool::new(false));
        let (s, a) = (switch.clone(), after_ran.clone());
        let (executor, store, dispatch) = setup(vec![json!(1), json!(2), json!(3)], move || {
            Box::new(KillsOnFirst {
                switch: s.clone(),
                after_ran: a.clone(),
            })
        });

        let err = executor.perform(&dispatch, switch).unwrap_err();

        assert!(err.is_killed());
        assert!(!after_ran.load(Ordering::SeqCst));
        assert_eq!(store.count_units(dispatch.job_id).unwrap().pending, 3);
    }
}
