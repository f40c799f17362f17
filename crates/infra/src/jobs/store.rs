//! Job and work-unit storage.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use raven_core::{JobId, WorkUnitId};

use super::types::{ExecutionHandle, Job, UnitCounts, WorkUnit, WorkUnitStatus};

/// Persistence contract of the engine.
///
/// Workers only ever touch the unit they claimed, so implementations need
/// row-level atomicity, not cross-row transactions. Dispatching a job is
/// serialized by the dispatch claim instead.
pub trait JobStore: Send + Sync {
    /// Persist a freshly created job.
    fn insert_job(&self, job: Job) -> Result<JobId, JobStoreError>;

    /// Get a job by ID.
    fn get_job(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Take the job's dispatch claim.
    ///
    /// Returns `false` if another caller holds it. At most one caller at a
    /// time may create units or hand the job to a runner.
    fn claim_dispatch(&self, job_id: JobId) -> Result<bool, JobStoreError>;

    /// Give up the dispatch claim without recording a dispatch.
    fn release_dispatch(&self, job_id: JobId) -> Result<(), JobStoreError>;

    /// Record the bound processor and the runner's execution handle, and
    /// release the dispatch claim.
    fn set_dispatch(
        &self,
        job_id: JobId,
        processor: &str,
        handle: &ExecutionHandle,
    ) -> Result<(), JobStoreError>;

    /// Bulk-create one pending unit per payload.
    fn insert_units(
        &self,
        job_id: JobId,
        payloads: Vec<serde_json::Value>,
    ) -> Result<Vec<WorkUnitId>, JobStoreError>;

    /// Remove all of a job's units. Returns the number removed.
    fn delete_units(&self, job_id: JobId) -> Result<u64, JobStoreError>;

    /// Get a unit by ID.
    fn get_unit(&self, unit_id: WorkUnitId) -> Result<Option<WorkUnit>, JobStoreError>;

    /// IDs of a job's units, optionally filtered by status, in creation order.
    fn list_unit_ids(
        &self,
        job_id: JobId,
        status: Option<WorkUnitStatus>,
    ) -> Result<Vec<WorkUnitId>, JobStoreError>;

    /// A job's units, optionally filtered by status, in creation order.
    fn list_units(
        &self,
        job_id: JobId,
        status: Option<WorkUnitStatus>,
    ) -> Result<Vec<WorkUnit>, JobStoreError>;

    fn mark_done(&self, unit_id: WorkUnitId) -> Result<(), JobStoreError>;

    fn mark_error(&self, unit_id: WorkUnitId, detail: &str) -> Result<(), JobStoreError>;

    /// `status = pending where status = error`, scoped to one job.
    ///
    /// Returns the number of units reset.
    fn reset_errors(&self, job_id: JobId) -> Result<u64, JobStoreError>;

    /// Count a job's units by status.
    fn count_units(&self, job_id: JobId) -> Result<UnitCounts, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    JobNotFound(JobId),
    #[error("work unit not found: {0}")]
    UnitNotFound(WorkUnitId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

impl<S: JobStore + ?Sized> JobStore for Arc<S> {
    fn insert_job(&self, job: Job) -> Result<JobId, JobStoreError> {
        (**self).insert_job(job)
    }

    fn get_job(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get_job(job_id)
    }

    fn claim_dispatch(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        (**self).claim_dispatch(job_id)
    }

    fn release_dispatch(&self, job_id: JobId) -> Result<(), JobStoreError> {
        (**self).release_dispatch(job_id)
    }

    fn set_dispatch(
        &self,
        job_id: JobId,
        processor: &str,
        handle: &ExecutionHandle,
    ) -> Result<(), JobStoreError> {
        (**self).set_dispatch(job_id, processor, handle)
    }

    fn insert_units(
        &self,
        job_id: JobId,
        payloads: Vec<serde_json::Value>,
    ) -> Result<Vec<WorkUnitId>, JobStoreError> {
        (**self).insert_units(job_id, payloads)
    }

    fn delete_units(&self, job_id: JobId) -> Result<u64, JobStoreError> {
        (**self).delete_units(job_id)
    }

    fn get_unit(&self, unit_id: WorkUnitId) -> Result<Option<WorkUnit>, JobStoreError> {
        (**self).get_unit(unit_id)
    }

    fn list_unit_ids(
        &self,
        job_id: JobId,
        status: Option<WorkUnitStatus>,
    ) -> Result<Vec<WorkUnitId>, JobStoreError> {
        (**self).list_unit_ids(job_id, status)
    }

    fn list_units(
        &self,
        job_id: JobId,
        status: Option<WorkUnitStatus>,
    ) -> Result<Vec<WorkUnit>, JobStoreError> {
        (**self).list_units(job_id, status)
    }

    fn mark_done(&self, unit_id: WorkUnitId) -> Result<(), JobStoreError> {
        (**self).mark_done(unit_id)
    }

    fn mark_error(&self, unit_id: WorkUnitId, detail: &str) -> Result<(), JobStoreError> {
        (**self).mark_error(unit_id, detail)
    }

    fn reset_errors(&self, job_id: JobId) -> Result<u64, JobStoreError> {
        (**self).reset_errors(job_id)
    }

    fn count_units(&self, job_id: JobId) -> Result<UnitCounts, JobStoreError> {
        (**self).count_units(job_id)
    }
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    units: RwLock<HashMap<WorkUnitId, WorkUnit>>,
    claims: RwLock<HashSet<JobId>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn jobs_read(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs
            .read()
            .map_err(|_| JobStoreError::Storage("lock poisoned".to_string()))
    }

    fn jobs_write(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs
            .write()
            .map_err(|_| JobStoreError::Storage("lock poisoned".to_string()))
    }

    fn units_read(
        &self,
    ) -> Result<RwLockReadGuard<'_, HashMap<WorkUnitId, WorkUnit>>, JobStoreError> {
        self.units
            .read()
            .map_err(|_| JobStoreError::Storage("lock poisoned".to_string()))
    }

    fn units_write(
        &self,
    ) -> Result<RwLockWriteGuard<'_, HashMap<WorkUnitId, WorkUnit>>, JobStoreError> {
        self.units
            .write()
            .map_err(|_| JobStoreError::Storage("lock poisoned".to_string()))
    }

    fn claims_write(&self) -> Result<RwLockWriteGuard<'_, HashSet<JobId>>, JobStoreError> {
        self.claims
            .write()
            .map_err(|_| JobStoreError::Storage("lock poisoned".to_string()))
    }

    fn update_unit(
        &self,
        unit_id: WorkUnitId,
        f: impl FnOnce(&mut WorkUnit),
    ) -> Result<(), JobStoreError> {
        let mut units = self.units_write()?;
        let unit = units
            .get_mut(&unit_id)
            .ok_or(JobStoreError::UnitNotFound(unit_id))?;
        f(unit);
        Ok(())
    }

    /// A job's units matching `status`, sorted by creation order.
    fn job_units(
        &self,
        job_id: JobId,
        status: Option<WorkUnitStatus>,
    ) -> Result<Vec<WorkUnit>, JobStoreError> {
        let units = self.units_read()?;
        let mut result: Vec<_> = units
            .values()
            .filter(|u| u.job_id == job_id && status.map_or(true, |s| u.status == s))
            .cloned()
            .collect();

        // UUIDv7 ids within one bulk insert share a timestamp; break ties by id.
        result.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(result)
    }
}

impl JobStore for InMemoryJobStore {
    fn insert_job(&self, job: Job) -> Result<JobId, JobStoreError> {
        let mut jobs = self.jobs_write()?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    fn get_job(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.jobs_read()?.get(&job_id).cloned())
    }

    fn claim_dispatch(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        if !self.jobs_read()?.contains_key(&job_id) {
            return Err(JobStoreError::JobNotFound(job_id));
        }
        Ok(self.claims_write()?.insert(job_id))
    }

    fn release_dispatch(&self, job_id: JobId) -> Result<(), JobStoreError> {
        self.claims_write()?.remove(&job_id);
        Ok(())
    }

    fn set_dispatch(
        &self,
        job_id: JobId,
        processor: &str,
        handle: &ExecutionHandle,
    ) -> Result<(), JobStoreError> {
        {
            let mut jobs = self.jobs_write()?;
            let job = jobs
                .get_mut(&job_id)
                .ok_or(JobStoreError::JobNotFound(job_id))?;
            job.mark_dispatched(processor, handle.clone());
        }
        self.claims_write()?.remove(&job_id);
        Ok(())
    }

    fn insert_units(
        &self,
        job_id: JobId,
        payloads: Vec<serde_json::Value>,
    ) -> Result<Vec<WorkUnitId>, JobStoreError> {
        if !self.jobs_read()?.contains_key(&job_id) {
            return Err(JobStoreError::JobNotFound(job_id));
        }

        let mut units = self.units_write()?;
        let mut ids = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let unit = WorkUnit::new(job_id, payload);
            ids.push(unit.id);
            units.insert(unit.id, unit);
        }
        Ok(ids)
    }

    fn delete_units(&self, job_id: JobId) -> Result<u64, JobStoreError> {
        let mut units = self.units_write()?;
        let before = units.len();
        units.retain(|_, u| u.job_id != job_id);
        Ok((before - units.len()) as u64)
    }

    fn get_unit(&self, unit_id: WorkUnitId) -> Result<Option<WorkUnit>, JobStoreError> {
        Ok(self.units_read()?.get(&unit_id).cloned())
    }

    fn list_unit_ids(
        &self,
        job_id: JobId,
        status: Option<WorkUnitStatus>,
    ) -> Result<Vec<WorkUnitId>, JobStoreError> {
        Ok(self
            .job_units(job_id, status)?
            .into_iter()
            .map(|u| u.id)
            .collect())
    }

    fn list_units(
        &self,
        job_id: JobId,
        status: Option<WorkUnitStatus>,
    ) -> Result<Vec<WorkUnit>, JobStoreError> {
        self.job_units(job_id, status)
    }

    fn mark_done(&self, unit_id: WorkUnitId) -> Result<(), JobStoreError> {
        self.update_unit(unit_id, WorkUnit::mark_done)
    }

    fn mark_error(&self, unit_id: WorkUnitId, detail: &str) -> Result<(), JobStoreError> {
        self.update_unit(unit_id, |u| u.mark_error(detail))
    }

    fn reset_errors(&self, job_id: JobId) -> Result<u64, JobStoreError> {
        let mut units = self.units_write()?;
        let reset = units
            .values_mut()
            .filter(|u| u.job_id == job_id)
            .map(|u| u.reset_error())
            .filter(|reset| *reset)
            .count();
        Ok(reset as u64)
    }

    fn count_units(&self, job_id: JobId) -> Result<UnitCounts, JobStoreError> {
        let units = self.units_read()?;
        let mut counts = UnitCounts::default();
        for unit in units.values().filter(|u| u.job_id == job_id) {
            counts.record(unit.status);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::NewJob;
    use serde_json::json;

    fn store_with_job() -> (InMemoryJobStore, JobId) {
        let store = InMemoryJobStore::new();
        let job_id = store.insert_job(Job::new(NewJob::new("test"))).unwrap();
        (store, job_id)
    }

    #[test]
    fn insert_and_get_job() {
        let (store, job_id) = store_with_job();
        let job = store.get_job(job_id).unwrap().unwrap();
        assert_eq!(job.title, "test");
        assert!(store.get_job(JobId::new()).unwrap().is_none());
    }

    #[test]
    fn duplicate_job_is_rejected() {
        let store = InMemoryJobStore::new();
        let job = Job::new(NewJob::new("test"));
        store.insert_job(job.clone()).unwrap();
        assert!(matches!(
            store.insert_job(job),
            Err(JobStoreError::AlreadyExists(_))
        ));
    }

    #[test]
    fn bulk_insert_creates_pending_units_in_order() {
        let (store, job_id) = store_with_job();
        let ids = store
            .insert_units(job_id, vec![json!(1), json!(2), json!(3)])
            .unwrap();

        assert_eq!(store.list_unit_ids(job_id, None).unwrap(), ids);
        let units = store.list_units(job_id, Some(WorkUnitStatus::Pending)).unwrap();
        let payloads: Vec<_> = units.iter().map(|u| u.payload.clone()).collect();
        assert_eq!(payloads, vec![json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn units_require_an_existing_job() {
        let store = InMemoryJobStore::new();
        assert!(matches!(
            store.insert_units(JobId::new(), vec![json!(1)]),
            Err(JobStoreError::JobNotFound(_))
        ));
    }

    #[test]
    fn status_updates_and_counts() {
        let (store, job_id) = store_with_job();
        let ids = store
            .insert_units(job_id, vec![json!("a"), json!("b"), json!("c")])
            .unwrap();

        store.mark_done(ids[0]).unwrap();
        store.mark_error(ids[1], "boom").unwrap();

        let counts = store.count_units(job_id).unwrap();
        assert_eq!(counts, UnitCounts { pending: 1, done: 1, error: 1 });

        let failed = store.list_units(job_id, Some(WorkUnitStatus::Error)).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].error.as_deref(), Some("boom"));
    }

    #[test]
    fn reset_errors_only_touches_failed_units_of_the_job() {
        let (store, job_id) = store_with_job();
        let other = store.insert_job(Job::new(NewJob::new("other"))).unwrap();

        let ids = store
            .insert_units(job_id, vec![json!(1), json!(2), json!(3)])
            .unwrap();
        let other_ids = store.insert_units(other, vec![json!(9)]).unwrap();

        store.mark_done(ids[0]).unwrap();
        store.mark_error(ids[1], "x").unwrap();
        store.mark_error(other_ids[0], "y").unwrap();

        assert_eq!(store.reset_errors(job_id).unwrap(), 1);

        let counts = store.count_units(job_id).unwrap();
        assert_eq!(counts, UnitCounts { pending: 2, done: 1, error: 0 });
        assert_eq!(store.count_units(other).unwrap().error, 1);
    }

    #[test]
    fn set_dispatch_records_processor_and_handle() {
        let (store, job_id) = store_with_job();
        store
            .set_dispatch(job_id, "submit", &ExecutionHandle::new("h1"))
            .unwrap();

        let job = store.get_job(job_id).unwrap().unwrap();
        assert_eq!(job.processor.as_deref(), Some("submit"));
        assert_eq!(job.execution_handle, Some(ExecutionHandle::new("h1")));
    }

    #[test]
    fn dispatch_claim_is_exclusive_until_released_or_recorded() {
        let (store, job_id) = store_with_job();

        assert!(store.claim_dispatch(job_id).unwrap());
        assert!(!store.claim_dispatch(job_id).unwrap());

        store.release_dispatch(job_id).unwrap();
        assert!(store.claim_dispatch(job_id).unwrap());

        store
            .set_dispatch(job_id, "submit", &ExecutionHandle::new("h1"))
            .unwrap();
        assert!(store.claim_dispatch(job_id).unwrap());
    }

    #[test]
    fn claiming_a_missing_job_fails() {
        let store = InMemoryJobStore::new();
        assert!(matches!(
            store.claim_dispatch(JobId::new()),
            Err(JobStoreError::JobNotFound(_))
        ));
    }

    #[test]
    fn delete_units_only_removes_the_jobs_units() {
        let (store, job_id) = store_with_job();
        let other = store.insert_job(Job::new(NewJob::new("other"))).unwrap();
        store.insert_units(job_id, vec![json!(1), json!(2)]).unwrap();
        store.insert_units(other, vec![json!(3)]).unwrap();

        assert_eq!(store.delete_units(job_id).unwrap(), 2);
        assert_eq!(store.count_units(job_id).unwrap().total(), 0);
        assert_eq!(store.count_units(other).unwrap().total(), 1);
    }

    #[test]
    fn missing_unit_update_is_an_error() {
        let store = InMemoryJobStore::new();
        assert!(matches!(
            store.mark_done(WorkUnitId::new()),
            Err(JobStoreError::UnitNotFound(_))
        ));
    }
}
