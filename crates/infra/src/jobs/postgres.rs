//! Postgres-backed job store.
//!
//! ## Schema
//!
//! - `jobs`: one row per job, `processor` and `execution_handle` null until
//!   the job is run. `dispatch_claimed_at` is set while a caller holds the
//!   dispatch claim.
//! - `job_parts`: one row per work unit. `status` is a `SMALLINT`
//!   (pending = 0, done = 1, error = 2) and `data` holds the JSON payload.
//!
//! ## Blocking
//!
//! [`JobStore`] is synchronous because pool workers are plain OS threads. The
//! async queries are driven on the runtime handle given at construction.
//! Called from inside a multi-threaded runtime, the calling worker is moved
//! off the scheduler with `block_in_place` first. A current-thread runtime
//! cannot be blocked, so calls from one fail with a storage error.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder, Row};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, instrument};
use uuid::Uuid;

use raven_core::{JobId, WorkUnitId};

use super::store::{JobStore, JobStoreError};
use super::types::{ExecutionHandle, Job, UnitCounts, WorkUnit, WorkUnitStatus};

/// Rows per `INSERT` when bulk-creating units; keeps binds under the
/// protocol limit.
const INSERT_CHUNK: usize = 1000;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id UUID PRIMARY KEY,
        title TEXT NOT NULL,
        complete_url TEXT NOT NULL DEFAULT '',
        back_url TEXT NOT NULL DEFAULT '',
        processor TEXT,
        execution_handle TEXT,
        dispatch_claimed_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "ALTER TABLE jobs ADD COLUMN IF NOT EXISTS dispatch_claimed_at TIMESTAMPTZ",
    r#"
    CREATE TABLE IF NOT EXISTS job_parts (
        id UUID PRIMARY KEY,
        job_id UUID NOT NULL REFERENCES jobs (id),
        data JSONB NOT NULL,
        status SMALLINT NOT NULL DEFAULT 0,
        error TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS job_parts_job_id_status_idx ON job_parts (job_id, status)",
];

/// Job store persisted in Postgres.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
    runtime: Handle,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    /// Create tables and indexes if they do not exist.
    pub async fn migrate(&self) -> Result<(), JobStoreError> {
        for statement in SCHEMA.iter().copied() {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        debug!("job tables ready");
        Ok(())
    }

    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    pub async fn create_job(&self, job: &Job) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"
            INSERT INTO jobs (id, title, complete_url, back_url, processor, execution_handle, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(&job.title)
        .bind(&job.complete_url)
        .bind(&job.back_url)
        .bind(job.processor.as_deref())
        .bind(job.execution_handle.as_ref().map(ExecutionHandle::as_str))
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if unique_violation(&e) {
                JobStoreError::AlreadyExists(job.id)
            } else {
                map_sqlx_error("create_job", e)
            }
        })?;
        Ok(())
    }

    pub async fn load_job(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, title, complete_url, back_url, processor, execution_handle, created_at, updated_at
            FROM jobs
            WHERE id = $1
            "#,
        )
        .bind(job_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_job", e))?;

        row.map(|row| JobRow::from_row(&row).map(Job::from))
            .transpose()
            .map_err(|e| JobStoreError::Storage(format!("failed to decode job row: {e}")))
    }

    pub async fn record_dispatch(
        &self,
        job_id: JobId,
        processor: &str,
        handle: &ExecutionHandle,
    ) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET processor = $2, execution_handle = $3, dispatch_claimed_at = NULL, updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(processor)
        .bind(handle.as_str())
        .bind(Utc::now())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_dispatch", e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::JobNotFound(job_id));
        }
        Ok(())
    }

    /// Conditional update: only one caller sees its row affected.
    pub async fn try_claim(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET dispatch_claimed_at = $2
            WHERE id = $1 AND dispatch_claimed_at IS NULL
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(Utc::now())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("try_claim", e))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.load_job(job_id).await? {
            Some(_) => Ok(false),
            None => Err(JobStoreError::JobNotFound(job_id)),
        }
    }

    pub async fn release_claim(&self, job_id: JobId) -> Result<(), JobStoreError> {
        sqlx::query("UPDATE jobs SET dispatch_claimed_at = NULL WHERE id = $1")
            .bind(job_id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("release_claim", e))?;
        Ok(())
    }

    pub async fn remove_units(&self, job_id: JobId) -> Result<u64, JobStoreError> {
        let result = sqlx::query("DELETE FROM job_parts WHERE job_id = $1")
            .bind(job_id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("remove_units", e))?;
        Ok(result.rows_affected())
    }

    /// Insert one pending unit per payload in a single transaction.
    #[instrument(skip(self, payloads), fields(job_id = %job_id, units = payloads.len()), err)]
    pub async fn create_units(
        &self,
        job_id: JobId,
        payloads: Vec<serde_json::Value>,
    ) -> Result<Vec<WorkUnitId>, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("create_units", e))?;

        let exists = sqlx::query("SELECT 1 FROM jobs WHERE id = $1")
            .bind(job_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("create_units", e))?;
        if exists.is_none() {
            return Err(JobStoreError::JobNotFound(job_id));
        }

        let units: Vec<WorkUnit> = payloads
            .into_iter()
            .map(|payload| WorkUnit::new(job_id, payload))
            .collect();

        for chunk in units.chunks(INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO job_parts (id, job_id, data, status, created_at, updated_at) ",
            );
            builder.push_values(chunk, |mut row, unit| {
                row.push_bind(*unit.id.as_uuid())
                    .push_bind(*unit.job_id.as_uuid())
                    .push_bind(unit.payload.clone())
                    .push_bind(unit.status.code())
                    .push_bind(unit.created_at)
                    .push_bind(unit.updated_at);
            });
            builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("create_units", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("create_units", e))?;

        Ok(units.into_iter().map(|u| u.id).collect())
    }

    pub async fn load_unit(&self, unit_id: WorkUnitId) -> Result<Option<WorkUnit>, JobStoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, job_id, data, status, error, created_at, updated_at
            FROM job_parts
            WHERE id = $1
            "#,
        )
        .bind(unit_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_unit", e))?;

        row.map(|row| decode_unit(&row)).transpose()
    }

    pub async fn load_units(
        &self,
        job_id: JobId,
        status: Option<WorkUnitStatus>,
    ) -> Result<Vec<WorkUnit>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_id, data, status, error, created_at, updated_at
            FROM job_parts
            WHERE job_id = $1 AND ($2::SMALLINT IS NULL OR status = $2)
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(status.map(WorkUnitStatus::code))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_units", e))?;

        rows.iter().map(decode_unit).collect()
    }

    pub async fn unit_ids(
        &self,
        job_id: JobId,
        status: Option<WorkUnitStatus>,
    ) -> Result<Vec<WorkUnitId>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id
            FROM job_parts
            WHERE job_id = $1 AND ($2::SMALLINT IS NULL OR status = $2)
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(status.map(WorkUnitStatus::code))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("unit_ids", e))?;

        rows.iter()
            .map(|row| {
                row.try_get::<Uuid, _>("id")
                    .map(WorkUnitId::from_uuid)
                    .map_err(|e| JobStoreError::Storage(format!("failed to decode unit id: {e}")))
            })
            .collect()
    }

    pub async fn set_unit_status(
        &self,
        unit_id: WorkUnitId,
        status: WorkUnitStatus,
        error: Option<&str>,
    ) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE job_parts
            SET status = $2, error = $3, updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(unit_id.as_uuid())
        .bind(status.code())
        .bind(error)
        .bind(Utc::now())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_unit_status", e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::UnitNotFound(unit_id));
        }
        Ok(())
    }

    pub async fn requeue_failed(&self, job_id: JobId) -> Result<u64, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE job_parts
            SET status = $2, error = NULL, updated_at = $4
            WHERE job_id = $1 AND status = $3
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(WorkUnitStatus::Pending.code())
        .bind(WorkUnitStatus::Error.code())
        .bind(Utc::now())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("requeue_failed", e))?;

        Ok(result.rows_affected())
    }

    pub async fn unit_counts(&self, job_id: JobId) -> Result<UnitCounts, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS total
            FROM job_parts
            WHERE job_id = $1
            GROUP BY status
            "#,
        )
        .bind(job_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("unit_counts", e))?;

        let mut counts = UnitCounts::default();
        for row in rows {
            let code: i16 = row
                .try_get("status")
                .map_err(|e| JobStoreError::Storage(format!("failed to decode status: {e}")))?;
            let total: i64 = row
                .try_get("total")
                .map_err(|e| JobStoreError::Storage(format!("failed to decode count: {e}")))?;
            let total = total.max(0) as u64;

            match WorkUnitStatus::from_code(code) {
                Some(WorkUnitStatus::Pending) => counts.pending += total,
                Some(WorkUnitStatus::Done) => counts.done += total,
                Some(WorkUnitStatus::Error) => counts.error += total,
                None => {
                    return Err(JobStoreError::Storage(format!(
                        "unknown unit status code {code}"
                    )));
                }
            }
        }
        Ok(counts)
    }
}

impl PostgresJobStore {
    fn blocking<T>(
        &self,
        query: impl Future<Output = Result<T, JobStoreError>>,
    ) -> Result<T, JobStoreError> {
        block_on_runtime(&self.runtime, query)?
    }
}

/// Drive `fut` to completion on `runtime` from synchronous code.
fn block_on_runtime<F: Future>(runtime: &Handle, fut: F) -> Result<F::Output, JobStoreError> {
    match Handle::try_current().map(|current| current.runtime_flavor()) {
        Err(_) => Ok(runtime.block_on(fut)),
        Ok(RuntimeFlavor::CurrentThread) => Err(JobStoreError::Storage(
            "job store called from a current-thread runtime; use spawn_blocking".to_string(),
        )),
        Ok(_) => Ok(tokio::task::block_in_place(|| runtime.block_on(fut))),
    }
}

impl JobStore for PostgresJobStore {
    fn insert_job(&self, job: Job) -> Result<JobId, JobStoreError> {
        self.blocking(self.create_job(&job))?;
        Ok(job.id)
    }

    fn get_job(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.blocking(self.load_job(job_id))
    }

    fn claim_dispatch(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        self.blocking(self.try_claim(job_id))
    }

    fn release_dispatch(&self, job_id: JobId) -> Result<(), JobStoreError> {
        self.blocking(self.release_claim(job_id))
    }

    fn set_dispatch(
        &self,
        job_id: JobId,
        processor: &str,
        handle: &ExecutionHandle,
    ) -> Result<(), JobStoreError> {
        self.blocking(self.record_dispatch(job_id, processor, handle))
    }

    fn insert_units(
        &self,
        job_id: JobId,
        payloads: Vec<serde_json::Value>,
    ) -> Result<Vec<WorkUnitId>, JobStoreError> {
        self.blocking(self.create_units(job_id, payloads))
    }

    fn delete_units(&self, job_id: JobId) -> Result<u64, JobStoreError> {
        self.blocking(self.remove_units(job_id))
    }

    fn get_unit(&self, unit_id: WorkUnitId) -> Result<Option<WorkUnit>, JobStoreError> {
        self.blocking(self.load_unit(unit_id))
    }

    fn list_unit_ids(
        &self,
        job_id: JobId,
        status: Option<WorkUnitStatus>,
    ) -> Result<Vec<WorkUnitId>, JobStoreError> {
        self.blocking(self.unit_ids(job_id, status))
    }

    fn list_units(
        &self,
        job_id: JobId,
        status: Option<WorkUnitStatus>,
    ) -> Result<Vec<WorkUnit>, JobStoreError> {
        self.blocking(self.load_units(job_id, status))
    }

    fn mark_done(&self, unit_id: WorkUnitId) -> Result<(), JobStoreError> {
        self.blocking(self.set_unit_status(unit_id, WorkUnitStatus::Done, None))
    }

    fn mark_error(&self, unit_id: WorkUnitId, detail: &str) -> Result<(), JobStoreError> {
        self.blocking(self.set_unit_status(unit_id, WorkUnitStatus::Error, Some(detail)))
    }

    fn reset_errors(&self, job_id: JobId) -> Result<u64, JobStoreError> {
        self.blocking(self.requeue_failed(job_id))
    }

    fn count_units(&self, job_id: JobId) -> Result<UnitCounts, JobStoreError> {
        self.blocking(self.unit_counts(job_id))
    }
}

struct JobRow {
    id: Uuid,
    title: String,
    complete_url: String,
    back_url: String,
    processor: Option<String>,
    execution_handle: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            title: row.try_get("title")?,
            complete_url: row.try_get("complete_url")?,
            back_url: row.try_get("back_url")?,
            processor: row.try_get("processor")?,
            execution_handle: row.try_get("execution_handle")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl From<JobRow> for Job {
    fn from(row: JobRow) -> Self {
        Job {
            id: JobId::from_uuid(row.id),
            title: row.title,
            complete_url: row.complete_url,
            back_url: row.back_url,
            processor: row.processor,
            execution_handle: row.execution_handle.map(ExecutionHandle::new),
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

struct UnitRow {
    id: Uuid,
    job_id: Uuid,
    data: serde_json::Value,
    status: i16,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for UnitRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            job_id: row.try_get("job_id")?,
            data: row.try_get("data")?,
            status: row.try_get("status")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<UnitRow> for WorkUnit {
    type Error = JobStoreError;

    fn try_from(row: UnitRow) -> Result<Self, Self::Error> {
        let status = WorkUnitStatus::from_code(row.status).ok_or_else(|| {
            JobStoreError::Storage(format!("unknown unit status code {}", row.status))
        })?;
        Ok(WorkUnit {
            id: WorkUnitId::from_uuid(row.id),
            job_id: JobId::from_uuid(row.job_id),
            payload: row.data,
            status,
            error: row.error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn decode_unit(row: &PgRow) -> Result<WorkUnit, JobStoreError> {
    UnitRow::from_row(row)
        .map_err(|e| JobStoreError::Storage(format!("failed to decode unit row: {e}")))?
        .try_into()
}

fn unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db) => {
            JobStoreError::Storage(format!("database error in {operation}: {}", db.message()))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::PoolTimedOut => {
            JobStoreError::Storage(format!("timed out waiting for a connection in {operation}"))
        }
        other => JobStoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}
