//! Job execution engine.
//!
//! ## Flow
//!
//! 1. A caller creates a [`Job`] and calls [`JobService::run`] with a
//!    processor key and a list of items.
//! 2. One pending [`WorkUnit`] is stored per item and the job is handed to a
//!    [`JobRunner`], which returns an [`ExecutionHandle`] right away.
//! 3. The runner later calls [`JobExecutor::perform`]: the processor's
//!    `before`, then `process` for every pending unit on a [`WorkerPool`],
//!    then `after`.
//! 4. [`JobService::status`] projects the runner report and unit counts
//!    into a [`JobStatusView`]. [`JobService::retry`] re-dispatches only the
//!    failed units.
//!
//! ## Components
//!
//! - `store` / `postgres`: unit-of-work persistence
//! - `pool`: bounded worker pool with per-item retry
//! - `processor`: processor trait, registry and execution context
//! - `executor`: processor lifecycle over the pool
//! - `runner`: runner interface and the in-process runner
//! - `status`: status projection
//! - `service`: facade

pub mod executor;
pub mod pool;
pub mod postgres;
pub mod processor;
pub mod runner;
pub mod service;
pub mod status;
pub mod store;
pub mod types;

pub use executor::JobExecutor;
pub use pool::{ExecutionStrategy, InlineStrategy, ThreadedStrategy, WorkerPool};
pub use postgres::PostgresJobStore;
pub use processor::{
    JobContext, NoopProgress, Processor, ProcessorInfo, ProcessorRegistry, ProgressSink,
    decode_payload,
};
pub use runner::{
    Dispatch, DispatchMode, JobRunner, LocalRunner, RunnerError, RunnerReport, RunnerState,
};
pub use service::{JobError, JobService};
pub use status::{JobStatus, JobStatusView, StatusCache, StatusError};
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use types::{
    ExecutionHandle, Job, JobOptions, NewJob, ProcessError, StatusName, UnitCounts, WorkUnit,
    WorkUnitStatus,
};
