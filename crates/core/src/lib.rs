//! `raven-core`: identifiers and error types shared by the job engine and
//! its processors.
//!
//! This crate has no infrastructure concerns.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{EvaluationId, JobId, TaskId, WorkUnitId};
