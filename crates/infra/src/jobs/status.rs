//! Status projection: the externally visible view of a job.
//!
//! Recomputed on every query from the job record, the runner's report and the
//! unit counts. Only the runner report is cached, and only for the lifetime of
//! a [`StatusCache`].

use std::collections::HashMap;

use serde::Serialize;

use raven_core::JobId;

use super::processor::ProcessorInfo;
use super::runner::{JobRunner, RunnerError, RunnerReport, RunnerState};
use super::store::{JobStore, JobStoreError};
use super::types::{ExecutionHandle, Job, StatusName, UnitCounts, WorkUnit, WorkUnitStatus};

/// Runner reports fetched during one request.
#[derive(Debug, Default)]
pub struct StatusCache {
    reports: HashMap<ExecutionHandle, Option<RunnerReport>>,
}

impl StatusCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The runner's report for `handle`, asking the runner at most once.
    pub fn report(
        &mut self,
        runner: &dyn JobRunner,
        handle: &ExecutionHandle,
    ) -> Result<Option<RunnerReport>, RunnerError> {
        if let Some(report) = self.reports.get(handle) {
            return Ok(report.clone());
        }
        let report = runner.get_status(handle)?;
        self.reports.insert(handle.clone(), report.clone());
        Ok(report)
    }
}

/// Inputs of the projection for one job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobStatus {
    dispatched: bool,
    report: Option<RunnerReport>,
    counts: UnitCounts,
}

impl JobStatus {
    pub fn new(dispatched: bool, report: Option<RunnerReport>, counts: UnitCounts) -> Self {
        Self {
            dispatched,
            report,
            counts,
        }
    }

    /// Gather the inputs for `job`, going through `cache` for the runner.
    pub fn load(
        job: &Job,
        store: &dyn JobStore,
        runner: &dyn JobRunner,
        cache: &mut StatusCache,
    ) -> Result<Self, StatusError> {
        let report = match &job.execution_handle {
            Some(handle) => cache.report(runner, handle)?,
            None => None,
        };
        let counts = store.count_units(job.id)?;
        Ok(Self::new(job.is_dispatched(), report, counts))
    }

    pub fn report(&self) -> Option<&RunnerReport> {
        self.report.as_ref()
    }

    pub fn counts(&self) -> UnitCounts {
        self.counts
    }

    /// Coarse state.
    ///
    /// A dispatched job whose runner report is missing or unrecognized counts
    /// as `Done`: a runner that dropped its record is assumed to have
    /// finished. Callers depend on this lenient reading.
    pub fn status_name(&self) -> StatusName {
        if !self.dispatched {
            return StatusName::New;
        }
        match self.report.as_ref().map(|r| r.state) {
            Some(RunnerState::Queued) => StatusName::New,
            Some(RunnerState::Working) => StatusName::Running,
            Some(RunnerState::Completed) => StatusName::Done,
            Some(RunnerState::Failed) => StatusName::Error,
            Some(RunnerState::Killed) => StatusName::Killed,
            Some(RunnerState::Unknown) | None => StatusName::Done,
        }
    }

    pub fn percentage(&self) -> f64 {
        match self.status_name() {
            StatusName::New => 0.0,
            StatusName::Done => 100.0,
            _ => self
                .report
                .as_ref()
                .map_or(0.0, |r| clamp_percentage(r.pct_complete)),
        }
    }

    /// Unit count, never zero.
    pub fn total(&self) -> u64 {
        self.counts.total().max(1)
    }

    pub fn completed(&self) -> u64 {
        match self.status_name() {
            StatusName::New => 0,
            StatusName::Done if self.counts.total() == 0 => self.total(),
            _ => self.counts.done,
        }
    }

    pub fn error_count(&self) -> u64 {
        self.counts.error
    }

    pub fn ended(&self) -> bool {
        self.status_name().is_terminal()
    }

    /// Ended, but not every unit completed.
    pub fn parts_failed(&self) -> bool {
        self.ended() && self.completed() != self.total()
    }

    /// Share of units done, in percent.
    pub fn success_percentage(&self) -> f64 {
        share(self.counts.done, self.counts.total())
    }

    /// Share of units failed, in percent.
    pub fn error_percentage(&self) -> f64 {
        share(self.counts.error, self.counts.total())
    }

    /// Presentable error summary, paragraphs separated by blank lines.
    ///
    /// `failed` are the job's units in `error` status.
    pub fn error(&self, info: &ProcessorInfo, failed: &[WorkUnit]) -> Option<String> {
        let mut parts = Vec::new();

        match self.status_name() {
            StatusName::Error => {
                let headline = self
                    .report
                    .as_ref()
                    .and_then(|r| r.message.clone())
                    .unwrap_or_else(|| "Job failed.".to_string());
                parts.push(headline);
                parts.push(info.kill_message.clone());
            }
            StatusName::Killed => {
                parts.push("Killed.".to_string());
                parts.push(info.kill_message.clone());
            }
            _ => {}
        }

        parts.extend(failed.iter().map(|unit| {
            format!(
                "Error for part ID {}: {}",
                unit.id,
                unit.error.as_deref().unwrap_or_default()
            )
        }));

        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }
}

fn clamp_percentage(pct: f64) -> f64 {
    if pct.is_nan() { 0.0 } else { pct.clamp(0.0, 100.0) }
}

fn share(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 * 100.0 / total as f64
    }
}

/// Status projection error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StatusError {
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Runner(#[from] RunnerError),
}

/// Serializable status snapshot for the web layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusView {
    pub job_id: JobId,
    pub title: String,
    pub complete_url: String,
    pub back_url: String,
    pub processor_name: String,
    pub status_name: StatusName,
    pub percentage: f64,
    pub total: u64,
    pub completed: u64,
    pub error_count: u64,
    pub success_percentage: f64,
    pub error_percentage: f64,
    pub parts_failed: bool,
    pub ended: bool,
    pub error: Option<String>,
}

impl JobStatusView {
    pub fn build(
        job: &Job,
        info: &ProcessorInfo,
        store: &dyn JobStore,
        runner: &dyn JobRunner,
        cache: &mut StatusCache,
    ) -> Result<Self, StatusError> {
        let status = JobStatus::load(job, store, runner, cache)?;
        let failed = if status.error_count() > 0 {
            store.list_units(job.id, Some(WorkUnitStatus::Error))?
        } else {
            Vec::new()
        };

        Ok(Self {
            job_id: job.id,
            title: job.title.clone(),
            complete_url: job.complete_url.clone(),
            back_url: job.back_url.clone(),
            processor_name: info.name.clone(),
            status_name: status.status_name(),
            percentage: status.percentage(),
            total: status.total(),
            completed: status.completed(),
            error_count: status.error_count(),
            success_percentage: status.success_percentage(),
            error_percentage: status.error_percentage(),
            parts_failed: status.parts_failed(),
            ended: status.ended(),
            error: status.error(info, &failed),
        })
    }
}
