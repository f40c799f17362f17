//! Evaluation processors for the job engine.
//!
//! Each processor walks the tasks of one evaluation: publishing them,
//! closing them and importing results, approving the submitted work, or
//! removing them from the marketplace. [`EvaluationJobs`] launches them.

pub mod approve;
pub mod close;
pub mod evaluation;
pub mod launcher;
pub mod marketplace;
pub mod purge;
pub mod submit;

use std::sync::Arc;

use raven_infra::jobs::ProcessorRegistry;

pub use approve::ApproveProcessor;
pub use close::CloseProcessor;
pub use evaluation::{EvaluationRepository, EvaluationStatus};
pub use launcher::{EvaluationJobs, LaunchError};
pub use marketplace::{Assignment, AssignmentStatus, Marketplace, MarketplaceError};
pub use purge::PurgeProcessor;
pub use submit::SubmitProcessor;

/// Register the four evaluation processors under their keys.
pub fn register_all(
    registry: &mut ProcessorRegistry,
    marketplace: Arc<dyn Marketplace>,
    evaluations: Arc<dyn EvaluationRepository>,
) {
    {
        let (m, e) = (marketplace.clone(), evaluations.clone());
        registry.register(submit::info(), move || {
            Box::new(SubmitProcessor::new(m.clone(), e.clone()))
        });
    }
    {
        let (m, e) = (marketplace.clone(), evaluations.clone());
        registry.register(close::info(), move || {
            Box::new(CloseProcessor::new(m.clone(), e.clone()))
        });
    }
    {
        let (m, e) = (marketplace.clone(), evaluations.clone());
        registry.register(approve::info(), move || {
            Box::new(ApproveProcessor::new(m.clone(), e.clone()))
        });
    }
    registry.register(purge::info(), move || {
        Box::new(PurgeProcessor::new(marketplace.clone(), evaluations.clone()))
    });
}

#[cfg(test)]
pub(crate) mod fakes {
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, Condvar, Mutex};

    use raven_core::{EvaluationId, JobId, TaskId};
    use raven_infra::jobs::{JobContext, JobOptions, NoopProgress};

    use crate::evaluation::{EvaluationRepository, EvaluationStatus};
    use crate::marketplace::{Assignment, Marketplace, MarketplaceError};

    pub fn context_for(evaluation_id: EvaluationId, tasks: &[TaskId]) -> JobContext {
        let items = tasks
            .iter()
            .map(|t| serde_json::to_value(t).unwrap())
            .collect();
        JobContext::new(
            JobId::new(),
            JobOptions::for_evaluation(evaluation_id),
            items,
            Arc::new(NoopProgress),
        )
    }

    pub fn context_without_evaluation() -> JobContext {
        JobContext::new(JobId::new(), JobOptions::default(), Vec::new(), Arc::new(NoopProgress))
    }

    /// Holds callers until released.
    #[derive(Default)]
    pub struct Gate {
        open: Mutex<bool>,
        cond: Condvar,
    }

    impl Gate {
        pub fn release(&self) {
            *self.open.lock().unwrap() = true;
            self.cond.notify_all();
        }

        fn wait(&self) {
            let mut open = self.open.lock().unwrap();
            while !*open {
                open = self.cond.wait(open).unwrap();
            }
        }
    }

    #[derive(Default)]
    pub struct FakeMarketplace {
        calls: Mutex<Vec<&'static str>>,
        fail_next: Mutex<usize>,
        always_fail: Mutex<HashSet<TaskId>>,
        duplicates: Mutex<HashSet<TaskId>>,
        assignments: Mutex<HashMap<TaskId, Vec<Assignment>>>,
        approved: Mutex<Vec<String>>,
        gates: Mutex<HashMap<TaskId, Arc<Gate>>>,
    }

    impl FakeMarketplace {
        pub fn calls(&self, name: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|c| **c == name).count()
        }

        /// Fail the next `n` calls of any kind.
        pub fn fail_next(&self, n: usize) {
            *self.fail_next.lock().unwrap() = n;
        }

        pub fn always_fail(&self, task_id: TaskId) {
            self.always_fail.lock().unwrap().insert(task_id);
        }

        pub fn reject_as_duplicate(&self, task_id: TaskId) {
            self.duplicates.lock().unwrap().insert(task_id);
        }

        pub fn set_assignments(&self, task_id: TaskId, assignments: Vec<Assignment>) {
            self.assignments.lock().unwrap().insert(task_id, assignments);
        }

        pub fn approved(&self) -> Vec<String> {
            self.approved.lock().unwrap().clone()
        }

        /// Block submissions of `task_id` until the returned gate is released.
        pub fn block_on(&self, task_id: TaskId) -> Arc<Gate> {
            let gate = Arc::new(Gate::default());
            self.gates.lock().unwrap().insert(task_id, gate.clone());
            gate
        }

        fn call(&self, name: &'static str, task_id: Option<TaskId>) -> Result<(), MarketplaceError> {
            self.calls.lock().unwrap().push(name);
            {
                let mut remaining = self.fail_next.lock().unwrap();
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(MarketplaceError::Remote(format!("{name} timed out")));
                }
            }
            if let Some(task_id) = task_id {
                if self.always_fail.lock().unwrap().contains(&task_id) {
                    return Err(MarketplaceError::Remote(format!("{name} rejected {task_id}")));
                }
            }
            Ok(())
        }
    }

    impl Marketplace for FakeMarketplace {
        fn register_hit_type(&self, evaluation_id: EvaluationId) -> Result<String, MarketplaceError> {
            self.call("register_hit_type", None)?;
            Ok(format!("hit-type-{evaluation_id}"))
        }

        fn submit_task(&self, task_id: TaskId, _hit_type: &str) -> Result<(), MarketplaceError> {
            let gate = self.gates.lock().unwrap().get(&task_id).cloned();
            if let Some(gate) = gate {
                gate.wait();
            }
            self.call("submit_task", Some(task_id))?;
            if self.duplicates.lock().unwrap().contains(&task_id) {
                return Err(MarketplaceError::AlreadyExists(task_id));
            }
            Ok(())
        }

        fn force_expire(&self, task_id: TaskId) -> Result<(), MarketplaceError> {
            self.call("force_expire", Some(task_id))
        }

        fn fetch_results(&self, task_id: TaskId) -> Result<(), MarketplaceError> {
            self.call("fetch_results", Some(task_id))
        }

        fn assignments(&self, task_id: TaskId) -> Result<Vec<Assignment>, MarketplaceError> {
            self.call("assignments", Some(task_id))?;
            Ok(self
                .assignments
                .lock()
                .unwrap()
                .get(&task_id)
                .cloned()
                .unwrap_or_default())
        }

        fn approve_assignment(&self, assignment_id: &str) -> Result<(), MarketplaceError> {
            self.call("approve_assignment", None)?;
            self.approved.lock().unwrap().push(assignment_id.to_string());
            Ok(())
        }

        fn dispose(&self, task_id: TaskId) -> Result<(), MarketplaceError> {
            self.call("dispose", Some(task_id))
        }
    }

    #[derive(Default)]
    pub struct FakeEvaluations {
        tasks: Mutex<HashMap<EvaluationId, Vec<TaskId>>>,
        statuses: Mutex<HashMap<EvaluationId, EvaluationStatus>>,
        jobs: Mutex<HashMap<EvaluationId, JobId>>,
        cleared: Mutex<Vec<TaskId>>,
        metadata: Mutex<Vec<TaskId>>,
    }

    impl FakeEvaluations {
        /// A new evaluation with `tasks` tasks.
        pub fn seed(&self, tasks: usize) -> (EvaluationId, Vec<TaskId>) {
            let evaluation_id = EvaluationId::new();
            let ids: Vec<TaskId> = (0..tasks).map(|_| TaskId::new()).collect();
            self.tasks.lock().unwrap().insert(evaluation_id, ids.clone());
            self.statuses
                .lock()
                .unwrap()
                .insert(evaluation_id, EvaluationStatus::New);
            (evaluation_id, ids)
        }

        pub fn status(&self, evaluation_id: EvaluationId) -> Option<EvaluationStatus> {
            self.statuses.lock().unwrap().get(&evaluation_id).copied()
        }

        pub fn current(&self, evaluation_id: EvaluationId) -> Option<JobId> {
            self.jobs.lock().unwrap().get(&evaluation_id).copied()
        }

        pub fn cleared(&self) -> Vec<TaskId> {
            self.cleared.lock().unwrap().clone()
        }

        pub fn metadata_added(&self) -> Vec<TaskId> {
            self.metadata.lock().unwrap().clone()
        }
    }

    impl EvaluationRepository for FakeEvaluations {
        fn set_status(&self, evaluation_id: EvaluationId, status: EvaluationStatus) -> anyhow::Result<()> {
            self.statuses.lock().unwrap().insert(evaluation_id, status);
            Ok(())
        }

        fn task_ids(&self, evaluation_id: EvaluationId) -> anyhow::Result<Vec<TaskId>> {
            self.tasks
                .lock()
                .unwrap()
                .get(&evaluation_id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no evaluation {evaluation_id}"))
        }

        fn clear_task_response(&self, task_id: TaskId) -> anyhow::Result<()> {
            self.cleared.lock().unwrap().push(task_id);
            Ok(())
        }

        fn add_metadata_as_questions(&self, task_id: TaskId) -> anyhow::Result<()> {
            self.metadata.lock().unwrap().push(task_id);
            Ok(())
        }

        fn current_job(&self, evaluation_id: EvaluationId) -> anyhow::Result<Option<JobId>> {
            Ok(self.current(evaluation_id))
        }

        fn set_job(&self, evaluation_id: EvaluationId, job_id: JobId) -> anyhow::Result<()> {
            self.jobs.lock().unwrap().insert(evaluation_id, job_id);
            Ok(())
        }
    }
}
