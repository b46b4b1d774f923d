//! Run results and plan status counts

use serde::Serialize;
use tracing::warn;

use crate::domain::{JobStatus, Plan};
use crate::error::FlowResult;
use crate::graph::DependencyGraph;

/// Outcome of one `run_next` batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    /// Chat jobs that finished their turn and wait for the user
    pub awaiting_user: Vec<String>,
    /// Jobs that could not be started, for example locked by another run,
    /// or that ended without an outcome
    pub skipped: Vec<String>,
}

impl BatchReport {
    pub fn is_empty(&self) -> bool {
        self.launched() == 0 && self.skipped.is_empty()
    }

    pub fn launched(&self) -> usize {
        self.completed.len() + self.failed.len() + self.awaiting_user.len()
    }

    pub(crate) fn record(&mut self, job_id: String, status: JobStatus) {
        match status {
            JobStatus::Completed => self.completed.push(job_id),
            JobStatus::PendingUser => self.awaiting_user.push(job_id),
            JobStatus::Failed => self.failed.push(job_id),
            other => {
                warn!(job = %job_id, status = %other, "Job ended without an outcome");
                self.skipped.push(job_id);
            }
        }
    }
}

/// Outcome of a successful `run_all`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Jobs executed by this run, in completion order
    pub executed: Vec<String>,
    pub awaiting_user: Vec<String>,
    /// Jobs that could not be started; they are not retried within the run
    pub skipped: Vec<String>,
    /// Scheduling rounds that launched at least one job
    pub rounds: u32,
}

/// Aggregate job counts for a plan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlanStatus {
    pub plan: String,
    pub total: usize,
    pub pending: usize,
    pub pending_user: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub abandoned: usize,
    /// Pending jobs whose dependencies are not yet met
    pub blocked: usize,
    /// Jobs that can start right now
    pub runnable: usize,
}

impl PlanStatus {
    /// Count jobs by status from a freshly loaded plan
    pub fn compute(plan: &Plan) -> FlowResult<Self> {
        let graph = DependencyGraph::build(plan)?;
        let mut status = Self {
            plan: plan.name.clone(),
            total: plan.len(),
            runnable: graph.runnable_jobs().len(),
            ..Default::default()
        };
        for job in plan.jobs() {
            match job.status {
                JobStatus::Pending => status.pending += 1,
                JobStatus::PendingUser => status.pending_user += 1,
                JobStatus::Running => status.running += 1,
                JobStatus::Completed => status.completed += 1,
                JobStatus::Failed => status.failed += 1,
                JobStatus::Abandoned => status.abandoned += 1,
            }
        }
        status.blocked = status.pending - status.runnable;
        Ok(status)
    }

    pub fn count(&self, job_status: JobStatus) -> usize {
        match job_status {
            JobStatus::Pending => self.pending,
            JobStatus::PendingUser => self.pending_user,
            JobStatus::Running => self.running,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
            JobStatus::Abandoned => self.abandoned,
        }
    }

    /// Share of jobs that are done (completed or abandoned), 0-100
    pub fn progress(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        (((self.completed + self.abandoned) * 100) / self.total) as u8
    }

    /// Nothing pending or running
    pub fn is_settled(&self) -> bool {
        self.pending == 0 && self.running == 0
    }
}
