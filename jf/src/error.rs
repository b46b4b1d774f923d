//! Error taxonomy for plan loading, scheduling and execution
//!
//! Structural errors (`PlanNotFound`, `InvalidJob`, `MalformedDocument`,
//! `DuplicateJob`, `UnresolvedDependency`, `CyclicDependency`) abort an
//! operation before any job runs. `ExecutionFailure` is scoped to a single job
//! and is also recorded durably in that job's file.

use std::path::PathBuf;

use jobdoc::DocError;

use crate::domain::{JobStatus, PlanLifecycle};

/// Errors surfaced by the orchestration engine
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error("Plan directory not found: {}", .0.display())]
    PlanNotFound(PathBuf),

    #[error("Invalid job {file}: {reason}")]
    InvalidJob { file: String, reason: String },

    #[error("Malformed document {file}: {source}")]
    MalformedDocument {
        file: String,
        #[source]
        source: DocError,
    },

    #[error("Duplicate job id '{id}' in {first} and {second}")]
    DuplicateJob { id: String, first: String, second: String },

    #[error("Job '{job}' depends on '{reference}', which matches no job in the plan")]
    UnresolvedDependency { job: String, reference: String },

    #[error("Dependency cycle detected: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),

    #[error("Job '{job}' has unmet dependencies: {}", .unmet.join(", "))]
    DependencyUnmet { job: String, unmet: Vec<String> },

    #[error("Job '{title}' failed: {message}")]
    ExecutionFailure { job: String, title: String, message: String },

    #[error("Job '{job}' cannot move from {from} to {to}")]
    InvalidTransition { job: String, from: JobStatus, to: JobStatus },

    #[error("Plan '{0}' is a chat-style plan; running all jobs is disabled, run chat turns one by one")]
    ChatPlanRunAll(String),

    #[error("Plan '{0}' is on hold")]
    PlanOnHold(String),

    #[error("No runnable jobs in plan '{0}'")]
    NoRunnableJobs(String),

    #[error("Plan '{plan}' is stalled: no runnable jobs and none running ({} pending: {})", .pending.len(), .pending.join(", "))]
    Stalled { plan: String, pending: Vec<String> },

    #[error("{} job(s) failed: {}", .0.len(), .0.join(", "))]
    JobsFailed(Vec<String>),

    #[error("Job '{job}' was launched {steps} times in one run; stopping runaway loop")]
    StepLimitReached { job: String, steps: u32 },

    #[error("Run cancelled")]
    Cancelled,

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Extraction failed: {0}")]
    Extraction(String),

    #[error("Plan '{plan}' cannot move from {from} to {to}")]
    LifecycleTransition {
        plan: String,
        from: PlanLifecycle,
        to: PlanLifecycle,
    },

    #[error("Plan hook {hook} failed: {message}")]
    HookFailed { hook: String, message: String },

    #[error(transparent)]
    Doc(DocError),
}

impl FlowError {
    /// Attach the offending file to a document error
    pub fn doc(file: impl Into<String>, err: DocError) -> Self {
        match err {
            DocError::MalformedDocument(_) => Self::MalformedDocument {
                file: file.into(),
                source: err,
            },
            other => Self::Doc(other),
        }
    }
}

impl From<DocError> for FlowError {
    fn from(err: DocError) -> Self {
        Self::doc("<unknown>", err)
    }
}

/// Result alias for engine operations
pub type FlowResult<T> = std::result::Result<T, FlowError>;
