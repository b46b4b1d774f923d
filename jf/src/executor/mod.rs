//! Job execution boundary
//!
//! The orchestrator hands a prepared [`ExecutionContext`] to the executor
//! registered for the job's type and gets back an [`ExecutionOutcome`].
//! Executors never change a job's status; the orchestrator owns that.

mod agent;
mod command;
mod hooks;
mod process;
mod shell;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use crate::config::Config;
use crate::domain::{Job, JobStatus, JobType};
use crate::error::FlowError;
use crate::worktree::{Provisioner, WorktreeError};

pub use agent::AgentExecutor;
pub use command::{CommandExecutor, CommandKind};
pub use hooks::{HookEvent, HookNotifier, HookPayload};
pub use process::{CommandOutput, run_shell};
pub use shell::ShellExecutor;

/// Longest output kept in a job file
pub const MAX_OUTPUT_CHARS: usize = 30_000;

/// Error types for job execution
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("No executor registered for job type {0}")]
    Unsupported(JobType),

    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command exited with status {code}: {output}")]
    CommandFailed { code: i32, output: String },

    #[error("Template error: {0}")]
    Template(String),

    #[error(transparent)]
    Provision(#[from] WorktreeError),

    #[error("Failed to record job output: {0}")]
    Record(String),

    #[error("Nothing to execute for job {0}")]
    EmptyJob(String),
}

impl From<FlowError> for ExecutorError {
    fn from(err: FlowError) -> Self {
        Self::Record(err.to_string())
    }
}

impl From<jobdoc::DocError> for ExecutorError {
    fn from(err: jobdoc::DocError) -> Self {
        Self::Record(err.to_string())
    }
}

/// Everything an executor needs to run one job
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub plan_name: String,
    pub plan_dir: PathBuf,
    /// Repositories a plan worktree spans
    pub repos: Vec<String>,
    /// Snapshot of the job taken just before it started
    pub job: Job,
    /// Fully resolved prompt
    pub prompt: String,
    /// Effective model: override, then job, then plan, then executor default
    pub model: String,
    /// Effective worktree name
    pub worktree: Option<String>,
}

impl ExecutionContext {
    /// Template variables for command lines
    pub fn vars(&self) -> Value {
        json!({
            "model": self.model,
            "job_id": self.job.id,
            "job_title": self.job.title,
            "job_file": self.job.path,
            "plan": self.plan_name,
            "plan_dir": self.plan_dir,
            "worktree": self.worktree,
        })
    }

    /// Directory where per-job artifacts are written
    pub fn artifact_dir(&self) -> PathBuf {
        self.plan_dir.join(".artifacts").join(&self.job.id)
    }
}

/// What a successful execution produced
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    /// `Completed`, or `PendingUser` when a human turn is expected next
    pub status: JobStatus,
    /// Location of an output artifact, when one was written
    pub artifact: Option<PathBuf>,
    /// Captured output, used for summaries
    pub output: String,
}

impl ExecutionOutcome {
    pub fn completed(output: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Completed,
            artifact: None,
            output: output.into(),
        }
    }

    pub fn awaiting_user(output: impl Into<String>) -> Self {
        Self {
            status: JobStatus::PendingUser,
            artifact: None,
            output: output.into(),
        }
    }

    pub fn with_artifact(mut self, artifact: impl Into<PathBuf>) -> Self {
        self.artifact = Some(artifact.into());
        self
    }
}

/// Executes one kind of job
#[async_trait]
pub trait JobExecutor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionOutcome, ExecutorError>;
}

/// Executors keyed by job type
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<JobType, Arc<dyn JobExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Standard executors built from configuration
    pub fn from_config(config: &Config, provisioner: Arc<dyn Provisioner>) -> Self {
        debug!("ExecutorRegistry::from_config: called");
        let executors = &config.executors;
        let mut registry = Self::new();
        registry.register(
            JobType::Shell,
            Arc::new(ShellExecutor::new(&executors.shell).with_provisioner(provisioner.clone())),
        );
        registry.register(
            JobType::Oneshot,
            Arc::new(CommandExecutor::new(CommandKind::Oneshot, &executors.oneshot)),
        );
        registry.register(JobType::Chat, Arc::new(CommandExecutor::new(CommandKind::Chat, &executors.chat)));
        registry.register(
            JobType::HeadlessAgent,
            Arc::new(AgentExecutor::headless(&executors.headless_agent, provisioner.clone())),
        );
        registry.register(
            JobType::InteractiveAgent,
            Arc::new(AgentExecutor::interactive(&executors.interactive_agent, provisioner)),
        );
        registry
    }

    pub fn register(&mut self, job_type: JobType, executor: Arc<dyn JobExecutor>) {
        debug!(%job_type, executor = executor.name(), "ExecutorRegistry::register: called");
        self.executors.insert(job_type, executor);
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn JobExecutor>> {
        self.executors.get(&job_type).cloned()
    }

    /// Run `ctx` on the executor for its job type
    pub async fn dispatch(&self, ctx: &ExecutionContext) -> Result<ExecutionOutcome, ExecutorError> {
        let executor = self
            .get(ctx.job.job_type)
            .ok_or(ExecutorError::Unsupported(ctx.job.job_type))?;
        debug!(job = %ctx.job.id, executor = executor.name(), "ExecutorRegistry::dispatch: called");
        executor.execute(ctx).await
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<String> = self.executors.keys().map(ToString::to_string).collect();
        types.sort();
        f.debug_struct("ExecutorRegistry").field("types", &types).finish()
    }
}

/// Cut `text` to at most `max` characters on a char boundary
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...\n[truncated, {} chars total]", &text[..idx], text.chars().count()),
        None => text.to_string(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::domain::JobType;
    use std::path::Path;

    pub(crate) fn context(plan_dir: &Path, job: Job) -> ExecutionContext {
        ExecutionContext {
            plan_name: "test-plan".to_string(),
            plan_dir: plan_dir.to_path_buf(),
            repos: Vec::new(),
            prompt: job.body.trim().to_string(),
            job,
            model: "test-model".to_string(),
            worktree: None,
        }
    }

    struct Echo;

    #[async_trait]
    impl JobExecutor for Echo {
        fn name(&self) -> &'static str {
            "echo"
        }

        async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionOutcome, ExecutorError> {
            Ok(ExecutionOutcome::completed(ctx.prompt.clone()))
        }
    }

    #[tokio::test]
    async fn test_registry_dispatch_by_type() {
        let mut registry = ExecutorRegistry::new();
        registry.register(JobType::Oneshot, Arc::new(Echo));

        let mut job = Job::new("a", "A", JobType::Oneshot);
        job.body = "hello".to_string();
        let ctx = context(Path::new("/tmp"), job.clone());
        let outcome = registry.dispatch(&ctx).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::completed("hello"));

        job.job_type = JobType::Shell;
        let ctx = context(Path::new("/tmp"), job);
        assert!(matches!(
            registry.dispatch(&ctx).await,
            Err(ExecutorError::Unsupported(JobType::Shell))
        ));
    }

    #[test]
    fn test_context_vars() {
        let ctx = context(Path::new("/plans/p"), Job::new("job-1", "First", JobType::Oneshot));
        let vars = ctx.vars();
        assert_eq!(vars["model"], "test-model");
        assert_eq!(vars["job_id"], "job-1");
        assert_eq!(vars["plan"], "test-plan");
        assert_eq!(ctx.artifact_dir(), PathBuf::from("/plans/p/.artifacts/job-1"));
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("short", 10), "short");
        let cut = truncate_chars("héllo world", 5);
        assert!(cut.starts_with("héllo..."));
        assert!(cut.contains("11 chars total"));
    }
}
