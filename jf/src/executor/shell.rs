//! Shell job executor

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::process::run_shell;
use super::{ExecutionContext, ExecutionOutcome, ExecutorError, JobExecutor, MAX_OUTPUT_CHARS, truncate_chars};
use crate::plan::{append_output, body_without_output};
use crate::worktree::Provisioner;

/// Runs the job body as a shell script
pub struct ShellExecutor {
    shell: String,
    provisioner: Option<Arc<dyn Provisioner>>,
}

impl ShellExecutor {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            provisioner: None,
        }
    }

    /// Run jobs that name a worktree inside it
    pub fn with_provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    async fn workdir(&self, ctx: &ExecutionContext) -> Result<PathBuf, ExecutorError> {
        match (&ctx.worktree, &self.provisioner) {
            (Some(name), Some(provisioner)) => {
                let info = provisioner.ensure_worktree(&ctx.plan_name, name, &ctx.repos).await?;
                Ok(info.path)
            }
            _ => Ok(ctx.plan_dir.clone()),
        }
    }
}

#[async_trait]
impl JobExecutor for ShellExecutor {
    fn name(&self) -> &'static str {
        "shell"
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionOutcome, ExecutorError> {
        debug!(job = %ctx.job.id, "ShellExecutor::execute: called");
        let script = body_without_output(&ctx.job.body).trim();
        if script.is_empty() {
            return Err(ExecutorError::EmptyJob(ctx.job.id.clone()));
        }

        let workdir = self.workdir(ctx).await?;
        let output = run_shell(&self.shell, script, &workdir, None).await?;
        let text = truncate_chars(&output.combined(), MAX_OUTPUT_CHARS);
        if !text.trim().is_empty() {
            append_output(&ctx.job, &text)?;
        }

        if !output.success() {
            debug!(job = %ctx.job.id, code = output.code, "ShellExecutor::execute: script failed");
            return Err(ExecutorError::CommandFailed {
                code: output.code,
                output: truncate_chars(&output.combined(), 500),
            });
        }
        info!(job = %ctx.job.id, "Shell job finished");
        Ok(ExecutionOutcome::completed(text))
    }
}
