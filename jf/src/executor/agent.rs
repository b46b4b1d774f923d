//! Agent executors
//!
//! Agents run inside a plan worktree. The resolved prompt is written to
//! `.artifacts/<job-id>/prompt.md` in the plan directory and the configured
//! agent command is started in the worktree: directly for headless agents,
//! in a tmux window for interactive ones.

use std::sync::Arc;

use async_trait::async_trait;
use handlebars::Handlebars;
use serde_json::Value;
use tracing::{debug, info};

use super::process::run_shell;
use super::{ExecutionContext, ExecutionOutcome, ExecutorError, JobExecutor, MAX_OUTPUT_CHARS, truncate_chars};
use crate::plan::append_output;
use crate::worktree::Provisioner;

/// Runs an agent command in a provisioned worktree
pub struct AgentExecutor {
    interactive: bool,
    template: String,
    provisioner: Arc<dyn Provisioner>,
    hbs: Handlebars<'static>,
}

impl AgentExecutor {
    fn new(interactive: bool, template: &str, provisioner: Arc<dyn Provisioner>) -> Self {
        let mut hbs = Handlebars::new();
        hbs.register_escape_fn(handlebars::no_escape);
        Self {
            interactive,
            template: template.to_string(),
            provisioner,
            hbs,
        }
    }

    pub fn headless(template: &str, provisioner: Arc<dyn Provisioner>) -> Self {
        Self::new(false, template, provisioner)
    }

    pub fn interactive(template: &str, provisioner: Arc<dyn Provisioner>) -> Self {
        Self::new(true, template, provisioner)
    }

    /// Worktree name for a job: its own setting, else its id
    fn worktree_name(ctx: &ExecutionContext) -> String {
        ctx.worktree.clone().unwrap_or_else(|| ctx.job.id.clone())
    }

    async fn write_prompt(&self, ctx: &ExecutionContext) -> Result<std::path::PathBuf, ExecutorError> {
        let dir = ctx.artifact_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| ExecutorError::Record(format!("Failed to create {}: {}", dir.display(), e)))?;
        let path = dir.join("prompt.md");
        jobdoc::write_atomic(&path, &ctx.prompt)?;
        Ok(path)
    }
}

#[async_trait]
impl JobExecutor for AgentExecutor {
    fn name(&self) -> &'static str {
        if self.interactive { "interactive_agent" } else { "headless_agent" }
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionOutcome, ExecutorError> {
        debug!(job = %ctx.job.id, interactive = self.interactive, "AgentExecutor::execute: called");
        if ctx.prompt.trim().is_empty() {
            return Err(ExecutorError::EmptyJob(ctx.job.id.clone()));
        }

        let name = Self::worktree_name(ctx);
        let worktree = self
            .provisioner
            .ensure_worktree(&ctx.plan_name, &name, &ctx.repos)
            .await?;
        let prompt_file = self.write_prompt(ctx).await?;

        let mut vars = ctx.vars();
        if let Value::Object(map) = &mut vars {
            map.insert("prompt_file".to_string(), Value::from(prompt_file.to_string_lossy().into_owned()));
            map.insert("workdir".to_string(), Value::from(worktree.path.to_string_lossy().into_owned()));
        }
        let command = self
            .hbs
            .render_template(&self.template, &vars)
            .map_err(|e| ExecutorError::Template(format!("{}: {}", self.template, e)))?;

        if self.interactive {
            let session = self
                .provisioner
                .ensure_session(&ctx.plan_name, &name, &worktree.path)
                .await?;
            info!(job = %ctx.job.id, %session, "Starting interactive agent");
            let code = self
                .provisioner
                .run_in_session(&session, &ctx.job.id, &command, &worktree.path)
                .await?;
            if code != 0 {
                return Err(ExecutorError::CommandFailed {
                    code,
                    output: format!("interactive agent in session {} exited with status {}", session, code),
                });
            }
            return Ok(ExecutionOutcome::completed(String::new()).with_artifact(prompt_file));
        }

        info!(job = %ctx.job.id, worktree = ?worktree.path, "Starting headless agent");
        let output = run_shell("sh", &command, &worktree.path, None).await?;
        let text = truncate_chars(&output.combined(), MAX_OUTPUT_CHARS);
        if !text.trim().is_empty() {
            append_output(&ctx.job, &text)?;
        }
        if !output.success() {
            return Err(ExecutorError::CommandFailed {
                code: output.code,
                output: truncate_chars(&output.combined(), 500),
            });
        }
        Ok(ExecutionOutcome::completed(text).with_artifact(prompt_file))
    }
}
