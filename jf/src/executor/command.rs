//! LLM command executor for oneshot and chat jobs
//!
//! The resolved prompt is piped into a configured command line such as
//! `llm -m {{model}}`; whatever the command prints is the response.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Local;
use handlebars::Handlebars;
use tracing::{debug, info};

use super::process::run_shell;
use super::{ExecutionContext, ExecutionOutcome, ExecutorError, JobExecutor, MAX_OUTPUT_CHARS, truncate_chars};
use crate::domain::{OutputMode, new_block_id};
use crate::plan::append_output;

/// How a command response is recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Response goes to the output target; the job completes
    Oneshot,
    /// Response is appended as an LLM turn; the job waits for the user
    Chat,
}

/// Executor that renders and runs a command template
pub struct CommandExecutor {
    kind: CommandKind,
    template: String,
    hbs: Handlebars<'static>,
}

impl CommandExecutor {
    pub fn new(kind: CommandKind, template: impl Into<String>) -> Self {
        let mut hbs = Handlebars::new();
        hbs.register_escape_fn(handlebars::no_escape);
        Self {
            kind,
            template: template.into(),
            hbs,
        }
    }

    fn render(&self, ctx: &ExecutionContext) -> Result<String, ExecutorError> {
        self.hbs
            .render_template(&self.template, &ctx.vars())
            .map_err(|e| ExecutorError::Template(format!("{}: {}", self.template, e)))
    }

    /// Write a oneshot response to its output target
    fn record_response(&self, ctx: &ExecutionContext, response: &str) -> Result<Option<PathBuf>, ExecutorError> {
        let output = &ctx.job.output;
        match (output.mode, &output.path) {
            (OutputMode::None, _) => Ok(None),
            (OutputMode::File, Some(path)) => {
                let target = ctx.plan_dir.join(path);
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| ExecutorError::Record(e.to_string()))?;
                }
                jobdoc::write_atomic(&target, &format!("{}\n", response.trim_end()))?;
                Ok(Some(target))
            }
            _ => {
                append_output(&ctx.job, &truncate_chars(response, MAX_OUTPUT_CHARS))?;
                Ok(Some(ctx.job.path.clone()))
            }
        }
    }

    /// Append the response as a new LLM turn of the chat file
    fn record_turn(&self, ctx: &ExecutionContext, response: &str) -> Result<String, ExecutorError> {
        let block_id = new_block_id();
        let content = jobdoc::read_document(&ctx.job.path)?;
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let updated = jobdoc::append_llm_turn(&content, &block_id, &timestamp, response);
        jobdoc::write_atomic(&ctx.job.path, &updated)?;
        Ok(block_id)
    }
}

#[async_trait]
impl JobExecutor for CommandExecutor {
    fn name(&self) -> &'static str {
        match self.kind {
            CommandKind::Oneshot => "oneshot",
            CommandKind::Chat => "chat",
        }
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionOutcome, ExecutorError> {
        debug!(job = %ctx.job.id, kind = ?self.kind, "CommandExecutor::execute: called");
        if ctx.prompt.trim().is_empty() {
            return Err(ExecutorError::EmptyJob(ctx.job.id.clone()));
        }

        let command = self.render(ctx)?;
        debug!(job = %ctx.job.id, %command, "CommandExecutor::execute: rendered command");
        let output = run_shell("sh", &command, &ctx.plan_dir, Some(&ctx.prompt)).await?;
        if !output.success() {
            return Err(ExecutorError::CommandFailed {
                code: output.code,
                output: truncate_chars(&output.combined(), 500),
            });
        }

        let response = output.stdout;
        match self.kind {
            CommandKind::Oneshot => {
                let artifact = self.record_response(ctx, &response)?;
                info!(job = %ctx.job.id, chars = response.len(), "Oneshot response recorded");
                let outcome = ExecutionOutcome::completed(response);
                Ok(match artifact {
                    Some(path) => outcome.with_artifact(path),
                    None => outcome,
                })
            }
            CommandKind::Chat => {
                let block_id = self.record_turn(ctx, &response)?;
                info!(job = %ctx.job.id, %block_id, "Chat turn appended");
                Ok(ExecutionOutcome::awaiting_user(response).with_artifact(ctx.job.path.clone()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Job, JobStatus, JobType, OutputSpec};
    use crate::executor::tests::context;
    use std::fs;
    use tempfile::TempDir;

    fn job(temp: &TempDir, job_type: JobType, body: &str) -> Job {
        let mut job = Job::new("q", "Question", job_type);
        job.filename = "01-q.md".to_string();
        job.path = temp.path().join(&job.filename);
        job.body = body.to_string();
        fs::write(&job.path, job.render().unwrap()).unwrap();
        job
    }

    #[tokio::test]
    async fn test_oneshot_pipes_prompt_and_records_output() {
        let temp = TempDir::new().unwrap();
        let job = job(&temp, JobType::Oneshot, "what is rust\n");
        let executor = CommandExecutor::new(CommandKind::Oneshot, "echo '[{{model}}]'; tr a-z A-Z");
        let outcome = executor.execute(&context(temp.path(), job.clone())).await.unwrap();

        assert_eq!(outcome.status, JobStatus::Completed);
        assert_eq!(outcome.output, "[test-model]\nWHAT IS RUST");
        let content = fs::read_to_string(&job.path).unwrap();
        assert!(content.contains("## Output"));
        assert!(content.contains("WHAT IS RUST"));
    }

    #[tokio::test]
    async fn test_oneshot_writes_output_file() {
        let temp = TempDir::new().unwrap();
        let mut job = job(&temp, JobType::Oneshot, "draft\n");
        job.output = OutputSpec {
            mode: OutputMode::File,
            message: None,
            path: Some("out/answer.md".to_string()),
        };
        let executor = CommandExecutor::new(CommandKind::Oneshot, "cat");
        let outcome = executor.execute(&context(temp.path(), job)).await.unwrap();

        let target = temp.path().join("out/answer.md");
        assert_eq!(outcome.artifact, Some(target.clone()));
        assert_eq!(fs::read_to_string(target).unwrap(), "draft\n");
    }

    #[tokio::test]
    async fn test_chat_appends_turn_and_awaits_user() {
        let temp = TempDir::new().unwrap();
        let job = job(&temp, JobType::Chat, "How do I start?\n");
        let executor = CommandExecutor::new(CommandKind::Chat, "echo 'Start small.'");
        let outcome = executor.execute(&context(temp.path(), job.clone())).await.unwrap();

        assert_eq!(outcome.status, JobStatus::PendingUser);
        let content = fs::read_to_string(&job.path).unwrap();
        let turns = jobdoc::parse_chat_file(&content).unwrap();
        let reply = turns.iter().find(|t| t.speaker == jobdoc::Speaker::Llm).unwrap();
        assert_eq!(reply.content, "Start small.");
        assert_eq!(reply.block_id().map(str::len), Some(6));
    }

    #[tokio::test]
    async fn test_command_failure() {
        let temp = TempDir::new().unwrap();
        let job = job(&temp, JobType::Oneshot, "anything\n");
        let executor = CommandExecutor::new(CommandKind::Oneshot, "echo 'model offline' >&2; exit 7");
        match executor.execute(&context(temp.path(), job)).await.unwrap_err() {
            ExecutorError::CommandFailed { code, output } => {
                assert_eq!(code, 7);
                assert!(output.contains("model offline"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_bad_template() {
        let temp = TempDir::new().unwrap();
        let job = job(&temp, JobType::Oneshot, "anything\n");
        let executor = CommandExecutor::new(CommandKind::Oneshot, "llm {{#if}}");
        assert!(matches!(
            executor.execute(&context(temp.path(), job)).await,
            Err(ExecutorError::Template(_))
        ));
    }
}
