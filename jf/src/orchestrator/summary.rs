//! Post-completion job summaries

use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::SummaryConfig;
use crate::domain::Job;
use crate::executor::run_shell;

/// Produces a short summary of a finished job
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// `None` when no summary could be produced
    async fn summarize(&self, job: &Job, output: &str, workdir: &Path) -> Option<String>;
}

/// Summarizer that pipes the job output through a configured command
#[derive(Debug, Clone)]
pub struct CommandSummarizer {
    config: SummaryConfig,
}

impl CommandSummarizer {
    pub fn new(config: SummaryConfig) -> Self {
        Self { config }
    }

    fn input(&self, job: &Job, output: &str) -> String {
        format!("{}\n\nJob: {}\n\n{}", self.config.prompt, job.title, output.trim())
    }
}

#[async_trait]
impl Summarizer for CommandSummarizer {
    async fn summarize(&self, job: &Job, output: &str, workdir: &Path) -> Option<String> {
        debug!(job = %job.id, "CommandSummarizer::summarize: called");
        if output.trim().is_empty() {
            return None;
        }
        match run_shell("sh", &self.config.command, workdir, Some(&self.input(job, output))).await {
            Ok(result) if result.success() => {
                let text = result.stdout.split_whitespace().collect::<Vec<_>>().join(" ");
                if text.is_empty() {
                    None
                } else {
                    Some(clip(&text, self.config.max_chars))
                }
            }
            Ok(result) => {
                warn!(job = %job.id, code = result.code, "Summary command failed");
                None
            }
            Err(e) => {
                warn!(job = %job.id, error = %e, "Failed to run summary command");
                None
            }
        }
    }
}

fn clip(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", cut.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::JobType;
    use tempfile::TempDir;

    fn summarizer(command: &str, max_chars: usize) -> CommandSummarizer {
        CommandSummarizer::new(SummaryConfig {
            enabled: true,
            command: command.to_string(),
            prompt: "Summarize:".to_string(),
            max_chars,
        })
    }

    #[tokio::test]
    async fn test_summary_from_command() {
        let temp = TempDir::new().unwrap();
        let job = Job::new("a", "Build", JobType::Shell);
        let summary = summarizer("grep -c .", 200)
            .summarize(&job, "line one\nline two", temp.path())
            .await;
        // prompt, title and two output lines
        assert_eq!(summary.as_deref(), Some("4"));
    }

    #[tokio::test]
    async fn test_summary_is_clipped() {
        let temp = TempDir::new().unwrap();
        let job = Job::new("a", "Build", JobType::Shell);
        let summary = summarizer("echo 'a very long summary that keeps going'", 10)
            .summarize(&job, "output", temp.path())
            .await
            .unwrap();
        assert_eq!(summary, "a very...");
    }

    #[tokio::test]
    async fn test_summary_failure_is_none() {
        let temp = TempDir::new().unwrap();
        let job = Job::new("a", "Build", JobType::Shell);
        assert!(summarizer("exit 1", 200).summarize(&job, "output", temp.path()).await.is_none());
        assert!(summarizer("cat", 200).summarize(&job, "  ", temp.path()).await.is_none());
    }
}
