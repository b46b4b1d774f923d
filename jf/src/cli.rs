//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

use crate::domain::JobType;

/// JobFlow - dependency-ordered plan runner
#[derive(Parser)]
#[command(
    name = "jf",
    about = "Run plans of LLM, agent and shell jobs in dependency order",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Plan directory
    #[arg(short, long, global = true, default_value = ".")]
    pub plan: PathBuf,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Show job counts and per-job status
    Status {
        /// Output format (text or json)
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Show the dependency graph
    Graph {
        /// Output format (text or mermaid)
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Run one batch of runnable jobs
    Next,

    /// Run a single job after checking its dependencies
    Run {
        /// Job id or filename
        job: String,
    },

    /// Run every job until the plan settles
    All {
        /// Maximum jobs running at once
        #[arg(short = 'j', long)]
        parallel: Option<usize>,

        /// Model for every job
        #[arg(short, long)]
        model: Option<String>,
    },

    /// Show what a job is waiting on
    Blocking {
        /// Job id or filename
        job: String,
    },

    /// Add a job to the plan
    Add {
        /// Job title
        title: String,

        /// Job type (oneshot, shell, chat, headless_agent, interactive_agent)
        #[arg(short = 't', long = "type", default_value = "oneshot")]
        job_type: JobType,

        /// Dependency (id or filename), repeatable
        #[arg(short, long = "depends-on")]
        depends_on: Vec<String>,

        /// Prompt or script for the job body
        #[arg(short, long)]
        body: Option<String>,
    },

    /// Create a job from blocks of a chat file
    Extract {
        /// Chat file, relative to the plan directory
        chat_file: String,

        /// Comma-separated block ids, or "all"
        blocks: String,

        /// Title of the new job
        #[arg(long)]
        title: String,

        /// Copy content into the job instead of referencing it
        #[arg(long)]
        copy: bool,

        /// Job type of the new job
        #[arg(short = 't', long = "type", default_value = "chat")]
        job_type: JobType,

        /// Dependency (id or filename), repeatable
        #[arg(short, long = "depends-on")]
        depends_on: Vec<String>,
    },

    /// Return a failed job to pending
    Reset {
        /// Job id or filename
        job: String,
    },

    /// Retire a job; dependents treat it as done
    Abandon {
        /// Job id or filename
        job: String,
    },

    /// Pause the plan; nothing runs until unhold
    Hold,

    /// Release a held plan
    Unhold,

    /// Mark the plan ready for review, running its on_review hook
    Review,

    /// Mark a reviewed plan finished, running its on_finish hook
    Finish,
}

/// Get the log file path
pub fn get_log_path() -> PathBuf {
    debug!("get_log_path: called");
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("jobflow")
        .join("logs")
        .join("jobflow.log")
}

/// Output format for status and graph commands
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    Mermaid,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        debug!(%s, "OutputFormat::from_str: called");
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            "mermaid" => Ok(Self::Mermaid),
            _ => Err(format!("Unknown format: {}. Use: text, json, or mermaid", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
            Self::Mermaid => write!(f, "mermaid"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_status_defaults() {
        let cli = Cli::parse_from(["jf", "status"]);
        assert_eq!(cli.plan, PathBuf::from("."));
        assert!(matches!(
            cli.command,
            Command::Status {
                format: OutputFormat::Text
            }
        ));
    }

    #[test]
    fn test_cli_parse_lifecycle_commands() {
        assert!(matches!(Cli::parse_from(["jf", "hold"]).command, Command::Hold));
        assert!(matches!(Cli::parse_from(["jf", "unhold"]).command, Command::Unhold));
        assert!(matches!(Cli::parse_from(["jf", "review"]).command, Command::Review));
        assert!(matches!(Cli::parse_from(["jf", "finish"]).command, Command::Finish));
    }

    #[test]
    fn test_cli_parse_global_plan_after_subcommand() {
        let cli = Cli::parse_from(["jf", "graph", "--format", "mermaid", "--plan", "plans/auth"]);
        assert_eq!(cli.plan, PathBuf::from("plans/auth"));
        assert!(matches!(
            cli.command,
            Command::Graph {
                format: OutputFormat::Mermaid
            }
        ));
    }

    #[test]
    fn test_cli_parse_all_overrides() {
        let cli = Cli::parse_from(["jf", "all", "-j", "5", "--model", "opus"]);
        match cli.command {
            Command::All { parallel, model } => {
                assert_eq!(parallel, Some(5));
                assert_eq!(model.as_deref(), Some("opus"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_cli_parse_add() {
        let cli = Cli::parse_from([
            "jf",
            "add",
            "Write tests",
            "--type",
            "headless-agent",
            "--depends-on",
            "impl",
            "-d",
            "01-spec.md",
        ]);
        match cli.command {
            Command::Add {
                title,
                job_type,
                depends_on,
                body,
            } => {
                assert_eq!(title, "Write tests");
                assert_eq!(job_type, JobType::HeadlessAgent);
                assert_eq!(depends_on, vec!["impl", "01-spec.md"]);
                assert!(body.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_cli_parse_extract() {
        let cli = Cli::parse_from(["jf", "extract", "plan.md", "a1b2c3,d4e5f6", "--title", "Design", "--copy"]);
        match cli.command {
            Command::Extract {
                chat_file,
                blocks,
                title,
                copy,
                job_type,
                ..
            } => {
                assert_eq!(chat_file, "plan.md");
                assert_eq!(blocks, "a1b2c3,d4e5f6");
                assert_eq!(title, "Design");
                assert!(copy);
                assert_eq!(job_type, JobType::Chat);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_output_format_from_str() {
        assert_eq!("JSON".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert!("table".parse::<OutputFormat>().is_err());
    }
}
