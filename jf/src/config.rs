//! JobFlow configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main JobFlow configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Scheduling limits
    pub orchestrator: OrchestratorSection,

    /// Commands used to execute each job type
    pub executors: ExecutorsConfig,

    /// Worktree and session provisioning
    pub worktree: WorktreeSection,

    /// Job lifecycle hook commands
    pub hooks: HooksConfig,

    /// Log level (trace, debug, info, warn, error)
    #[serde(rename = "log-level", skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        for candidate in Self::candidates() {
            if candidate.exists() {
                match Self::load_from_file(&candidate) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", candidate.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read only the log level, before logging is initialized
    ///
    /// Errors are swallowed; the full load reports them once logging is up.
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        let candidates = match config_path {
            Some(path) => vec![path.clone()],
            None => Self::candidates(),
        };
        candidates
            .iter()
            .filter(|p| p.exists())
            .find_map(|p| fs::read_to_string(p).ok())
            .and_then(|content| serde_yaml::from_str::<Config>(&content).ok())
            .and_then(|config| config.log_level)
    }

    /// Project-local `.jobflow.yml`, then `~/.config/jobflow/jobflow.yml`
    fn candidates() -> Vec<PathBuf> {
        let mut candidates = vec![PathBuf::from(".jobflow.yml")];
        if let Some(config_dir) = dirs::config_dir() {
            candidates.push(config_dir.join("jobflow").join("jobflow.yml"));
        }
        candidates
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Orchestrator limits and behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    /// Maximum jobs executing at once
    #[serde(rename = "max-parallel-jobs")]
    pub max_parallel_jobs: usize,

    /// Poll interval while waiting on running jobs, in milliseconds
    #[serde(rename = "check-interval-ms")]
    pub check_interval_ms: u64,

    /// Model used for every job, overriding job and plan settings
    #[serde(rename = "model-override", skip_serializing_if = "Option::is_none")]
    pub model_override: Option<String>,

    /// Times one job may be relaunched during a single run-all
    #[serde(rename = "max-consecutive-steps")]
    pub max_consecutive_steps: u32,

    /// Leave interactive agents out of automatic runs
    #[serde(rename = "skip-interactive")]
    pub skip_interactive: bool,

    pub summary: SummaryConfig,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_parallel_jobs: 3,
            check_interval_ms: 5000,
            model_override: None,
            max_consecutive_steps: 20,
            skip_interactive: false,
            summary: SummaryConfig::default(),
        }
    }
}

/// Post-completion summary generation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SummaryConfig {
    pub enabled: bool,

    /// Command that reads the prompt on stdin and prints a summary
    pub command: String,

    /// Instruction placed before the job output
    pub prompt: String,

    /// Summaries longer than this are truncated
    #[serde(rename = "max-chars")]
    pub max_chars: usize,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            command: "llm".to_string(),
            prompt: "Summarize the result of this job in one or two sentences.".to_string(),
            max_chars: 200,
        }
    }
}

/// Command lines per job type
///
/// Commands are handlebars templates rendered with `model`, `job_id`,
/// `job_title`, `plan`, `prompt_file` and `workdir`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorsConfig {
    /// Shell used for `shell` jobs
    pub shell: String,

    /// Model when neither job, plan nor override sets one
    #[serde(rename = "default-model")]
    pub default_model: String,

    pub oneshot: String,

    pub chat: String,

    #[serde(rename = "headless-agent")]
    pub headless_agent: String,

    #[serde(rename = "interactive-agent")]
    pub interactive_agent: String,
}

impl Default for ExecutorsConfig {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            default_model: "claude-sonnet-4".to_string(),
            oneshot: "llm -m {{model}}".to_string(),
            chat: "llm -m {{model}}".to_string(),
            headless_agent: "claude --model {{model}} -p \"$(cat {{prompt_file}})\"".to_string(),
            interactive_agent: "claude --model {{model}} \"$(cat {{prompt_file}})\"".to_string(),
        }
    }
}

/// Worktree and terminal session naming
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorktreeSection {
    /// Directory holding `{plan}/{worktree}` checkouts
    #[serde(rename = "base-dir")]
    pub base_dir: PathBuf,

    /// Repository worktrees are created from
    #[serde(rename = "repo-root")]
    pub repo_root: PathBuf,

    /// Branches are named `{branch-prefix}/{plan}/{worktree}`
    #[serde(rename = "branch-prefix")]
    pub branch_prefix: String,

    /// Prefix for tmux session names
    #[serde(rename = "session-prefix")]
    pub session_prefix: String,
}

impl Default for WorktreeSection {
    fn default() -> Self {
        let base_dir = dirs::data_local_dir()
            .map(|d| d.join("jobflow").join("worktrees"))
            .unwrap_or_else(|| PathBuf::from("/tmp/jobflow/worktrees"));

        Self {
            base_dir,
            repo_root: PathBuf::from("."),
            branch_prefix: "jobflow".to_string(),
            session_prefix: "jf-".to_string(),
        }
    }
}

/// Commands notified when jobs start and stop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HooksConfig {
    #[serde(rename = "job-start", skip_serializing_if = "Option::is_none")]
    pub job_start: Option<String>,

    #[serde(rename = "job-stop", skip_serializing_if = "Option::is_none")]
    pub job_stop: Option<String>,

    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            job_start: None,
            job_stop: None,
            timeout_ms: 5000,
        }
    }
}
