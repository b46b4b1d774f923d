//! Plan domain type
//!
//! A Plan is a directory of job files plus an optional `.jobflow-plan.yml`.
//! It is rebuilt from disk for every operation and never cached across calls.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::job::{Job, JobType};
use crate::error::{FlowError, FlowResult};

/// Plan configuration file name, stored alongside job files
pub const PLAN_CONFIG_FILE: &str = ".jobflow-plan.yml";

/// Conversation file that turns a plan into a chat-style plan
pub const CHAT_PLAN_FILE: &str = "plan.md";

/// Plan lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlanLifecycle {
    #[default]
    Normal,
    /// Paused; nothing runs
    Hold,
    /// Work done, awaiting review
    Review,
    Finished,
}

impl PlanLifecycle {
    pub fn is_normal(&self) -> bool {
        *self == Self::Normal
    }
}

impl fmt::Display for PlanLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Hold => write!(f, "hold"),
            Self::Review => write!(f, "review"),
            Self::Finished => write!(f, "finished"),
        }
    }
}

/// Plan-level defaults and metadata from `.jobflow-plan.yml`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanConfig {
    /// Default model for jobs that do not set one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Default worktree for jobs that do not set one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worktree: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_agent_container: Option<String>,

    #[serde(skip_serializing_if = "PlanLifecycle::is_normal")]
    pub status: PlanLifecycle,

    /// Recipe the plan was created from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipe: Option<String>,

    /// Repositories a worktree spans
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub repos: Vec<String>,

    /// Lifecycle hook commands keyed by event (on_start, on_review, on_finish)
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub hooks: BTreeMap<String, String>,

    pub prepend_dependencies: bool,
}

/// A loaded plan directory
#[derive(Debug, Clone)]
pub struct Plan {
    /// Directory basename
    pub name: String,

    /// Absolute plan directory
    pub directory: PathBuf,

    pub config: PlanConfig,

    jobs: Vec<Job>,
    by_id: HashMap<String, usize>,
    by_filename: HashMap<String, usize>,
}

impl Plan {
    /// Create an empty plan rooted at `directory`
    pub fn new(directory: impl Into<PathBuf>, config: PlanConfig) -> Self {
        let directory = directory.into();
        let name = directory
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| directory.display().to_string());
        debug!(%name, ?directory, "Plan::new: called");
        Self {
            name,
            directory,
            config,
            jobs: Vec::new(),
            by_id: HashMap::new(),
            by_filename: HashMap::new(),
        }
    }

    /// Add a job, enforcing unique ids and filenames
    pub fn insert(&mut self, job: Job) -> FlowResult<()> {
        debug!(id = %job.id, filename = %job.filename, "Plan::insert: called");
        if let Some(&idx) = self.by_id.get(&job.id) {
            return Err(FlowError::DuplicateJob {
                id: job.id.clone(),
                first: self.jobs[idx].filename.clone(),
                second: job.filename.clone(),
            });
        }
        if self.by_filename.contains_key(&job.filename) {
            return Err(FlowError::InvalidJob {
                file: job.filename.clone(),
                reason: "filename already used in plan".to_string(),
            });
        }
        let idx = self.jobs.len();
        self.by_id.insert(job.id.clone(), idx);
        self.by_filename.insert(job.filename.clone(), idx);
        self.jobs.push(job);
        Ok(())
    }

    /// Jobs in plan (file) order
    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn jobs_mut(&mut self) -> impl Iterator<Item = &mut Job> {
        self.jobs.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn job(&self, id: &str) -> Option<&Job> {
        self.by_id.get(id).map(|&i| &self.jobs[i])
    }

    pub fn job_by_filename(&self, filename: &str) -> Option<&Job> {
        self.by_filename.get(filename).map(|&i| &self.jobs[i])
    }

    /// Resolve a dependency reference: identifier first, then filename
    pub fn find(&self, reference: &str) -> Option<&Job> {
        let reference = reference.trim();
        self.job(reference)
            .or_else(|| self.job_by_filename(reference))
            .or_else(|| self.jobs.iter().find(|j| j.matches_reference(reference)))
    }

    pub fn path_for(&self, filename: &str) -> PathBuf {
        self.directory.join(filename)
    }

    pub fn config_path(&self) -> PathBuf {
        self.directory.join(PLAN_CONFIG_FILE)
    }

    /// A plan driven by one running conversation
    ///
    /// True when the plan's only job is a chat, or when the conversation lives
    /// in `plan.md`. Such plans advance one human turn at a time.
    pub fn is_chat_plan(&self) -> bool {
        let single_chat = self.jobs.len() == 1 && self.jobs[0].job_type == JobType::Chat;
        let chat_plan_file = self
            .job_by_filename(CHAT_PLAN_FILE)
            .is_some_and(|j| j.job_type == JobType::Chat);
        single_chat || chat_plan_file
    }

    pub fn is_on_hold(&self) -> bool {
        self.config.status == PlanLifecycle::Hold
    }

    /// Model for a job: job setting, then plan default
    pub fn model_for<'a>(&'a self, job: &'a Job) -> Option<&'a str> {
        job.model.as_deref().or(self.config.model.as_deref())
    }

    /// Worktree for a job: job setting, then plan default
    pub fn worktree_for<'a>(&'a self, job: &'a Job) -> Option<&'a str> {
        job.worktree.as_deref().or(self.config.worktree.as_deref())
    }

    /// Whether dependency output should be prepended to a job's prompt
    pub fn prepends_dependencies(&self, job: &Job) -> bool {
        job.prepend_dependencies || self.config.prepend_dependencies
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::job::JobStatus;

    fn job(id: &str, filename: &str, job_type: JobType) -> Job {
        let mut job = Job::new(id, id, job_type);
        job.filename = filename.to_string();
        job
    }

    #[test]
    fn test_plan_name_from_directory() {
        let plan = Plan::new("/work/plans/auth-rework", PlanConfig::default());
        assert_eq!(plan.name, "auth-rework");
    }

    #[test]
    fn test_insert_rejects_duplicate_id() {
        let mut plan = Plan::new("/p", PlanConfig::default());
        plan.insert(job("a", "01-a.md", JobType::Shell)).unwrap();
        let err = plan.insert(job("a", "02-a.md", JobType::Shell)).unwrap_err();
        assert!(matches!(err, FlowError::DuplicateJob { .. }));
    }

    #[test]
    fn test_find_prefers_id_over_filename() {
        let mut plan = Plan::new("/p", PlanConfig::default());
        plan.insert(job("01-b.md", "01-a.md", JobType::Shell)).unwrap();
        plan.insert(job("b", "01-b.md", JobType::Shell)).unwrap();
        assert_eq!(plan.find("01-b.md").unwrap().filename, "01-a.md");
        assert_eq!(plan.find("01-a").unwrap().id, "01-b.md");
        assert!(plan.find("missing").is_none());
    }

    #[test]
    fn test_chat_plan_detection() {
        let mut plan = Plan::new("/p", PlanConfig::default());
        plan.insert(job("c", "01-chat.md", JobType::Chat)).unwrap();
        assert!(plan.is_chat_plan());

        plan.insert(job("s", "02-shell.md", JobType::Shell)).unwrap();
        assert!(!plan.is_chat_plan());

        plan.insert(job("p", CHAT_PLAN_FILE, JobType::Chat)).unwrap();
        assert!(plan.is_chat_plan());
    }

    #[test]
    fn test_plan_config_defaults_and_fallbacks() {
        let yaml = "model: gpt-5\nworktree: shared\nstatus: hold\nrepos: [api, web]\nhooks:\n  on_review: make review\n";
        let config: PlanConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.status, PlanLifecycle::Hold);
        assert_eq!(config.repos, vec!["api", "web"]);
        assert_eq!(config.hooks.get("on_review").map(String::as_str), Some("make review"));

        let plan = Plan::new("/p", config);
        assert!(plan.is_on_hold());
        let mut j = job("a", "01-a.md", JobType::Oneshot);
        assert_eq!(plan.model_for(&j), Some("gpt-5"));
        j.model = Some("local".into());
        assert_eq!(plan.model_for(&j), Some("local"));
        assert_eq!(plan.worktree_for(&j), Some("shared"));
        assert_eq!(j.status, JobStatus::Pending);
    }
}
