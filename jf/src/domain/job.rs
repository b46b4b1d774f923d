//! Job domain type
//!
//! A Job is one markdown file in a plan directory. Recognized frontmatter keys
//! are promoted to typed fields; everything else rides along in
//! [`Job::extra`] so it survives being written back.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use jobdoc::{Document, SourceBlock};
use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml::{Mapping, Value};
use tracing::debug;

use crate::error::{FlowError, FlowResult};

/// Job status state machine
///
/// ```text
/// pending -> running -> completed | failed | pending_user
/// failed  -> pending            (explicit re-run)
/// pending_user -> running       (next chat turn)
/// *       -> abandoned          (explicit retirement)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    /// Chat job waiting for a human turn
    PendingUser,
    /// Retired by the user; satisfies dependents
    Abandoned,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::PendingUser,
        JobStatus::Abandoned,
    ];

    /// No further automatic transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Abandoned)
    }

    /// Terminal, or parked waiting for a human
    pub fn is_settled(&self) -> bool {
        self.is_terminal() || *self == Self::PendingUser
    }

    /// Whether `self -> to` is a legal transition
    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        use JobStatus::*;
        if *self == to {
            return true;
        }
        matches!(
            (*self, to),
            (Pending, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, PendingUser)
                | (Running, Pending)
                | (Failed, Pending)
                | (PendingUser, Running)
                | (PendingUser, Completed)
                | (Pending | Running | Failed | PendingUser | Completed, Abandoned)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::PendingUser => write!(f, "pending_user"),
            Self::Abandoned => write!(f, "abandoned"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_yaml::from_str::<JobStatus>(s.trim()).map_err(|_| format!("unknown job status '{}'", s))
    }
}

/// Kind of work a job performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Single LLM call
    Oneshot,
    /// Shell script in the job body
    Shell,
    /// Multi-turn conversation advanced one turn per run
    Chat,
    /// Autonomous agent without a terminal
    #[serde(alias = "headless-agent")]
    HeadlessAgent,
    /// Agent attached to a terminal session
    #[serde(alias = "interactive-agent", alias = "agent")]
    InteractiveAgent,
}

impl JobType {
    pub fn is_agent(&self) -> bool {
        matches!(self, Self::HeadlessAgent | Self::InteractiveAgent)
    }

    pub fn is_interactive(&self) -> bool {
        *self == Self::InteractiveAgent
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Oneshot => write!(f, "oneshot"),
            Self::Shell => write!(f, "shell"),
            Self::Chat => write!(f, "chat"),
            Self::HeadlessAgent => write!(f, "headless_agent"),
            Self::InteractiveAgent => write!(f, "interactive_agent"),
        }
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_yaml::from_str::<JobType>(s.trim()).map_err(|_| format!("unknown job type '{}'", s))
    }
}

/// What happens with a job's result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    #[default]
    File,
    Commit,
    None,
    #[serde(alias = "generate-jobs")]
    GenerateJobs,
}

/// The `output` frontmatter block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct OutputSpec {
    #[serde(rename = "type", default)]
    pub mode: OutputMode,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// On-disk frontmatter shape
#[derive(Debug, Default, Serialize, Deserialize)]
struct Frontmatter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<JobStatus>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    job_type: Option<JobType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    worktree: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target_agent_container: Option<String>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source_block: Option<String>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    prompt_source: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    output: Option<OutputSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    note_ref: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    prepend_dependencies: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    on_complete_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    updated_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    completed_at: Option<String>,
    #[serde(flatten)]
    extra: Mapping,
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
        Nothing(()),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) if s.trim().is_empty() => Vec::new(),
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
        OneOrMany::Nothing(()) => Vec::new(),
    })
}

fn parse_time(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok().map(|t| t.with_timezone(&Utc)))
}

fn format_time(time: Option<DateTime<Utc>>) -> Option<String> {
    time.map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
}

/// One unit of work in a plan
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    /// Stable identifier, unique within the plan
    pub id: String,

    /// File name relative to the plan directory
    pub filename: String,

    /// Absolute path to the job file
    pub path: PathBuf,

    pub title: String,
    pub job_type: JobType,
    pub status: JobStatus,

    /// Dependency references as written (ids or filenames)
    pub depends_on: Vec<String>,

    /// Resolved dependency ids, filled in by plan loading
    pub dependencies: Vec<String>,

    pub source_block: Option<SourceBlock>,
    pub prompt_source: Vec<String>,
    pub template: Option<String>,
    pub model: Option<String>,
    pub worktree: Option<String>,
    pub target_agent_container: Option<String>,
    pub repository: Option<String>,
    pub branch: Option<String>,
    pub output: OutputSpec,
    pub note_ref: Option<String>,
    pub prepend_dependencies: bool,
    pub on_complete_status: Option<String>,
    pub summary: Option<String>,
    pub last_error: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Unrecognized frontmatter keys, preserved verbatim
    pub extra: Mapping,

    /// Prompt text or chat transcript
    pub body: String,
}

impl Job {
    /// Create a pending job with no file yet
    pub fn new(id: impl Into<String>, title: impl Into<String>, job_type: JobType) -> Self {
        let output = OutputSpec {
            mode: if job_type.is_agent() {
                OutputMode::Commit
            } else {
                OutputMode::File
            },
            ..Default::default()
        };
        Self {
            id: id.into(),
            filename: String::new(),
            path: PathBuf::new(),
            title: title.into(),
            job_type,
            status: JobStatus::Pending,
            depends_on: Vec::new(),
            dependencies: Vec::new(),
            source_block: None,
            prompt_source: Vec::new(),
            template: None,
            model: None,
            worktree: None,
            target_agent_container: None,
            repository: None,
            branch: None,
            output,
            note_ref: None,
            prepend_dependencies: false,
            on_complete_status: None,
            summary: None,
            last_error: None,
            created_at: None,
            updated_at: None,
            started_at: None,
            completed_at: None,
            extra: Mapping::new(),
            body: String::new(),
        }
    }

    /// Build a job from a parsed document
    ///
    /// `id`, `type` and `status` are required; the title falls back to the
    /// file stem.
    pub fn from_document(path: &Path, doc: Document) -> FlowResult<Self> {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        debug!(%filename, "Job::from_document: called");

        let invalid = |reason: String| FlowError::InvalidJob {
            file: filename.clone(),
            reason,
        };

        let fm: Frontmatter = serde_yaml::from_value(Value::Mapping(doc.metadata)).map_err(|e| invalid(e.to_string()))?;

        let id = fm
            .id
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| invalid("missing required field 'id'".to_string()))?;
        let job_type = fm
            .job_type
            .ok_or_else(|| invalid("missing required field 'type'".to_string()))?;
        let status = fm
            .status
            .ok_or_else(|| invalid("missing required field 'status'".to_string()))?;
        let source_block = fm
            .source_block
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.parse::<SourceBlock>())
            .transpose()
            .map_err(|e| invalid(e.to_string()))?;
        let title = fm.title.filter(|t| !t.trim().is_empty()).unwrap_or_else(|| {
            path.file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default()
        });

        Ok(Self {
            id,
            filename,
            path: path.to_path_buf(),
            title,
            job_type,
            status,
            depends_on: fm.depends_on,
            dependencies: Vec::new(),
            source_block,
            prompt_source: fm.prompt_source,
            template: fm.template,
            model: fm.model,
            worktree: fm.worktree,
            target_agent_container: fm.target_agent_container,
            repository: fm.repository,
            branch: fm.branch,
            output: fm.output.unwrap_or_default(),
            note_ref: fm.note_ref,
            prepend_dependencies: fm.prepend_dependencies,
            on_complete_status: fm.on_complete_status,
            summary: fm.summary,
            last_error: fm.last_error,
            created_at: parse_time(fm.created_at),
            updated_at: parse_time(fm.updated_at),
            started_at: parse_time(fm.started_at),
            completed_at: parse_time(fm.completed_at),
            extra: fm.extra,
            body: doc.body,
        })
    }

    /// Frontmatter for writing this job from scratch; unknown keys go last
    pub fn to_frontmatter(&self) -> FlowResult<Mapping> {
        let fm = Frontmatter {
            id: Some(self.id.clone()),
            title: Some(self.title.clone()),
            status: Some(self.status),
            job_type: Some(self.job_type),
            model: self.model.clone(),
            worktree: self.worktree.clone(),
            target_agent_container: self.target_agent_container.clone(),
            depends_on: self.depends_on.clone(),
            source_block: self.source_block.as_ref().map(ToString::to_string),
            prompt_source: self.prompt_source.clone(),
            template: self.template.clone(),
            repository: self.repository.clone(),
            branch: self.branch.clone(),
            output: Some(self.output.clone()),
            note_ref: self.note_ref.clone(),
            prepend_dependencies: self.prepend_dependencies,
            on_complete_status: self.on_complete_status.clone(),
            summary: self.summary.clone(),
            last_error: self.last_error.clone(),
            created_at: format_time(self.created_at),
            updated_at: format_time(self.updated_at),
            started_at: format_time(self.started_at),
            completed_at: format_time(self.completed_at),
            extra: self.extra.clone(),
        };
        match serde_yaml::to_value(fm) {
            Ok(Value::Mapping(mapping)) => Ok(mapping),
            Ok(_) => Err(FlowError::InvalidJob {
                file: self.filename.clone(),
                reason: "frontmatter did not serialize to a mapping".to_string(),
            }),
            Err(e) => Err(FlowError::InvalidJob {
                file: self.filename.clone(),
                reason: e.to_string(),
            }),
        }
    }

    /// Serialized file content for a new job
    pub fn render(&self) -> FlowResult<String> {
        let metadata = self.to_frontmatter()?;
        jobdoc::rebuild(&metadata, &self.body).map_err(|e| FlowError::doc(&self.filename, e))
    }

    /// Whether a dependency reference names this job
    pub fn matches_reference(&self, reference: &str) -> bool {
        let reference = reference.trim();
        self.id == reference
            || self.filename == reference
            || self.filename.strip_suffix(".md") == Some(reference)
    }
}

/// The dependency-satisfaction rule
///
/// A dependency is met when it is completed or abandoned. An interactive
/// agent may also proceed on a chat that is waiting for a human turn. No
/// other pairing treats `pending_user` as satisfied.
pub fn dependency_met(dependent: &Job, dependency: &Job) -> bool {
    match dependency.status {
        JobStatus::Completed | JobStatus::Abandoned => true,
        JobStatus::PendingUser => {
            dependency.job_type == JobType::Chat && dependent.job_type == JobType::InteractiveAgent
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(content: &str) -> Document {
        jobdoc::parse(content).unwrap()
    }

    #[test]
    fn test_job_from_document() {
        let content = "---\nid: api-1a2b3c4d\ntitle: Build API\nstatus: pending\ntype: agent\ndepends_on: schema\nworktree: feature-api\noutput:\n  type: commit\ncustom_key: keep me\n---\n\nImplement it.\n";
        let job = Job::from_document(Path::new("/plan/02-build-api.md"), doc(content)).unwrap();
        assert_eq!(job.id, "api-1a2b3c4d");
        assert_eq!(job.filename, "02-build-api.md");
        assert_eq!(job.job_type, JobType::InteractiveAgent);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.depends_on, vec!["schema"]);
        assert_eq!(job.output.mode, OutputMode::Commit);
        assert_eq!(job.extra.get("custom_key").and_then(Value::as_str), Some("keep me"));
        assert_eq!(job.body, "Implement it.\n");
    }

    #[test]
    fn test_job_missing_required_fields() {
        for (content, field) in [
            ("---\ntitle: x\ntype: shell\nstatus: pending\n---\n", "id"),
            ("---\nid: x\nstatus: pending\n---\n", "type"),
            ("---\nid: x\ntype: shell\n---\n", "status"),
        ] {
            let err = Job::from_document(Path::new("01-x.md"), doc(content)).unwrap_err();
            match err {
                FlowError::InvalidJob { reason, .. } => assert!(reason.contains(field), "{reason}"),
                other => panic!("unexpected error: {other}"),
            }
        }
    }

    #[test]
    fn test_job_unknown_status_is_invalid() {
        let err = Job::from_document(Path::new("01-x.md"), doc("---\nid: x\ntype: shell\nstatus: sleeping\n---\n"))
            .unwrap_err();
        assert!(matches!(err, FlowError::InvalidJob { .. }));
    }

    #[test]
    fn test_title_defaults_to_stem() {
        let job = Job::from_document(
            Path::new("03-cleanup.md"),
            doc("---\nid: c\ntype: shell\nstatus: pending\n---\n"),
        )
        .unwrap();
        assert_eq!(job.title, "03-cleanup");
    }

    #[test]
    fn test_render_keeps_extra_keys() {
        let content = "---\nid: a\ntitle: A\nstatus: pending\ntype: oneshot\nreviewer: sam\n---\n\nbody\n";
        let job = Job::from_document(Path::new("01-a.md"), doc(content)).unwrap();
        let reparsed = Job::from_document(Path::new("01-a.md"), doc(&job.render().unwrap())).unwrap();
        assert_eq!(reparsed.extra.get("reviewer").and_then(Value::as_str), Some("sam"));
        assert_eq!(reparsed.body, "body\n");
        assert_eq!(reparsed.title, "A");
    }

    #[test]
    fn test_status_transitions() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::PendingUser));
        assert!(JobStatus::Failed.can_transition_to(JobStatus::Pending));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Pending));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Abandoned.can_transition_to(JobStatus::Pending));
        assert!(JobStatus::Completed.can_transition_to(JobStatus::Abandoned));
    }

    #[test]
    fn test_status_and_type_parse() {
        assert_eq!("pending_user".parse::<JobStatus>().unwrap(), JobStatus::PendingUser);
        assert_eq!("headless-agent".parse::<JobType>().unwrap(), JobType::HeadlessAgent);
        assert_eq!("agent".parse::<JobType>().unwrap(), JobType::InteractiveAgent);
        assert!("robot".parse::<JobType>().is_err());
        assert_eq!(JobType::InteractiveAgent.to_string(), "interactive_agent");
    }

    #[test]
    fn test_matches_reference() {
        let mut job = Job::new("schema-1234abcd", "Schema", JobType::Oneshot);
        job.filename = "01-schema.md".to_string();
        assert!(job.matches_reference("schema-1234abcd"));
        assert!(job.matches_reference("01-schema.md"));
        assert!(job.matches_reference("01-schema"));
        assert!(!job.matches_reference("schema"));
    }

    #[test]
    fn test_dependency_rule() {
        let mut chat = Job::new("c", "Chat", JobType::Chat);
        chat.status = JobStatus::PendingUser;
        let agent = Job::new("a", "Agent", JobType::InteractiveAgent);
        let headless = Job::new("h", "Headless", JobType::HeadlessAgent);
        let shell = Job::new("s", "Shell", JobType::Shell);

        assert!(dependency_met(&agent, &chat));
        assert!(!dependency_met(&headless, &chat));
        assert!(!dependency_met(&shell, &chat));

        chat.status = JobStatus::Abandoned;
        assert!(dependency_met(&shell, &chat));

        chat.status = JobStatus::Running;
        assert!(!dependency_met(&agent, &chat));
    }
}
