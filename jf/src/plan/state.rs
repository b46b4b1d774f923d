//! Durable job state transitions
//!
//! Every transition is written into the job's own frontmatter before the
//! caller moves on, so a crash never loses more than the in-flight job.

use chrono::{DateTime, Local, SecondsFormat, Utc};
use jobdoc::{Changes, LockState};
use tracing::{debug, info, warn};

use crate::domain::{Job, JobStatus, Plan};
use crate::error::{FlowError, FlowResult};

const OUTPUT_HEADER: &str = "## Output";
const ABANDON_NOTE: &str = "This job was abandoned by the user.";

fn timestamp(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Compact duration such as `1h2m3s`
pub fn format_duration(duration: chrono::Duration) -> String {
    let total = duration.num_seconds().max(0);
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    match (hours, minutes) {
        (0, 0) => format!("{}s", seconds),
        (0, _) => format!("{}m{}s", minutes, seconds),
        _ => format!("{}h{}m{}s", hours, minutes, seconds),
    }
}

/// Apply frontmatter changes to a job file atomically
pub fn write_changes(job: &Job, changes: &Changes) -> FlowResult<()> {
    debug!(job = %job.id, keys = ?changes.keys().collect::<Vec<_>>(), "write_changes: called");
    let content = jobdoc::read_document(&job.path)?;
    let updated = jobdoc::update(&content, changes).map_err(|e| FlowError::doc(&job.filename, e))?;
    if updated != content {
        jobdoc::write_atomic(&job.path, &updated)?;
    }
    Ok(())
}

/// Move a job to `status`, recording timestamps
pub fn set_status(job: &mut Job, status: JobStatus) -> FlowResult<()> {
    transition(job, status, Changes::new())
}

/// Move a running job to failed and record the error
pub fn mark_failed(job: &mut Job, error: &str) -> FlowResult<()> {
    let changes = Changes::new().set("last_error", error);
    transition(job, JobStatus::Failed, changes)?;
    job.last_error = Some(error.to_string());
    Ok(())
}

/// Explicit re-run request: failed (or orphaned running) back to pending
pub fn reset_job(job: &mut Job) -> FlowResult<()> {
    debug!(job = %job.id, status = %job.status, "reset_job: called");
    if !matches!(job.status, JobStatus::Failed | JobStatus::Running) {
        return Err(FlowError::InvalidTransition {
            job: job.id.clone(),
            from: job.status,
            to: JobStatus::Pending,
        });
    }
    if job.status == JobStatus::Running
        && let LockState::Held(pid) = jobdoc::lock_state(&job.path)?
    {
        warn!(job = %job.id, pid, "Refusing to reset a job that is still running");
        return Err(FlowError::InvalidTransition {
            job: job.id.clone(),
            from: job.status,
            to: JobStatus::Pending,
        });
    }
    let changes = Changes::new().remove("last_error").remove("completed_at").remove("duration");
    transition(job, JobStatus::Pending, changes)?;
    job.last_error = None;
    job.completed_at = None;
    Ok(())
}

/// Retire a job; dependents treat it as satisfied
pub fn abandon_job(job: &mut Job) -> FlowResult<()> {
    debug!(job = %job.id, "abandon_job: called");
    check_transition(job, JobStatus::Abandoned)?;

    let now = Utc::now();
    let changes = Changes::new()
        .set("status", JobStatus::Abandoned.to_string())
        .set("updated_at", timestamp(now));
    let content = jobdoc::read_document(&job.path)?;
    let mut updated = jobdoc::update(&content, &changes).map_err(|e| FlowError::doc(&job.filename, e))?;
    if !updated.contains(ABANDON_NOTE) {
        let trimmed = updated.trim_end().len();
        updated.truncate(trimmed);
        updated.push_str(&format!("\n\n---\n\n## Note\n\n{}\n", ABANDON_NOTE));
    }
    jobdoc::write_atomic(&job.path, &updated)?;

    info!(job = %job.id, from = %job.status, "Job abandoned");
    job.status = JobStatus::Abandoned;
    job.updated_at = Some(now);
    Ok(())
}

/// Append a timestamped line under the job's `## Output` section
pub fn append_output(job: &Job, text: &str) -> FlowResult<()> {
    debug!(job = %job.id, len = text.len(), "append_output: called");
    let mut content = jobdoc::read_document(&job.path)?;
    let has_section = content.lines().any(|l| l.trim_end() == OUTPUT_HEADER);
    let trimmed = content.trim_end().len();
    content.truncate(trimmed);
    if !has_section {
        content.push_str(&format!("\n\n{}\n", OUTPUT_HEADER));
    }
    content.push_str(&format!("\n[{}] {}\n", Local::now().format("%H:%M:%S"), text.trim_end()));
    jobdoc::write_atomic(&job.path, &content)?;
    Ok(())
}

/// Job body without the `## Output` section appended by earlier runs
pub fn body_without_output(body: &str) -> &str {
    let mut offset = 0;
    for line in body.split_inclusive('\n') {
        if line.trim_end() == OUTPUT_HEADER {
            return body[..offset].trim_end();
        }
        offset += line.len();
    }
    body
}

/// Store a generated summary in the job's frontmatter
pub fn record_summary(job: &mut Job, summary: &str) -> FlowResult<()> {
    write_changes(job, &Changes::new().set("summary", summary))?;
    job.summary = Some(summary.to_string());
    Ok(())
}

/// Running jobs whose lock is missing or belongs to a dead process
pub fn find_orphaned(plan: &Plan) -> FlowResult<Vec<&Job>> {
    let mut orphaned = Vec::new();
    for job in plan.jobs().iter().filter(|j| j.status == JobStatus::Running) {
        match jobdoc::lock_state(&job.path)? {
            LockState::Held(_) => {}
            state => {
                debug!(job = %job.id, ?state, "find_orphaned: running without live lock");
                orphaned.push(job);
            }
        }
    }
    Ok(orphaned)
}

fn check_transition(job: &Job, to: JobStatus) -> FlowResult<()> {
    if job.status.can_transition_to(to) {
        Ok(())
    } else {
        Err(FlowError::InvalidTransition {
            job: job.id.clone(),
            from: job.status,
            to,
        })
    }
}

fn transition(job: &mut Job, to: JobStatus, mut changes: Changes) -> FlowResult<()> {
    debug!(job = %job.id, from = %job.status, %to, "transition: called");
    check_transition(job, to)?;

    let now = Utc::now();
    changes.insert("status", to.to_string());
    changes.insert("updated_at", timestamp(now));
    match to {
        JobStatus::Running => {
            changes.insert("started_at", timestamp(now));
            job.started_at = Some(now);
        }
        JobStatus::Completed | JobStatus::Failed => {
            changes.insert("completed_at", timestamp(now));
            if let Some(started) = job.started_at {
                changes.insert("duration", format_duration(now - started));
            }
            job.completed_at = Some(now);
        }
        _ => {}
    }

    write_changes(job, &changes)?;
    info!(job = %job.id, from = %job.status, %to, "Job status changed");
    job.status = to;
    job.updated_at = Some(now);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::load_plan;
    use std::fs;
    use tempfile::TempDir;

    const JOB: &str = "---\nid: build\ntitle: Build\nstatus: pending\ntype: shell\n# keep this comment\nowner: ops\n---\n\necho hi\n";

    fn setup() -> (TempDir, Job) {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("01-build.md"), JOB).unwrap();
        let plan = load_plan(temp.path()).unwrap();
        let job = plan.job("build").unwrap().clone();
        (temp, job)
    }

    fn reload(job: &Job) -> Job {
        let content = fs::read_to_string(&job.path).unwrap();
        Job::from_document(&job.path, jobdoc::parse(&content).unwrap()).unwrap()
    }

    #[test]
    fn test_status_lifecycle_persists() {
        let (_temp, mut job) = setup();
        set_status(&mut job, JobStatus::Running).unwrap();
        let on_disk = reload(&job);
        assert_eq!(on_disk.status, JobStatus::Running);
        assert!(on_disk.started_at.is_some());

        set_status(&mut job, JobStatus::Completed).unwrap();
        let on_disk = reload(&job);
        assert_eq!(on_disk.status, JobStatus::Completed);
        assert!(on_disk.completed_at.is_some());
        assert!(on_disk.extra.get("duration").is_some());

        let content = fs::read_to_string(&job.path).unwrap();
        assert!(content.contains("# keep this comment\nowner: ops\n"));
        assert!(content.ends_with("\n\necho hi\n"));
    }

    #[test]
    fn test_invalid_transition_leaves_file() {
        let (_temp, mut job) = setup();
        let err = set_status(&mut job, JobStatus::Completed).unwrap_err();
        assert!(matches!(err, FlowError::InvalidTransition { .. }));
        assert_eq!(fs::read_to_string(&job.path).unwrap(), JOB);
    }

    #[test]
    fn test_failed_then_reset() {
        let (_temp, mut job) = setup();
        set_status(&mut job, JobStatus::Running).unwrap();
        mark_failed(&mut job, "exit status 2").unwrap();
        let on_disk = reload(&job);
        assert_eq!(on_disk.status, JobStatus::Failed);
        assert_eq!(on_disk.last_error.as_deref(), Some("exit status 2"));

        reset_job(&mut job).unwrap();
        let on_disk = reload(&job);
        assert_eq!(on_disk.status, JobStatus::Pending);
        assert!(on_disk.last_error.is_none());
    }

    #[test]
    fn test_reset_rejects_completed() {
        let (_temp, mut job) = setup();
        set_status(&mut job, JobStatus::Running).unwrap();
        set_status(&mut job, JobStatus::Completed).unwrap();
        assert!(matches!(reset_job(&mut job), Err(FlowError::InvalidTransition { .. })));
    }

    #[test]
    fn test_abandon_appends_note_once() {
        let (_temp, mut job) = setup();
        abandon_job(&mut job).unwrap();
        let mut again = reload(&job);
        assert_eq!(again.status, JobStatus::Abandoned);
        abandon_job(&mut again).unwrap();
        let content = fs::read_to_string(&job.path).unwrap();
        assert_eq!(content.matches(ABANDON_NOTE).count(), 1);
    }

    #[test]
    fn test_append_output_section() {
        let (_temp, job) = setup();
        append_output(&job, "first line").unwrap();
        append_output(&job, "second line").unwrap();
        let content = fs::read_to_string(&job.path).unwrap();
        assert_eq!(content.matches(OUTPUT_HEADER).count(), 1);
        assert!(content.contains("] first line\n"));
        assert!(content.trim_end().ends_with("second line"));
    }

    #[test]
    fn test_body_without_output() {
        assert_eq!(body_without_output("echo hi\n"), "echo hi\n");
        assert_eq!(body_without_output("echo hi\n\n## Output\n\n[10:00:00] hi\n"), "echo hi");
        assert_eq!(body_without_output("## Outputs are fine\n"), "## Outputs are fine\n");
    }

    #[test]
    fn test_find_orphaned_running_job() {
        let (temp, mut job) = setup();
        set_status(&mut job, JobStatus::Running).unwrap();
        let plan = load_plan(temp.path()).unwrap();
        let orphaned = find_orphaned(&plan).unwrap();
        assert_eq!(orphaned.len(), 1);

        let _lock = jobdoc::JobLock::acquire(&job.path).unwrap();
        assert!(find_orphaned(&plan).unwrap().is_empty());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(chrono::Duration::seconds(42)), "42s");
        assert_eq!(format_duration(chrono::Duration::seconds(83)), "1m23s");
        assert_eq!(format_duration(chrono::Duration::seconds(3723)), "1h2m3s");
    }
}
