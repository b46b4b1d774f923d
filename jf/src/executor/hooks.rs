//! Job lifecycle hooks
//!
//! A hook is a shell command that receives a JSON payload on stdin when a
//! job starts or stops. Hooks are best effort: failures and timeouts are
//! logged and never change the job's outcome.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use super::process::run_shell;
use crate::config::HooksConfig;
use crate::domain::{Job, JobStatus, JobType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum HookEvent {
    JobStart,
    JobStop,
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::JobStart => write!(f, "job-start"),
            Self::JobStop => write!(f, "job-stop"),
        }
    }
}

/// JSON document passed to a hook
#[derive(Debug, Clone, Serialize)]
pub struct HookPayload {
    pub event: HookEvent,
    pub plan: String,
    pub job_id: String,
    pub job_title: String,
    pub job_type: JobType,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HookPayload {
    pub fn new(event: HookEvent, plan: &str, job: &Job, status: JobStatus) -> Self {
        Self {
            event,
            plan: plan.to_string(),
            job_id: job.id.clone(),
            job_title: job.title.clone(),
            job_type: job.job_type,
            status,
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Runs the configured hook commands
#[derive(Debug, Clone, Default)]
pub struct HookNotifier {
    start: Option<String>,
    stop: Option<String>,
    timeout: Duration,
}

impl HookNotifier {
    pub fn from_config(config: &HooksConfig) -> Self {
        Self {
            start: config.job_start.clone(),
            stop: config.job_stop.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }

    /// Notifier with no hooks configured
    pub fn disabled() -> Self {
        Self::default()
    }

    fn command(&self, event: HookEvent) -> Option<&str> {
        match event {
            HookEvent::JobStart => self.start.as_deref(),
            HookEvent::JobStop => self.stop.as_deref(),
        }
    }

    /// Run the hook for `payload.event`, if any, in `workdir`
    pub async fn notify(&self, payload: &HookPayload, workdir: &Path) {
        let Some(command) = self.command(payload.event) else {
            return;
        };
        debug!(event = %payload.event, job = %payload.job_id, "HookNotifier::notify: called");

        let input = match serde_json::to_string(payload) {
            Ok(json) => json,
            Err(e) => {
                warn!(event = %payload.event, error = %e, "Failed to serialize hook payload");
                return;
            }
        };

        match tokio::time::timeout(self.timeout, run_shell("sh", command, workdir, Some(&input))).await {
            Ok(Ok(output)) if output.success() => {
                debug!(event = %payload.event, "HookNotifier::notify: hook finished");
            }
            Ok(Ok(output)) => {
                warn!(event = %payload.event, code = output.code, stderr = %output.stderr, "Hook command failed");
            }
            Ok(Err(e)) => warn!(event = %payload.event, error = %e, "Failed to run hook"),
            Err(_) => warn!(event = %payload.event, timeout = ?self.timeout, "Hook timed out"),
        }
    }
}
