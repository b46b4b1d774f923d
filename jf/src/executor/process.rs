//! Subprocess helper shared by executors

use std::path::Path;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::ExecutorError;

/// Captured result of a finished command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, -1 when killed by a signal
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// stdout and stderr merged for display
    pub fn combined(&self) -> String {
        if self.stdout.is_empty() {
            self.stderr.clone()
        } else if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n\nSTDERR:\n{}", self.stdout, self.stderr)
        }
    }
}

/// Run `script` with `shell -c` in `workdir`, optionally feeding `stdin`
pub async fn run_shell(
    shell: &str,
    script: &str,
    workdir: &Path,
    stdin: Option<&str>,
) -> Result<CommandOutput, ExecutorError> {
    debug!(%shell, ?workdir, has_stdin = stdin.is_some(), "run_shell: called");
    let mut child = Command::new(shell)
        .arg("-c")
        .arg(script)
        .current_dir(workdir)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ExecutorError::Spawn {
            program: shell.to_string(),
            source,
        })?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        let input = input.to_string();
        tokio::spawn(async move {
            if let Err(e) = pipe.write_all(input.as_bytes()).await {
                warn!(error = %e, "Failed to write command stdin");
            }
        });
    }

    let output = child.wait_with_output().await.map_err(|source| ExecutorError::Spawn {
        program: shell.to_string(),
        source,
    })?;

    let result = CommandOutput {
        code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).trim_end().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
    };
    debug!(code = result.code, stdout_len = result.stdout.len(), "run_shell: finished");
    Ok(result)
}
