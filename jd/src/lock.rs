//! Job lock files
//!
//! While a job executes, `<job-file>.lock` holds the PID of the process
//! running it. A lock whose process no longer exists is stale and may be
//! taken over by the next run.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{DocError, DocResult};

/// Observed state of a job's lock file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// No lock file
    Free,
    /// Locked by a live process
    Held(i32),
    /// Lock file left behind by a process that is gone
    Stale(i32),
}

/// Path of the lock file guarding `job_path`
pub fn lock_path(job_path: &Path) -> PathBuf {
    let mut raw = job_path.as_os_str().to_owned();
    raw.push(".lock");
    PathBuf::from(raw)
}

/// Inspect the lock guarding `job_path`
pub fn lock_state(job_path: &Path) -> DocResult<LockState> {
    let path = lock_path(job_path);
    debug!(?path, "lock_state: called");
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(LockState::Free),
        Err(e) => return Err(DocError::io(&path, e)),
    };

    let Ok(pid) = content.trim().parse::<i32>() else {
        debug!(%content, "lock_state: unreadable pid, treating as stale");
        return Ok(LockState::Stale(0));
    };

    if is_process_running(pid) {
        Ok(LockState::Held(pid))
    } else {
        Ok(LockState::Stale(pid))
    }
}

fn is_process_running(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        // Signal 0 only checks existence; EPERM means it exists under another user
        let result = matches!(kill(Pid::from_raw(pid), None), Ok(()) | Err(Errno::EPERM));
        debug!(pid, result, "is_process_running: unix check");
        result
    }

    #[cfg(not(unix))]
    {
        true
    }
}

/// Held lock on a job file, released on drop
#[derive(Debug)]
pub struct JobLock {
    path: PathBuf,
}

impl JobLock {
    /// Take the lock for `job_path`, replacing a stale one
    ///
    /// The PID is written to a temp file that is linked into place without
    /// clobbering, so a visible lock file always carries its owner.
    pub fn acquire(job_path: &Path) -> DocResult<Self> {
        let path = lock_path(job_path);
        debug!(?path, "JobLock::acquire: called");
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        for _ in 0..3 {
            let mut staged = tempfile::Builder::new()
                .prefix(".lock-")
                .tempfile_in(dir)
                .map_err(|e| DocError::io(&path, e))?;
            write!(staged, "{}", std::process::id()).map_err(|e| DocError::io(&path, e))?;
            staged.flush().map_err(|e| DocError::io(&path, e))?;

            match staged.persist_noclobber(&path) {
                Ok(_) => {
                    debug!(?path, "JobLock::acquire: lock taken");
                    return Ok(Self { path });
                }
                Err(e) if e.error.kind() == ErrorKind::AlreadyExists => match lock_state(job_path)? {
                    LockState::Held(pid) => {
                        debug!(pid, "JobLock::acquire: held by live process");
                        return Err(DocError::Locked {
                            path: job_path.to_path_buf(),
                            pid,
                        });
                    }
                    LockState::Stale(pid) => {
                        warn!(?path, pid, "Removing stale job lock");
                        match fs::remove_file(&path) {
                            Ok(()) => {}
                            Err(e) if e.kind() == ErrorKind::NotFound => {}
                            Err(e) => return Err(DocError::io(&path, e)),
                        }
                    }
                    LockState::Free => {
                        debug!("JobLock::acquire: lock vanished, retrying");
                    }
                },
                Err(e) => return Err(DocError::io(&path, e.error)),
            }
        }

        Err(DocError::Locked {
            path: job_path.to_path_buf(),
            pid: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for JobLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path)
            && e.kind() != ErrorKind::NotFound
        {
            warn!(path = ?self.path, error = %e, "Failed to remove job lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use tempfile::TempDir;

    #[test]
    fn test_lock_path_appends_suffix() {
        assert_eq!(lock_path(Path::new("/plan/01-job.md")), PathBuf::from("/plan/01-job.md.lock"));
    }

    #[test]
    fn test_acquire_and_release() {
        let temp = TempDir::new().unwrap();
        let job = temp.path().join("01-job.md");

        let lock = JobLock::acquire(&job).unwrap();
        assert_eq!(lock_state(&job).unwrap(), LockState::Held(std::process::id() as i32));
        assert!(matches!(JobLock::acquire(&job), Err(DocError::Locked { .. })));

        drop(lock);
        assert_eq!(lock_state(&job).unwrap(), LockState::Free);
    }

    #[test]
    fn test_lock_file_carries_pid() {
        let temp = TempDir::new().unwrap();
        let job = temp.path().join("01-job.md");
        let lock = JobLock::acquire(&job).unwrap();
        assert_eq!(fs::read_to_string(lock.path()).unwrap(), std::process::id().to_string());
        let leftovers = fs::read_dir(temp.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn test_concurrent_acquire_has_one_winner() {
        let temp = TempDir::new().unwrap();
        let job = temp.path().join("01-job.md");
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let job = job.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    JobLock::acquire(&job)
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let held = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(held, 1);
        assert!(
            results
                .iter()
                .filter_map(|r| r.as_ref().err())
                .all(|e| matches!(e, DocError::Locked { .. }))
        );
    }

    #[test]
    fn test_empty_lock_is_stale() {
        let temp = TempDir::new().unwrap();
        let job = temp.path().join("01-job.md");
        fs::write(lock_path(&job), "").unwrap();
        assert_eq!(lock_state(&job).unwrap(), LockState::Stale(0));

        let lock = JobLock::acquire(&job).unwrap();
        assert_eq!(fs::read_to_string(lock.path()).unwrap(), std::process::id().to_string());
    }

    #[test]
    fn test_stale_lock_taken_over() {
        let temp = TempDir::new().unwrap();
        let job = temp.path().join("01-job.md");
        fs::write(lock_path(&job), "not-a-pid").unwrap();
        assert_eq!(lock_state(&job).unwrap(), LockState::Stale(0));

        let lock = JobLock::acquire(&job).unwrap();
        assert!(lock.path().exists());
    }
}
