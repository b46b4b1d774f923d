//! Git worktree and tmux session provisioner

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::WorktreeSection;

const MAX_NAME_LEN: usize = 100;

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("valid name regex"));

/// Error types for provisioning
#[derive(Debug, thiserror::Error)]
pub enum WorktreeError {
    #[error("Invalid worktree name '{0}': use letters, digits, '-' or '_' (at most 100 characters)")]
    InvalidName(String),

    #[error("Failed to create worktree: {0}")]
    CreateFailed(String),

    #[error("Session error: {0}")]
    SessionFailed(String),

    #[error("Git command failed: {0}")]
    GitError(String),
}

/// Configuration for the git provisioner
#[derive(Debug, Clone)]
pub struct WorktreeConfig {
    /// Worktrees live at `{base_dir}/{plan}/{name}`
    pub base_dir: PathBuf,

    /// Repository (or parent of the `repos` list) worktrees come from
    pub repo_root: PathBuf,

    pub branch_prefix: String,

    pub session_prefix: String,
}

impl From<&WorktreeSection> for WorktreeConfig {
    fn from(section: &WorktreeSection) -> Self {
        Self {
            base_dir: section.base_dir.clone(),
            repo_root: section.repo_root.clone(),
            branch_prefix: section.branch_prefix.clone(),
            session_prefix: section.session_prefix.clone(),
        }
    }
}

/// A provisioned worktree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub name: String,
    pub path: PathBuf,
    pub branch: String,
    /// False when an existing worktree was reused
    pub created: bool,
}

/// Ensures isolated execution contexts exist
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Create or reuse the worktree `name` of `plan`
    ///
    /// With `repos` empty the worktree is a checkout of the configured
    /// repository; otherwise it is a directory holding one checkout per repo.
    async fn ensure_worktree(&self, plan: &str, name: &str, repos: &[String]) -> Result<WorktreeInfo, WorktreeError>;

    /// Create or reuse a detached terminal session rooted at `path`
    async fn ensure_session(&self, plan: &str, name: &str, path: &Path) -> Result<String, WorktreeError>;

    /// Run `command` in a new window of `session` and wait for it to exit
    ///
    /// Returns the command's exit code.
    async fn run_in_session(&self, session: &str, window: &str, command: &str, workdir: &Path)
    -> Result<i32, WorktreeError>;
}

/// Check a worktree name: `^[A-Za-z0-9_-]+$`, at most 100 characters
pub fn validate_name(name: &str) -> Result<(), WorktreeError> {
    if name.len() > MAX_NAME_LEN || !NAME_RE.is_match(name) {
        return Err(WorktreeError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn sanitize(component: &str) -> String {
    component
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect()
}

/// tmux session name for a plan worktree; tmux rejects `.` and `:`
pub fn session_name(prefix: &str, plan: &str, name: &str) -> String {
    sanitize(&format!("{}{}-{}", prefix, plan, name))
}

/// Paths listed by `git worktree list --porcelain`
pub fn parse_worktree_list(output: &str) -> Vec<PathBuf> {
    output
        .lines()
        .filter_map(|line| line.strip_prefix("worktree "))
        .map(PathBuf::from)
        .collect()
}

fn same_path(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

async fn git(args: &[&str], dir: &Path) -> Result<std::process::Output, WorktreeError> {
    debug!(?args, ?dir, "git: called");
    Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .map_err(|e| WorktreeError::GitError(e.to_string()))
}

async fn tmux(args: &[&str]) -> Result<std::process::Output, WorktreeError> {
    debug!(?args, "tmux: called");
    Command::new("tmux")
        .args(args)
        .output()
        .await
        .map_err(|e| WorktreeError::SessionFailed(format!("failed to run tmux: {}", e)))
}

/// Provisioner backed by `git worktree` and `tmux`
pub struct GitProvisioner {
    config: WorktreeConfig,
}

impl GitProvisioner {
    pub fn new(config: WorktreeConfig) -> Self {
        debug!(?config, "GitProvisioner::new: called");
        Self { config }
    }

    /// Path of a plan worktree
    pub fn worktree_path(&self, plan: &str, name: &str) -> PathBuf {
        self.config.base_dir.join(sanitize(plan)).join(name)
    }

    pub fn branch_name(&self, plan: &str, name: &str) -> String {
        format!("{}/{}/{}", self.config.branch_prefix, sanitize(plan), name)
    }

    /// Ensure `target` is a worktree of `repo` on `branch`; true when created
    async fn ensure_checkout(&self, repo: &Path, target: &Path, branch: &str) -> Result<bool, WorktreeError> {
        debug!(?repo, ?target, %branch, "GitProvisioner::ensure_checkout: called");

        let listed = git(&["worktree", "list", "--porcelain"], repo).await?;
        if !listed.status.success() {
            let stderr = String::from_utf8_lossy(&listed.stderr);
            return Err(WorktreeError::GitError(stderr.trim().to_string()));
        }
        let existing = parse_worktree_list(&String::from_utf8_lossy(&listed.stdout));
        if existing.iter().any(|p| same_path(p, target)) {
            debug!(?target, "GitProvisioner::ensure_checkout: reusing registered worktree");
            return Ok(false);
        }
        if target.join(".git").exists() {
            warn!(?target, "Reusing checkout that is not registered with the repository");
            return Ok(false);
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| WorktreeError::CreateFailed(format!("Failed to create {}: {}", parent.display(), e)))?;
        }
        let target_str = target.to_string_lossy().into_owned();

        let branch_ref = format!("refs/heads/{}", branch);
        let has_branch = git(&["rev-parse", "--verify", "--quiet", branch_ref.as_str()], repo)
            .await?
            .status
            .success();
        let output = if has_branch {
            debug!(%branch, "GitProvisioner::ensure_checkout: branch exists, attaching");
            git(&["worktree", "add", target_str.as_str(), branch], repo).await?
        } else {
            git(&["worktree", "add", "-b", branch, target_str.as_str(), "HEAD"], repo).await?
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WorktreeError::CreateFailed(stderr.trim().to_string()));
        }
        info!("Created worktree at {:?} on branch {}", target, branch);
        Ok(true)
    }
}

#[async_trait]
impl Provisioner for GitProvisioner {
    async fn ensure_worktree(&self, plan: &str, name: &str, repos: &[String]) -> Result<WorktreeInfo, WorktreeError> {
        debug!(%plan, %name, ?repos, "GitProvisioner::ensure_worktree: called");
        validate_name(name)?;

        let path = self.worktree_path(plan, name);
        let branch = self.branch_name(plan, name);

        let created = if repos.is_empty() {
            self.ensure_checkout(&self.config.repo_root, &path, &branch).await?
        } else {
            let mut any_created = false;
            for repo in repos {
                validate_name(repo)?;
                let created = self
                    .ensure_checkout(&self.config.repo_root.join(repo), &path.join(repo), &branch)
                    .await?;
                any_created |= created;
            }
            any_created
        };

        Ok(WorktreeInfo {
            name: name.to_string(),
            path,
            branch,
            created,
        })
    }

    async fn ensure_session(&self, plan: &str, name: &str, path: &Path) -> Result<String, WorktreeError> {
        let session = session_name(&self.config.session_prefix, plan, name);
        debug!(%session, ?path, "GitProvisioner::ensure_session: called");

        let target = format!("={}", session);
        if tmux(&["has-session", "-t", target.as_str()]).await?.status.success() {
            debug!(%session, "GitProvisioner::ensure_session: session exists");
            return Ok(session);
        }

        let workdir = path.to_string_lossy().into_owned();
        let output = tmux(&["new-session", "-d", "-s", session.as_str(), "-c", workdir.as_str()]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WorktreeError::SessionFailed(stderr.trim().to_string()));
        }
        info!(%session, "Created tmux session");
        Ok(session)
    }

    async fn run_in_session(
        &self,
        session: &str,
        window: &str,
        command: &str,
        workdir: &Path,
    ) -> Result<i32, WorktreeError> {
        debug!(%session, %window, "GitProvisioner::run_in_session: called");
        let channel = sanitize(&format!("{}-{}-done", session, window));
        let status_file = std::env::temp_dir().join(format!("{}.status", channel));
        let wrapped = format!(
            "{}; echo $? > '{}'; tmux wait-for -S {}",
            command,
            status_file.display(),
            channel
        );

        let target = format!("{}:", session);
        let workdir = workdir.to_string_lossy().into_owned();
        let args = [
            "new-window",
            "-t",
            target.as_str(),
            "-n",
            window,
            "-c",
            workdir.as_str(),
            wrapped.as_str(),
        ];
        let output = tmux(&args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WorktreeError::SessionFailed(stderr.trim().to_string()));
        }

        tmux(&["wait-for", channel.as_str()]).await?;
        let code = tokio::fs::read_to_string(&status_file)
            .await
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(-1);
        let _ = tokio::fs::remove_file(&status_file).await;
        debug!(%session, %window, code, "GitProvisioner::run_in_session: window finished");
        Ok(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn setup_git_repo(dir: &Path) {
        for args in [
            vec!["init"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test"],
            vec!["commit", "--allow-empty", "-m", "initial"],
        ] {
            Command::new("git").args(&args).current_dir(dir).output().await.unwrap();
        }
    }

    fn provisioner(base: &Path, repo: &Path) -> GitProvisioner {
        GitProvisioner::new(WorktreeConfig {
            base_dir: base.to_path_buf(),
            repo_root: repo.to_path_buf(),
            branch_prefix: "test".to_string(),
            session_prefix: "t-".to_string(),
        })
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("feature_1-api").is_ok());
        assert!(validate_name("bad name").is_err());
        assert!(validate_name("../escape").is_err());
        assert!(validate_name("").is_err());
        assert!(validate_name(&"a".repeat(101)).is_err());
        assert!(validate_name(&"a".repeat(100)).is_ok());
    }

    #[test]
    fn test_session_name_sanitized() {
        assert_eq!(session_name("jf-", "v1.2", "api"), "jf-v1-2-api");
        assert_eq!(session_name("", "plan:x", "wt"), "plan-x-wt");
    }

    #[test]
    fn test_parse_worktree_list() {
        let output = "worktree /repo\nHEAD abc\nbranch refs/heads/main\n\nworktree /wt/plan/api\nHEAD def\nbranch refs/heads/test/plan/api\n";
        assert_eq!(
            parse_worktree_list(output),
            vec![PathBuf::from("/repo"), PathBuf::from("/wt/plan/api")]
        );
    }

    #[test]
    fn test_paths_and_branches() {
        let p = provisioner(Path::new("/wt"), Path::new("/repo"));
        assert_eq!(p.worktree_path("my plan", "api"), PathBuf::from("/wt/my-plan/api"));
        assert_eq!(p.branch_name("my plan", "api"), "test/my-plan/api");
    }

    #[tokio::test]
    async fn test_ensure_worktree_is_idempotent() {
        let repo_dir = tempdir().unwrap();
        let base_dir = tempdir().unwrap();
        setup_git_repo(repo_dir.path()).await;
        let p = provisioner(base_dir.path(), repo_dir.path());

        let first = p.ensure_worktree("auth", "api", &[]).await.unwrap();
        assert!(first.created);
        assert!(first.path.join(".git").exists());
        assert_eq!(first.branch, "test/auth/api");

        let second = p.ensure_worktree("auth", "api", &[]).await.unwrap();
        assert!(!second.created);
        assert_eq!(second.path, first.path);
    }

    #[tokio::test]
    async fn test_ensure_worktree_multi_repo() {
        let root = tempdir().unwrap();
        let base_dir = tempdir().unwrap();
        for repo in ["api", "web"] {
            let dir = root.path().join(repo);
            std::fs::create_dir_all(&dir).unwrap();
            setup_git_repo(&dir).await;
        }
        let p = provisioner(base_dir.path(), root.path());
        let repos = vec!["api".to_string(), "web".to_string()];

        let info = p.ensure_worktree("plan", "shared", &repos).await.unwrap();
        assert!(info.path.join("api").join(".git").exists());
        assert!(info.path.join("web").join(".git").exists());
    }

    #[tokio::test]
    async fn test_ensure_worktree_rejects_bad_name() {
        let base_dir = tempdir().unwrap();
        let p = provisioner(base_dir.path(), base_dir.path());
        assert!(matches!(
            p.ensure_worktree("plan", "../../etc", &[]).await,
            Err(WorktreeError::InvalidName(_))
        ));
    }
}
