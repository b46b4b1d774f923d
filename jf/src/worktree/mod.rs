//! Worktree and terminal session provisioning
//!
//! Agent jobs execute in a git worktree named after the plan and the job's
//! `worktree` setting. Names are deterministic, so repeated or concurrent
//! requests reuse what exists instead of creating duplicates.

mod provisioner;

pub use provisioner::{
    GitProvisioner, Provisioner, WorktreeConfig, WorktreeError, WorktreeInfo, parse_worktree_list, session_name,
    validate_name,
};
