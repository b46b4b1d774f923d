//! JobFlow - plan orchestration engine
//!
//! A plan is a directory of markdown job files with YAML frontmatter. JobFlow
//! loads the directory, orders jobs by their declared dependencies and runs
//! them with bounded parallelism, writing every status transition back into
//! the job's own file.
//!
//! # Modules
//!
//! - [`domain`] - Job, Plan and the dependency satisfaction rule
//! - [`plan`] - Loading, adding, extracting and persisting jobs
//! - [`graph`] - Dependency graph, cycle detection and runnable jobs
//! - [`orchestrator`] - run_job / run_next / run_all and status counts
//! - [`executor`] - Per-type job executors and lifecycle hooks
//! - [`worktree`] - Git worktree and tmux session provisioning
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod executor;
pub mod graph;
pub mod orchestrator;
pub mod plan;
pub mod worktree;

pub use config::Config;
pub use domain::{Job, JobStatus, JobType, OutputMode, Plan, PlanConfig, dependency_met};
pub use error::{FlowError, FlowResult};
pub use executor::{ExecutionContext, ExecutionOutcome, ExecutorError, ExecutorRegistry, JobExecutor};
pub use graph::DependencyGraph;
pub use orchestrator::{BatchReport, Orchestrator, OrchestratorConfig, PlanStatus, RunSummary};
pub use plan::{add_job, extract_to_job, load_plan, resolve_dependencies, set_lifecycle};
pub use worktree::{GitProvisioner, Provisioner, WorktreeConfig, WorktreeError};
