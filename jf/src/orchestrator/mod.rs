//! Concurrent plan orchestration
//!
//! [`Orchestrator`] runs single jobs, one runnable batch, or a whole plan,
//! bounded by `max_parallel_jobs` and cancellable between batches.

mod config;
mod engine;
mod report;
mod summary;

pub use config::OrchestratorConfig;
pub use engine::Orchestrator;
pub use report::{BatchReport, PlanStatus, RunSummary};
pub use summary::{CommandSummarizer, Summarizer};
