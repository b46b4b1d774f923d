//! Plan directory operations
//!
//! Loading and resolving plans, adding and extracting jobs, prompt assembly,
//! durable status transitions and the plan lifecycle. Every operation starts
//! from the files on disk; nothing here caches a plan between calls.

mod extract;
mod lifecycle;
mod loader;
mod prompt;
pub mod state;

pub use extract::{ExtractMode, ExtractReport, ExtractRequest, extract_to_job};
pub use lifecycle::{HookRun, LifecycleReport, ON_FINISH_HOOK, ON_REVIEW_HOOK, save_plan_config, set_lifecycle};
pub use loader::{add_job, generate_unique_id, load_job, load_plan, load_plan_config, resolve_dependencies};
pub use prompt::resolve_prompt;
pub use state::{
    abandon_job, append_output, body_without_output, find_orphaned, format_duration, mark_failed, record_summary,
    reset_job, set_status, write_changes,
};
