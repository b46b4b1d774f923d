//! Domain types for plans and jobs

pub mod id;
pub mod job;
pub mod plan;

pub use id::{generate_job_id, job_filename, new_block_id, slugify};
pub use job::{Job, JobStatus, JobType, OutputMode, OutputSpec, dependency_met};
pub use plan::{CHAT_PLAN_FILE, PLAN_CONFIG_FILE, Plan, PlanConfig, PlanLifecycle};
