//! Prompt assembly for a job about to run
//!
//! Content is read from disk at run time, so references recorded by
//! extraction and dependency outputs always reflect the latest edits.

use jobdoc::DocError;
use tracing::{debug, warn};

use super::state::body_without_output;
use crate::domain::{Job, Plan};
use crate::error::{FlowError, FlowResult};

/// Build the full prompt for `job`
///
/// Sections in order: dependency context (when prepending is enabled),
/// `prompt_source` files, the referenced `source_block`, then the job body.
pub fn resolve_prompt(plan: &Plan, job: &Job) -> FlowResult<String> {
    debug!(job = %job.id, deps = job.dependencies.len(), "resolve_prompt: called");
    let mut sections = Vec::new();

    if plan.prepends_dependencies(job) {
        for dep_id in &job.dependencies {
            let Some(dep) = plan.job(dep_id) else {
                warn!(job = %job.id, dependency = %dep_id, "Dependency missing from plan while building prompt");
                continue;
            };
            let body = read_body(plan, &dep.filename)?;
            if !body.is_empty() {
                sections.push(format!("## Context from {}\n\n{}", dep.title, body));
            }
        }
    }

    for file in &job.prompt_source {
        let body = read_body(plan, file)?;
        if !body.is_empty() {
            sections.push(format!("## {}\n\n{}", file, body));
        }
    }

    if let Some(block) = &job.source_block {
        let extracted = block.resolve(&plan.directory).map_err(|e| match e {
            DocError::BlocksNotFound(ids) => FlowError::Extraction(format!(
                "job {} references missing blocks in {}: {}",
                job.id,
                block.file,
                ids.join(", ")
            )),
            other => FlowError::doc(&block.file, other),
        })?;
        for warning in &extracted.warnings {
            warn!(job = %job.id, source = %block, %warning, "Source block warning");
        }
        if !extracted.content.is_empty() {
            sections.push(extracted.content);
        }
    }

    let body = body_without_output(&job.body).trim();
    if !body.is_empty() {
        sections.push(body.to_string());
    }

    Ok(sections.join("\n\n"))
}

/// Body of a plan file, re-read from disk and trimmed
fn read_body(plan: &Plan, filename: &str) -> FlowResult<String> {
    let content = jobdoc::read_document(&plan.path_for(filename))?;
    let doc = jobdoc::parse(&content).map_err(|e| FlowError::doc(filename, e))?;
    Ok(body_without_output(&doc.body).trim().to_string())
}
