//! Extract chat blocks into a new job
//!
//! Two modes coexist. [`ExtractMode::Copy`] writes the selected turns into the
//! new job's body. [`ExtractMode::Reference`] records a `source_block`
//! (`file#id1,id2`) and leaves the body empty; the content is read when the
//! job runs.

use std::fmt;
use std::str::FromStr;

use jobdoc::{BlockSelector, SourceBlock};
use tracing::{debug, info, warn};

use super::loader::add_job;
use crate::domain::{Job, JobStatus, JobType, Plan};
use crate::error::{FlowError, FlowResult};

/// How extracted content reaches the new job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExtractMode {
    /// Copy content into the job body
    Copy,
    /// Store a lazy `source_block` reference
    #[default]
    Reference,
}

impl fmt::Display for ExtractMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Copy => write!(f, "copy"),
            Self::Reference => write!(f, "reference"),
        }
    }
}

impl FromStr for ExtractMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "copy" => Ok(Self::Copy),
            "reference" | "ref" => Ok(Self::Reference),
            _ => Err(format!("Unknown extract mode: {}. Use: copy, reference", s)),
        }
    }
}

/// Parameters for [`extract_to_job`]
#[derive(Debug, Clone)]
pub struct ExtractRequest {
    /// Chat file, relative to the plan directory
    pub source: String,
    pub selector: BlockSelector,
    pub title: String,
    pub job_type: JobType,
    pub mode: ExtractMode,
    pub depends_on: Vec<String>,
}

impl ExtractRequest {
    pub fn new(source: impl Into<String>, selector: BlockSelector, title: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            selector,
            title: title.into(),
            job_type: JobType::Chat,
            mode: ExtractMode::default(),
            depends_on: Vec::new(),
        }
    }
}

/// Outcome of an extraction
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractReport {
    pub job_id: String,
    pub filename: String,
    /// Block ids that were found
    pub found: Vec<String>,
    /// Requested ids that matched nothing
    pub warnings: Vec<String>,
}

/// Create a job from blocks of a chat file in the plan
///
/// Unknown ids produce warnings; an extraction that matches no requested id
/// fails without creating a job.
pub fn extract_to_job(plan: &mut Plan, request: ExtractRequest) -> FlowResult<ExtractReport> {
    debug!(source = %request.source, selector = %request.selector, mode = %request.mode, "extract_to_job: called");

    let block = SourceBlock::new(request.source.clone(), request.selector.clone());
    let extracted = block.resolve(&plan.directory).map_err(|e| match e {
        jobdoc::DocError::BlocksNotFound(ids) => {
            FlowError::Extraction(format!("no blocks found in {} for ids: {}", request.source, ids.join(", ")))
        }
        other => FlowError::doc(&request.source, other),
    })?;
    for warning in &extracted.warnings {
        warn!(source = %request.source, %warning, "Extraction warning");
    }

    let mut job = Job::new("", request.title.clone(), request.job_type);
    job.depends_on = request.depends_on;
    // A human opens the conversation; it is not runnable until then
    if job.job_type == JobType::Chat {
        job.status = JobStatus::PendingUser;
    }
    match request.mode {
        ExtractMode::Copy => {
            job.body = format!("{}\n", extracted.content.trim_end());
        }
        ExtractMode::Reference => {
            let selector = match &request.selector {
                BlockSelector::All => BlockSelector::All,
                BlockSelector::Ids(_) => BlockSelector::Ids(extracted.found.clone()),
            };
            job.source_block = Some(SourceBlock::new(request.source.clone(), selector));
        }
    }

    let filename = add_job(plan, job)?;
    let job_id = plan
        .job_by_filename(&filename)
        .map(|j| j.id.clone())
        .ok_or_else(|| FlowError::JobNotFound(filename.clone()))?;
    info!(%job_id, %filename, mode = %request.mode, "Extracted chat blocks into job");

    Ok(ExtractReport {
        job_id,
        filename,
        found: extracted.found,
        warnings: extracted.warnings,
    })
}
