//! Plan loading and dependency resolution

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::domain::{Job, PLAN_CONFIG_FILE, Plan, PlanConfig, generate_job_id, job_filename};
use crate::error::{FlowError, FlowResult};

/// Load a plan directory and resolve every dependency reference
///
/// Markdown files that start with a frontmatter block are job files; other
/// markdown (notes, specs without metadata) is skipped.
pub fn load_plan(directory: &Path) -> FlowResult<Plan> {
    debug!(?directory, "load_plan: called");
    if !directory.is_dir() {
        return Err(FlowError::PlanNotFound(directory.to_path_buf()));
    }
    let directory = directory
        .canonicalize()
        .map_err(|_| FlowError::PlanNotFound(directory.to_path_buf()))?;

    let config = load_plan_config(&directory)?;
    let mut plan = Plan::new(&directory, config);

    for path in job_files(&directory)? {
        if let Some(job) = load_job(&path)? {
            plan.insert(job)?;
        }
    }

    resolve_dependencies(&mut plan)?;
    info!(plan = %plan.name, jobs = plan.len(), "Loaded plan");
    Ok(plan)
}

/// Read `.jobflow-plan.yml`; a missing file yields defaults
pub fn load_plan_config(directory: &Path) -> FlowResult<PlanConfig> {
    let path = directory.join(PLAN_CONFIG_FILE);
    debug!(?path, "load_plan_config: called");
    if !path.exists() {
        debug!("load_plan_config: no plan config, using defaults");
        return Ok(PlanConfig::default());
    }
    let content = jobdoc::read_document(&path)?;
    if content.trim().is_empty() {
        return Ok(PlanConfig::default());
    }
    serde_yaml::from_str(&content).map_err(|e| {
        FlowError::doc(
            PLAN_CONFIG_FILE,
            jobdoc::DocError::MalformedDocument(format!("invalid plan config: {}", e)),
        )
    })
}

/// Markdown files in the plan directory, sorted by name
fn job_files(directory: &Path) -> FlowResult<Vec<PathBuf>> {
    let pattern = directory.join("*.md");
    let pattern = pattern.to_string_lossy();
    let entries = glob::glob(&pattern).map_err(|e| FlowError::InvalidJob {
        file: pattern.to_string(),
        reason: e.to_string(),
    })?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| match entry {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(error = %e, "Skipping unreadable plan entry");
                None
            }
        })
        .filter(|p| p.is_file())
        .collect();
    files.sort();
    debug!(count = files.len(), "job_files: found markdown files");
    Ok(files)
}

/// Load one job file; `None` when the file is a note without frontmatter
pub fn load_job(path: &Path) -> FlowResult<Option<Job>> {
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    debug!(%filename, "load_job: called");

    let content = jobdoc::read_document(path)?;
    let doc = jobdoc::parse(&content).map_err(|e| FlowError::doc(&filename, e))?;
    if !content.starts_with("---") {
        debug!(%filename, "load_job: no frontmatter, not a job");
        return Ok(None);
    }
    Job::from_document(path, doc).map(Some)
}

/// Resolve every job's dependency references to job ids
///
/// References match an identifier first, then a filename. Any reference that
/// matches nothing is an error naming the job and the reference.
pub fn resolve_dependencies(plan: &mut Plan) -> FlowResult<()> {
    debug!(plan = %plan.name, "resolve_dependencies: called");
    let mut resolved: Vec<Vec<String>> = Vec::with_capacity(plan.len());
    for job in plan.jobs() {
        let mut ids = Vec::with_capacity(job.depends_on.len());
        for reference in &job.depends_on {
            match plan.find(reference) {
                Some(dep) => {
                    if !ids.contains(&dep.id) {
                        ids.push(dep.id.clone());
                    }
                }
                None => {
                    debug!(job = %job.id, %reference, "resolve_dependencies: unresolved reference");
                    return Err(FlowError::UnresolvedDependency {
                        job: job.id.clone(),
                        reference: reference.clone(),
                    });
                }
            }
        }
        resolved.push(ids);
    }
    for (job, ids) in plan.jobs_mut().zip(resolved) {
        job.dependencies = ids;
    }
    Ok(())
}

/// Unique id for a new job in `plan`
pub fn generate_unique_id(plan: &Plan, title: &str) -> String {
    generate_job_id(title, |candidate| plan.job(candidate).is_some())
}

/// Write a new job into the plan directory and append it to `plan`
///
/// Assigns an id when the job has none and a collision-free filename derived
/// from the title. Returns the filename.
pub fn add_job(plan: &mut Plan, mut job: Job) -> FlowResult<String> {
    debug!(plan = %plan.name, title = %job.title, "add_job: called");
    if job.id.trim().is_empty() || plan.job(&job.id).is_some() {
        job.id = generate_unique_id(plan, &job.title);
    }

    let directory = plan.directory.clone();
    let filename = job_filename(
        &job.title,
        plan.jobs().iter().map(|j| j.filename.as_str()),
        |candidate| plan.job_by_filename(candidate).is_some() || directory.join(candidate).exists(),
    );

    let now = chrono::Utc::now();
    job.created_at.get_or_insert(now);
    job.updated_at = Some(now);
    job.filename = filename.clone();
    job.path = plan.path_for(&filename);

    for reference in &job.depends_on {
        let dep = plan.find(reference).ok_or_else(|| FlowError::UnresolvedDependency {
            job: job.id.clone(),
            reference: reference.clone(),
        })?;
        if !job.dependencies.contains(&dep.id) {
            job.dependencies.push(dep.id.clone());
        }
    }

    let content = job.render()?;
    write_new_file(&job.path, &content)?;
    info!(id = %job.id, %filename, "Added job");

    plan.insert(job)?;
    Ok(filename)
}

fn write_new_file(path: &Path, content: &str) -> FlowResult<()> {
    use std::io::Write;

    let io_error = |source: std::io::Error| {
        FlowError::Doc(jobdoc::DocError::Io {
            path: path.to_path_buf(),
            source,
        })
    };
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(io_error)?;
    file.write_all(content.as_bytes()).map_err(io_error)
}
