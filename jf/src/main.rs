//! JobFlow - plan runner
//!
//! CLI entry point for inspecting and running plan directories.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result, eyre};
use tracing::{debug, info, warn};

use jobdoc::BlockSelector;
use jobflow::cli::{Cli, Command, OutputFormat, get_log_path};
use jobflow::config::Config;
use jobflow::domain::{Job, JobStatus, JobType, Plan, PlanLifecycle};
use jobflow::executor::{ExecutorRegistry, HookNotifier};
use jobflow::graph::DependencyGraph;
use jobflow::orchestrator::{Orchestrator, OrchestratorConfig, PlanStatus};
use jobflow::plan::{
    ExtractMode, ExtractRequest, abandon_job, add_job, extract_to_job, load_plan, reset_job, set_lifecycle,
};
use jobflow::worktree::{GitProvisioner, WorktreeConfig};

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    let log_path = get_log_path();
    if let Some(log_dir) = log_path.parent() {
        fs::create_dir_all(log_dir).context("Failed to create log directory")?;
    }

    // Priority: CLI --log-level > config file > INFO
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::File::create(&log_path).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_log_level = Config::load_log_level(cli.config.as_ref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    debug!(command = ?cli.command, plan = ?cli.plan, "main: dispatching command");
    let plan_dir = cli.plan.as_path();
    match cli.command {
        Command::Status { format } => cmd_status(plan_dir, format),
        Command::Graph { format } => cmd_graph(plan_dir, format),
        Command::Next => cmd_next(&config, plan_dir).await,
        Command::Run { job } => cmd_run(&config, plan_dir, &job).await,
        Command::All { parallel, model } => cmd_all(&config, plan_dir, parallel, model).await,
        Command::Blocking { job } => cmd_blocking(plan_dir, &job),
        Command::Add {
            title,
            job_type,
            depends_on,
            body,
        } => cmd_add(plan_dir, &title, job_type, depends_on, body),
        Command::Extract {
            chat_file,
            blocks,
            title,
            copy,
            job_type,
            depends_on,
        } => cmd_extract(plan_dir, &chat_file, &blocks, &title, copy, job_type, depends_on),
        Command::Reset { job } => cmd_reset(plan_dir, &job),
        Command::Abandon { job } => cmd_abandon(plan_dir, &job),
        Command::Hold => cmd_lifecycle(plan_dir, PlanLifecycle::Hold).await,
        Command::Unhold => cmd_lifecycle(plan_dir, PlanLifecycle::Normal).await,
        Command::Review => cmd_lifecycle(plan_dir, PlanLifecycle::Review).await,
        Command::Finish => cmd_lifecycle(plan_dir, PlanLifecycle::Finished).await,
    }
}

fn load(plan_dir: &Path) -> Result<Plan> {
    load_plan(plan_dir).with_context(|| format!("Failed to load plan {}", plan_dir.display()))
}

/// Resolve a job reference (id or filename) to a job of the plan
fn find_job<'a>(plan: &'a Plan, reference: &str) -> Result<&'a Job> {
    plan.find(reference)
        .ok_or_else(|| eyre!("No job '{}' in plan '{}'", reference, plan.name))
}

fn build_orchestrator(config: &Config, orchestrator_config: OrchestratorConfig) -> Orchestrator {
    let provisioner = Arc::new(GitProvisioner::new(WorktreeConfig::from(&config.worktree)));
    let registry = ExecutorRegistry::from_config(config, provisioner);
    Orchestrator::new(orchestrator_config, registry).with_hooks(HookNotifier::from_config(&config.hooks))
}

fn colored_status(status: JobStatus) -> String {
    let text = status.to_string();
    match status {
        JobStatus::Completed => text.green().to_string(),
        JobStatus::Failed => text.red().to_string(),
        JobStatus::Running => text.cyan().to_string(),
        JobStatus::PendingUser => text.magenta().to_string(),
        JobStatus::Abandoned => text.dimmed().to_string(),
        JobStatus::Pending => text.yellow().to_string(),
    }
}

/// Show plan status
fn cmd_status(plan_dir: &Path, format: OutputFormat) -> Result<()> {
    debug!(?plan_dir, %format, "cmd_status: called");
    if format == OutputFormat::Mermaid {
        return Err(eyre!("status supports text or json output; use `graph --format mermaid` for a diagram"));
    }
    let plan = load(plan_dir)?;
    let status = PlanStatus::compute(&plan)?;
    let graph = DependencyGraph::build(&plan)?;

    match format {
        OutputFormat::Json => {
            let jobs: Vec<_> = plan
                .jobs()
                .iter()
                .map(|j| {
                    serde_json::json!({
                        "id": j.id,
                        "title": j.title,
                        "file": j.filename,
                        "type": j.job_type,
                        "status": j.status,
                        "runnable": graph.is_runnable(&j.id),
                        "depends_on": j.dependencies,
                    })
                })
                .collect();
            let json = serde_json::json!({ "summary": status, "jobs": jobs });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Text | OutputFormat::Mermaid => {
            println!("{} ({})", plan.name.bold(), plan.config.status);
            println!(
                "{} jobs: {} completed, {} running, {} pending ({} runnable, {} blocked), {} awaiting user, {} failed, {} abandoned",
                status.total,
                status.completed,
                status.running,
                status.pending,
                status.runnable,
                status.blocked,
                status.pending_user,
                status.failed,
                status.abandoned
            );
            println!("Progress: {}%", status.progress());
            println!();
            for job in plan.jobs() {
                let marker = if graph.is_runnable(&job.id) { "*" } else { " " };
                println!(
                    "{} {:<14} {:<20} {:<18} {}",
                    marker,
                    colored_status(job.status),
                    job.id,
                    job.job_type.to_string(),
                    job.title
                );
            }
        }
    }
    Ok(())
}

/// Show the dependency graph
fn cmd_graph(plan_dir: &Path, format: OutputFormat) -> Result<()> {
    debug!(?plan_dir, %format, "cmd_graph: called");
    let plan = load(plan_dir)?;
    let graph = DependencyGraph::build(&plan)?;

    match format {
        OutputFormat::Mermaid => print!("{}", graph.to_mermaid()),
        OutputFormat::Json => {
            let stages: Vec<Vec<&str>> = graph
                .execution_stages()
                .into_iter()
                .map(|stage| stage.into_iter().map(|j| j.id.as_str()).collect())
                .collect();
            println!("{}", serde_json::to_string_pretty(&stages)?);
        }
        OutputFormat::Text => {
            for (i, stage) in graph.execution_stages().iter().enumerate() {
                println!("{}", format!("Stage {}", i + 1).bold());
                for job in stage {
                    let deps: Vec<&str> = graph.dependencies(&job.id).into_iter().map(|d| d.id.as_str()).collect();
                    if deps.is_empty() {
                        println!("  {} [{}]", job.id, colored_status(job.status));
                    } else {
                        println!("  {} [{}] <- {}", job.id, colored_status(job.status), deps.join(", "));
                    }
                }
            }
        }
    }
    Ok(())
}

/// Run one batch of runnable jobs
async fn cmd_next(config: &Config, plan_dir: &Path) -> Result<()> {
    debug!(?plan_dir, "cmd_next: called");
    let plan = load(plan_dir)?;
    let orchestrator = build_orchestrator(config, OrchestratorConfig::from(config));
    let report = orchestrator.run_next(&plan).await?;

    for id in &report.completed {
        println!("{} {}", "completed".green(), id);
    }
    for id in &report.awaiting_user {
        println!("{} {}", "awaiting user".magenta(), id);
    }
    for id in &report.skipped {
        println!("{} {}", "skipped".yellow(), id);
    }
    for id in &report.failed {
        println!("{} {}", "failed".red(), id);
    }
    if !report.failed.is_empty() {
        return Err(eyre!("{} job(s) failed", report.failed.len()));
    }
    Ok(())
}

/// Run a single job
async fn cmd_run(config: &Config, plan_dir: &Path, reference: &str) -> Result<()> {
    debug!(?plan_dir, %reference, "cmd_run: called");
    let plan = load(plan_dir)?;
    let id = find_job(&plan, reference)?.id.clone();
    let orchestrator = build_orchestrator(config, OrchestratorConfig::from(config));
    let status = orchestrator.run_job_checked(&plan, &id).await?;
    println!("{} {}", colored_status(status), id);
    Ok(())
}

/// Run the whole plan
async fn cmd_all(config: &Config, plan_dir: &Path, parallel: Option<usize>, model: Option<String>) -> Result<()> {
    debug!(?plan_dir, ?parallel, ?model, "cmd_all: called");
    let plan = load(plan_dir)?;

    let mut orchestrator_config = OrchestratorConfig::from(config);
    if let Some(parallel) = parallel {
        orchestrator_config = orchestrator_config.with_parallel(parallel);
    }
    if let Some(model) = model {
        orchestrator_config = orchestrator_config.with_model(model);
    }
    let orchestrator = build_orchestrator(config, orchestrator_config);

    let token = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; no new jobs will be started");
            eprintln!("Interrupted; waiting for running jobs to finish");
            token.cancel();
        }
    });

    let summary = orchestrator.run_all(&plan).await?;
    println!(
        "{} {} job(s) in {} round(s)",
        "Finished".green().bold(),
        summary.executed.len(),
        summary.rounds
    );
    if !summary.awaiting_user.is_empty() {
        println!("Awaiting user: {}", summary.awaiting_user.join(", "));
    }
    if !summary.skipped.is_empty() {
        println!("{} {}", "Could not start:".yellow(), summary.skipped.join(", "));
    }
    Ok(())
}

/// Show unmet dependencies of a job
fn cmd_blocking(plan_dir: &Path, reference: &str) -> Result<()> {
    debug!(?plan_dir, %reference, "cmd_blocking: called");
    let plan = load(plan_dir)?;
    let job = find_job(&plan, reference)?;
    let graph = DependencyGraph::build(&plan)?;
    let unmet = graph.unmet_dependencies(&job.id)?;

    if unmet.is_empty() {
        if job.status == JobStatus::Pending {
            println!("{} is ready to run", job.id);
        } else {
            println!("{} has no unmet dependencies (status: {})", job.id, colored_status(job.status));
        }
    } else {
        println!("{} is waiting on:", job.id);
        for dep in unmet {
            println!("  {}", dep);
        }
    }
    Ok(())
}

/// Add a job to the plan
fn cmd_add(plan_dir: &Path, title: &str, job_type: JobType, depends_on: Vec<String>, body: Option<String>) -> Result<()> {
    debug!(?plan_dir, %title, %job_type, ?depends_on, "cmd_add: called");
    let mut plan = load(plan_dir)?;
    let mut job = Job::new("", title, job_type);
    job.depends_on = depends_on;
    if let Some(body) = body {
        job.body = format!("{}\n", body.trim_end());
    }
    let filename = add_job(&mut plan, job)?;
    let id = plan.job_by_filename(&filename).map(|j| j.id.clone()).unwrap_or_default();
    println!("{} {} ({})", "Added".green(), filename, id);
    Ok(())
}

/// Create a job from chat blocks
fn cmd_extract(
    plan_dir: &Path,
    chat_file: &str,
    blocks: &str,
    title: &str,
    copy: bool,
    job_type: JobType,
    depends_on: Vec<String>,
) -> Result<()> {
    debug!(?plan_dir, %chat_file, %blocks, %title, copy, "cmd_extract: called");
    let mut plan = load(plan_dir)?;
    let selector = blocks.parse::<BlockSelector>().context("Invalid block selector")?;

    let mut request = ExtractRequest::new(chat_file, selector, title);
    request.job_type = job_type;
    request.depends_on = depends_on;
    request.mode = if copy { ExtractMode::Copy } else { ExtractMode::Reference };

    let report = extract_to_job(&mut plan, request)?;
    for warning in &report.warnings {
        eprintln!("{} {}", "warning:".yellow(), warning);
    }
    println!(
        "{} {} ({}) from blocks {}",
        "Created".green(),
        report.filename,
        report.job_id,
        report.found.join(", ")
    );
    Ok(())
}

fn job_for_update(plan_dir: &Path, reference: &str) -> Result<Job> {
    let plan = load(plan_dir)?;
    Ok(find_job(&plan, reference)?.clone())
}

/// Return a failed job to pending
fn cmd_reset(plan_dir: &Path, reference: &str) -> Result<()> {
    debug!(?plan_dir, %reference, "cmd_reset: called");
    let mut job = job_for_update(plan_dir, reference)?;
    reset_job(&mut job)?;
    println!("{} {}", colored_status(job.status), job.id);
    Ok(())
}

/// Retire a job
fn cmd_abandon(plan_dir: &Path, reference: &str) -> Result<()> {
    debug!(?plan_dir, %reference, "cmd_abandon: called");
    let mut job = job_for_update(plan_dir, reference)?;
    abandon_job(&mut job)?;
    println!("{} {}", colored_status(job.status), job.id);
    Ok(())
}

/// Move the plan through hold, review and finish
async fn cmd_lifecycle(plan_dir: &Path, target: PlanLifecycle) -> Result<()> {
    debug!(?plan_dir, %target, "cmd_lifecycle: called");
    let mut plan = load(plan_dir)?;
    let report = set_lifecycle(&mut plan, target).await?;

    if let Some(hook) = &report.hook {
        if !hook.output.is_empty() {
            println!("{}", hook.output);
        }
        if !hook.success() {
            println!("{} {} exited with {}", "Warning:".yellow(), hook.name, hook.code);
        }
    }

    if report.changed {
        println!("Plan '{}': {} -> {}", plan.name, report.from, report.to.to_string().bold());
    } else {
        println!("Plan '{}' is already {}", plan.name, report.to);
    }
    Ok(())
}
