//! Plan execution with bounded parallelism
//!
//! The orchestrator never caches a plan between scheduling decisions: every
//! round reloads the directory, rebuilds the dependency graph and launches
//! what is runnable. A job's file is the only record of its state; the
//! in-memory plan is a snapshot used for one decision.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::OrchestratorConfig;
use super::report::{BatchReport, PlanStatus, RunSummary};
use super::summary::{CommandSummarizer, Summarizer};
use crate::domain::{Job, JobStatus, Plan};
use crate::error::{FlowError, FlowResult};
use crate::executor::{ExecutionContext, ExecutorRegistry, HookEvent, HookNotifier, HookPayload};
use crate::graph::DependencyGraph;
use crate::plan::{find_orphaned, load_job, load_plan, mark_failed, record_summary, resolve_prompt, set_status};

type JobResult = (String, FlowResult<JobStatus>);

/// Drives job execution for plans
#[derive(Clone)]
pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: Arc<ExecutorRegistry>,
    hooks: Arc<HookNotifier>,
    summarizer: Option<Arc<dyn Summarizer>>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, registry: ExecutorRegistry) -> Self {
        debug!(
            max_parallel = config.max_parallel_jobs,
            skip_interactive = config.skip_interactive,
            ?registry,
            "Orchestrator::new: called"
        );
        let summarizer: Option<Arc<dyn Summarizer>> = if config.summary.enabled {
            Some(Arc::new(CommandSummarizer::new(config.summary.clone())))
        } else {
            None
        };
        Self {
            config,
            registry: Arc::new(registry),
            hooks: Arc::new(HookNotifier::disabled()),
            summarizer,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_hooks(mut self, hooks: HookNotifier) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// Share a cancellation token with the caller
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Token observed at batch boundaries; cancel it to stop launching jobs
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        info!("Cancellation requested");
        self.cancel.cancel();
    }

    /// Counts per status, computed from `plan` as given
    pub fn status(&self, plan: &Plan) -> FlowResult<PlanStatus> {
        debug!(plan = %plan.name, "Orchestrator::status: called");
        PlanStatus::compute(plan)
    }

    /// Execute one job without checking its dependencies
    ///
    /// The job's lock is held for the whole run. Status goes to `running`
    /// before the executor starts and to the outcome status (or `failed`)
    /// before this returns. Execution errors are recorded in the job file
    /// and returned as [`FlowError::ExecutionFailure`].
    pub async fn run_job(&self, plan: &Plan, job_id: &str) -> FlowResult<JobStatus> {
        debug!(plan = %plan.name, job = %job_id, "Orchestrator::run_job: called");
        let snapshot = plan
            .job(job_id)
            .ok_or_else(|| FlowError::JobNotFound(job_id.to_string()))?;

        let _lock = jobdoc::JobLock::acquire(&snapshot.path).map_err(|e| FlowError::doc(&snapshot.filename, e))?;

        // The snapshot may predate another process's run of this job
        let mut job = load_job(&snapshot.path)?.ok_or_else(|| FlowError::JobNotFound(job_id.to_string()))?;
        job.dependencies = snapshot.dependencies.clone();

        set_status(&mut job, JobStatus::Running)?;
        self.notify(HookEvent::JobStart, plan, &job, None).await;

        let result = match self.context(plan, &job) {
            Ok(ctx) => {
                info!(job = %job.id, job_type = %job.job_type, model = %ctx.model, "Running job");
                self.registry.dispatch(&ctx).await.map_err(|e| e.to_string())
            }
            Err(e) => Err(e.to_string()),
        };

        match result {
            Ok(outcome) => {
                set_status(&mut job, outcome.status)?;
                if outcome.status == JobStatus::Completed {
                    self.summarize(plan, &mut job, &outcome.output).await;
                }
                self.notify(HookEvent::JobStop, plan, &job, None).await;
                Ok(outcome.status)
            }
            Err(message) => {
                error!(job = %job.id, %message, "Job failed");
                mark_failed(&mut job, &message)?;
                self.notify(HookEvent::JobStop, plan, &job, Some(&message)).await;
                Err(FlowError::ExecutionFailure {
                    job: job.id.clone(),
                    title: job.title.clone(),
                    message,
                })
            }
        }
    }

    /// [`run_job`](Self::run_job) after confirming every dependency is met
    pub async fn run_job_checked(&self, plan: &Plan, job_id: &str) -> FlowResult<JobStatus> {
        debug!(plan = %plan.name, job = %job_id, "Orchestrator::run_job_checked: called");
        let unmet = DependencyGraph::build(plan)?.unmet_dependencies(job_id)?;
        if !unmet.is_empty() {
            return Err(FlowError::DependencyUnmet {
                job: job_id.to_string(),
                unmet,
            });
        }
        self.run_job(plan, job_id).await
    }

    /// Run one batch of up to `max_parallel_jobs` runnable jobs
    ///
    /// Returns when the whole batch has settled. Jobs unblocked by the batch
    /// are left for the next call.
    pub async fn run_next(&self, plan: &Plan) -> FlowResult<BatchReport> {
        debug!(plan = %plan.name, "Orchestrator::run_next: called");
        if plan.is_on_hold() {
            return Err(FlowError::PlanOnHold(plan.name.clone()));
        }
        if self.cancel.is_cancelled() {
            return Err(FlowError::Cancelled);
        }

        let mut batch = self.candidates(plan, &HashSet::new())?;
        batch.truncate(self.config.max_parallel_jobs);
        if batch.is_empty() {
            return Err(FlowError::NoRunnableJobs(plan.name.clone()));
        }
        info!(plan = %plan.name, jobs = ?batch, "Starting batch");

        let snapshot = Arc::new(plan.clone());
        let mut set = JoinSet::new();
        for id in batch {
            self.spawn_job(&mut set, snapshot.clone(), id, None);
        }

        let mut report = BatchReport::default();
        while let Some(joined) = set.join_next().await {
            match Self::settled(joined) {
                Some((id, Ok(status))) => report.record(id, status),
                Some((id, Err(FlowError::ExecutionFailure { .. }))) => report.record(id, JobStatus::Failed),
                Some((id, Err(e))) => {
                    warn!(job = %id, error = %e, "Job could not be started");
                    report.skipped.push(id);
                }
                None => {}
            }
        }
        info!(
            completed = report.completed.len(),
            failed = report.failed.len(),
            awaiting_user = report.awaiting_user.len(),
            "Batch finished"
        );
        Ok(report)
    }

    /// Run the plan until nothing is pending or running
    ///
    /// Failures do not stop sibling jobs. A job that cannot be started (for
    /// example locked by another process) is not retried within the run.
    /// The run ends with an error when any
    /// job failed, when pending jobs can never become runnable, when a job is
    /// launched more than `max_consecutive_steps` times, or when cancelled.
    pub async fn run_all(&self, plan: &Plan) -> FlowResult<RunSummary> {
        debug!(plan = %plan.name, "Orchestrator::run_all: called");
        if plan.is_on_hold() {
            return Err(FlowError::PlanOnHold(plan.name.clone()));
        }
        if plan.is_chat_plan() {
            return Err(FlowError::ChatPlanRunAll(plan.name.clone()));
        }
        info!(plan = %plan.name, max_parallel = self.config.max_parallel_jobs, "Running plan");

        let directory = plan.directory.clone();
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_jobs));
        let mut set: JoinSet<JobResult> = JoinSet::new();
        let mut in_flight: HashSet<String> = HashSet::new();
        let mut unstartable: HashSet<String> = HashSet::new();
        let mut launches: HashMap<String, u32> = HashMap::new();
        let mut failed: Vec<String> = Vec::new();
        let mut halt: Option<FlowError> = None;
        let mut summary = RunSummary::default();

        loop {
            let current = Arc::new(load_plan(&directory)?);

            if halt.is_none() && !self.cancel.is_cancelled() {
                let mut launched = 0;
                let exclude: HashSet<String> = in_flight.union(&unstartable).cloned().collect();
                for id in self.candidates(&current, &exclude)? {
                    let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                        break;
                    };
                    let steps = launches.entry(id.clone()).or_insert(0);
                    if *steps >= self.config.max_consecutive_steps {
                        warn!(job = %id, steps = *steps, "Step limit reached");
                        halt = Some(FlowError::StepLimitReached {
                            job: id,
                            steps: *steps,
                        });
                        break;
                    }
                    *steps += 1;
                    in_flight.insert(id.clone());
                    self.spawn_job(&mut set, current.clone(), id, Some(permit));
                    launched += 1;
                }
                if launched > 0 {
                    summary.rounds += 1;
                    debug!(launched, in_flight = in_flight.len(), "run_all: launched round");
                }
            }

            if set.is_empty() {
                let waiting = self.running_elsewhere(&current)?;
                if waiting.is_empty() || halt.is_some() || self.cancel.is_cancelled() {
                    break;
                }
                debug!(jobs = ?waiting, "run_all: waiting on jobs run by another process");
                tokio::select! {
                    _ = tokio::time::sleep(self.config.check_interval) => {}
                    _ = self.cancel.cancelled() => {}
                }
                continue;
            }

            let joined = if self.cancel.is_cancelled() {
                set.join_next().await
            } else {
                tokio::select! {
                    joined = set.join_next() => joined,
                    _ = self.cancel.cancelled() => {
                        info!(in_flight = in_flight.len(), "Cancelled; waiting for running jobs to finish");
                        continue;
                    }
                }
            };

            let Some((id, result)) = joined.and_then(Self::settled) else {
                continue;
            };
            in_flight.remove(&id);
            match result {
                Ok(status) => {
                    if status == JobStatus::PendingUser {
                        summary.awaiting_user.push(id.clone());
                    }
                    summary.executed.push(id);
                }
                Err(FlowError::ExecutionFailure { .. }) => failed.push(id),
                Err(e) => {
                    warn!(job = %id, error = %e, "Job could not be started; not retrying in this run");
                    unstartable.insert(id.clone());
                    summary.skipped.push(id);
                }
            }
        }

        let finished = load_plan(&directory)?;
        let pending: Vec<String> = finished
            .jobs()
            .iter()
            .filter(|j| matches!(j.status, JobStatus::Pending | JobStatus::Running))
            .filter(|j| !self.skipped(j))
            .map(|j| j.id.clone())
            .collect();

        if self.cancel.is_cancelled() && !pending.is_empty() {
            return Err(FlowError::Cancelled);
        }
        if let Some(err) = halt {
            return Err(err);
        }
        if !failed.is_empty() {
            return Err(FlowError::JobsFailed(failed));
        }
        if !pending.is_empty() {
            return Err(FlowError::Stalled {
                plan: finished.name.clone(),
                pending,
            });
        }
        info!(plan = %finished.name, executed = summary.executed.len(), rounds = summary.rounds, "Plan run finished");
        Ok(summary)
    }

    fn spawn_job(
        &self,
        set: &mut JoinSet<JobResult>,
        plan: Arc<Plan>,
        id: String,
        permit: Option<tokio::sync::OwnedSemaphorePermit>,
    ) {
        let this = self.clone();
        set.spawn(async move {
            let _permit = permit;
            let result = this.run_job(&plan, &id).await;
            (id, result)
        });
    }

    fn settled(joined: Result<JobResult, JoinError>) -> Option<JobResult> {
        match joined {
            Ok(result) => Some(result),
            Err(e) => {
                error!(error = %e, "Job task panicked");
                None
            }
        }
    }

    /// Runnable job ids in plan order, minus `exclude` and skipped types
    fn candidates(&self, plan: &Plan, exclude: &HashSet<String>) -> FlowResult<Vec<String>> {
        let graph = DependencyGraph::build(plan)?;
        Ok(graph
            .runnable_jobs()
            .into_iter()
            .filter(|j| !self.skipped(j) && !exclude.contains(&j.id))
            .map(|j| j.id.clone())
            .collect())
    }

    fn skipped(&self, job: &Job) -> bool {
        self.config.skip_interactive && job.job_type.is_interactive()
    }

    /// Running jobs whose lock is held by a live process
    fn running_elsewhere(&self, plan: &Plan) -> FlowResult<Vec<String>> {
        let orphaned: HashSet<&str> = find_orphaned(plan)?.into_iter().map(|j| j.id.as_str()).collect();
        for id in &orphaned {
            warn!(job = %id, "Job is marked running but no process holds its lock; reset it to run again");
        }
        Ok(plan
            .jobs()
            .iter()
            .filter(|j| j.status == JobStatus::Running && !orphaned.contains(j.id.as_str()))
            .map(|j| j.id.clone())
            .collect())
    }

    fn context(&self, plan: &Plan, job: &Job) -> FlowResult<ExecutionContext> {
        Ok(ExecutionContext {
            plan_name: plan.name.clone(),
            plan_dir: plan.directory.clone(),
            repos: plan.config.repos.clone(),
            prompt: resolve_prompt(plan, job)?,
            model: self.config.resolve_model(plan.model_for(job)),
            worktree: plan.worktree_for(job).map(str::to_string),
            job: job.clone(),
        })
    }

    async fn summarize(&self, plan: &Plan, job: &mut Job, output: &str) {
        let Some(summarizer) = &self.summarizer else {
            return;
        };
        if let Some(summary) = summarizer.summarize(job, output, &plan.directory).await
            && let Err(e) = record_summary(job, &summary)
        {
            warn!(job = %job.id, error = %e, "Failed to record summary");
        }
    }

    async fn notify(&self, event: HookEvent, plan: &Plan, job: &Job, error: Option<&str>) {
        let mut payload = HookPayload::new(event, &plan.name, job, job.status);
        if let Some(message) = error {
            payload = payload.with_error(message);
        }
        self.hooks.notify(&payload, &plan.directory).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutionOutcome, ExecutorError, JobExecutor};
    use crate::domain::JobType;
    use async_trait::async_trait;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    /// Completes jobs whose prompt is not "fail"
    struct Scripted;

    #[async_trait]
    impl JobExecutor for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionOutcome, ExecutorError> {
            if ctx.prompt == "fail" {
                return Err(ExecutorError::CommandFailed {
                    code: 1,
                    output: "scripted failure".to_string(),
                });
            }
            Ok(ExecutionOutcome::completed(format!("ran {} with {}", ctx.job.id, ctx.model)))
        }
    }

    fn write_job(dir: &Path, file: &str, id: &str, status: &str, deps: &[&str], body: &str) {
        let deps = if deps.is_empty() {
            String::new()
        } else {
            format!("depends_on:\n{}", deps.iter().map(|d| format!("- {}\n", d)).collect::<String>())
        };
        let content = format!("---\nid: {id}\ntitle: Job {id}\nstatus: {status}\ntype: oneshot\n{deps}---\n\n{body}\n");
        fs::write(dir.join(file), content).unwrap();
    }

    fn orchestrator() -> Orchestrator {
        let mut registry = ExecutorRegistry::new();
        registry.register(JobType::Oneshot, Arc::new(Scripted));
        Orchestrator::new(OrchestratorConfig::default().with_model("stub-model"), registry)
    }

    #[tokio::test]
    async fn test_run_job_completes_and_persists() {
        let temp = TempDir::new().unwrap();
        write_job(temp.path(), "01-a.md", "a", "pending", &[], "work");
        let plan = load_plan(temp.path()).unwrap();

        let status = orchestrator().run_job(&plan, "a").await.unwrap();
        assert_eq!(status, JobStatus::Completed);

        let reloaded = load_plan(temp.path()).unwrap();
        let job = reloaded.job("a").unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.started_at.is_some());
        assert!(job.completed_at.is_some());
        assert!(!jobdoc::lock_path(&job.path).exists());
    }

    #[tokio::test]
    async fn test_run_job_failure_is_recorded() {
        let temp = TempDir::new().unwrap();
        write_job(temp.path(), "01-a.md", "a", "pending", &[], "fail");
        let plan = load_plan(temp.path()).unwrap();

        let err = orchestrator().run_job(&plan, "a").await.unwrap_err();
        match err {
            FlowError::ExecutionFailure { job, title, message } => {
                assert_eq!(job, "a");
                assert_eq!(title, "Job a");
                assert!(message.contains("scripted failure"));
            }
            other => panic!("unexpected error: {other}"),
        }
        let reloaded = load_plan(temp.path()).unwrap();
        let job = reloaded.job("a").unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.last_error.as_deref().unwrap().contains("scripted failure"));
    }

    #[tokio::test]
    async fn test_run_job_ignores_dependencies() {
        let temp = TempDir::new().unwrap();
        write_job(temp.path(), "01-a.md", "a", "pending", &[], "first");
        write_job(temp.path(), "02-b.md", "b", "pending", &["a"], "second");
        let plan = load_plan(temp.path()).unwrap();
        let orchestrator = orchestrator();

        let err = orchestrator.run_job_checked(&plan, "b").await.unwrap_err();
        assert!(matches!(err, FlowError::DependencyUnmet { ref unmet, .. } if unmet == &["a (pending)".to_string()]));

        assert_eq!(orchestrator.run_job(&plan, "b").await.unwrap(), JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_run_job_rejects_finished_job() {
        let temp = TempDir::new().unwrap();
        write_job(temp.path(), "01-a.md", "a", "completed", &[], "done");
        let plan = load_plan(temp.path()).unwrap();
        assert!(matches!(
            orchestrator().run_job(&plan, "a").await,
            Err(FlowError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_run_job_unknown_id() {
        let temp = TempDir::new().unwrap();
        write_job(temp.path(), "01-a.md", "a", "pending", &[], "work");
        let plan = load_plan(temp.path()).unwrap();
        assert!(matches!(
            orchestrator().run_job(&plan, "ghost").await,
            Err(FlowError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_run_next_stops_after_one_batch() {
        let temp = TempDir::new().unwrap();
        write_job(temp.path(), "01-a.md", "a", "pending", &[], "first");
        write_job(temp.path(), "02-b.md", "b", "pending", &["a"], "second");
        let plan = load_plan(temp.path()).unwrap();

        let report = orchestrator().run_next(&plan).await.unwrap();
        assert_eq!(report.completed, vec!["a".to_string()]);

        let reloaded = load_plan(temp.path()).unwrap();
        assert_eq!(reloaded.job("b").unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_run_all_does_not_retry_locked_job() {
        let temp = TempDir::new().unwrap();
        write_job(temp.path(), "01-a.md", "a", "pending", &[], "work");
        write_job(temp.path(), "02-b.md", "b", "pending", &[], "work");
        fs::write(jobdoc::lock_path(&temp.path().join("01-a.md")), std::process::id().to_string()).unwrap();
        let plan = load_plan(temp.path()).unwrap();

        let orchestrator = orchestrator();
        let err = tokio::time::timeout(std::time::Duration::from_secs(10), orchestrator.run_all(&plan))
            .await
            .unwrap()
            .unwrap_err();
        match err {
            FlowError::Stalled { pending, .. } => assert_eq!(pending, vec!["a".to_string()]),
            other => panic!("unexpected error: {other}"),
        }

        let reloaded = load_plan(temp.path()).unwrap();
        assert_eq!(reloaded.job("a").unwrap().status, JobStatus::Pending);
        assert_eq!(reloaded.job("b").unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_summary_recorded_on_completion() {
        struct Fixed;

        #[async_trait]
        impl Summarizer for Fixed {
            async fn summarize(&self, _job: &Job, output: &str, _workdir: &Path) -> Option<String> {
                Some(format!("summary of: {output}"))
            }
        }

        let temp = TempDir::new().unwrap();
        write_job(temp.path(), "01-a.md", "a", "pending", &[], "work");
        let plan = load_plan(temp.path()).unwrap();
        orchestrator()
            .with_summarizer(Arc::new(Fixed))
            .run_job(&plan, "a")
            .await
            .unwrap();

        let reloaded = load_plan(temp.path()).unwrap();
        assert_eq!(
            reloaded.job("a").unwrap().summary.as_deref(),
            Some("summary of: ran a with stub-model")
        );
    }
}
