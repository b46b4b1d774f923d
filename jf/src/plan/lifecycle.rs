//! Plan lifecycle transitions
//!
//! The lifecycle is stored in the plan config file. Entering review runs the
//! plan's `on_review` hook and is refused when the hook fails. Finishing runs
//! `on_finish`, whose failure is only logged.

use handlebars::Handlebars;
use jobdoc::DocError;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::domain::{PLAN_CONFIG_FILE, Plan, PlanLifecycle};
use crate::error::{FlowError, FlowResult};
use crate::executor::run_shell;

pub const ON_REVIEW_HOOK: &str = "on_review";
pub const ON_FINISH_HOOK: &str = "on_finish";

/// A plan hook that was executed during a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookRun {
    pub name: String,
    pub code: i32,
    pub output: String,
}

impl HookRun {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Result of [`set_lifecycle`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleReport {
    pub from: PlanLifecycle,
    pub to: PlanLifecycle,
    /// False when the plan already was in the requested state
    pub changed: bool,
    pub hook: Option<HookRun>,
}

/// Move `plan` to `target`, running the matching hook and persisting the config
///
/// - `Hold` is accepted from any state but `Finished`
/// - `Normal` only releases a held plan
/// - `Review` is a no-op for plans already in review or finished
/// - `Finished` requires the plan to be in review
pub async fn set_lifecycle(plan: &mut Plan, target: PlanLifecycle) -> FlowResult<LifecycleReport> {
    let from = plan.config.status;
    debug!(plan = %plan.name, %from, to = %target, "set_lifecycle: called");

    if from == target || (target == PlanLifecycle::Review && from == PlanLifecycle::Finished) {
        info!(plan = %plan.name, status = %from, "Plan already in requested state");
        return Ok(LifecycleReport {
            from,
            to: from,
            changed: false,
            hook: None,
        });
    }

    let allowed = match target {
        PlanLifecycle::Hold => from != PlanLifecycle::Finished,
        PlanLifecycle::Normal => from == PlanLifecycle::Hold,
        PlanLifecycle::Review => true,
        PlanLifecycle::Finished => from == PlanLifecycle::Review,
    };
    if !allowed {
        return Err(FlowError::LifecycleTransition {
            plan: plan.name.clone(),
            from,
            to: target,
        });
    }

    let hook = match target {
        PlanLifecycle::Review => {
            let run = run_hook(plan, ON_REVIEW_HOOK).await?;
            if let Some(run) = run.as_ref().filter(|r| !r.success()) {
                return Err(FlowError::HookFailed {
                    hook: run.name.clone(),
                    message: format!("exit code {}: {}", run.code, run.output),
                });
            }
            run
        }
        PlanLifecycle::Finished => {
            let run = match run_hook(plan, ON_FINISH_HOOK).await {
                Ok(run) => run,
                Err(e) => Some(HookRun {
                    name: ON_FINISH_HOOK.to_string(),
                    code: -1,
                    output: e.to_string(),
                }),
            };
            if let Some(run) = run.as_ref().filter(|r| !r.success()) {
                warn!(plan = %plan.name, code = run.code, output = %run.output, "on_finish hook failed");
            }
            run
        }
        PlanLifecycle::Hold | PlanLifecycle::Normal => None,
    };

    plan.config.status = target;
    save_plan_config(plan)?;
    info!(plan = %plan.name, %from, to = %target, "Plan lifecycle changed");

    Ok(LifecycleReport {
        from,
        to: target,
        changed: true,
        hook,
    })
}

/// Write the plan config back to its file
pub fn save_plan_config(plan: &Plan) -> FlowResult<()> {
    debug!(plan = %plan.name, "save_plan_config: called");
    let yaml = serde_yaml::to_string(&plan.config)
        .map_err(|e| FlowError::doc(PLAN_CONFIG_FILE, DocError::MalformedDocument(e.to_string())))?;
    jobdoc::write_atomic(&plan.config_path(), &yaml).map_err(|e| FlowError::doc(PLAN_CONFIG_FILE, e))
}

async fn run_hook(plan: &Plan, name: &str) -> FlowResult<Option<HookRun>> {
    let Some(template) = plan.config.hooks.get(name).filter(|t| !t.trim().is_empty()) else {
        debug!(hook = name, "run_hook: no hook configured");
        return Ok(None);
    };

    let hook_err = |message: String| FlowError::HookFailed {
        hook: name.to_string(),
        message,
    };

    let mut hbs = Handlebars::new();
    hbs.register_escape_fn(handlebars::no_escape);
    let command = hbs
        .render_template(
            template,
            &json!({
                "plan_name": plan.name,
                "plan_dir": plan.directory.display().to_string(),
                "note_ref": note_ref(plan),
            }),
        )
        .map_err(|e| hook_err(e.to_string()))?;

    debug!(hook = name, %command, "run_hook: running");
    let output = run_shell("sh", &command, &plan.directory, None)
        .await
        .map_err(|e| hook_err(e.to_string()))?;

    Ok(Some(HookRun {
        name: name.to_string(),
        code: output.code,
        output: output.combined(),
    }))
}

/// Note reference of the first job that carries one
fn note_ref(plan: &Plan) -> String {
    plan.jobs()
        .iter()
        .find_map(|job| job.extra.get("note_ref").and_then(|v| v.as_str()))
        .unwrap_or_default()
        .to_string()
}
