//! Orchestrator settings derived from configuration and CLI overrides

use std::time::Duration;

use crate::config::{Config, SummaryConfig};

/// Settings for one orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Upper bound on jobs executing at once, never below one
    pub max_parallel_jobs: usize,

    /// Wait between polls while only other processes' jobs are running
    pub check_interval: Duration,

    /// Model applied to every job, ahead of job and plan settings
    pub model_override: Option<String>,

    /// Launches allowed per job within one `run_all`
    pub max_consecutive_steps: u32,

    /// Leave interactive agents out of `run_next` and `run_all`
    pub skip_interactive: bool,

    pub summary: SummaryConfig,

    /// Model when nothing else sets one
    pub default_model: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for OrchestratorConfig {
    fn from(config: &Config) -> Self {
        let section = &config.orchestrator;
        Self {
            max_parallel_jobs: section.max_parallel_jobs.max(1),
            check_interval: Duration::from_millis(section.check_interval_ms),
            model_override: section.model_override.clone(),
            max_consecutive_steps: section.max_consecutive_steps,
            skip_interactive: section.skip_interactive,
            summary: section.summary.clone(),
            default_model: config.executors.default_model.clone(),
        }
    }
}

impl OrchestratorConfig {
    /// Override the parallelism bound
    pub fn with_parallel(mut self, max_parallel_jobs: usize) -> Self {
        self.max_parallel_jobs = max_parallel_jobs.max(1);
        self
    }

    /// Force one model for every job
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model_override = Some(model.into());
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_skip_interactive(mut self, skip: bool) -> Self {
        self.skip_interactive = skip;
        self
    }

    pub fn with_max_consecutive_steps(mut self, steps: u32) -> Self {
        self.max_consecutive_steps = steps;
        self
    }

    /// Effective model: override, then job/plan setting, then default
    pub fn resolve_model(&self, configured: Option<&str>) -> String {
        self.model_override
            .as_deref()
            .or(configured)
            .unwrap_or(&self.default_model)
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.max_parallel_jobs, 3);
        assert_eq!(config.check_interval, Duration::from_secs(5));
        assert_eq!(config.max_consecutive_steps, 20);
        assert!(!config.skip_interactive);
        assert!(config.model_override.is_none());
    }

    #[test]
    fn test_parallel_never_zero() {
        let mut config = Config::default();
        config.orchestrator.max_parallel_jobs = 0;
        assert_eq!(OrchestratorConfig::from(&config).max_parallel_jobs, 1);
        assert_eq!(OrchestratorConfig::default().with_parallel(0).max_parallel_jobs, 1);
    }

    #[test]
    fn test_resolve_model_precedence() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.resolve_model(None), "claude-sonnet-4");
        assert_eq!(config.resolve_model(Some("haiku")), "haiku");

        let config = config.with_model("opus");
        assert_eq!(config.resolve_model(Some("haiku")), "opus");
    }
}
