//! Orchestrator Configuration
//!
//! Runtime knobs for the execution engine. Defaults are usable as-is; flow
//! files may override them through their `settings:` block.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default per-step timeout.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Default wake-up interval of the dispatcher loop.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Periodic checkpointing on a wall-clock interval.
#[derive(Debug, Clone, PartialEq)]
pub struct AutoCheckpoint {
    pub interval: Duration,
    pub path: PathBuf,
}

/// Execution settings shared by every run of an orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// Maximum concurrently running steps
    pub worker_limit: usize,
    /// Hard limit on a single step invocation
    pub step_timeout: Option<Duration>,
    /// Prune only the failed subtree instead of halting the flow
    pub continue_on_error: bool,
    /// Extra attempts after a failed invocation
    pub max_retries: u32,
    /// How often the dispatcher wakes to check timeouts and cancellation
    pub poll_interval: Duration,
    pub auto_checkpoint: Option<AutoCheckpoint>,
    /// Sample process CPU/memory during runs
    pub monitor_resources: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worker_limit: num_cpus::get().max(1),
            step_timeout: Some(DEFAULT_STEP_TIMEOUT),
            continue_on_error: false,
            max_retries: 0,
            poll_interval: DEFAULT_POLL_INTERVAL,
            auto_checkpoint: None,
            monitor_resources: false,
        }
    }
}

impl OrchestratorConfig {
    /// Sets the maximum number of parallel steps (at least one).
    pub fn set_worker_limit(&mut self, limit: usize) -> &mut Self {
        self.worker_limit = limit.max(1);
        self
    }

    pub fn set_step_timeout(&mut self, timeout: Option<Duration>) -> &mut Self {
        self.step_timeout = timeout;
        self
    }

    pub fn set_continue_on_error(&mut self, enabled: bool) -> &mut Self {
        self.continue_on_error = enabled;
        self
    }

    pub fn set_max_retries(&mut self, retries: u32) -> &mut Self {
        self.max_retries = retries;
        self
    }

    pub fn set_poll_interval(&mut self, interval: Duration) -> &mut Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Enables periodic checkpoints written to `path`.
    pub fn set_auto_checkpoint(&mut self, interval: Duration, path: impl Into<PathBuf>) -> &mut Self {
        self.auto_checkpoint = Some(AutoCheckpoint {
            interval,
            path: path.into(),
        });
        self
    }

    pub fn set_monitor_resources(&mut self, enabled: bool) -> &mut Self {
        self.monitor_resources = enabled;
        self
    }

    /// Applies overrides from a flow file.
    pub fn apply(&mut self, settings: &FlowSettings) -> &mut Self {
        if let Some(workers) = settings.workers {
            self.set_worker_limit(workers);
        }
        if let Some(secs) = settings.step_timeout_secs {
            self.step_timeout = if secs == 0 { None } else { Some(Duration::from_secs(secs)) };
        }
        if let Some(enabled) = settings.continue_on_error {
            self.continue_on_error = enabled;
        }
        if let Some(retries) = settings.max_retries {
            self.max_retries = retries;
        }
        if let Some(path) = &settings.checkpoint_path {
            let interval = settings
                .checkpoint_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(60));
            self.set_auto_checkpoint(interval, path.clone());
        }
        self
    }
}

/// Optional `settings:` block of a flow file.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FlowSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,
    /// Zero disables the timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continue_on_error: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_interval_secs: Option<u64>,
}

impl FlowSettings {
    pub fn is_empty(&self) -> bool {
        self == &FlowSettings::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert!(config.worker_limit >= 1);
        assert_eq!(config.step_timeout, Some(DEFAULT_STEP_TIMEOUT));
        assert!(!config.continue_on_error);
        assert_eq!(config.max_retries, 0);
        assert!(config.auto_checkpoint.is_none());
    }

    #[test]
    fn test_worker_limit_floor() {
        let mut config = OrchestratorConfig::default();
        config.set_worker_limit(0);
        assert_eq!(config.worker_limit, 1);
    }

    #[test]
    fn test_setters_chain() {
        let mut config = OrchestratorConfig::default();
        config
            .set_worker_limit(3)
            .set_continue_on_error(true)
            .set_max_retries(2)
            .set_step_timeout(None);

        assert_eq!(config.worker_limit, 3);
        assert!(config.continue_on_error);
        assert_eq!(config.max_retries, 2);
        assert!(config.step_timeout.is_none());
    }

    #[test]
    fn test_apply_settings() {
        let settings = FlowSettings {
            workers: Some(2),
            step_timeout_secs: Some(0),
            continue_on_error: Some(true),
            max_retries: Some(1),
            checkpoint_path: Some(PathBuf::from("run.ckpt")),
            checkpoint_interval_secs: Some(5),
        };

        let mut config = OrchestratorConfig::default();
        config.apply(&settings);

        assert_eq!(config.worker_limit, 2);
        assert!(config.step_timeout.is_none());
        assert!(config.continue_on_error);
        assert_eq!(config.max_retries, 1);
        assert_eq!(
            config.auto_checkpoint,
            Some(AutoCheckpoint {
                interval: Duration::from_secs(5),
                path: PathBuf::from("run.ckpt"),
            })
        );
    }

    #[test]
    fn test_empty_settings_change_nothing() {
        let settings = FlowSettings::default();
        assert!(settings.is_empty());

        let mut config = OrchestratorConfig::default();
        let before = config.clone();
        config.apply(&settings);
        assert_eq!(config, before);
    }

    #[test]
    fn test_settings_reject_unknown_keys() {
        let result: Result<FlowSettings, _> = serde_yaml::from_str("threads: 4\n");
        assert!(result.is_err());
    }
}
