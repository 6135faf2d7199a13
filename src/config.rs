//! Scheduler configuration.
//!
//! Loaded with the `config` crate from an optional TOML file, then overridden
//! by `FORGELINE__*` environment variables (e.g.
//! `FORGELINE__TICK_INTERVAL_SECS=5`, `FORGELINE__TIMEOUTS__REVIEW_SECS=600`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{FeatureId, Stage, Tenant, TenantId};
use crate::timeout::StageTimeouts;

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "FORGELINE";

/// Default config file name looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "forgeline.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to render configuration: {0}")]
    Render(#[from] toml::ser::Error),
}

/// Retry policy for launching execution units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total launch attempts before giving up.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay_ms: u64,
    /// Upper bound for any single delay.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based), or
    /// `None` when the attempt budget is spent.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let exp = 1u64 << attempt.saturating_sub(1).min(30);
        let delay = self.base_delay_ms.saturating_mul(exp).min(self.max_delay_ms);
        Some(Duration::from_millis(delay))
    }
}

/// Command lines for the process execution backend, one per stage.
///
/// Each entry is a program followed by its arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerCommands {
    pub plan: Vec<String>,
    pub implement: Vec<String>,
    pub review: Vec<String>,
    pub verify: Vec<String>,
    /// Working directory for every worker; defaults to the current one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

impl WorkerCommands {
    pub fn for_stage(&self, stage: Stage) -> Option<&[String]> {
        let command = match stage {
            Stage::Plan => &self.plan,
            Stage::Implement => &self.implement,
            Stage::Review => &self.review,
            Stage::Verify => &self.verify,
            Stage::Done | Stage::Failed => return None,
        };
        if command.is_empty() {
            None
        } else {
            Some(command.as_slice())
        }
    }
}

/// GitHub settings for the pull-request collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitHubConfig {
    pub owner: String,
    pub repo: String,
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
}

fn default_base_branch() -> String {
    "main".to_string()
}

/// Top-level scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between scheduler ticks.
    pub tick_interval_secs: u64,
    /// Concurrency limit for tenants without an override.
    pub default_concurrency_limit: u32,
    /// Exit code a reviewer uses to request changes.
    pub changes_requested_exit_code: i32,
    /// Keep successful features in `awaiting-merge` until merge is confirmed.
    pub require_merge_confirmation: bool,
    /// Prefix for the branch name derived from a feature ID.
    pub branch_prefix: String,
    /// Directory holding the file store, run journal and metrics.
    pub state_dir: PathBuf,
    /// Days to keep run journals; 0 keeps them forever.
    pub evidence_retention_days: u64,
    /// Per-tenant concurrency overrides.
    pub tenant_limits: HashMap<String, u32>,
    pub timeouts: StageTimeouts,
    pub launch_retry: RetryPolicy,
    pub workers: WorkerCommands,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub github: Option<GitHubConfig>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 10,
            default_concurrency_limit: 2,
            changes_requested_exit_code: 2,
            require_merge_confirmation: false,
            branch_prefix: "feature/".to_string(),
            state_dir: PathBuf::from(".forgeline"),
            evidence_retention_days: 30,
            tenant_limits: HashMap::new(),
            timeouts: StageTimeouts::default(),
            launch_retry: RetryPolicy::default(),
            workers: WorkerCommands::default(),
            github: None,
        }
    }
}

impl SchedulerConfig {
    /// Load configuration from `path` (optional) and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        let settings = config::Config::builder()
            .add_source(config::File::from(file).required(path.is_some()))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let config: SchedulerConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the scheduler cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_concurrency_limit == 0 {
            return Err(ConfigError::Invalid(
                "default_concurrency_limit must be positive".to_string(),
            ));
        }
        if let Some((tenant, _)) = self.tenant_limits.iter().find(|(_, limit)| **limit == 0) {
            return Err(ConfigError::Invalid(format!(
                "tenant_limits.{} must be positive",
                tenant
            )));
        }
        if self.tick_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "tick_interval_secs must be positive".to_string(),
            ));
        }
        if self.launch_retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "launch_retry.max_attempts must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    /// Effective concurrency limit: config override, then the tenant's
    /// stored limit, then the default. Zero values are skipped.
    pub fn limit_for(&self, tenant: &Tenant) -> u32 {
        self.tenant_limits
            .get(tenant.id.as_str())
            .copied()
            .or(tenant.concurrency_limit)
            .filter(|limit| *limit > 0)
            .unwrap_or(self.default_concurrency_limit)
    }

    /// Branch a feature's work is pushed to.
    pub fn branch_for(&self, feature: &FeatureId) -> String {
        format!("{}{}", self.branch_prefix, feature)
    }

    pub fn with_tenant_limit(mut self, tenant: &TenantId, limit: u32) -> Self {
        self.tenant_limits.insert(tenant.to_string(), limit);
        self
    }

    pub fn with_timeouts(mut self, timeouts: StageTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_launch_retry(mut self, retry: RetryPolicy) -> Self {
        self.launch_retry = retry;
        self
    }

    /// Render this configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}
