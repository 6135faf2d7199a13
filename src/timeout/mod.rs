//! Stage timeout configuration.
//!
//! Each working stage has a maximum wall-clock duration. When a stage
//! worker exceeds it, the execution unit manager terminates the worker and
//! reports the unit as timed out. The poll interval controls how often a
//! running unit is checked.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::Stage;

/// Configuration for stage time limits and polling cadence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageTimeouts {
    /// Maximum time allowed for the plan stage.
    /// Default: 900 seconds (15 minutes)
    pub plan_secs: u64,

    /// Maximum time allowed for the implement stage.
    /// Default: 3600 seconds (60 minutes)
    pub implement_secs: u64,

    /// Maximum time allowed for the review stage.
    /// Default: 1200 seconds (20 minutes)
    pub review_secs: u64,

    /// Maximum time allowed for the verify stage.
    /// Default: 1800 seconds (30 minutes)
    pub verify_secs: u64,

    /// Interval between polls of a running execution unit.
    /// Default: 2000 milliseconds
    pub poll_interval_ms: u64,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            plan_secs: 900,
            implement_secs: 3600,
            review_secs: 1200,
            verify_secs: 1800,
            poll_interval_ms: 2000,
        }
    }
}

impl StageTimeouts {
    /// Creates a new StageTimeouts with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Maximum duration for `stage`. Terminal stages have no limit.
    pub fn for_stage(&self, stage: Stage) -> Option<Duration> {
        let secs = match stage {
            Stage::Plan => self.plan_secs,
            Stage::Implement => self.implement_secs,
            Stage::Review => self.review_secs,
            Stage::Verify => self.verify_secs,
            Stage::Done | Stage::Failed => return None,
        };
        Some(Duration::from_secs(secs))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Sets the same limit for every working stage.
    pub fn with_all_stages(mut self, timeout: Duration) -> Self {
        let secs = timeout.as_secs();
        self.plan_secs = secs;
        self.implement_secs = secs;
        self.review_secs = secs;
        self.verify_secs = secs;
        self
    }

    /// Sets the limit for a single stage.
    pub fn with_stage(mut self, stage: Stage, timeout: Duration) -> Self {
        let secs = timeout.as_secs();
        match stage {
            Stage::Plan => self.plan_secs = secs,
            Stage::Implement => self.implement_secs = secs,
            Stage::Review => self.review_secs = secs,
            Stage::Verify => self.verify_secs = secs,
            Stage::Done | Stage::Failed => {}
        }
        self
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }
}
