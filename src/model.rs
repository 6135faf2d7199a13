//! Domain types shared by every scheduling component.
//!
//! Features, tenants, pipeline runs and execution units are plain serde
//! values. The store owns their persisted form; the scheduler, the pipeline
//! state machine and the outcome reporter pass them around by value.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Create an identifier from any string-like value.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Stable identifier of a feature.
    FeatureId
);
string_id!(
    /// Identifier of a tenant (project).
    TenantId
);
string_id!(
    /// Identifier of one pipeline run.
    RunId
);
string_id!(
    /// Opaque handle of an execution unit, issued by the execution backend.
    UnitHandle
);

impl RunId {
    /// Generate a run ID from the feature, a timestamp and a random suffix.
    pub fn generate(feature: &FeatureId) -> Self {
        let millis = Utc::now().timestamp_millis();
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("run-{}-{}-{}", feature, millis, &suffix[..12]))
    }
}

/// Lifecycle status of a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FeatureStatus {
    Pending,
    Running,
    AwaitingMerge,
    Passing,
    Failing,
}

impl FeatureStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureStatus::Pending => "pending",
            FeatureStatus::Running => "running",
            FeatureStatus::AwaitingMerge => "awaiting-merge",
            FeatureStatus::Passing => "passing",
            FeatureStatus::Failing => "failing",
        }
    }
}

impl fmt::Display for FeatureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A schedulable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    /// Feature identifier.
    pub id: FeatureId,
    /// Owning tenant.
    pub tenant: TenantId,
    /// Human readable title, used for PR summaries.
    #[serde(default)]
    pub title: String,
    /// Current lifecycle status.
    pub status: FeatureStatus,
    /// Features this one depends on, in insertion order.
    #[serde(default)]
    pub depends_on: Vec<FeatureId>,
    /// Scheduling priority (lower value is scheduled first).
    #[serde(default)]
    pub priority: i32,
    /// Creation timestamp, used to break priority ties.
    pub created_at: DateTime<Utc>,
    /// Reason recorded with the last failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// URL of the pull request opened on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_request_url: Option<String>,
}

impl Feature {
    /// Create a pending feature with no dependencies.
    pub fn new(id: impl Into<FeatureId>, tenant: impl Into<TenantId>, priority: i32) -> Self {
        Self {
            id: id.into(),
            tenant: tenant.into(),
            title: String::new(),
            status: FeatureStatus::Pending,
            depends_on: Vec::new(),
            priority,
            created_at: Utc::now(),
            failure_reason: None,
            pull_request_url: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_dependencies(mut self, depends_on: Vec<FeatureId>) -> Self {
        self.depends_on = depends_on;
        self
    }

    pub fn with_status(mut self, status: FeatureStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}

/// A tenant (project): the concurrency scoping boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    /// Stored concurrency limit; `None` falls back to the configured default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency_limit: Option<u32>,
}

impl Tenant {
    pub fn new(id: impl Into<TenantId>) -> Self {
        Self {
            id: id.into(),
            concurrency_limit: None,
        }
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.concurrency_limit = Some(limit);
        self
    }
}

/// Stage of a pipeline run.
///
/// The four working stages run strictly in order; `Done` and `Failed` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Plan,
    Implement,
    Review,
    Verify,
    Done,
    Failed,
}

impl Stage {
    /// The working stages, in execution order.
    pub const WORKING: [Stage; 4] = [Stage::Plan, Stage::Implement, Stage::Review, Stage::Verify];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Plan => "plan",
            Stage::Implement => "implement",
            Stage::Review => "review",
            Stage::Verify => "verify",
            Stage::Done => "done",
            Stage::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Done | Stage::Failed)
    }

    /// The stage entered after this one succeeds.
    pub fn next(&self) -> Stage {
        match self {
            Stage::Plan => Stage::Implement,
            Stage::Implement => Stage::Review,
            Stage::Review => Stage::Verify,
            Stage::Verify => Stage::Done,
            Stage::Done => Stage::Done,
            Stage::Failed => Stage::Failed,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of one execution unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Launching,
    Running,
    Succeeded,
    Rejected,
    Errored,
    TimedOut,
}

impl UnitStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UnitStatus::Succeeded | UnitStatus::Rejected | UnitStatus::Errored | UnitStatus::TimedOut
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UnitStatus::Launching => "launching",
            UnitStatus::Running => "running",
            UnitStatus::Succeeded => "succeeded",
            UnitStatus::Rejected => "rejected",
            UnitStatus::Errored => "errored",
            UnitStatus::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters handed to a stage worker at launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchParams {
    pub run_id: RunId,
    pub feature: FeatureId,
    pub tenant: TenantId,
    /// Reviewer feedback carried into a rework `implement` invocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

/// Observed state of an execution unit at one poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitReport {
    pub handle: UnitHandle,
    pub stage: Stage,
    pub status: UnitStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Captured worker output, if the backend provides it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// The backend no longer knows the worker.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub lost: bool,
}

impl UnitReport {
    pub fn new(handle: UnitHandle, stage: Stage, status: UnitStatus) -> Self {
        Self {
            handle,
            stage,
            status,
            exit_code: None,
            output: None,
            lost: false,
        }
    }
}

/// Record of one finished stage attempt within a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageAttempt {
    pub stage: Stage,
    pub handle: Option<UnitHandle>,
    pub status: UnitStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// One feature's traversal of the stage sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: RunId,
    pub feature: FeatureId,
    pub tenant: TenantId,
    pub stage: Stage,
    /// Set once the single review → implement back-edge has fired.
    pub rework_used: bool,
    /// Reviewer feedback pending delivery to the next `implement` launch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    /// Handle of the execution unit for the current stage, once launched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_unit: Option<UnitHandle>,
    /// When the current stage was entered.
    pub stage_started_at: DateTime<Utc>,
    /// Finished stage attempts, oldest first.
    #[serde(default)]
    pub attempts: Vec<StageAttempt>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl PipelineRun {
    /// Create a run for a freshly admitted feature, positioned at `plan`.
    pub fn new(feature: &Feature) -> Self {
        let now = Utc::now();
        Self {
            id: RunId::generate(&feature.id),
            feature: feature.id.clone(),
            tenant: feature.tenant.clone(),
            stage: Stage::Plan,
            rework_used: false,
            feedback: None,
            active_unit: None,
            stage_started_at: now,
            attempts: Vec::new(),
            created_at: now,
            updated_at: now,
            finished_at: None,
            failure_reason: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.stage.is_terminal()
    }

    pub fn launch_params(&self) -> LaunchParams {
        LaunchParams {
            run_id: self.id.clone(),
            feature: self.feature.clone(),
            tenant: self.tenant.clone(),
            feedback: self.feedback.clone(),
        }
    }

    /// Move to `stage`, clearing the active unit.
    pub fn enter(&mut self, stage: Stage) {
        let now = Utc::now();
        self.stage = stage;
        self.active_unit = None;
        self.stage_started_at = now;
        self.updated_at = now;
        if stage.is_terminal() {
            self.finished_at = Some(now);
        }
    }
}
