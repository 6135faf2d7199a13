//! Error types for the scheduling core.
//!
//! Collaborator failures (store, execution backend, PR service) each have
//! their own error type. `SchedulerError` is what the public entry points
//! return to callers.

pub mod classification;

use thiserror::Error;

use crate::model::{FeatureId, FeatureStatus, Stage, TenantId};

pub use classification::FailureReason;

/// A dependency edge was rejected because it would close a cycle.
///
/// `path` is the existing dependency chain from `depends_on` back to
/// `feature`; adding the edge would turn it into a loop.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("adding {feature} -> {depends_on} would create a cycle: {}", format_path(.path))]
pub struct CycleError {
    pub feature: FeatureId,
    pub depends_on: FeatureId,
    pub path: Vec<FeatureId>,
}

fn format_path(path: &[FeatureId]) -> String {
    path.iter()
        .map(FeatureId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// The execution backend could not start a worker after bounded retries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("failed to launch {stage} worker after {attempts} attempt(s): {message}")]
pub struct LaunchError {
    pub stage: Stage,
    pub attempts: u32,
    pub message: String,
}

/// Errors reported by an execution backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The backend is unreachable or refused to start a worker.
    #[error("execution backend unavailable: {0}")]
    Unavailable(String),

    /// No worker command is configured for the stage.
    #[error("no worker configured for stage {0}")]
    NotConfigured(Stage),

    /// Other backend failure.
    #[error("{0}")]
    Other(String),
}

/// Errors that can occur during store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Referenced feature does not exist.
    #[error("feature not found: {0}")]
    FeatureNotFound(FeatureId),

    /// Referenced pipeline run does not exist.
    #[error("pipeline run not found: {0}")]
    RunNotFound(String),

    /// Feature with the same ID already exists.
    #[error("feature already exists: {0}")]
    DuplicateFeature(FeatureId),

    /// Pipeline run with the same ID already exists.
    #[error("pipeline run already exists: {0}")]
    DuplicateRun(String),

    /// Another process holds the store lock and it could not be taken.
    #[error("store lock unavailable: {0}")]
    Lock(String),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors reported by the pull-request collaborator.
#[derive(Error, Debug)]
pub enum PullRequestError {
    #[error("GitHub API error: {0}")]
    GitHub(#[from] octocrab::Error),

    #[error("pull request service not configured: {0}")]
    NotConfigured(String),

    #[error("{0}")]
    Other(String),
}

/// Errors returned by the scheduler's public entry points.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error(transparent)]
    Cycle(#[from] CycleError),

    #[error("unknown feature: {0}")]
    UnknownFeature(FeatureId),

    #[error("unknown tenant: {0}")]
    UnknownTenant(TenantId),

    #[error("feature {0} already has a running pipeline")]
    AlreadyRunning(FeatureId),

    #[error("feature {feature} cannot move from {from} to {to}")]
    InvalidTransition {
        feature: FeatureId,
        from: FeatureStatus,
        to: FeatureStatus,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
