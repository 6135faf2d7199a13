//! forgeline: dependency-aware scheduling of feature work through a fixed
//! `plan → implement → review → verify` agent pipeline.
//!
//! The scheduler admits ready features per tenant under a concurrency limit
//! and drives each one through out-of-process stage workers. Storage, worker
//! execution and pull-request creation are collaborators behind traits.

pub mod config;
pub mod error;
pub mod evidence;
pub mod execution;
pub mod metrics;
pub mod model;
pub mod parallel;
pub mod pipeline;
pub mod pull_request;
pub mod reporter;
pub mod status;
pub mod store;
pub mod timeout;

pub use config::{ConfigError, RetryPolicy, SchedulerConfig, WorkerCommands};
pub use error::{CycleError, FailureReason, LaunchError, SchedulerError, StoreError};
pub use execution::{ExecutionBackend, ExecutionUnitManager, ProcessBackend, WorkerState};
pub use model::{
    Feature, FeatureId, FeatureStatus, PipelineRun, RunId, Stage, Tenant, TenantId, UnitHandle,
    UnitStatus,
};
pub use parallel::{ConcurrencyLimiter, DependencyResolver, Scheduler, TickSummary};
pub use pull_request::{DryRunPullRequests, GitHubPullRequests, PullRequestService};
pub use status::{format_status, SchedulerStatus};
pub use store::{FileStore, MemoryStore, Store};
pub use timeout::StageTimeouts;
