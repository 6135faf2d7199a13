//! Persistent store contract.
//!
//! The scheduler never owns durable state itself: tenants, features and
//! pipeline runs live behind the `Store` trait. `MemoryStore` backs tests
//! and embedding; `FileStore` persists a JSON snapshot for the CLI.

mod file;
mod memory;
mod state;

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::model::{Feature, FeatureId, FeatureStatus, PipelineRun, Tenant, TenantId};

pub use file::FileStore;
pub use memory::MemoryStore;
pub use state::StoreState;

/// Storage abstraction consumed by the scheduling core.
#[async_trait]
pub trait Store: Send + Sync {
    // === Tenant operations ===

    /// List all tenants known to the system.
    async fn list_tenants(&self) -> StoreResult<Vec<Tenant>>;

    /// Create or replace a tenant.
    async fn upsert_tenant(&self, tenant: &Tenant) -> StoreResult<()>;

    // === Feature operations ===

    /// List a tenant's features, optionally filtered by status.
    async fn list_features(
        &self,
        tenant: &TenantId,
        status: Option<FeatureStatus>,
    ) -> StoreResult<Vec<Feature>>;

    /// Load a feature by ID.
    async fn get_feature(&self, id: &FeatureId) -> StoreResult<Option<Feature>>;

    /// Insert a new feature. Fails if the ID is taken.
    async fn insert_feature(&self, feature: &Feature) -> StoreResult<()>;

    /// Set a feature's status and recorded reason.
    async fn update_feature_status(
        &self,
        id: &FeatureId,
        status: FeatureStatus,
        reason: Option<String>,
    ) -> StoreResult<()>;

    /// Replace a feature's dependency list.
    async fn set_dependencies(&self, id: &FeatureId, depends_on: &[FeatureId]) -> StoreResult<()>;

    /// Record the pull request opened for a feature.
    async fn set_pull_request(&self, id: &FeatureId, url: &str) -> StoreResult<()>;

    // === Pipeline run operations ===

    /// Persist a newly created pipeline run.
    async fn create_pipeline_run(&self, run: &PipelineRun) -> StoreResult<()>;

    /// Overwrite an existing pipeline run.
    async fn update_pipeline_run(&self, run: &PipelineRun) -> StoreResult<()>;

    /// Runs whose stage is neither `done` nor `failed`.
    async fn list_unfinished_pipeline_runs(&self) -> StoreResult<Vec<PipelineRun>>;

    /// All runs recorded for a feature, oldest first.
    async fn list_pipeline_runs(&self, feature: &FeatureId) -> StoreResult<Vec<PipelineRun>>;
}
