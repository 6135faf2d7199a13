use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Store, StoreState};
use crate::error::StoreResult;
use crate::model::{Feature, FeatureId, FeatureStatus, PipelineRun, Tenant, TenantId};

/// In-process store with no durability.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-populated with `state`.
    pub fn with_state(state: StoreState) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }

    /// Clone the current contents.
    pub async fn snapshot(&self) -> StoreState {
        self.state.read().await.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn list_tenants(&self) -> StoreResult<Vec<Tenant>> {
        Ok(self.state.read().await.list_tenants())
    }

    async fn upsert_tenant(&self, tenant: &Tenant) -> StoreResult<()> {
        self.state.write().await.upsert_tenant(tenant);
        Ok(())
    }

    async fn list_features(
        &self,
        tenant: &TenantId,
        status: Option<FeatureStatus>,
    ) -> StoreResult<Vec<Feature>> {
        Ok(self.state.read().await.list_features(tenant, status))
    }

    async fn get_feature(&self, id: &FeatureId) -> StoreResult<Option<Feature>> {
        Ok(self.state.read().await.features.get(id).cloned())
    }

    async fn insert_feature(&self, feature: &Feature) -> StoreResult<()> {
        self.state.write().await.insert_feature(feature)
    }

    async fn update_feature_status(
        &self,
        id: &FeatureId,
        status: FeatureStatus,
        reason: Option<String>,
    ) -> StoreResult<()> {
        self.state
            .write()
            .await
            .update_feature_status(id, status, reason)
    }

    async fn set_dependencies(&self, id: &FeatureId, depends_on: &[FeatureId]) -> StoreResult<()> {
        self.state.write().await.set_dependencies(id, depends_on)
    }

    async fn set_pull_request(&self, id: &FeatureId, url: &str) -> StoreResult<()> {
        self.state.write().await.set_pull_request(id, url)
    }

    async fn create_pipeline_run(&self, run: &PipelineRun) -> StoreResult<()> {
        self.state.write().await.create_pipeline_run(run)
    }

    async fn update_pipeline_run(&self, run: &PipelineRun) -> StoreResult<()> {
        self.state.write().await.update_pipeline_run(run)
    }

    async fn list_unfinished_pipeline_runs(&self) -> StoreResult<Vec<PipelineRun>> {
        Ok(self.state.read().await.list_unfinished_pipeline_runs())
    }

    async fn list_pipeline_runs(&self, feature: &FeatureId) -> StoreResult<Vec<PipelineRun>> {
        Ok(self.state.read().await.list_pipeline_runs(feature))
    }
}
