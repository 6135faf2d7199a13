use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::model::{Feature, FeatureId, FeatureStatus, PipelineRun, RunId, Tenant, TenantId};

/// Snapshot of everything a store holds.
///
/// Both store implementations mutate this value under their own lock; the
/// file store additionally writes it to disk after each mutation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreState {
    #[serde(default)]
    pub tenants: BTreeMap<TenantId, Tenant>,
    #[serde(default)]
    pub features: BTreeMap<FeatureId, Feature>,
    #[serde(default)]
    pub runs: BTreeMap<RunId, PipelineRun>,
}

impl StoreState {
    pub fn list_tenants(&self) -> Vec<Tenant> {
        self.tenants.values().cloned().collect()
    }

    pub fn upsert_tenant(&mut self, tenant: &Tenant) {
        self.tenants.insert(tenant.id.clone(), tenant.clone());
    }

    pub fn list_features(&self, tenant: &TenantId, status: Option<FeatureStatus>) -> Vec<Feature> {
        self.features
            .values()
            .filter(|f| &f.tenant == tenant)
            .filter(|f| status.map_or(true, |s| f.status == s))
            .cloned()
            .collect()
    }

    pub fn insert_feature(&mut self, feature: &Feature) -> StoreResult<()> {
        if self.features.contains_key(&feature.id) {
            return Err(StoreError::DuplicateFeature(feature.id.clone()));
        }
        // Features may reference tenants that were never registered explicitly.
        self.tenants
            .entry(feature.tenant.clone())
            .or_insert_with(|| Tenant::new(feature.tenant.clone()));
        self.features.insert(feature.id.clone(), feature.clone());
        Ok(())
    }

    pub fn update_feature_status(
        &mut self,
        id: &FeatureId,
        status: FeatureStatus,
        reason: Option<String>,
    ) -> StoreResult<()> {
        let feature = self.feature_mut(id)?;
        feature.status = status;
        feature.failure_reason = reason;
        Ok(())
    }

    pub fn set_dependencies(&mut self, id: &FeatureId, depends_on: &[FeatureId]) -> StoreResult<()> {
        self.feature_mut(id)?.depends_on = depends_on.to_vec();
        Ok(())
    }

    pub fn set_pull_request(&mut self, id: &FeatureId, url: &str) -> StoreResult<()> {
        self.feature_mut(id)?.pull_request_url = Some(url.to_string());
        Ok(())
    }

    pub fn create_pipeline_run(&mut self, run: &PipelineRun) -> StoreResult<()> {
        if !self.features.contains_key(&run.feature) {
            return Err(StoreError::FeatureNotFound(run.feature.clone()));
        }
        if self.runs.contains_key(&run.id) {
            return Err(StoreError::DuplicateRun(run.id.to_string()));
        }
        self.runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    pub fn update_pipeline_run(&mut self, run: &PipelineRun) -> StoreResult<()> {
        let slot = self
            .runs
            .get_mut(&run.id)
            .ok_or_else(|| StoreError::RunNotFound(run.id.to_string()))?;
        *slot = run.clone();
        slot.updated_at = Utc::now();
        Ok(())
    }

    pub fn list_unfinished_pipeline_runs(&self) -> Vec<PipelineRun> {
        self.runs
            .values()
            .filter(|run| !run.is_finished())
            .cloned()
            .collect()
    }

    pub fn list_pipeline_runs(&self, feature: &FeatureId) -> Vec<PipelineRun> {
        let mut runs: Vec<PipelineRun> = self
            .runs
            .values()
            .filter(|run| &run.feature == feature)
            .cloned()
            .collect();
        runs.sort_by_key(|run| run.created_at);
        runs
    }

    fn feature_mut(&mut self, id: &FeatureId) -> StoreResult<&mut Feature> {
        self.features
            .get_mut(id)
            .ok_or_else(|| StoreError::FeatureNotFound(id.clone()))
    }
}
