use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{FeatureId, RunId, TenantId};

/// Current journal schema version.
pub const EVIDENCE_SCHEMA_VERSION: u32 = 1;

/// Record kind for lifecycle events.
pub const LIFECYCLE_KIND: &str = "lifecycle";

/// One journal line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    pub schema_version: u32,
    pub run_id: RunId,
    pub recorded_at: DateTime<Utc>,
    /// Type of record (currently always "lifecycle").
    pub kind: String,
    pub payload: Value,
}

impl EvidenceRecord {
    pub fn new(run_id: RunId, kind: impl Into<String>, payload: Value) -> Self {
        Self {
            schema_version: EVIDENCE_SCHEMA_VERSION,
            run_id,
            recorded_at: Utc::now(),
            kind: kind.into(),
            payload,
        }
    }
}

/// Manifest (`run.json`) kept alongside a run's journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRunMetadata {
    pub schema_version: u32,
    pub run_id: RunId,
    pub feature_id: FeatureId,
    pub tenant_id: TenantId,
    pub created_at: DateTime<Utc>,
    /// Timestamp of the latest record.
    pub updated_at: DateTime<Utc>,
    pub record_count: u64,
    /// Final outcome (`done` or `failed`) once the run completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
}

impl EvidenceRunMetadata {
    pub fn new(
        run_id: RunId,
        feature_id: FeatureId,
        tenant_id: TenantId,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            schema_version: EVIDENCE_SCHEMA_VERSION,
            run_id,
            feature_id,
            tenant_id,
            created_at: timestamp,
            updated_at: timestamp,
            record_count: 0,
            outcome: None,
        }
    }

    /// Account for a newly appended record.
    pub fn record(&mut self, timestamp: DateTime<Utc>) {
        self.updated_at = timestamp;
        self.record_count = self.record_count.saturating_add(1);
    }

    pub fn is_complete(&self) -> bool {
        self.outcome.is_some()
    }
}
