use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{FeatureId, RunId, Stage};

const SCHEMA_VERSION: &str = "v1";

/// Lifecycle event types for a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEventType {
    PipelineStart,
    Stage,
    PipelineComplete,
}

/// Lifecycle event payload stored in the run journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub schema_version: String,
    pub event_type: LifecycleEventType,
    pub timestamp: String,
    pub run_id: RunId,
    pub feature_id: FeatureId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl LifecycleEvent {
    pub fn new(event_type: LifecycleEventType, run_id: RunId, feature_id: FeatureId) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            event_type,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            run_id,
            feature_id,
            stage: None,
            status: None,
            exit_code: None,
            error_type: None,
            error_message: None,
        }
    }
}
