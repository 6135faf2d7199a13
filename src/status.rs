//! Status snapshot exposed to dashboards and the CLI.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Feature, FeatureId, TenantId};

/// A feature as it appears in a status listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSummary {
    pub id: FeatureId,
    pub priority: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    /// Recorded failure reason, for failing features.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_request_url: Option<String>,
}

impl FeatureSummary {
    pub fn from_feature(feature: &Feature) -> Self {
        Self {
            id: feature.id.clone(),
            priority: feature.priority,
            title: feature.title.clone(),
            reason: feature.failure_reason.clone(),
            pull_request_url: feature.pull_request_url.clone(),
        }
    }
}

/// Scheduling view of one tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantStatus {
    pub tenant: TenantId,
    /// Effective concurrency limit.
    pub limit: u32,
    /// Unfinished pipeline runs.
    pub in_flight: u32,
    /// Features the next tick would try to admit, in admission order.
    pub ready: Vec<FeatureId>,
    pub running: Vec<FeatureSummary>,
    pub awaiting_merge: Vec<FeatureSummary>,
    pub failing: Vec<FeatureSummary>,
    /// Count of pending features, ready or blocked.
    pub pending: usize,
    pub passing: usize,
}

impl TenantStatus {
    /// Free slots, zero when over the limit.
    pub fn available_slots(&self) -> u32 {
        self.limit.saturating_sub(self.in_flight)
    }

    /// Pending features held back by unmet dependencies.
    pub fn blocked(&self) -> usize {
        self.pending.saturating_sub(self.ready.len())
    }
}

/// Response of `Scheduler::status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub generated_at: DateTime<Utc>,
    pub tenants: Vec<TenantStatus>,
}

impl SchedulerStatus {
    pub fn tenant(&self, id: &TenantId) -> Option<&TenantStatus> {
        self.tenants.iter().find(|t| &t.tenant == id)
    }
}

/// Render a status snapshot as plain text.
pub fn format_status(status: &SchedulerStatus) -> String {
    if status.tenants.is_empty() {
        return "No tenants.\n".to_string();
    }

    let mut output = String::new();
    for tenant in &status.tenants {
        output.push_str(&format!(
            "{}  {}/{} in flight, {} ready, {} blocked, {} passing\n",
            tenant.tenant,
            tenant.in_flight,
            tenant.limit,
            tenant.ready.len(),
            tenant.blocked(),
            tenant.passing
        ));
        if !tenant.ready.is_empty() {
            let ready: Vec<&str> = tenant.ready.iter().map(FeatureId::as_str).collect();
            output.push_str(&format!("  ready: {}\n", ready.join(", ")));
        }
        for feature in &tenant.running {
            output.push_str(&format!("  running: {}\n", feature.id));
        }
        for feature in &tenant.awaiting_merge {
            match &feature.pull_request_url {
                Some(url) => output.push_str(&format!("  awaiting merge: {} ({})\n", feature.id, url)),
                None => output.push_str(&format!("  awaiting merge: {}\n", feature.id)),
            }
        }
        for feature in &tenant.failing {
            output.push_str(&format!(
                "  failing: {} ({})\n",
                feature.id,
                feature.reason.as_deref().unwrap_or("no reason recorded")
            ));
        }
    }
    output
}
