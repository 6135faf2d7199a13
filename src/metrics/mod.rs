//! Scheduler metrics.
//!
//! Counts admissions, deferrals, pipeline outcomes and reworks, and keeps
//! per-stage duration statistics. The collector is shared by the scheduler
//! and every pipeline task.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::model::{Stage, TenantId, UnitStatus};

/// Duration statistics for one stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageDurationStats {
    /// Number of samples
    pub count: u32,
    /// Mean duration
    pub mean: Duration,
    /// Minimum duration
    pub min: Duration,
    /// Maximum duration
    pub max: Duration,
    /// Sum of all durations (for calculating mean)
    pub total: Duration,
}

impl StageDurationStats {
    /// Add a new duration sample.
    pub fn add_sample(&mut self, duration: Duration) {
        self.count += 1;
        self.total += duration;
        self.mean = self.total / self.count;

        if self.count == 1 {
            self.min = duration;
            self.max = duration;
        } else {
            self.min = self.min.min(duration);
            self.max = self.max.max(duration);
        }
    }
}

/// Per-tenant counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TenantCounters {
    pub admitted: u32,
    pub deferred: u32,
    pub done: u32,
    pub failed: u32,
}

/// Aggregated scheduler metrics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerMetrics {
    /// Scheduler ticks completed
    pub ticks: u64,
    /// Pipelines admitted (including restart recoveries)
    pub pipelines_admitted: u32,
    /// Ready features left pending because their tenant was at its limit
    pub admissions_deferred: u32,
    /// Pipelines that reached `done`
    pub pipelines_done: u32,
    /// Pipelines that reached `failed`
    pub pipelines_failed: u32,
    /// Review → implement back-edges taken
    pub reworks: u32,
    /// Failures by reason label
    pub failure_frequency: BTreeMap<String, u32>,
    /// Stage durations keyed by stage name
    pub stage_durations: BTreeMap<String, StageDurationStats>,
    /// Stage attempts by terminal unit status
    pub unit_outcomes: BTreeMap<String, u32>,
    /// Counters per tenant
    pub tenants: BTreeMap<String, TenantCounters>,
    /// Sum of wall-clock time of finished pipelines
    pub total_pipeline_time: Duration,
}

impl SchedulerMetrics {
    /// Share of finished pipelines that reached `done`.
    pub fn success_rate(&self) -> f64 {
        let finished = self.pipelines_done + self.pipelines_failed;
        if finished == 0 {
            return 0.0;
        }
        self.pipelines_done as f64 / finished as f64
    }

    /// The most frequent failure reason label.
    pub fn most_common_failure(&self) -> Option<&str> {
        self.failure_frequency
            .iter()
            .max_by_key(|(_, count)| *count)
            .map(|(label, _)| label.as_str())
    }

    /// The stage with the highest mean duration.
    pub fn slowest_stage(&self) -> Option<&str> {
        self.stage_durations
            .iter()
            .max_by_key(|(_, stats)| stats.mean)
            .map(|(name, _)| name.as_str())
    }

    fn tenant(&mut self, tenant: &TenantId) -> &mut TenantCounters {
        self.tenants.entry(tenant.to_string()).or_default()
    }
}

/// Thread-safe metrics collector.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    inner: Arc<RwLock<SchedulerMetrics>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, f: impl FnOnce(&mut SchedulerMetrics)) {
        if let Ok(mut metrics) = self.inner.write() {
            f(&mut metrics);
        }
    }

    pub fn record_tick(&self) {
        self.update(|m| m.ticks += 1);
    }

    pub fn record_admission(&self, tenant: &TenantId) {
        self.update(|m| {
            m.pipelines_admitted += 1;
            m.tenant(tenant).admitted += 1;
        });
    }

    pub fn record_deferral(&self, tenant: &TenantId) {
        self.update(|m| {
            m.admissions_deferred += 1;
            m.tenant(tenant).deferred += 1;
        });
    }

    /// Record one finished stage attempt.
    pub fn record_stage(&self, stage: Stage, status: UnitStatus, duration: Duration) {
        self.update(|m| {
            m.stage_durations
                .entry(stage.as_str().to_string())
                .or_default()
                .add_sample(duration);
            *m.unit_outcomes.entry(status.as_str().to_string()).or_insert(0) += 1;
        });
    }

    pub fn record_rework(&self) {
        self.update(|m| m.reworks += 1);
    }

    /// Record a pipeline reaching a terminal stage. `failure` is the reason
    /// label for failed pipelines.
    pub fn record_outcome(&self, tenant: &TenantId, failure: Option<&str>, duration: Duration) {
        self.update(|m| {
            m.total_pipeline_time += duration;
            match failure {
                None => {
                    m.pipelines_done += 1;
                    m.tenant(tenant).done += 1;
                }
                Some(label) => {
                    m.pipelines_failed += 1;
                    m.tenant(tenant).failed += 1;
                    *m.failure_frequency.entry(label.to_string()).or_insert(0) += 1;
                }
            }
        });
    }

    /// Copy of the current metrics.
    pub fn snapshot(&self) -> SchedulerMetrics {
        self.inner
            .read()
            .map(|metrics| metrics.clone())
            .unwrap_or_default()
    }
}

/// Stores metrics snapshots on disk under `<state_dir>/metrics`.
#[derive(Debug, Clone)]
pub struct MetricsStore {
    dir: PathBuf,
}

impl MetricsStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = state_dir.into().join("metrics");
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Save a snapshot as `<name>.json`.
    pub fn save(&self, name: &str, metrics: &SchedulerMetrics) -> io::Result<PathBuf> {
        let path = self.dir.join(format!("{}.json", name));
        let temp_path = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(metrics).map_err(io::Error::other)?;
        let mut file = std::fs::File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        std::fs::rename(&temp_path, &path)?;
        Ok(path)
    }

    pub fn load(&self, name: &str) -> io::Result<Option<SchedulerMetrics>> {
        let path = self.dir.join(format!("{}.json", name));
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                let metrics = serde_json::from_str(&contents).map_err(io::Error::other)?;
                Ok(Some(metrics))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// Format metrics for display.
pub fn format_metrics(metrics: &SchedulerMetrics) -> String {
    let mut output = String::from("## Scheduler Metrics\n\n");

    output.push_str("### Summary\n");
    output.push_str(&format!("- **Ticks**: {}\n", metrics.ticks));
    output.push_str(&format!(
        "- **Pipelines**: {} admitted, {} done, {} failed\n",
        metrics.pipelines_admitted, metrics.pipelines_done, metrics.pipelines_failed
    ));
    output.push_str(&format!(
        "- **Success Rate**: {:.1}%\n",
        metrics.success_rate() * 100.0
    ));
    output.push_str(&format!("- **Reworks**: {}\n", metrics.reworks));
    output.push_str(&format!(
        "- **Deferred Admissions**: {}\n",
        metrics.admissions_deferred
    ));
    output.push_str(&format!(
        "- **Total Pipeline Time**: {:.1}s\n",
        metrics.total_pipeline_time.as_secs_f64()
    ));

    if !metrics.stage_durations.is_empty() {
        output.push_str("\n### Stage Durations\n");
        for (stage, stats) in &metrics.stage_durations {
            output.push_str(&format!(
                "- **{}**: mean={:.2}s, min={:.2}s, max={:.2}s (n={})\n",
                stage,
                stats.mean.as_secs_f64(),
                stats.min.as_secs_f64(),
                stats.max.as_secs_f64(),
                stats.count
            ));
        }
    }

    if !metrics.failure_frequency.is_empty() {
        output.push_str("\n### Failure Reasons\n");
        let mut failures: Vec<_> = metrics.failure_frequency.iter().collect();
        failures.sort_by(|a, b| b.1.cmp(a.1));
        for (label, count) in failures {
            output.push_str(&format!("- **{}**: {} occurrences\n", label, count));
        }
    }

    if !metrics.tenants.is_empty() {
        output.push_str("\n### Tenants\n");
        for (tenant, counters) in &metrics.tenants {
            output.push_str(&format!(
                "- **{}**: {} admitted, {} deferred, {} done, {} failed\n",
                tenant, counters.admitted, counters.deferred, counters.done, counters.failed
            ));
        }
    }

    output
}
