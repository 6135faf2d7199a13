//! Outcome reporter.
//!
//! Persists the terminal result of a pipeline run and, on success, asks the
//! pull-request collaborator to open a PR. Both paths give the tenant's
//! concurrency slot back as their very last step. After a restart it also
//! settles features whose run finished before the outcome was recorded.

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::config::SchedulerConfig;
use crate::error::{FailureReason, StoreError};
use crate::metrics::MetricsCollector;
use crate::model::{Feature, FeatureStatus, PipelineRun, Stage};
use crate::parallel::SlotTicket;
use crate::pull_request::PullRequestService;
use crate::store::Store;

pub struct OutcomeReporter {
    store: Arc<dyn Store>,
    pull_requests: Arc<dyn PullRequestService>,
    config: SchedulerConfig,
    metrics: MetricsCollector,
}

impl OutcomeReporter {
    pub fn new(
        store: Arc<dyn Store>,
        pull_requests: Arc<dyn PullRequestService>,
        config: &SchedulerConfig,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            store,
            pull_requests,
            config: config.clone(),
            metrics,
        }
    }

    /// Record a successful run and open its pull request.
    ///
    /// The feature sits in `awaiting-merge` while the PR is requested, then
    /// moves to `passing` unless merge confirmation is required. A failed PR
    /// request is logged and does not hold the feature back.
    pub async fn on_pipeline_done(&self, run: &PipelineRun, ticket: SlotTicket) -> FeatureStatus {
        let status = self.record_done(run).await;
        self.metrics
            .record_outcome(&run.tenant, None, run_duration(run));
        info!(feature = %run.feature, run_id = %run.id, status = %status, "pipeline done");
        drop(ticket);
        status
    }

    /// Record a failed run with its reason.
    pub async fn on_pipeline_failed(
        &self,
        run: &PipelineRun,
        reason: &FailureReason,
        ticket: SlotTicket,
    ) {
        let feature = &run.feature;
        if let Err(err) = self
            .store
            .update_feature_status(feature, FeatureStatus::Failing, Some(reason.to_string()))
            .await
        {
            error!(feature = %feature, "failed to record failure: {}", err);
        }
        self.metrics
            .record_outcome(&run.tenant, Some(reason.label()), run_duration(run));
        info!(feature = %feature, run_id = %run.id, reason = %reason, "pipeline failed");
        drop(ticket);
    }

    /// Apply the outcome of `run`, already finished, to a feature still
    /// marked `running`.
    ///
    /// A done run whose pull request was already recorded only gets its
    /// final status; otherwise the PR is requested as in `on_pipeline_done`.
    pub async fn settle_finished_run(
        &self,
        run: &PipelineRun,
        feature: &Feature,
    ) -> Result<FeatureStatus, StoreError> {
        match run.stage {
            Stage::Done if feature.pull_request_url.is_some() => {
                let status = self.final_status();
                self.store
                    .update_feature_status(&feature.id, status, None)
                    .await?;
                Ok(status)
            }
            Stage::Done => Ok(self.record_done(run).await),
            _ => {
                let reason = run
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "pipeline failed before restart".to_string());
                self.store
                    .update_feature_status(&feature.id, FeatureStatus::Failing, Some(reason))
                    .await?;
                Ok(FeatureStatus::Failing)
            }
        }
    }

    fn final_status(&self) -> FeatureStatus {
        if self.config.require_merge_confirmation {
            FeatureStatus::AwaitingMerge
        } else {
            FeatureStatus::Passing
        }
    }

    async fn record_done(&self, run: &PipelineRun) -> FeatureStatus {
        let feature = &run.feature;
        if let Err(err) = self
            .store
            .update_feature_status(feature, FeatureStatus::AwaitingMerge, None)
            .await
        {
            error!(feature = %feature, "failed to record awaiting-merge: {}", err);
        }

        let branch = self.config.branch_for(feature);
        let summary = self.summary(run).await;
        match self
            .pull_requests
            .create_pull_request(feature, &branch, &summary)
            .await
        {
            Ok(url) => {
                if let Err(err) = self.store.set_pull_request(feature, &url).await {
                    warn!(feature = %feature, "failed to record pull request URL: {}", err);
                }
            }
            Err(err) => {
                warn!(feature = %feature, branch = %branch, "pull request creation failed: {}", err);
            }
        }

        let status = self.final_status();
        if status == FeatureStatus::Passing {
            if let Err(err) = self
                .store
                .update_feature_status(feature, FeatureStatus::Passing, None)
                .await
            {
                error!(feature = %feature, "failed to record passing: {}", err);
            }
        }
        status
    }

    async fn summary(&self, run: &PipelineRun) -> String {
        let title = match self.store.get_feature(&run.feature).await {
            Ok(Some(feature)) if !feature.title.is_empty() => feature.title,
            _ => format!("Feature {}", run.feature),
        };
        format!(
            "{}\n\nFeature {} for tenant {} passed plan, implement, review and verify.\nRework used: {}\nRun: {}",
            title,
            run.feature,
            run.tenant,
            if run.rework_used { "yes" } else { "no" },
            run.id
        )
    }
}

fn run_duration(run: &PipelineRun) -> std::time::Duration {
    let end = run.finished_at.unwrap_or_else(Utc::now);
    (end - run.created_at).to_std().unwrap_or_default()
}
