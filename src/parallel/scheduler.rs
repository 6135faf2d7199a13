//! Scheduler loop.
//!
//! Each tick walks every tenant, asks the dependency resolver for the ready
//! set and the concurrency limiter for admission, and spawns one pipeline
//! task per admitted feature. Pipeline tasks run independently of the tick;
//! the scheduler only keeps a cancel sender and a join handle for each.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::evidence::EvidenceStore;
use crate::execution::{ExecutionBackend, ExecutionUnitManager};
use crate::metrics::{MetricsCollector, SchedulerMetrics};
use crate::model::{Feature, FeatureId, FeatureStatus, PipelineRun, RunId, Stage, Tenant, TenantId};
use crate::parallel::dependency::DependencyResolver;
use crate::parallel::limiter::{Admission, ConcurrencyLimiter, SlotTicket};
use crate::pipeline::{PipelineContext, PipelineStateMachine};
use crate::pull_request::PullRequestService;
use crate::reporter::OutcomeReporter;
use crate::status::{FeatureSummary, SchedulerStatus, TenantStatus};
use crate::store::Store;

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Features admitted and started, in admission order.
    pub admitted: Vec<FeatureId>,
    /// Ready features left pending because their tenant was at its limit.
    pub deferred: Vec<FeatureId>,
    /// Tenants whose processing failed this tick.
    pub failed_tenants: Vec<TenantId>,
}

/// A live pipeline task.
struct ActivePipeline {
    run_id: RunId,
    cancel_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

type ActiveMap = Arc<Mutex<HashMap<FeatureId, ActivePipeline>>>;

/// Top-level driver of the scheduling core.
pub struct Scheduler {
    /// Scheduler configuration
    config: SchedulerConfig,
    store: Arc<dyn Store>,
    /// Dependency graph shared with dependency edits
    resolver: Arc<DependencyResolver>,
    /// Per-tenant admission control
    limiter: ConcurrencyLimiter,
    /// Collaborators handed to every pipeline task
    ctx: Arc<PipelineContext>,
    metrics: MetricsCollector,
    /// Pipelines started by this scheduler that have not finished yet
    active: ActiveMap,
}

impl Scheduler {
    /// Create a scheduler over the given collaborators.
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn Store>,
        backend: Arc<dyn ExecutionBackend>,
        pull_requests: Arc<dyn PullRequestService>,
    ) -> Self {
        let metrics = MetricsCollector::new();
        let units = Arc::new(ExecutionUnitManager::new(
            backend,
            config.timeouts.clone(),
            config.launch_retry.clone(),
            config.changes_requested_exit_code,
        ));
        let reporter = Arc::new(OutcomeReporter::new(
            store.clone(),
            pull_requests,
            &config,
            metrics.clone(),
        ));
        let ctx = Arc::new(PipelineContext {
            store: store.clone(),
            units,
            reporter,
            metrics: metrics.clone(),
            evidence: None,
        });

        Self {
            limiter: ConcurrencyLimiter::new(config.default_concurrency_limit),
            resolver: Arc::new(DependencyResolver::new(store.clone())),
            config,
            store,
            ctx,
            metrics,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Journal every pipeline run to `evidence`.
    ///
    /// Must be called before the scheduler starts any pipeline.
    pub fn with_evidence(mut self, evidence: EvidenceStore) -> Self {
        match Arc::get_mut(&mut self.ctx) {
            Some(ctx) => ctx.evidence = Some(evidence),
            None => warn!("pipelines already started, run journal not attached"),
        }
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    pub fn resolver(&self) -> &DependencyResolver {
        &self.resolver
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        self.metrics.snapshot()
    }

    /// Number of pipeline tasks still running.
    pub fn active_count(&self) -> usize {
        self.active.lock().map(|active| active.len()).unwrap_or(0)
    }

    pub fn is_active(&self, feature: &FeatureId) -> bool {
        self.active
            .lock()
            .map(|active| active.contains_key(feature))
            .unwrap_or(false)
    }

    /// Resume from persisted state. Call once before the first tick.
    ///
    /// In-flight counts are rebuilt from unfinished pipeline runs, and each
    /// of those runs is resumed, reattaching to its recorded execution unit
    /// instead of launching a new one. A `running` feature without an
    /// unfinished run takes the outcome of its latest finished run, or goes
    /// back to `pending` when it has none. Returns the number of resumed
    /// runs.
    pub async fn recover(&self) -> Result<usize, SchedulerError> {
        self.resolver.load().await?;
        let tenants = self.store.list_tenants().await?;
        for tenant in &tenants {
            self.limiter
                .configure(&tenant.id, self.config.limit_for(tenant));
        }

        if let Some(evidence) = &self.ctx.evidence {
            match evidence.enforce_retention() {
                Ok(0) => {}
                Ok(deleted) => info!(deleted, "pruned expired run journals"),
                Err(err) => warn!("failed to prune run journals: {}", err),
            }
        }

        let runs = self.store.list_unfinished_pipeline_runs().await?;
        let mut resumed = 0;
        for run in &runs {
            if self.is_active(&run.feature) {
                continue;
            }
            let ticket = self.limiter.reclaim(&run.tenant);
            if let Err(err) = self
                .store
                .update_feature_status(&run.feature, FeatureStatus::Running, None)
                .await
            {
                warn!(feature = %run.feature, "failed to mark resumed feature running: {}", err);
            }
            info!(
                feature = %run.feature,
                run_id = %run.id,
                stage = %run.stage,
                reattach = run.active_unit.is_some(),
                "resuming pipeline run"
            );
            self.metrics.record_admission(&run.tenant);
            self.spawn_pipeline(run.clone(), ticket);
            resumed += 1;
        }

        for tenant in &tenants {
            let running = self
                .store
                .list_features(&tenant.id, Some(FeatureStatus::Running))
                .await?;
            for feature in running {
                if runs.iter().any(|run| run.feature == feature.id) || self.is_active(&feature.id) {
                    continue;
                }
                let latest = self.store.list_pipeline_runs(&feature.id).await?.pop();
                if let Some(run) = latest.filter(|run| run.is_finished()) {
                    let status = self.ctx.reporter.settle_finished_run(&run, &feature).await?;
                    warn!(
                        feature = %feature.id,
                        run_id = %run.id,
                        status = %status,
                        "running feature's run had already finished, applied its outcome"
                    );
                    continue;
                }
                warn!(
                    feature = %feature.id,
                    "running feature has no unfinished pipeline run, resetting to pending"
                );
                self.store
                    .update_feature_status(&feature.id, FeatureStatus::Pending, None)
                    .await?;
            }
        }

        Ok(resumed)
    }

    /// Run one scheduling pass over every tenant.
    ///
    /// A failure while processing one tenant or one feature is logged and
    /// does not stop the rest of the pass.
    pub async fn tick(&self) -> Result<TickSummary, SchedulerError> {
        self.metrics.record_tick();
        let tenants = self.store.list_tenants().await?;

        let mut by_tenant: Vec<(Tenant, Vec<Feature>)> = Vec::with_capacity(tenants.len());
        let mut summary = TickSummary::default();
        for tenant in tenants {
            match self.store.list_features(&tenant.id, None).await {
                Ok(features) => by_tenant.push((tenant, features)),
                Err(err) => {
                    warn!(tenant = %tenant.id, "failed to list features: {}", err);
                    summary.failed_tenants.push(tenant.id);
                }
            }
        }

        let all: Vec<Feature> = by_tenant
            .iter()
            .flat_map(|(_, features)| features.iter().cloned())
            .collect();
        self.resolver.sync(&all).await;
        let statuses: HashMap<FeatureId, FeatureStatus> =
            all.iter().map(|f| (f.id.clone(), f.status)).collect();

        for (tenant, features) in &by_tenant {
            self.tick_tenant(tenant, features, &statuses, &mut summary)
                .await;
        }

        if !summary.admitted.is_empty() || !summary.deferred.is_empty() {
            debug!(
                admitted = summary.admitted.len(),
                deferred = summary.deferred.len(),
                "tick complete"
            );
        }
        Ok(summary)
    }

    async fn tick_tenant(
        &self,
        tenant: &Tenant,
        features: &[Feature],
        statuses: &HashMap<FeatureId, FeatureStatus>,
        summary: &mut TickSummary,
    ) {
        self.limiter
            .configure(&tenant.id, self.config.limit_for(tenant));
        let ready = self.resolver.ready_set(&tenant.id, features, statuses).await;

        let mut candidates = ready
            .into_iter()
            .filter(|feature| !self.is_active(&feature.id));
        while let Some(feature) = candidates.next() {
            match self.limiter.try_admit(&tenant.id) {
                Admission::Admitted(ticket) => match self.admit(&feature, ticket).await {
                    Ok(()) => summary.admitted.push(feature.id),
                    Err(err) => {
                        warn!(feature = %feature.id, tenant = %tenant.id, "admission failed: {}", err);
                        if !summary.failed_tenants.contains(&tenant.id) {
                            summary.failed_tenants.push(tenant.id.clone());
                        }
                    }
                },
                Admission::Rejected { in_flight, limit } => {
                    debug!(tenant = %tenant.id, in_flight, limit, "tenant at concurrency limit");
                    for deferred in std::iter::once(feature).chain(candidates) {
                        self.metrics.record_deferral(&tenant.id);
                        summary.deferred.push(deferred.id);
                    }
                    break;
                }
            }
        }
    }

    /// Persist the run, mark the feature running and start its pipeline.
    ///
    /// The run row is written first so a crash after this point is always
    /// recoverable. If marking the feature fails the run is closed as
    /// failed and the ticket is dropped, returning the slot.
    async fn admit(&self, feature: &Feature, ticket: SlotTicket) -> Result<(), SchedulerError> {
        let mut run = PipelineRun::new(feature);
        self.store.create_pipeline_run(&run).await?;
        if let Err(err) = self
            .store
            .update_feature_status(&feature.id, FeatureStatus::Running, None)
            .await
        {
            run.failure_reason = Some(format!("admission aborted: {}", err));
            run.enter(Stage::Failed);
            if let Err(close_err) = self.store.update_pipeline_run(&run).await {
                warn!(run_id = %run.id, "failed to close aborted run: {}", close_err);
            }
            return Err(err.into());
        }

        info!(
            feature = %feature.id,
            tenant = %feature.tenant,
            run_id = %run.id,
            priority = feature.priority,
            "feature admitted"
        );
        self.metrics.record_admission(&feature.tenant);
        self.spawn_pipeline(run, ticket);
        Ok(())
    }

    fn spawn_pipeline(&self, run: PipelineRun, ticket: SlotTicket) {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let feature = run.feature.clone();
        let run_id = run.id.clone();
        let machine = PipelineStateMachine::new(self.ctx.clone(), run, ticket, cancel_rx);
        let active = self.active.clone();

        // Held until the entry is inserted so the task cannot remove it first.
        let Ok(mut guard) = self.active.lock() else {
            warn!(feature = %feature, "active pipeline map poisoned, running untracked");
            tokio::spawn(async move {
                machine.run().await;
            });
            return;
        };
        let task_feature = feature.clone();
        let task_run = run_id.clone();
        let handle = tokio::spawn(async move {
            let finished = machine.run().await;
            debug!(feature = %task_feature, stage = %finished.stage, "pipeline task exiting");
            if let Ok(mut active) = active.lock() {
                if active
                    .get(&task_feature)
                    .is_some_and(|entry| entry.run_id == task_run)
                {
                    active.remove(&task_feature);
                }
            }
        });
        guard.insert(
            feature,
            ActivePipeline {
                run_id,
                cancel_tx,
                handle,
            },
        );
    }

    /// Drive ticks on the configured interval until `shutdown` turns true.
    ///
    /// Runs `recover` first. Pipelines still running at shutdown keep their
    /// persisted runs and are resumed by the next `recover`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), SchedulerError> {
        let resumed = self.recover().await?;
        info!(
            resumed,
            interval_secs = self.config.tick_interval_secs,
            "scheduler started"
        );

        let mut interval = tokio::time::interval(self.config.tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(summary) => {
                            for tenant in summary.failed_tenants {
                                warn!(tenant = %tenant, "tenant skipped this tick");
                            }
                        }
                        Err(err) => error!("scheduler tick failed: {}", err),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(active = self.active_count(), "scheduler stopped");
        Ok(())
    }

    /// Reset a `failing` or `pending` feature to `pending`, clearing its
    /// recorded reason. The next tick considers it again.
    pub async fn enqueue(&self, id: &FeatureId) -> Result<(), SchedulerError> {
        let feature = self.require_feature(id).await?;
        if self.is_active(id) || feature.status == FeatureStatus::Running {
            return Err(SchedulerError::AlreadyRunning(id.clone()));
        }
        match feature.status {
            FeatureStatus::Pending | FeatureStatus::Failing => {
                self.store
                    .update_feature_status(id, FeatureStatus::Pending, None)
                    .await?;
                info!(feature = %id, from = %feature.status, "feature enqueued");
                Ok(())
            }
            from => Err(SchedulerError::InvalidTransition {
                feature: id.clone(),
                from,
                to: FeatureStatus::Pending,
            }),
        }
    }

    /// Stop the live pipeline for `id`. The pipeline terminates its active
    /// execution unit and fails with reason `cancelled`.
    ///
    /// Returns `false` when this scheduler has no live pipeline for the
    /// feature.
    pub async fn cancel(&self, id: &FeatureId) -> Result<bool, SchedulerError> {
        let signalled = match self.active.lock() {
            Ok(active) => match active.get(id) {
                Some(entry) => entry.cancel_tx.send(true).is_ok(),
                None => false,
            },
            Err(_) => false,
        };
        if signalled {
            info!(feature = %id, "cancellation requested");
            return Ok(true);
        }
        self.require_feature(id).await?;
        Ok(false)
    }

    /// Record that the pull request of an `awaiting-merge` feature merged.
    pub async fn confirm_merge(&self, id: &FeatureId) -> Result<(), SchedulerError> {
        let feature = self.require_feature(id).await?;
        if feature.status != FeatureStatus::AwaitingMerge || self.is_active(id) {
            return Err(SchedulerError::InvalidTransition {
                feature: id.clone(),
                from: feature.status,
                to: FeatureStatus::Passing,
            });
        }
        self.store
            .update_feature_status(id, FeatureStatus::Passing, None)
            .await?;
        info!(feature = %id, "merge confirmed");
        Ok(())
    }

    pub async fn add_dependency(
        &self,
        feature: &FeatureId,
        depends_on: &FeatureId,
    ) -> Result<(), SchedulerError> {
        self.resolver.add_dependency(feature, depends_on).await
    }

    pub async fn remove_dependency(
        &self,
        feature: &FeatureId,
        depends_on: &FeatureId,
    ) -> Result<(), SchedulerError> {
        self.resolver.remove_dependency(feature, depends_on).await
    }

    /// Per-tenant view of limits, in-flight pipelines and feature states.
    ///
    /// In-flight counts come from unfinished pipeline runs in the store, so
    /// the snapshot is accurate from any process sharing that store.
    pub async fn status(&self) -> Result<SchedulerStatus, SchedulerError> {
        let tenants = self.store.list_tenants().await?;
        let unfinished = self.store.list_unfinished_pipeline_runs().await?;

        let mut by_tenant = Vec::with_capacity(tenants.len());
        for tenant in tenants {
            let features = self.store.list_features(&tenant.id, None).await?;
            by_tenant.push((tenant, features));
        }
        let all: Vec<Feature> = by_tenant
            .iter()
            .flat_map(|(_, features)| features.iter().cloned())
            .collect();
        self.resolver.sync(&all).await;
        let statuses: HashMap<FeatureId, FeatureStatus> =
            all.iter().map(|f| (f.id.clone(), f.status)).collect();

        let mut tenants = Vec::with_capacity(by_tenant.len());
        for (tenant, features) in &by_tenant {
            let ready = self
                .resolver
                .ready_set(&tenant.id, features, &statuses)
                .await;
            let in_flight = unfinished
                .iter()
                .filter(|run| run.tenant == tenant.id)
                .count() as u32;
            let pick = |status: FeatureStatus| -> Vec<FeatureSummary> {
                features
                    .iter()
                    .filter(|f| f.status == status)
                    .map(FeatureSummary::from_feature)
                    .collect()
            };
            tenants.push(TenantStatus {
                tenant: tenant.id.clone(),
                limit: self.config.limit_for(tenant),
                in_flight,
                ready: ready.into_iter().map(|f| f.id).collect(),
                running: pick(FeatureStatus::Running),
                awaiting_merge: pick(FeatureStatus::AwaitingMerge),
                failing: pick(FeatureStatus::Failing),
                pending: features
                    .iter()
                    .filter(|f| f.status == FeatureStatus::Pending)
                    .count(),
                passing: features
                    .iter()
                    .filter(|f| f.status == FeatureStatus::Passing)
                    .count(),
            });
        }

        Ok(SchedulerStatus {
            generated_at: Utc::now(),
            tenants,
        })
    }

    /// Wait until every pipeline started so far has finished.
    pub async fn join_pipelines(&self) {
        loop {
            let handles: Vec<JoinHandle<()>> = match self.active.lock() {
                Ok(mut active) => active.drain().map(|(_, entry)| entry.handle).collect(),
                Err(_) => return,
            };
            if handles.is_empty() {
                return;
            }
            for result in futures::future::join_all(handles).await {
                if let Err(err) = result {
                    warn!("pipeline task ended abnormally: {}", err);
                }
            }
        }
    }

    async fn require_feature(&self, id: &FeatureId) -> Result<Feature, SchedulerError> {
        self.store
            .get_feature(id)
            .await?
            .ok_or_else(|| SchedulerError::UnknownFeature(id.clone()))
    }
}
