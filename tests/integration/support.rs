//! Shared fixtures: a scripted execution backend, a recording PR service and
//! a scheduler wired for fast polling.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use forgeline::error::{BackendError, PullRequestError, StoreError, StoreResult};
use forgeline::model::LaunchParams;
use forgeline::{
    ExecutionBackend, Feature, FeatureId, FeatureStatus, MemoryStore, PipelineRun,
    PullRequestService, RetryPolicy, Scheduler, SchedulerConfig, Stage, StageTimeouts, Store,
    Tenant, TenantId, TickSummary, UnitHandle, WorkerState,
};

/// What a scripted worker does once started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Exit with the code and output on the first status check.
    Exit(i32, Option<String>),
    /// Keep running until stopped or finished from the test.
    Hang,
}

impl Step {
    pub fn ok() -> Self {
        Step::Exit(0, None)
    }

    pub fn changes_requested(feedback: &str) -> Self {
        Step::Exit(2, Some(feedback.to_string()))
    }
}

/// One `start_worker` call as the backend saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launch {
    pub feature: FeatureId,
    pub stage: Stage,
    pub feedback: Option<String>,
    pub handle: UnitHandle,
}

#[derive(Debug)]
struct Unit {
    step: Step,
    stopped: bool,
}

/// Execution backend driven by per-feature, per-stage scripts.
///
/// Unscripted stages exit 0. Handles the backend never issued report
/// `Lost`, like processes that did not survive a restart.
#[derive(Default)]
pub struct ScriptedBackend {
    scripts: Mutex<HashMap<(FeatureId, Stage), VecDeque<Step>>>,
    units: Mutex<HashMap<UnitHandle, Unit>>,
    launches: Mutex<Vec<Launch>>,
    unavailable: Mutex<Vec<FeatureId>>,
    stopped: Mutex<Vec<UnitHandle>>,
    next_id: AtomicU32,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue `steps` for successive launches of `stage` for `feature`.
    pub fn script(&self, feature: &str, stage: Stage, steps: Vec<Step>) {
        self.scripts
            .lock()
            .unwrap()
            .entry((FeatureId::new(feature), stage))
            .or_default()
            .extend(steps);
    }

    /// Refuse every launch for `feature`.
    pub fn make_unavailable(&self, feature: &str) {
        self.unavailable.lock().unwrap().push(FeatureId::new(feature));
    }

    /// Register a worker that was started before a restart.
    pub fn preload(&self, handle: &str, step: Step) {
        self.units.lock().unwrap().insert(
            UnitHandle::new(handle),
            Unit {
                step,
                stopped: false,
            },
        );
    }

    /// Let every hanging worker exit with `code`.
    pub fn finish_hanging(&self, code: i32) {
        for unit in self.units.lock().unwrap().values_mut() {
            if unit.step == Step::Hang {
                unit.step = Step::Exit(code, None);
            }
        }
    }

    pub fn launches(&self) -> Vec<Launch> {
        self.launches.lock().unwrap().clone()
    }

    pub fn stages_for(&self, feature: &str) -> Vec<Stage> {
        self.launches()
            .into_iter()
            .filter(|l| l.feature.as_str() == feature)
            .map(|l| l.stage)
            .collect()
    }

    pub fn stopped(&self) -> Vec<UnitHandle> {
        self.stopped.lock().unwrap().clone()
    }

    /// Wait until `feature` has launched `count` workers.
    pub async fn wait_for_launches(&self, feature: &str, count: usize) {
        for _ in 0..400 {
            if self.stages_for(feature).len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("{} never reached {} launches", feature, count);
    }
}

#[async_trait]
impl ExecutionBackend for ScriptedBackend {
    async fn start_worker(
        &self,
        stage: Stage,
        params: &LaunchParams,
    ) -> Result<UnitHandle, BackendError> {
        if self.unavailable.lock().unwrap().contains(&params.feature) {
            return Err(BackendError::Unavailable("scripted outage".to_string()));
        }
        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&(params.feature.clone(), stage))
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(Step::ok);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = UnitHandle::new(format!("{}-{}-{}", params.feature, stage, id));
        self.units.lock().unwrap().insert(
            handle.clone(),
            Unit {
                step,
                stopped: false,
            },
        );
        self.launches.lock().unwrap().push(Launch {
            feature: params.feature.clone(),
            stage,
            feedback: params.feedback.clone(),
            handle: handle.clone(),
        });
        Ok(handle)
    }

    async fn worker_status(&self, handle: &UnitHandle) -> Result<WorkerState, BackendError> {
        let units = self.units.lock().unwrap();
        let Some(unit) = units.get(handle) else {
            return Ok(WorkerState::Lost);
        };
        if unit.stopped {
            return Ok(WorkerState::Exited {
                exit_code: 137,
                output: None,
            });
        }
        Ok(match &unit.step {
            Step::Exit(exit_code, output) => WorkerState::Exited {
                exit_code: *exit_code,
                output: output.clone(),
            },
            Step::Hang => WorkerState::Running,
        })
    }

    async fn stop_worker(&self, handle: &UnitHandle) -> Result<(), BackendError> {
        if let Some(unit) = self.units.lock().unwrap().get_mut(handle) {
            unit.stopped = true;
        }
        self.stopped.lock().unwrap().push(handle.clone());
        Ok(())
    }
}

/// PR service that records every request.
#[derive(Default)]
pub struct RecordingPullRequests {
    pub requests: Mutex<Vec<(FeatureId, String)>>,
}

impl RecordingPullRequests {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn features(&self) -> Vec<FeatureId> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|(feature, _)| feature.clone())
            .collect()
    }
}

#[async_trait]
impl PullRequestService for RecordingPullRequests {
    async fn create_pull_request(
        &self,
        feature: &FeatureId,
        branch: &str,
        _summary: &str,
    ) -> Result<String, PullRequestError> {
        self.requests
            .lock()
            .unwrap()
            .push((feature.clone(), branch.to_string()));
        Ok(format!("https://example.test/pulls/{}", feature))
    }
}

/// Store that fails listing one tenant's features and marking one feature
/// running, and otherwise delegates to a `MemoryStore`.
pub struct FlakyStore {
    pub inner: Arc<MemoryStore>,
    broken_tenant: TenantId,
    broken_feature: FeatureId,
}

impl FlakyStore {
    pub fn new(inner: Arc<MemoryStore>, broken_tenant: &str, broken_feature: &str) -> Arc<Self> {
        Arc::new(Self {
            inner,
            broken_tenant: TenantId::new(broken_tenant),
            broken_feature: FeatureId::new(broken_feature),
        })
    }
}

fn injected(what: &str) -> StoreError {
    StoreError::Io(std::io::Error::other(format!("injected failure: {}", what)))
}

#[async_trait]
impl Store for FlakyStore {
    async fn list_tenants(&self) -> StoreResult<Vec<Tenant>> {
        self.inner.list_tenants().await
    }

    async fn upsert_tenant(&self, tenant: &Tenant) -> StoreResult<()> {
        self.inner.upsert_tenant(tenant).await
    }

    async fn list_features(
        &self,
        tenant: &TenantId,
        status: Option<FeatureStatus>,
    ) -> StoreResult<Vec<Feature>> {
        if tenant == &self.broken_tenant {
            return Err(injected("list_features"));
        }
        self.inner.list_features(tenant, status).await
    }

    async fn get_feature(&self, id: &FeatureId) -> StoreResult<Option<Feature>> {
        self.inner.get_feature(id).await
    }

    async fn insert_feature(&self, feature: &Feature) -> StoreResult<()> {
        self.inner.insert_feature(feature).await
    }

    async fn update_feature_status(
        &self,
        id: &FeatureId,
        status: FeatureStatus,
        reason: Option<String>,
    ) -> StoreResult<()> {
        if id == &self.broken_feature && status == FeatureStatus::Running {
            return Err(injected("update_feature_status"));
        }
        self.inner.update_feature_status(id, status, reason).await
    }

    async fn set_dependencies(&self, id: &FeatureId, depends_on: &[FeatureId]) -> StoreResult<()> {
        self.inner.set_dependencies(id, depends_on).await
    }

    async fn set_pull_request(&self, id: &FeatureId, url: &str) -> StoreResult<()> {
        self.inner.set_pull_request(id, url).await
    }

    async fn create_pipeline_run(&self, run: &PipelineRun) -> StoreResult<()> {
        self.inner.create_pipeline_run(run).await
    }

    async fn update_pipeline_run(&self, run: &PipelineRun) -> StoreResult<()> {
        self.inner.update_pipeline_run(run).await
    }

    async fn list_unfinished_pipeline_runs(&self) -> StoreResult<Vec<PipelineRun>> {
        self.inner.list_unfinished_pipeline_runs().await
    }

    async fn list_pipeline_runs(&self, feature: &FeatureId) -> StoreResult<Vec<PipelineRun>> {
        self.inner.list_pipeline_runs(feature).await
    }
}

/// Config with millisecond polling and near-instant launch retries.
pub fn fast_config() -> SchedulerConfig {
    SchedulerConfig::default()
        .with_timeouts(StageTimeouts::new().with_poll_interval(Duration::from_millis(5)))
        .with_launch_retry(RetryPolicy {
            max_attempts: 2,
            base_delay_ms: 1,
            max_delay_ms: 1,
        })
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub backend: Arc<ScriptedBackend>,
    pub pull_requests: Arc<RecordingPullRequests>,
    pub scheduler: Scheduler,
}

impl Harness {
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_store(config, Arc::new(MemoryStore::new()), ScriptedBackend::new())
    }

    pub fn with_store(
        config: SchedulerConfig,
        store: Arc<MemoryStore>,
        backend: Arc<ScriptedBackend>,
    ) -> Self {
        let pull_requests = RecordingPullRequests::new();
        let scheduler = Scheduler::new(
            config,
            store.clone(),
            backend.clone(),
            pull_requests.clone(),
        );
        Self {
            store,
            backend,
            pull_requests,
            scheduler,
        }
    }

    pub fn with_evidence(mut self, evidence: forgeline::evidence::EvidenceStore) -> Self {
        self.scheduler = self.scheduler.with_evidence(evidence);
        self
    }

    /// Tick, wait for the started pipelines, and return the tick summary.
    pub async fn tick_and_settle(&self) -> TickSummary {
        let summary = self.scheduler.tick().await.expect("tick");
        self.scheduler.join_pipelines().await;
        summary
    }

    /// Tick until a tick admits nothing.
    pub async fn run_to_idle(&self) -> Vec<TickSummary> {
        let mut ticks = Vec::new();
        for _ in 0..20 {
            let summary = self.tick_and_settle().await;
            if summary.admitted.is_empty() {
                return ticks;
            }
            ticks.push(summary);
        }
        panic!("scheduler never went idle");
    }

    pub async fn feature(&self, id: &str) -> Feature {
        self.store
            .get_feature(&FeatureId::new(id))
            .await
            .expect("store")
            .expect("feature exists")
    }
}
