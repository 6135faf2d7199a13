//! End-to-end scheduling scenarios against the in-memory store and a
//! scripted execution backend.

use std::sync::Arc;
use std::time::Duration;

use forgeline::evidence::{EvidenceStore, LifecycleEvent, LifecycleEventType};
use forgeline::{
    Feature, FeatureId, FeatureStatus, MemoryStore, PipelineRun, RetryPolicy, Scheduler, Stage,
    StageTimeouts, Store, Tenant, TenantId, UnitHandle,
};
use tempfile::TempDir;

use crate::support::{
    fast_config, FlakyStore, Harness, RecordingPullRequests, ScriptedBackend, Step,
};

fn id(s: &str) -> FeatureId {
    FeatureId::new(s)
}

async fn add(harness: &Harness, feature: Feature) {
    harness.store.insert_feature(&feature).await.expect("insert");
}

#[tokio::test]
async fn test_dependent_feature_waits_for_dependency() {
    let harness = Harness::new(fast_config());
    add(&harness, Feature::new("A", "acme", 1)).await;
    add(
        &harness,
        Feature::new("B", "acme", 1).with_dependencies(vec![id("A")]),
    )
    .await;

    let first = harness.tick_and_settle().await;
    assert_eq!(first.admitted, vec![id("A")]);
    assert!(first.deferred.is_empty());
    assert_eq!(harness.feature("A").await.status, FeatureStatus::Passing);
    assert_eq!(harness.feature("B").await.status, FeatureStatus::Pending);

    let second = harness.tick_and_settle().await;
    assert_eq!(second.admitted, vec![id("B")]);
    assert_eq!(harness.feature("B").await.status, FeatureStatus::Passing);
    assert_eq!(harness.pull_requests.features(), vec![id("A"), id("B")]);
    assert_eq!(
        harness.backend.stages_for("A"),
        vec![Stage::Plan, Stage::Implement, Stage::Review, Stage::Verify]
    );
}

#[tokio::test]
async fn test_single_change_request_reworks_then_passes() {
    let harness = Harness::new(fast_config());
    add(&harness, Feature::new("X", "acme", 1)).await;
    harness.backend.script(
        "X",
        Stage::Review,
        vec![Step::changes_requested("cover the error path")],
    );

    harness.run_to_idle().await;

    let feature = harness.feature("X").await;
    assert_eq!(feature.status, FeatureStatus::Passing);
    assert_eq!(
        feature.pull_request_url.as_deref(),
        Some("https://example.test/pulls/X")
    );
    assert_eq!(
        harness.backend.stages_for("X"),
        vec![
            Stage::Plan,
            Stage::Implement,
            Stage::Review,
            Stage::Implement,
            Stage::Review,
            Stage::Verify
        ]
    );
    let launches = harness.backend.launches();
    assert_eq!(launches[1].feedback, None);
    assert_eq!(launches[3].feedback.as_deref(), Some("cover the error path"));
    assert_eq!(launches[4].feedback, None);

    let runs = harness.store.list_pipeline_runs(&id("X")).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert!(runs[0].rework_used);
    assert_eq!(runs[0].stage, Stage::Done);
    assert_eq!(harness.scheduler.metrics().reworks, 1);
}

#[tokio::test]
async fn test_second_change_request_fails_and_releases_slot_once() {
    let mut config = fast_config();
    config.default_concurrency_limit = 1;
    let harness = Harness::new(config);
    add(&harness, Feature::new("X", "acme", 1)).await;
    harness.backend.script(
        "X",
        Stage::Review,
        vec![
            Step::changes_requested("first"),
            Step::changes_requested("second"),
        ],
    );

    let summary = harness.tick_and_settle().await;
    assert_eq!(summary.admitted, vec![id("X")]);

    let feature = harness.feature("X").await;
    assert_eq!(feature.status, FeatureStatus::Failing);
    assert!(feature
        .failure_reason
        .as_deref()
        .unwrap()
        .starts_with("rework_exhausted"));
    assert!(harness.pull_requests.features().is_empty());
    let stages = harness.backend.stages_for("X");
    assert_eq!(stages.iter().filter(|s| **s == Stage::Implement).count(), 2);
    assert!(!stages.contains(&Stage::Verify));

    let tenant = TenantId::new("acme");
    assert_eq!(harness.scheduler.limiter().in_flight(&tenant), 0);
    // Exactly one slot is free again: the next feature is admitted, a third is not.
    add(&harness, Feature::new("Y", "acme", 1)).await;
    add(&harness, Feature::new("Z", "acme", 2)).await;
    harness.backend.script("Y", Stage::Plan, vec![Step::Hang]);
    let next = harness.scheduler.tick().await.unwrap();
    assert_eq!(next.admitted, vec![id("Y")]);
    assert_eq!(next.deferred, vec![id("Z")]);
    assert_eq!(harness.scheduler.limiter().in_flight(&tenant), 1);

    harness.backend.wait_for_launches("Y", 1).await;
    harness.backend.finish_hanging(0);
    harness.scheduler.join_pipelines().await;
    let metrics = harness.scheduler.metrics();
    assert_eq!(metrics.pipelines_failed, 1);
    assert_eq!(metrics.failure_frequency.get("rework_exhausted"), Some(&1));
}

#[tokio::test]
async fn test_limit_of_one_admits_a_single_feature_per_tick() {
    let harness = Harness::new(fast_config());
    harness
        .store
        .upsert_tenant(&Tenant::new("acme").with_limit(1))
        .await
        .unwrap();
    add(&harness, Feature::new("A", "acme", 1)).await;
    add(&harness, Feature::new("B", "acme", 2)).await;
    harness.backend.script("A", Stage::Plan, vec![Step::Hang]);

    let first = harness.scheduler.tick().await.unwrap();
    assert_eq!(first.admitted, vec![id("A")]);
    assert_eq!(first.deferred, vec![id("B")]);
    assert_eq!(harness.feature("A").await.status, FeatureStatus::Running);
    assert_eq!(harness.feature("B").await.status, FeatureStatus::Pending);

    harness.backend.wait_for_launches("A", 1).await;
    let while_busy = harness.scheduler.tick().await.unwrap();
    assert!(while_busy.admitted.is_empty());
    assert_eq!(while_busy.deferred, vec![id("B")]);

    harness.backend.finish_hanging(0);
    harness.scheduler.join_pipelines().await;
    assert_eq!(harness.feature("A").await.status, FeatureStatus::Passing);

    let after = harness.tick_and_settle().await;
    assert_eq!(after.admitted, vec![id("B")]);
    assert_eq!(harness.feature("B").await.status, FeatureStatus::Passing);
}

#[tokio::test]
async fn test_tenants_are_limited_independently() {
    let mut config = fast_config();
    config.default_concurrency_limit = 1;
    let harness = Harness::new(config);
    add(&harness, Feature::new("A1", "acme", 1)).await;
    add(&harness, Feature::new("A2", "acme", 2)).await;
    add(&harness, Feature::new("G1", "globex", 1)).await;

    let summary = harness.tick_and_settle().await;

    let mut admitted = summary.admitted.clone();
    admitted.sort();
    assert_eq!(admitted, vec![id("A1"), id("G1")]);
    assert_eq!(summary.deferred, vec![id("A2")]);
}

#[tokio::test]
async fn test_restart_reattaches_instead_of_relaunching() {
    let store = Arc::new(MemoryStore::new());
    let feature = Feature::new("X", "acme", 1).with_status(FeatureStatus::Running);
    store.insert_feature(&feature).await.unwrap();
    let mut run = PipelineRun::new(&feature);
    run.enter(Stage::Implement);
    run.active_unit = Some(UnitHandle::new("X-implement-before-restart"));
    store.create_pipeline_run(&run).await.unwrap();

    let backend = ScriptedBackend::new();
    backend.preload("X-implement-before-restart", Step::ok());
    let harness = Harness::with_store(fast_config(), store, backend);

    let resumed = harness.scheduler.recover().await.unwrap();
    assert_eq!(resumed, 1);
    assert_eq!(
        harness.scheduler.limiter().in_flight(&TenantId::new("acme")),
        1
    );
    // A tick while the run is live must not admit the feature again.
    assert!(harness.scheduler.tick().await.unwrap().admitted.is_empty());

    harness.scheduler.join_pipelines().await;

    assert_eq!(harness.feature("X").await.status, FeatureStatus::Passing);
    assert_eq!(
        harness.backend.stages_for("X"),
        vec![Stage::Review, Stage::Verify]
    );
    let runs = harness.store.list_pipeline_runs(&id("X")).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].id, run.id);
    assert_eq!(runs[0].stage, Stage::Done);
    assert_eq!(runs[0].attempts[0].stage, Stage::Implement);
    assert_eq!(
        harness.scheduler.limiter().in_flight(&TenantId::new("acme")),
        0
    );
}

#[tokio::test]
async fn test_restart_with_lost_worker_fails_feature() {
    let store = Arc::new(MemoryStore::new());
    let feature = Feature::new("X", "acme", 1).with_status(FeatureStatus::Running);
    store.insert_feature(&feature).await.unwrap();
    let mut run = PipelineRun::new(&feature);
    run.enter(Stage::Review);
    run.active_unit = Some(UnitHandle::new("gone"));
    store.create_pipeline_run(&run).await.unwrap();

    let harness = Harness::with_store(fast_config(), store, ScriptedBackend::new());
    harness.scheduler.recover().await.unwrap();
    harness.scheduler.join_pipelines().await;

    let feature = harness.feature("X").await;
    assert_eq!(feature.status, FeatureStatus::Failing);
    assert!(feature.failure_reason.unwrap().starts_with("worker_lost"));
    assert!(harness.backend.launches().is_empty());
}

#[tokio::test]
async fn test_restart_applies_outcome_of_finished_run() {
    let store = Arc::new(MemoryStore::new());
    let done = Feature::new("X", "acme", 1).with_status(FeatureStatus::Running);
    let failed = Feature::new("Y", "acme", 2).with_status(FeatureStatus::Running);
    store.insert_feature(&done).await.unwrap();
    store.insert_feature(&failed).await.unwrap();
    // Both runs reached a terminal stage but the process died before the
    // features were updated.
    let mut done_run = PipelineRun::new(&done);
    done_run.enter(Stage::Done);
    store.create_pipeline_run(&done_run).await.unwrap();
    let mut failed_run = PipelineRun::new(&failed);
    failed_run.failure_reason = Some("worker_error: verify exited with code 1".to_string());
    failed_run.enter(Stage::Failed);
    store.create_pipeline_run(&failed_run).await.unwrap();

    let harness = Harness::with_store(fast_config(), store, ScriptedBackend::new());
    assert_eq!(harness.scheduler.recover().await.unwrap(), 0);
    let summary = harness.tick_and_settle().await;

    assert!(summary.admitted.is_empty());
    assert!(harness.backend.launches().is_empty());
    assert_eq!(harness.pull_requests.features(), vec![id("X")]);
    let x = harness.feature("X").await;
    assert_eq!(x.status, FeatureStatus::Passing);
    assert_eq!(x.pull_request_url.as_deref(), Some("https://example.test/pulls/X"));
    let y = harness.feature("Y").await;
    assert_eq!(y.status, FeatureStatus::Failing);
    assert_eq!(
        y.failure_reason.as_deref(),
        Some("worker_error: verify exited with code 1")
    );
    assert_eq!(harness.store.list_pipeline_runs(&id("X")).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_store_failures_stay_within_their_tenant_and_feature() {
    let memory = Arc::new(MemoryStore::new());
    for feature in [
        Feature::new("A1", "acme", 1),
        Feature::new("A2", "acme", 2),
        Feature::new("G1", "globex", 1),
        Feature::new("I1", "initech", 1),
    ] {
        memory.insert_feature(&feature).await.unwrap();
    }
    let store = FlakyStore::new(memory.clone(), "globex", "A1");
    let backend = ScriptedBackend::new();
    let scheduler = Scheduler::new(
        fast_config(),
        store,
        backend.clone(),
        RecordingPullRequests::new(),
    );

    let summary = scheduler.tick().await.unwrap();
    scheduler.join_pipelines().await;

    assert_eq!(summary.admitted, vec![id("A2"), id("I1")]);
    assert!(summary.failed_tenants.contains(&TenantId::new("globex")));
    assert!(summary.failed_tenants.contains(&TenantId::new("acme")));
    assert!(!summary.failed_tenants.contains(&TenantId::new("initech")));

    let get = |feature: &'static str| {
        let memory = memory.clone();
        async move { memory.get_feature(&id(feature)).await.unwrap().unwrap() }
    };
    assert_eq!(get("A1").await.status, FeatureStatus::Pending);
    assert_eq!(get("A2").await.status, FeatureStatus::Passing);
    assert_eq!(get("G1").await.status, FeatureStatus::Pending);
    assert_eq!(get("I1").await.status, FeatureStatus::Passing);
    // The aborted admission closed its run and gave the slot back.
    let runs = memory.list_pipeline_runs(&id("A1")).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].stage, Stage::Failed);
    assert!(backend.stages_for("A1").is_empty());
    assert_eq!(scheduler.limiter().in_flight(&TenantId::new("acme")), 0);
}

#[tokio::test]
async fn test_cancel_during_launch_backoff() {
    let config = fast_config().with_launch_retry(RetryPolicy {
        max_attempts: 10,
        base_delay_ms: 60_000,
        max_delay_ms: 60_000,
    });
    let harness = Harness::new(config);
    add(&harness, Feature::new("X", "acme", 1)).await;
    harness.backend.make_unavailable("X");

    harness.scheduler.tick().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(harness.scheduler.cancel(&id("X")).await.unwrap());
    tokio::time::timeout(Duration::from_secs(5), harness.scheduler.join_pipelines())
        .await
        .expect("cancel must not wait out the launch retries");

    let feature = harness.feature("X").await;
    assert_eq!(feature.status, FeatureStatus::Failing);
    assert!(feature.failure_reason.unwrap().starts_with("cancelled"));
}

#[tokio::test]
async fn test_cancel_terminates_active_unit() {
    let harness = Harness::new(fast_config());
    add(&harness, Feature::new("X", "acme", 1)).await;
    harness.backend.script("X", Stage::Implement, vec![Step::Hang]);

    harness.scheduler.tick().await.unwrap();
    harness.backend.wait_for_launches("X", 2).await;
    assert!(harness.scheduler.cancel(&id("X")).await.unwrap());
    harness.scheduler.join_pipelines().await;

    let feature = harness.feature("X").await;
    assert_eq!(feature.status, FeatureStatus::Failing);
    assert_eq!(
        feature.failure_reason.as_deref(),
        Some("cancelled: stopped during implement")
    );
    let implement = harness.backend.launches()[1].handle.clone();
    assert_eq!(harness.backend.stopped(), vec![implement]);
    assert_eq!(
        harness.scheduler.limiter().in_flight(&TenantId::new("acme")),
        0
    );
}

#[tokio::test]
async fn test_stage_timeout_terminates_and_fails() {
    let config = fast_config().with_timeouts(
        StageTimeouts::new()
            .with_stage(Stage::Plan, Duration::from_secs(1))
            .with_poll_interval(Duration::from_millis(20)),
    );
    let harness = Harness::new(config);
    add(&harness, Feature::new("X", "acme", 1)).await;
    harness.backend.script("X", Stage::Plan, vec![Step::Hang]);

    harness.tick_and_settle().await;

    let feature = harness.feature("X").await;
    assert_eq!(feature.status, FeatureStatus::Failing);
    assert!(feature.failure_reason.unwrap().starts_with("timeout"));
    assert_eq!(harness.backend.stopped().len(), 1);
    assert_eq!(harness.backend.stages_for("X"), vec![Stage::Plan]);
}

#[tokio::test]
async fn test_backend_outage_fails_with_infrastructure_reason() {
    let harness = Harness::new(fast_config());
    add(&harness, Feature::new("X", "acme", 1)).await;
    add(&harness, Feature::new("Y", "acme", 2)).await;
    harness.backend.make_unavailable("X");

    let summary = harness.tick_and_settle().await;

    assert_eq!(summary.admitted.len(), 2);
    let x = harness.feature("X").await;
    assert_eq!(x.status, FeatureStatus::Failing);
    assert!(x.failure_reason.unwrap().starts_with("infrastructure"));
    assert_eq!(harness.feature("Y").await.status, FeatureStatus::Passing);
}

#[tokio::test]
async fn test_failed_dependency_blocks_until_reenqueued() {
    let harness = Harness::new(fast_config());
    add(&harness, Feature::new("A", "acme", 1)).await;
    add(
        &harness,
        Feature::new("B", "acme", 1).with_dependencies(vec![id("A")]),
    )
    .await;
    harness
        .backend
        .script("A", Stage::Verify, vec![Step::Exit(1, None)]);

    let ticks = harness.run_to_idle().await;
    assert_eq!(ticks.len(), 1);
    assert_eq!(harness.feature("A").await.status, FeatureStatus::Failing);
    assert_eq!(harness.feature("B").await.status, FeatureStatus::Pending);

    harness.scheduler.enqueue(&id("A")).await.unwrap();
    let ticks = harness.run_to_idle().await;
    let admitted: Vec<FeatureId> = ticks.into_iter().flat_map(|t| t.admitted).collect();
    assert_eq!(admitted, vec![id("A"), id("B")]);
    assert_eq!(harness.feature("B").await.status, FeatureStatus::Passing);
}

#[tokio::test]
async fn test_merge_confirmation_holds_dependents() {
    let mut config = fast_config();
    config.require_merge_confirmation = true;
    let harness = Harness::new(config);
    add(&harness, Feature::new("A", "acme", 1)).await;
    add(
        &harness,
        Feature::new("B", "acme", 1).with_dependencies(vec![id("A")]),
    )
    .await;

    harness.run_to_idle().await;
    assert_eq!(harness.feature("A").await.status, FeatureStatus::AwaitingMerge);
    assert_eq!(harness.feature("B").await.status, FeatureStatus::Pending);

    harness.scheduler.confirm_merge(&id("A")).await.unwrap();
    let ticks = harness.run_to_idle().await;
    assert_eq!(ticks[0].admitted, vec![id("B")]);
}

#[tokio::test]
async fn test_dependency_edits_reject_cycles() {
    let harness = Harness::new(fast_config());
    add(&harness, Feature::new("A", "acme", 1)).await;
    add(&harness, Feature::new("B", "acme", 1)).await;
    add(&harness, Feature::new("C", "acme", 1)).await;
    harness.scheduler.recover().await.unwrap();

    harness.scheduler.add_dependency(&id("B"), &id("A")).await.unwrap();
    harness.scheduler.add_dependency(&id("C"), &id("B")).await.unwrap();
    let err = harness
        .scheduler
        .add_dependency(&id("A"), &id("C"))
        .await
        .unwrap_err();
    assert!(matches!(err, forgeline::SchedulerError::Cycle(_)));
    assert!(harness.feature("A").await.depends_on.is_empty());

    harness.scheduler.remove_dependency(&id("B"), &id("A")).await.unwrap();
    assert!(harness.feature("B").await.depends_on.is_empty());
    harness.scheduler.add_dependency(&id("A"), &id("C")).await.unwrap();
    assert_eq!(harness.feature("A").await.depends_on, vec![id("C")]);
}

#[tokio::test]
async fn test_run_journal_records_lifecycle() {
    let temp_dir = TempDir::new().unwrap();
    let evidence = EvidenceStore::new(temp_dir.path(), 30).unwrap();
    let harness = Harness::new(fast_config()).with_evidence(evidence.clone());
    add(&harness, Feature::new("X", "acme", 1)).await;

    harness.run_to_idle().await;

    let manifests = evidence.list_runs().unwrap();
    assert_eq!(manifests.len(), 1);
    assert_eq!(manifests[0].feature_id, id("X"));
    assert_eq!(manifests[0].outcome.as_deref(), Some("done"));
    let events: Vec<LifecycleEvent> = evidence
        .read_records(&manifests[0].run_id)
        .unwrap()
        .into_iter()
        .map(|record| serde_json::from_value(record.payload).unwrap())
        .collect();
    assert_eq!(events.len(), 6);
    assert_eq!(events[0].event_type, LifecycleEventType::PipelineStart);
    assert_eq!(events[5].event_type, LifecycleEventType::PipelineComplete);
}

#[tokio::test]
async fn test_status_snapshot_during_run() {
    let harness = Harness::new(fast_config());
    add(&harness, Feature::new("A", "acme", 1)).await;
    add(
        &harness,
        Feature::new("B", "acme", 1).with_dependencies(vec![id("A")]),
    )
    .await;
    harness.backend.script("A", Stage::Plan, vec![Step::Hang]);
    harness.scheduler.tick().await.unwrap();

    let status = harness.scheduler.status().await.unwrap();
    let acme = status.tenant(&TenantId::new("acme")).unwrap();
    assert_eq!(acme.in_flight, 1);
    assert_eq!(acme.running.len(), 1);
    assert_eq!(acme.running[0].id, id("A"));
    assert!(acme.ready.is_empty());
    assert_eq!(acme.blocked(), 1);

    harness.backend.wait_for_launches("A", 1).await;
    harness.backend.finish_hanging(0);
    harness.scheduler.join_pipelines().await;
}
