//! Execution unit management.
//!
//! An execution unit is one isolated worker invocation for a single stage.
//! The `ExecutionBackend` trait is the seam to whatever actually runs
//! workers; `ExecutionUnitManager` wraps it with launch retries, per-stage
//! deadlines, forced termination and exit-code interpretation.

pub mod process;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::RetryPolicy;
use crate::error::{BackendError, LaunchError};
use crate::model::{LaunchParams, Stage, UnitHandle, UnitReport, UnitStatus};
use crate::timeout::StageTimeouts;

pub use process::ProcessBackend;

/// Worker state as reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerState {
    /// Accepted but not yet running.
    Starting,
    Running,
    /// Finished with an exit code and, optionally, captured output.
    Exited {
        exit_code: i32,
        output: Option<String>,
    },
    /// The backend has no record of the handle.
    Lost,
}

/// Something that can run stage workers.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Start an isolated worker for `stage`.
    async fn start_worker(
        &self,
        stage: Stage,
        params: &LaunchParams,
    ) -> Result<UnitHandle, BackendError>;

    /// Current state of a worker. Must not block on the worker.
    ///
    /// A backend may release a worker once it has reported `Exited` or been
    /// stopped; later queries for that handle report `Lost`.
    async fn worker_status(&self, handle: &UnitHandle) -> Result<WorkerState, BackendError>;

    /// Force-stop a worker. Stopping an unknown or finished worker is not an
    /// error.
    async fn stop_worker(&self, handle: &UnitHandle) -> Result<(), BackendError>;
}

/// How `ExecutionUnitManager::wait` ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Finished(UnitReport),
    /// The cancel signal fired before the unit reached a terminal status.
    Cancelled,
}

#[derive(Debug)]
struct TrackedUnit {
    stage: Stage,
    deadline: Option<Instant>,
    /// Set once the unit is terminal; later polls return it unchanged.
    outcome: Option<UnitReport>,
}

/// Launches, polls and terminates execution units.
pub struct ExecutionUnitManager {
    backend: Arc<dyn ExecutionBackend>,
    timeouts: StageTimeouts,
    retry: RetryPolicy,
    changes_requested_exit_code: i32,
    units: Mutex<HashMap<UnitHandle, TrackedUnit>>,
}

impl ExecutionUnitManager {
    pub fn new(
        backend: Arc<dyn ExecutionBackend>,
        timeouts: StageTimeouts,
        retry: RetryPolicy,
        changes_requested_exit_code: i32,
    ) -> Self {
        Self {
            backend,
            timeouts,
            retry,
            changes_requested_exit_code,
            units: Mutex::new(HashMap::new()),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.timeouts.poll_interval()
    }

    /// Start a worker for `stage`, retrying with exponential backoff while
    /// the backend is unavailable. Returns `None` when `cancel` fires during
    /// a backoff.
    pub async fn launch(
        &self,
        stage: Stage,
        params: &LaunchParams,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<Option<UnitHandle>, LaunchError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.backend.start_worker(stage, params).await {
                Ok(handle) => {
                    info!(
                        feature = %params.feature,
                        stage = %stage,
                        handle = %handle,
                        attempt,
                        "execution unit launched"
                    );
                    self.track(handle.clone(), stage, Utc::now());
                    return Ok(Some(handle));
                }
                Err(err @ BackendError::NotConfigured(_)) => {
                    return Err(LaunchError {
                        stage,
                        attempts: attempt,
                        message: err.to_string(),
                    });
                }
                Err(err) => match self.retry.next_delay(attempt) {
                    Some(delay) => {
                        warn!(
                            feature = %params.feature,
                            stage = %stage,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "launch failed, retrying: {}",
                            err
                        );
                        if !backoff(delay, cancel).await {
                            debug!(feature = %params.feature, stage = %stage, "launch cancelled");
                            return Ok(None);
                        }
                    }
                    None => {
                        return Err(LaunchError {
                            stage,
                            attempts: attempt,
                            message: err.to_string(),
                        });
                    }
                },
            }
        }
    }

    /// Resume tracking a unit launched before a restart. The stage deadline
    /// counts from `stage_started_at`, not from now.
    pub fn attach(&self, handle: UnitHandle, stage: Stage, stage_started_at: DateTime<Utc>) {
        debug!(handle = %handle, stage = %stage, "reattaching execution unit");
        self.track(handle, stage, stage_started_at);
    }

    fn track(&self, handle: UnitHandle, stage: Stage, started_at: DateTime<Utc>) {
        let deadline = self.timeouts.for_stage(stage).map(|limit| {
            let elapsed = (Utc::now() - started_at).to_std().unwrap_or_default();
            Instant::now() + limit.saturating_sub(elapsed)
        });
        if let Ok(mut units) = self.units.lock() {
            units.insert(
                handle,
                TrackedUnit {
                    stage,
                    deadline,
                    outcome: None,
                },
            );
        }
    }

    fn tracked(&self, handle: &UnitHandle) -> Option<(Stage, Option<Instant>, Option<UnitReport>)> {
        let units = self.units.lock().ok()?;
        units
            .get(handle)
            .map(|unit| (unit.stage, unit.deadline, unit.outcome.clone()))
    }

    fn settle(&self, report: UnitReport) -> UnitReport {
        if let Ok(mut units) = self.units.lock() {
            if let Some(unit) = units.get_mut(&report.handle) {
                if let Some(existing) = &unit.outcome {
                    return existing.clone();
                }
                unit.outcome = Some(report.clone());
            }
        }
        report
    }

    /// Current status of a unit. Non-blocking; terminates the unit and
    /// reports `timed_out` once its stage deadline has passed.
    pub async fn poll(&self, handle: &UnitHandle) -> UnitReport {
        let Some((stage, deadline, outcome)) = self.tracked(handle) else {
            warn!(handle = %handle, "poll of untracked execution unit");
            let mut report = UnitReport::new(handle.clone(), Stage::Failed, UnitStatus::Errored);
            report.lost = true;
            return report;
        };
        if let Some(report) = outcome {
            return report;
        }

        if deadline.is_some_and(|d| Instant::now() >= d) {
            warn!(handle = %handle, stage = %stage, "stage deadline exceeded, terminating unit");
            self.stop(handle).await;
            return self.settle(UnitReport::new(handle.clone(), stage, UnitStatus::TimedOut));
        }

        match self.backend.worker_status(handle).await {
            Ok(WorkerState::Starting) => UnitReport::new(handle.clone(), stage, UnitStatus::Launching),
            Ok(WorkerState::Running) => UnitReport::new(handle.clone(), stage, UnitStatus::Running),
            Ok(WorkerState::Exited { exit_code, output }) => {
                let status = self.classify_exit(exit_code);
                debug!(handle = %handle, stage = %stage, exit_code, status = %status, "execution unit exited");
                let mut report = UnitReport::new(handle.clone(), stage, status);
                report.exit_code = Some(exit_code);
                report.output = output;
                self.settle(report)
            }
            Ok(WorkerState::Lost) => {
                warn!(handle = %handle, stage = %stage, "execution unit lost by backend");
                let mut report = UnitReport::new(handle.clone(), stage, UnitStatus::Errored);
                report.lost = true;
                self.settle(report)
            }
            Err(err) => {
                // Status errors are treated as transient; the deadline bounds them.
                warn!(handle = %handle, stage = %stage, "status check failed: {}", err);
                UnitReport::new(handle.clone(), stage, UnitStatus::Running)
            }
        }
    }

    /// Exit code 0 succeeds; the reviewer's changes-requested code rejects;
    /// anything else is an error.
    pub fn classify_exit(&self, exit_code: i32) -> UnitStatus {
        if exit_code == 0 {
            UnitStatus::Succeeded
        } else if exit_code == self.changes_requested_exit_code {
            UnitStatus::Rejected
        } else {
            UnitStatus::Errored
        }
    }

    /// Best-effort force stop. Later polls report `errored` unless the unit
    /// had already reached a terminal status.
    pub async fn terminate(&self, handle: &UnitHandle) {
        let stage = self
            .tracked(handle)
            .map(|(stage, _, _)| stage)
            .unwrap_or(Stage::Failed);
        info!(handle = %handle, stage = %stage, "terminating execution unit");
        self.stop(handle).await;
        self.settle(UnitReport::new(handle.clone(), stage, UnitStatus::Errored));
    }

    async fn stop(&self, handle: &UnitHandle) {
        if let Err(err) = self.backend.stop_worker(handle).await {
            warn!(handle = %handle, "failed to stop worker: {}", err);
        }
    }

    /// Drop bookkeeping for a unit whose result has been consumed.
    pub fn forget(&self, handle: &UnitHandle) {
        if let Ok(mut units) = self.units.lock() {
            units.remove(handle);
        }
    }

    /// Poll `handle` until it is terminal or `cancel` turns true.
    ///
    /// Polling waits are the only suspension points of a pipeline; a cancel
    /// signal interrupts the wait immediately.
    pub async fn wait(&self, handle: &UnitHandle, cancel: &mut watch::Receiver<bool>) -> WaitOutcome {
        let interval = self.poll_interval();
        let mut cancel_open = true;
        loop {
            if *cancel.borrow() {
                return WaitOutcome::Cancelled;
            }
            let report = self.poll(handle).await;
            if report.status.is_terminal() {
                return WaitOutcome::Finished(report);
            }
            if cancel_open {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    changed = cancel.changed() => {
                        if changed.is_err() {
                            cancel_open = false;
                        }
                    }
                }
            } else {
                tokio::time::sleep(interval).await;
            }
        }
    }
}

/// Sleep for `delay`. Returns false as soon as `cancel` turns true.
async fn backoff(delay: Duration, cancel: &mut watch::Receiver<bool>) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        if *cancel.borrow() {
            return false;
        }
        tokio::select! {
            _ = &mut sleep => return !*cancel.borrow(),
            changed = cancel.changed() => {
                if changed.is_err() {
                    // Sender gone: nobody can cancel any more.
                    (&mut sleep).await;
                    return true;
                }
            }
        }
    }
}
