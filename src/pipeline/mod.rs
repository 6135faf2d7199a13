//! Pipeline state machine.
//!
//! Drives one feature through `plan → implement → review → verify → done`.
//! Any non-success ends the run in `failed`, with one exception: the first
//! "changes requested" result at review sends the run back to implement,
//! carrying the reviewer's output as feedback. That back-edge fires at most
//! once per run.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::FailureReason;
use crate::evidence::{EvidenceStore, EvidenceWriter};
use crate::execution::{ExecutionUnitManager, WaitOutcome};
use crate::metrics::MetricsCollector;
use crate::model::{PipelineRun, Stage, StageAttempt, UnitHandle, UnitReport, UnitStatus};
use crate::parallel::SlotTicket;
use crate::reporter::OutcomeReporter;
use crate::store::Store;

/// Feedback passed to a rework `implement` when the reviewer printed nothing.
pub const DEFAULT_REWORK_FEEDBACK: &str = "Reviewer requested changes without further detail.";

/// What a finished stage attempt does to the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Enter the given stage (`Done` after verify).
    Advance(Stage),
    /// Take the review → implement back-edge.
    Rework,
    Fail(FailureReason),
}

/// Decide the transition for a terminal unit report observed at `stage`.
pub fn next_transition(stage: Stage, rework_used: bool, report: &UnitReport) -> Transition {
    match report.status {
        UnitStatus::Succeeded => Transition::Advance(stage.next()),
        UnitStatus::Rejected if stage == Stage::Review => {
            if rework_used {
                Transition::Fail(FailureReason::ReworkExhausted)
            } else {
                Transition::Rework
            }
        }
        UnitStatus::Rejected => Transition::Fail(FailureReason::Rejected { stage }),
        UnitStatus::TimedOut => Transition::Fail(FailureReason::Timeout { stage }),
        UnitStatus::Errored if report.lost => Transition::Fail(FailureReason::WorkerLost { stage }),
        UnitStatus::Errored | UnitStatus::Launching | UnitStatus::Running => {
            Transition::Fail(FailureReason::WorkerError {
                stage,
                exit_code: report.exit_code,
            })
        }
    }
}

/// Collaborators shared by every pipeline task.
pub struct PipelineContext {
    pub store: Arc<dyn Store>,
    pub units: Arc<ExecutionUnitManager>,
    pub reporter: Arc<OutcomeReporter>,
    pub metrics: MetricsCollector,
    pub evidence: Option<EvidenceStore>,
}

/// One live pipeline run. Owns the run record and the tenant slot.
pub struct PipelineStateMachine {
    ctx: Arc<PipelineContext>,
    run: PipelineRun,
    ticket: SlotTicket,
    cancel: watch::Receiver<bool>,
    journal: Option<EvidenceWriter>,
}

impl PipelineStateMachine {
    pub fn new(
        ctx: Arc<PipelineContext>,
        run: PipelineRun,
        ticket: SlotTicket,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        let journal = ctx
            .evidence
            .clone()
            .map(|store| EvidenceWriter::open(store, &run));
        Self {
            ctx,
            run,
            ticket,
            cancel,
            journal,
        }
    }

    /// Drive the run to `done` or `failed`, report the outcome and return
    /// the final run record.
    pub async fn run(mut self) -> PipelineRun {
        let resumed = self.run.active_unit.is_some() || !self.run.attempts.is_empty();
        info!(
            feature = %self.run.feature,
            run_id = %self.run.id,
            stage = %self.run.stage,
            resumed,
            "pipeline started"
        );
        if let Some(journal) = &self.journal {
            journal.emit_pipeline_start(resumed.then_some(self.run.stage));
        }

        let mut failure: Option<FailureReason> = None;
        while !self.run.stage.is_terminal() {
            if let Err(reason) = self.step().await {
                self.run.failure_reason = Some(reason.to_string());
                self.run.enter(Stage::Failed);
                failure = Some(reason);
            }
            self.persist().await;
        }

        if let Some(journal) = &self.journal {
            journal.emit_pipeline_complete(self.run.stage, failure.as_ref());
        }

        let Self {
            ctx, run, ticket, ..
        } = self;
        match failure {
            None => {
                ctx.reporter.on_pipeline_done(&run, ticket).await;
            }
            Some(reason) => {
                ctx.reporter.on_pipeline_failed(&run, &reason, ticket).await;
            }
        }
        run
    }

    /// Run the current stage to a terminal status and apply the transition.
    async fn step(&mut self) -> Result<(), FailureReason> {
        let stage = self.run.stage;
        let handle = self.acquire_unit(stage).await?;

        let report = match self.ctx.units.wait(&handle, &mut self.cancel).await {
            WaitOutcome::Finished(report) => report,
            WaitOutcome::Cancelled => {
                warn!(feature = %self.run.feature, stage = %stage, "pipeline cancelled");
                self.ctx.units.terminate(&handle).await;
                let report = self.ctx.units.poll(&handle).await;
                let reason = FailureReason::Cancelled { stage };
                self.record_attempt(&handle, &report, Some(&reason));
                self.ctx.units.forget(&handle);
                return Err(reason);
            }
        };
        self.ctx.units.forget(&handle);

        let transition = next_transition(stage, self.run.rework_used, &report);
        let reason = match &transition {
            Transition::Fail(reason) => Some(reason),
            _ => None,
        };
        self.record_attempt(&handle, &report, reason);

        match transition {
            Transition::Advance(next) => {
                if stage == Stage::Implement {
                    self.run.feedback = None;
                }
                debug!(feature = %self.run.feature, from = %stage, to = %next, "stage succeeded");
                self.run.enter(next);
                Ok(())
            }
            Transition::Rework => {
                let feedback = report
                    .output
                    .filter(|text| !text.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_REWORK_FEEDBACK.to_string());
                info!(feature = %self.run.feature, "review requested changes, reworking");
                self.run.rework_used = true;
                self.run.feedback = Some(feedback);
                self.ctx.metrics.record_rework();
                self.run.enter(Stage::Implement);
                Ok(())
            }
            Transition::Fail(reason) => Err(reason),
        }
    }

    /// Reattach the unit recorded for this stage, or launch a new one.
    async fn acquire_unit(&mut self, stage: Stage) -> Result<UnitHandle, FailureReason> {
        if let Some(handle) = self.run.active_unit.clone() {
            self.ctx
                .units
                .attach(handle.clone(), stage, self.run.stage_started_at);
            return Ok(handle);
        }
        if *self.cancel.borrow() {
            return Err(FailureReason::Cancelled { stage });
        }

        let params = self.run.launch_params();
        let launched = self
            .ctx
            .units
            .launch(stage, &params, &mut self.cancel)
            .await
            .map_err(|err| FailureReason::Infrastructure {
                stage,
                message: err.to_string(),
            })?;
        let Some(handle) = launched else {
            return Err(FailureReason::Cancelled { stage });
        };
        self.run.active_unit = Some(handle.clone());
        self.persist().await;
        Ok(handle)
    }

    fn record_attempt(
        &mut self,
        handle: &UnitHandle,
        report: &UnitReport,
        reason: Option<&FailureReason>,
    ) {
        let finished_at = Utc::now();
        let attempt = StageAttempt {
            stage: self.run.stage,
            handle: Some(handle.clone()),
            status: report.status,
            exit_code: report.exit_code,
            started_at: self.run.stage_started_at,
            finished_at,
        };
        let duration = (finished_at - attempt.started_at)
            .to_std()
            .unwrap_or_default();
        self.ctx
            .metrics
            .record_stage(attempt.stage, attempt.status, duration);
        if let Some(journal) = &self.journal {
            journal.emit_stage(&attempt, reason);
        }
        self.run.attempts.push(attempt);
    }

    async fn persist(&mut self) {
        self.run.updated_at = Utc::now();
        if let Err(err) = self.ctx.store.update_pipeline_run(&self.run).await {
            warn!(run_id = %self.run.id, "failed to persist pipeline run: {}", err);
        }
    }
}
