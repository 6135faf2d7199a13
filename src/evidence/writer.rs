use serde_json::Value;
use tracing::warn;

use crate::error::FailureReason;
use crate::evidence::lifecycle::{LifecycleEvent, LifecycleEventType};
use crate::evidence::record::{EvidenceRecord, LIFECYCLE_KIND};
use crate::evidence::store::EvidenceStore;
use crate::model::{FeatureId, PipelineRun, RunId, Stage, StageAttempt};

/// Writes lifecycle events for one pipeline run.
///
/// Journal failures never affect the pipeline; they are logged and dropped.
pub struct EvidenceWriter {
    run_id: RunId,
    feature: FeatureId,
    store: EvidenceStore,
    opened: bool,
}

impl EvidenceWriter {
    /// Open (or reopen after restart) the journal for `run`.
    pub fn open(store: EvidenceStore, run: &PipelineRun) -> Self {
        let opened = match store.open_run(&run.id, &run.feature, &run.tenant) {
            Ok(_) => true,
            Err(err) => {
                warn!(run_id = %run.id, "failed to open run journal: {}", err);
                false
            }
        };
        Self {
            run_id: run.id.clone(),
            feature: run.feature.clone(),
            store,
            opened,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn emit_pipeline_start(&self, resumed_at: Option<Stage>) {
        let mut event = self.event(LifecycleEventType::PipelineStart);
        if let Some(stage) = resumed_at {
            event.stage = Some(stage);
            event.status = Some("resumed".to_string());
        } else {
            event.status = Some("started".to_string());
        }
        self.write_event(event);
    }

    pub fn emit_stage(&self, attempt: &StageAttempt, reason: Option<&FailureReason>) {
        let mut event = self.event(LifecycleEventType::Stage);
        event.stage = Some(attempt.stage);
        event.status = Some(attempt.status.as_str().to_string());
        event.exit_code = attempt.exit_code;
        if let Some(reason) = reason {
            event.error_type = Some(reason.label().to_string());
            event.error_message = Some(reason.to_string());
        }
        self.write_event(event);
    }

    pub fn emit_pipeline_complete(&self, stage: Stage, reason: Option<&FailureReason>) {
        let mut event = self.event(LifecycleEventType::PipelineComplete);
        event.stage = Some(stage);
        event.status = Some(stage.as_str().to_string());
        if let Some(reason) = reason {
            event.error_type = Some(reason.label().to_string());
            event.error_message = Some(reason.to_string());
        }
        self.write_event(event);
        if self.opened {
            if let Err(err) = self.store.complete_run(&self.run_id, stage.as_str()) {
                warn!(run_id = %self.run_id, "failed to complete run journal: {}", err);
            }
        }
    }

    fn event(&self, event_type: LifecycleEventType) -> LifecycleEvent {
        LifecycleEvent::new(event_type, self.run_id.clone(), self.feature.clone())
    }

    fn write_event(&self, event: LifecycleEvent) {
        if !self.opened {
            return;
        }
        let payload: Value = match serde_json::to_value(&event) {
            Ok(value) => value,
            Err(err) => {
                warn!(run_id = %self.run_id, "failed to serialize journal event: {}", err);
                return;
            }
        };

        let record = EvidenceRecord::new(self.run_id.clone(), LIFECYCLE_KIND, payload);
        if let Err(err) = self.store.append_record(&record) {
            warn!(
                run_id = %self.run_id,
                "failed to write journal event to {}: {}",
                self.store.root_dir().display(),
                err
            );
        }
    }
}
