//! Pipeline run journal.
//!
//! Every pipeline run appends lifecycle records (`pipeline_start`, one
//! `stage` record per finished stage attempt, `pipeline_complete`) to
//! `<state_dir>/evidence/runs/<run_id>/events.jsonl`, with a `run.json`
//! manifest summarising the run. Old runs are pruned by retention.

pub mod lifecycle;
pub mod record;
pub mod store;
pub mod writer;

pub use lifecycle::{LifecycleEvent, LifecycleEventType};
pub use record::{EvidenceRecord, EvidenceRunMetadata, EVIDENCE_SCHEMA_VERSION};
pub use store::{EvidenceError, EvidenceResult, EvidenceStore};
pub use writer::EvidenceWriter;
