//! Classification of pipeline failures.
//!
//! Every path into the `failed` stage carries a `FailureReason`. Its
//! `Display` form is the reason string recorded on the feature; its label is
//! the stable `error_type` written to the run journal.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::Stage;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The execution backend stayed unavailable through every launch retry.
    Infrastructure { stage: Stage, message: String },
    /// The stage exceeded its maximum wall-clock duration.
    Timeout { stage: Stage },
    /// The worker exited with an unexpected status.
    WorkerError { stage: Stage, exit_code: Option<i32> },
    /// A worker rejected the work outside the review rework path.
    Rejected { stage: Stage },
    /// The reviewer requested changes after the single rework was used.
    ReworkExhausted,
    /// An external stop request terminated the run.
    Cancelled { stage: Stage },
    /// The backend no longer knows the worker (e.g. lost across a restart).
    WorkerLost { stage: Stage },
}

impl FailureReason {
    /// Stable label for journal records and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            FailureReason::Infrastructure { .. } => "infrastructure",
            FailureReason::Timeout { .. } => "timeout",
            FailureReason::WorkerError { .. } => "worker_error",
            FailureReason::Rejected { .. } => "rejected",
            FailureReason::ReworkExhausted => "rework_exhausted",
            FailureReason::Cancelled { .. } => "cancelled",
            FailureReason::WorkerLost { .. } => "worker_lost",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Infrastructure { stage, message } => {
                write!(f, "infrastructure: {} worker could not be launched ({})", stage, message)
            }
            FailureReason::Timeout { stage } => write!(f, "timeout: {} exceeded its time limit", stage),
            FailureReason::WorkerError { stage, exit_code } => match exit_code {
                Some(code) => write!(f, "worker_error: {} exited with code {}", stage, code),
                None => write!(f, "worker_error: {} terminated abnormally", stage),
            },
            FailureReason::Rejected { stage } => write!(f, "rejected: {} worker rejected the work", stage),
            FailureReason::ReworkExhausted => {
                write!(f, "rework_exhausted: review requested changes after rework was used")
            }
            FailureReason::Cancelled { stage } => write!(f, "cancelled: stopped during {}", stage),
            FailureReason::WorkerLost { stage } => {
                write!(f, "worker_lost: {} worker is no longer known to the backend", stage)
            }
        }
    }
}
