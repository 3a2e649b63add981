//! Audit events as they appear in the run document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::EventId;

/// Every kind of transition or decision the kernel records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    TaskReceived,
    TaskRejected,
    TaskDecomposed,
    ExecutorRouted,
    StepScheduled,
    EvidenceAttached,
    EvidenceInsufficient,
    StepExecuted,
    ExecutorFailed,
    StepVerified,
    VerificationFailed,
    PolicyDecision,
    RevisionRecorded,
    RevisionExhausted,
    UncertaintyEscalated,
    StepFailed,
    ConsistencyChecked,
    ContradictionDetected,
    FinalConclusionEmitted,
    ClarificationRequested,
    FinalizationFailed,
    MemoryWritten,
    RunCancelled,
    RunCompleted,
}

/// One entry in the run's append-only event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub event_id: EventId,
    /// Position in the run's event stream, starting at 0.
    pub sequence: u64,
    pub event_type: AuditEventType,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// The audit section of a run document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Audit {
    pub kernel_version: String,
    pub rsl_version: String,
    #[serde(default)]
    pub events: Vec<LogEvent>,
}

impl Default for Audit {
    fn default() -> Self {
        Self {
            kernel_version: crate::KERNEL_VERSION.to_string(),
            rsl_version: crate::RSL_VERSION.to_string(),
            events: Vec::new(),
        }
    }
}
