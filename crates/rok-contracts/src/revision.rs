//! Revision records: the append-only trail of corrective re-attempts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    ids::RevisionId,
    step::ExecutorSpec,
    verify::{Verification, VerificationStatus},
};

/// The corrective action chosen for a non-passing step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RevisionAction {
    /// Re-enter at the Evidence Binder.
    FetchMoreEvidence,
    /// Re-enter at the Execution Dispatcher, optionally with constraints.
    ReexecuteStep,
    /// Re-enter at the Execution Dispatcher with a different executor.
    ChangeExecutor,
    /// Stop revising; the step fails with an uncertainty flag.
    EscalateUncertainty,
}

impl RevisionAction {
    /// Escalation ends the loop; every other action is a retry and counts
    /// against the per-step ceiling.
    pub fn is_retry(self) -> bool {
        !matches!(self, RevisionAction::EscalateUncertainty)
    }
}

/// One revision decision. Never mutated after creation.
///
/// The outcome of a retry is linked from the other side: the execution and
/// verification it produced carry this record's `revision_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionRecord {
    pub revision_id: RevisionId,
    pub reason: String,
    pub action: RevisionAction,
    /// Status of the verification that triggered the revision.
    pub trigger_status: VerificationStatus,
    pub trigger_confidence: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub added_constraints: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_executor: Option<ExecutorSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_execution_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_verification: Option<Verification>,
    /// True when a revision ceiling overrode the policy's chosen action.
    #[serde(default)]
    pub forced: bool,
    pub created_at: DateTime<Utc>,
}

impl RevisionRecord {
    pub fn new(
        action: RevisionAction,
        reason: impl Into<String>,
        trigger: &Verification,
    ) -> Self {
        Self {
            revision_id: RevisionId::new(),
            reason: reason.into(),
            action,
            trigger_status: trigger.status,
            trigger_confidence: trigger.confidence,
            added_constraints: Vec::new(),
            new_executor: None,
            new_execution_output: None,
            new_verification: None,
            forced: false,
            created_at: Utc::now(),
        }
    }

    pub fn with_constraints(mut self, constraints: Vec<String>) -> Self {
        self.added_constraints = constraints;
        self
    }

    pub fn with_executor(mut self, executor: ExecutorSpec) -> Self {
        self.new_executor = Some(executor);
        self
    }

    pub fn forced(mut self) -> Self {
        self.forced = true;
        self
    }
}
