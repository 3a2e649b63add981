//! Error taxonomy for the reasoning orchestration kernel.
//!
//! Only `Validation` and `CyclicDependency` ever escape task intake. Every
//! other variant is recovered inside the kernel and recorded as step or task
//! state, a revision record, a contradiction, or an audit event.

use thiserror::Error;

/// The unified error type for the kernel and its adapters.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RokError {
    /// Malformed task input or a schema violation detected at intake.
    #[error("validation error: {reason}")]
    Validation { reason: String },

    /// The step dependency graph contains a cycle.
    #[error("cyclic dependency detected among steps: {}", step_ids.join(", "))]
    CyclicDependency { step_ids: Vec<String> },

    /// A model or tool call failed, refused, or timed out.
    #[error("executor '{executor}' failed: {reason}")]
    ExecutorFailure { executor: String, reason: String },

    /// Required evidence was absent or below the relevance threshold.
    #[error("step '{step_id}' has insufficient evidence: {reason}")]
    EvidenceInsufficiency { step_id: String, reason: String },

    /// A verification did not meet the policy status or confidence bar.
    #[error("verification below threshold for step '{step_id}': {reason}")]
    VerificationBelowThreshold { step_id: String, reason: String },

    /// The per-step or per-task revision ceiling has been reached.
    #[error("revision ceiling reached for step '{step_id}': {reason}")]
    RevisionExhausted { step_id: String, reason: String },

    /// A HIGH severity contradiction blocks finalization.
    #[error("consistency conflict: {reason}")]
    ConsistencyConflict { reason: String },

    /// Confidence or contradiction policy was not met at finalization.
    #[error("finalization blocked: {reason}")]
    FinalizationBlocked { reason: String },

    /// An illegal status transition or invariant violation.
    #[error("state machine error: {reason}")]
    StateMachine { reason: String },

    /// A configuration value (usually policy) is missing or invalid.
    #[error("configuration error: {reason}")]
    Config { reason: String },

    /// A run document failed JSON Schema validation.
    #[error("schema validation error: {reason}")]
    SchemaValidation { reason: String },

    /// An audit sink could not accept an event.
    #[error("audit write failed: {reason}")]
    AuditWriteFailed { reason: String },

    /// Memory or document storage failed.
    #[error("storage error: {reason}")]
    Storage { reason: String },

    /// The run was cancelled while the operation was in flight.
    #[error("run cancelled: {reason}")]
    Cancelled { reason: String },

    /// An external call exceeded its deadline.
    #[error("'{operation}' timed out after {timeout_ms} ms")]
    Timeout { operation: String, timeout_ms: u64 },
}

impl RokError {
    pub fn state(reason: impl Into<String>) -> Self {
        RokError::StateMachine { reason: reason.into() }
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        RokError::Validation { reason: reason.into() }
    }

    /// True for the failures an executor call can produce, including timeout.
    pub fn is_executor_failure(&self) -> bool {
        matches!(
            self,
            RokError::ExecutorFailure { .. } | RokError::Timeout { .. }
        )
    }
}

/// Convenience alias used throughout the workspace.
pub type RokResult<T> = Result<T, RokError>;
