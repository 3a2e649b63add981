//! Collaborator trait definitions for the kernel.
//!
//! The kernel owns orchestration and nothing else. Every judgement or side
//! effect it needs comes through one of these seams:
//!
//! - `ModelAdapter`   turns a prompt template reference into text
//! - `ToolInterface`  runs an external action (calculation, lookup)
//! - `EvidenceSource` supplies evidence candidates for a step
//! - `StepVerifier`   judges whether an output is supported
//! - `PolicyGate`     returns decisions for revision and finalization
//! - `AuditSink`      receives every audit event after the kernel records it
//! - `MemoryStore`    persists verified facts across runs
//!
//! The first four are async because they are the kernel's only suspension
//! points. The rest are synchronous and expected to be fast.

use async_trait::async_trait;

use rok_contracts::{
    audit::LogEvent,
    conclusion::MemoryWrite,
    error::RokResult,
    evidence::Evidence,
    ids::{EvidenceId, StepId},
    policy::{ConfidenceAggregation, PolicyContext, PolicyDecision, PolicySettings, RoutingContext, StepConfidence},
    step::{ExecutorSpec, PromptTemplateRef, StepStatus},
    task::SourceDocument,
    verify::{VerificationStatus, VerifierSpec},
};

/// A read-only copy of one step plus the task context it runs in.
///
/// Collaborators never see the live document; they get a `StepView`
/// captured under the store lock.
#[derive(Debug, Clone, PartialEq)]
pub struct StepView {
    pub step_id: StepId,
    pub step_index: usize,
    pub logical_id: String,
    pub title: String,
    pub description: String,
    pub status: StepStatus,
    pub executor: ExecutorSpec,
    pub verifier: VerifierSpec,
    pub evidence_required: bool,
    pub evidence: Vec<Evidence>,
    /// Output of the current execution, if any.
    pub output: Option<String>,
    /// 1-based number of the next execution attempt.
    pub attempt: u32,
    pub constraints: Vec<String>,
    /// `(dependency id, dependency output)` in declaration order.
    pub dependency_outputs: Vec<(StepId, String)>,
    pub objective: String,
    pub domain: String,
    pub task_constraints: Vec<String>,
    pub inputs: serde_json::Value,
    pub sources: Vec<SourceDocument>,
}

impl StepView {
    pub fn evidence_ids(&self) -> Vec<EvidenceId> {
        self.evidence.iter().map(|e| e.evidence_id.clone()).collect()
    }
}

// ── Executors ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    /// Name of the model executor (`ExecutorSpec::name`).
    pub executor: String,
    pub template: PromptTemplateRef,
    /// Everything the template is rendered with. Persisted on the execution.
    pub parameters: serde_json::Value,
    pub step: StepView,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelResponse {
    pub text: String,
    /// Adapter metadata. A numeric `cost` field is added to the run ledger.
    pub metadata: serde_json::Value,
}

/// Turns a prompt template reference into text. Implementations decide how
/// to render the template; the kernel stores only the reference.
#[async_trait]
pub trait ModelAdapter: Send + Sync {
    async fn invoke(&self, request: &ModelRequest) -> RokResult<ModelResponse>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolResponse {
    /// Rendered output, stored as the execution output.
    pub output: String,
    pub data: Option<serde_json::Value>,
    pub tool_call_ref: String,
}

/// Executes an external action by name.
#[async_trait]
pub trait ToolInterface: Send + Sync {
    async fn invoke(&self, tool_name: &str, config: &serde_json::Value) -> RokResult<ToolResponse>;
}

// ── Evidence ─────────────────────────────────────────────────────────────────

/// Produces evidence candidates for a step.
///
/// `round` is 0 on first binding and increments with every
/// FETCH_MORE_EVIDENCE revision, so a source can widen its search.
#[async_trait]
pub trait EvidenceSource: Send + Sync {
    async fn gather(&self, step: &StepView, round: u32) -> RokResult<Vec<Evidence>>;
}

// ── Verification ─────────────────────────────────────────────────────────────

/// A verifier's raw judgement, before the coordinator applies policy.
#[derive(Debug, Clone, PartialEq)]
pub struct Judgement {
    pub status: VerificationStatus,
    pub confidence: f64,
    pub issues: Vec<String>,
    pub checked_evidence_ids: Vec<EvidenceId>,
}

impl Judgement {
    pub fn new(status: VerificationStatus, confidence: f64) -> Self {
        Self {
            status,
            confidence,
            issues: Vec::new(),
            checked_evidence_ids: Vec::new(),
        }
    }

    pub fn with_issue(mut self, issue: impl Into<String>) -> Self {
        self.issues.push(issue.into());
        self
    }

    pub fn checking(mut self, ids: Vec<EvidenceId>) -> Self {
        self.checked_evidence_ids = ids;
        self
    }
}

#[async_trait]
pub trait StepVerifier: Send + Sync {
    async fn judge(&self, step: &StepView) -> RokResult<Judgement>;
}

// ── Policy ───────────────────────────────────────────────────────────────────

/// The kernel's only source of policy decisions.
///
/// Implementations must be pure: the same context always yields the same
/// decision, and no call has side effects.
pub trait PolicyGate: Send + Sync {
    /// Effective settings for `domain`, snapshotted once per run.
    fn settings(&self, domain: &str) -> PolicySettings;

    /// Decide what happens at a revision or finalization point.
    fn decide(&self, ctx: &PolicyContext) -> PolicyDecision;

    /// Replace a step's declared executor. `None` keeps the declaration.
    fn route(&self, _ctx: &RoutingContext<'_>) -> Option<ExecutorSpec> {
        None
    }

    /// Combine per-step confidences into the run's base confidence.
    fn aggregate_confidence(&self, items: &[StepConfidence], method: ConfidenceAggregation) -> f64 {
        method.apply(items)
    }
}

// ── Sinks and stores ─────────────────────────────────────────────────────────

/// Receives audit events after the kernel has recorded them.
pub trait AuditSink: Send + Sync {
    fn emit(&self, event: &LogEvent) -> RokResult<()>;

    fn flush(&self) -> RokResult<()> {
        Ok(())
    }
}

/// Persistent memory shared across runs.
pub trait MemoryStore: Send + Sync {
    fn load(&self) -> RokResult<Vec<MemoryWrite>>;

    fn append(&self, writes: &[MemoryWrite]) -> RokResult<()>;
}
