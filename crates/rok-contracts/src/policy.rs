//! Policy settings, decision contexts, and decisions.
//!
//! The kernel never authors policy. It snapshots a `PolicySettings` at
//! intake, builds a `PolicyContext` at each decision point, and acts on the
//! `PolicyDecision` it receives back.

use serde::{Deserialize, Serialize};

use crate::{
    conclusion::Severity,
    ids::StepId,
    step::ExecutorSpec,
    verify::VerificationStatus,
};

// ── Settings ─────────────────────────────────────────────────────────────────

/// How per-step confidences combine into one aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfidenceAggregation {
    #[default]
    Minimum,
    Mean,
    WeightedMean,
    Product,
}

/// One VERIFIED step's contribution to the aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepConfidence {
    pub step_id: StepId,
    pub confidence: f64,
    /// Weight for WEIGHTED_MEAN, from the verifier config key `weight` (default 1.0).
    pub weight: f64,
}

impl ConfidenceAggregation {
    /// Combine confidences. An empty slice aggregates to 0.
    pub fn apply(self, items: &[StepConfidence]) -> f64 {
        if items.is_empty() {
            return 0.0;
        }
        let value = match self {
            ConfidenceAggregation::Minimum => items
                .iter()
                .map(|c| c.confidence)
                .fold(f64::INFINITY, f64::min),
            ConfidenceAggregation::Mean => {
                items.iter().map(|c| c.confidence).sum::<f64>() / items.len() as f64
            }
            ConfidenceAggregation::WeightedMean => {
                let total: f64 = items.iter().map(|c| c.weight).sum();
                if total <= 0.0 {
                    items.iter().map(|c| c.confidence).sum::<f64>() / items.len() as f64
                } else {
                    items.iter().map(|c| c.confidence * c.weight).sum::<f64>() / total
                }
            }
            ConfidenceAggregation::Product => items.iter().map(|c| c.confidence).product(),
        };
        value.clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityPenalties {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
}

impl Default for SeverityPenalties {
    fn default() -> Self {
        Self {
            low: 0.02,
            medium: 0.1,
            high: 0.25,
        }
    }
}

impl SeverityPenalties {
    pub fn for_severity(&self, severity: Severity) -> f64 {
        match severity {
            Severity::Low => self.low,
            Severity::Medium => self.medium,
            Severity::High => self.high,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FinalizationSettings {
    pub min_confidence_to_finalize: f64,
    pub finalize_through_high_contradictions: bool,
    /// Finalize over the VERIFIED subset when some steps FAILED.
    pub allow_partial_finalization: bool,
    /// Refuse to finalize when any step is not VERIFIED.
    pub fail_closed_if_unverified: bool,
    pub aggregation: ConfidenceAggregation,
    pub severity_penalties: SeverityPenalties,
    /// Applied once when any revision happened during the run.
    pub revision_penalty: f64,
    /// Applied per step that escalated uncertainty.
    pub uncertainty_penalty: f64,
}

impl Default for FinalizationSettings {
    fn default() -> Self {
        Self {
            min_confidence_to_finalize: 0.5,
            finalize_through_high_contradictions: false,
            allow_partial_finalization: true,
            fail_closed_if_unverified: false,
            aggregation: ConfidenceAggregation::Minimum,
            severity_penalties: SeverityPenalties::default(),
            revision_penalty: 0.0,
            uncertainty_penalty: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsistencySettings {
    /// Percentage gap (in points) tolerated between two claims.
    pub numeric_tolerance: f64,
    /// Gap at or above which a numeric conflict is HIGH.
    pub high_severity_delta: f64,
    /// Token Jaccard needed for two claims to share a subject.
    pub subject_overlap: f64,
    /// Token Jaccard needed before a negation counts as a contradiction.
    pub negation_overlap: f64,
}

impl Default for ConsistencySettings {
    fn default() -> Self {
        Self {
            numeric_tolerance: 0.5,
            high_severity_delta: 2.0,
            subject_overlap: 0.3,
            negation_overlap: 0.6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySettings {
    pub write_verified_facts: bool,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            write_verified_facts: true,
        }
    }
}

/// The effective, run-scoped policy values the kernel enforces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySettings {
    pub policy_id: String,
    pub verification_confidence_threshold: f64,
    pub min_evidence_relevance: f64,
    pub max_retries_per_step: u32,
    pub max_total_revisions: u32,
    /// Executor names allowed to run. Empty allows all.
    pub allowed_executors: Vec<String>,
    /// Domains accepted at intake. Empty allows all.
    pub allowed_domains: Vec<String>,
    /// Step references (`S<n>` or a step id) that must carry evidence.
    pub evidence_required_steps: Vec<String>,
    /// Dependencies that no longer gate execution.
    pub waived_dependencies: Vec<StepId>,
    pub executor_timeout_ms: u64,
    pub max_parallel_steps: usize,
    pub finalization: FinalizationSettings,
    pub consistency: ConsistencySettings,
    pub memory: MemorySettings,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            policy_id: "default".to_string(),
            verification_confidence_threshold: 0.7,
            min_evidence_relevance: 0.2,
            max_retries_per_step: 3,
            max_total_revisions: 32,
            allowed_executors: Vec::new(),
            allowed_domains: Vec::new(),
            evidence_required_steps: Vec::new(),
            waived_dependencies: Vec::new(),
            executor_timeout_ms: 30_000,
            max_parallel_steps: 4,
            finalization: FinalizationSettings::default(),
            consistency: ConsistencySettings::default(),
            memory: MemorySettings::default(),
        }
    }
}

impl PolicySettings {
    pub fn executor_allowed(&self, name: &str) -> bool {
        self.allowed_executors.is_empty() || self.allowed_executors.iter().any(|e| e == name)
    }

    pub fn domain_allowed(&self, domain: &str) -> bool {
        self.allowed_domains.is_empty() || self.allowed_domains.iter().any(|d| d == domain)
    }

    /// True when `reference` names the step at `step_index` as `S<n>` or
    /// matches `step_id` exactly.
    pub fn step_matches(reference: &str, step_id: &StepId, step_index: usize) -> bool {
        if reference == step_id.as_str() {
            return true;
        }
        reference
            .strip_prefix('S')
            .and_then(|n| n.parse::<usize>().ok())
            .is_some_and(|n| n == step_index + 1)
    }

    pub fn requires_evidence(&self, step_id: &StepId, step_index: usize) -> bool {
        self.evidence_required_steps
            .iter()
            .any(|r| Self::step_matches(r, step_id, step_index))
    }
}

// ── Decision context ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionPoint {
    Revision,
    Finalization,
}

/// Which condition sent a step to the revision controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RevisionTrigger {
    VerificationBelowThreshold,
    EvidenceInsufficient,
    ExecutorFailure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyContext {
    pub decision_point: DecisionPoint,
    pub domain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<StepId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<RevisionTrigger>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_status: Option<VerificationStatus>,
    pub confidence: f64,
    pub retry_count: u32,
    pub total_revisions: u32,
    pub evidence_count: usize,
    #[serde(default)]
    pub contradiction_severities: Vec<Severity>,
}

/// The one action a policy gate returns for a context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PolicyDecision {
    FetchMoreEvidence {
        reason: String,
    },
    ReexecuteStep {
        reason: String,
        #[serde(default)]
        added_constraints: Vec<String>,
    },
    ChangeExecutor {
        reason: String,
        executor: ExecutorSpec,
    },
    EscalateUncertainty {
        reason: String,
    },
    Finalize,
    RequestClarification {
        reason: String,
    },
    Fail {
        reason: String,
    },
}

impl PolicyDecision {
    pub fn escalate(reason: impl Into<String>) -> Self {
        PolicyDecision::EscalateUncertainty {
            reason: reason.into(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            PolicyDecision::FetchMoreEvidence { .. } => "FETCH_MORE_EVIDENCE",
            PolicyDecision::ReexecuteStep { .. } => "REEXECUTE_STEP",
            PolicyDecision::ChangeExecutor { .. } => "CHANGE_EXECUTOR",
            PolicyDecision::EscalateUncertainty { .. } => "ESCALATE_UNCERTAINTY",
            PolicyDecision::Finalize => "FINALIZE",
            PolicyDecision::RequestClarification { .. } => "REQUEST_CLARIFICATION",
            PolicyDecision::Fail { .. } => "FAIL",
        }
    }
}

/// Input to the routing hook, queried once per step at intake.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingContext<'a> {
    pub domain: &'a str,
    pub step_id: &'a StepId,
    pub step_index: usize,
    pub declared: &'a ExecutorSpec,
}
