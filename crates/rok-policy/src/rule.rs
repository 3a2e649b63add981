//! Policy document schema.
//!
//! A `PolicyConfig` is deserialized from TOML. It carries the base
//! `[settings]`, per-domain overrides, an ordered list of revision rules,
//! executor routing, and finalization rules. Revision rules are evaluated in
//! declaration order and the first match wins; a revision context no rule
//! matches escalates uncertainty.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use rok_contracts::{
    policy::{
        ConfidenceAggregation, FinalizationSettings, PolicyContext, PolicySettings,
        RevisionTrigger,
    },
    verify::VerificationStatus,
};

/// What a revision rule tells the kernel to do.
///
/// Expressed in kebab-case in TOML:
/// ```toml
/// action = "fetch-more-evidence"
/// action = "reexecute-step"
/// action = "change-executor"
/// action = "escalate-uncertainty"
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleAction {
    FetchMoreEvidence,
    ReexecuteStep,
    ChangeExecutor,
    EscalateUncertainty,
}

fn wildcard() -> String {
    "*".to_string()
}

fn first_version() -> String {
    "1".to_string()
}

/// A single revision rule.
///
/// Every condition is optional; an absent condition matches anything.
/// `domain` accepts the wildcard `"*"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevisionRule {
    /// Stable identifier used in decision reasons and logs.
    pub id: String,

    #[serde(default)]
    pub description: String,

    #[serde(default = "wildcard")]
    pub domain: String,

    /// Only match this revision trigger.
    pub trigger: Option<RevisionTrigger>,

    /// Only match this verification status.
    pub status: Option<VerificationStatus>,

    /// Match while the step's retry count is below this value.
    pub below_retry_count: Option<u32>,

    /// Match when confidence is at least this value.
    pub min_confidence: Option<f64>,

    /// Match when confidence is strictly below this value.
    pub max_confidence: Option<f64>,

    pub action: RuleAction,

    /// Written to the revision record. Defaults to a reason naming the rule.
    pub reason: Option<String>,

    /// Constraints added on `reexecute-step`.
    #[serde(default)]
    pub added_constraints: Vec<String>,

    /// Target model executor for `change-executor`.
    pub executor: Option<String>,

    /// Prompt template for the target model executor.
    pub template_id: Option<String>,

    #[serde(default = "first_version")]
    pub template_version: String,
}

impl RevisionRule {
    pub fn matches(&self, ctx: &PolicyContext) -> bool {
        let domain = self.domain == "*" || self.domain == ctx.domain;
        let trigger = self.trigger.is_none() || self.trigger == ctx.trigger;
        let status = self.status.is_none() || self.status == ctx.verification_status;
        let retries = self.below_retry_count.map_or(true, |n| ctx.retry_count < n);
        let floor = self.min_confidence.map_or(true, |c| ctx.confidence >= c);
        let ceiling = self.max_confidence.map_or(true, |c| ctx.confidence < c);
        domain && trigger && status && retries && floor && ceiling
    }

    pub fn reason(&self) -> String {
        self.reason
            .clone()
            .unwrap_or_else(|| format!("revision rule '{}' matched", self.id))
    }
}

/// Per-domain overrides laid over `[settings]`.
///
/// ```toml
/// [[domains]]
/// name = "research"
/// verification_confidence_threshold = 0.85
/// evidence_required_steps = ["S2", "S3"]
/// min_confidence_to_finalize = 0.6
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DomainPolicy {
    pub name: String,
    pub verification_confidence_threshold: Option<f64>,
    pub min_evidence_relevance: Option<f64>,
    pub max_retries_per_step: Option<u32>,
    pub max_total_revisions: Option<u32>,
    pub allowed_executors: Option<Vec<String>>,
    pub evidence_required_steps: Option<Vec<String>>,
    pub executor_timeout_ms: Option<u64>,
    pub min_confidence_to_finalize: Option<f64>,
    pub finalize_through_high_contradictions: Option<bool>,
    pub allow_partial_finalization: Option<bool>,
    pub fail_closed_if_unverified: Option<bool>,
    pub aggregation: Option<ConfidenceAggregation>,
    pub revision_penalty: Option<f64>,
    pub uncertainty_penalty: Option<f64>,
    pub write_verified_facts: Option<bool>,
}

impl DomainPolicy {
    /// Lay these overrides over `settings`.
    pub fn apply(&self, settings: &mut PolicySettings) {
        fn set<T: Clone>(target: &mut T, value: &Option<T>) {
            if let Some(v) = value {
                *target = v.clone();
            }
        }
        set(&mut settings.verification_confidence_threshold, &self.verification_confidence_threshold);
        set(&mut settings.min_evidence_relevance, &self.min_evidence_relevance);
        set(&mut settings.max_retries_per_step, &self.max_retries_per_step);
        set(&mut settings.max_total_revisions, &self.max_total_revisions);
        set(&mut settings.allowed_executors, &self.allowed_executors);
        set(&mut settings.evidence_required_steps, &self.evidence_required_steps);
        set(&mut settings.executor_timeout_ms, &self.executor_timeout_ms);

        let f = &mut settings.finalization;
        set(&mut f.min_confidence_to_finalize, &self.min_confidence_to_finalize);
        set(&mut f.finalize_through_high_contradictions, &self.finalize_through_high_contradictions);
        set(&mut f.allow_partial_finalization, &self.allow_partial_finalization);
        set(&mut f.fail_closed_if_unverified, &self.fail_closed_if_unverified);
        set(&mut f.aggregation, &self.aggregation);
        set(&mut f.revision_penalty, &self.revision_penalty);
        set(&mut f.uncertainty_penalty, &self.uncertainty_penalty);

        set(&mut settings.memory.write_verified_facts, &self.write_verified_facts);
    }
}

/// Executor routing for MODEL steps. Step override beats domain override
/// beats the default.
///
/// ```toml
/// [routing]
/// default_model_executor = "gpt_stub"
/// domain_overrides = { research = "o3_stub" }
/// step_overrides = { S2 = "o3_stub" }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Keys are `S<n>` logical ids or step ids.
    pub step_overrides: BTreeMap<String, String>,
    pub domain_overrides: BTreeMap<String, String>,
    pub default_model_executor: Option<String>,
}

/// `[finalization]`: the kernel's finalization settings plus the gate's own
/// global block threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizationConfig {
    #[serde(flatten)]
    pub settings: FinalizationSettings,

    /// The gate requests clarification below this aggregate confidence,
    /// whatever the domain allows.
    #[serde(default)]
    pub block_if_confidence_below: f64,

    #[serde(default = "default_block_message")]
    pub block_message: String,
}

fn default_block_message() -> String {
    "Output blocked by policy.".to_string()
}

impl Default for FinalizationConfig {
    fn default() -> Self {
        Self {
            settings: FinalizationSettings::default(),
            block_if_confidence_below: 0.0,
            block_message: default_block_message(),
        }
    }
}

/// The top-level structure deserialized from a TOML policy file.
///
/// Example:
/// ```toml
/// [settings]
/// policy_id = "research-v1"
/// verification_confidence_threshold = 0.85
///
/// [[revision_rules]]
/// id = "refetch-on-partial"
/// status = "PARTIALLY_SUPPORTED"
/// action = "fetch-more-evidence"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub settings: PolicySettings,
    pub domains: Vec<DomainPolicy>,
    /// Ordered list of revision rules. First match wins.
    pub revision_rules: Vec<RevisionRule>,
    pub routing: RoutingConfig,
    pub finalization: Option<FinalizationConfig>,
}
