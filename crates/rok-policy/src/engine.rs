//! TOML-driven policy gate implementation.
//!
//! `TomlPolicyGate` loads a `PolicyConfig` from a TOML string or file and
//! implements the `PolicyGate` trait from rok-core.
//!
//! Revision algorithm:
//!
//! 1. Iterate revision rules in declaration order.
//! 2. The first rule whose conditions match the context produces the decision.
//! 3. If no rule matched → `EscalateUncertainty` (a step is never retried
//!    without a rule that asks for it).
//!
//! Finalization returns `Finalize` unless the aggregate confidence is below
//! the global block threshold, which yields `RequestClarification`.

use std::path::Path;

use tracing::{debug, warn};

use rok_contracts::{
    error::{RokError, RokResult},
    policy::{DecisionPoint, PolicyContext, PolicyDecision, PolicySettings, RoutingContext},
    step::{ExecutorKind, ExecutorSpec, PromptTemplateRef},
};
use rok_core::traits::PolicyGate;

use crate::rule::{PolicyConfig, RuleAction};

fn config_error(reason: impl Into<String>) -> RokError {
    RokError::Config {
        reason: reason.into(),
    }
}

/// A `PolicyGate` implementation that reads its rules from a TOML document.
///
/// ```rust,ignore
/// use rok_policy::TomlPolicyGate;
///
/// let gate = TomlPolicyGate::from_file(Path::new("policies/research.toml"))?;
/// // Pass `Arc::new(gate)` to `rok_core::Kernel::new(...)`.
/// ```
#[derive(Debug, Clone)]
pub struct TomlPolicyGate {
    config: PolicyConfig,
}

impl TomlPolicyGate {
    /// Parse `s` as TOML and build a `TomlPolicyGate`.
    ///
    /// Returns `RokError::Config` if the TOML is malformed, does not match
    /// `PolicyConfig`, or declares an unusable rule.
    pub fn from_toml_str(s: &str) -> RokResult<Self> {
        let config: PolicyConfig = toml::from_str(s)
            .map_err(|e| config_error(format!("failed to parse policy TOML: {e}")))?;
        Self::from_config(config)
    }

    /// Read the file at `path` and parse it as TOML policy configuration.
    pub fn from_file(path: &Path) -> RokResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            config_error(format!("failed to read policy file '{}': {e}", path.display()))
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_config(mut config: PolicyConfig) -> RokResult<Self> {
        if let Some(finalization) = &config.finalization {
            config.settings.finalization = finalization.settings.clone();
        }
        validate(&config)?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    fn revise(&self, ctx: &PolicyContext) -> PolicyDecision {
        for rule in &self.config.revision_rules {
            if !rule.matches(ctx) {
                continue;
            }
            debug!(
                rule_id = %rule.id,
                domain = %ctx.domain,
                trigger = ?ctx.trigger,
                retry_count = ctx.retry_count,
                "revision rule matched"
            );
            let reason = rule.reason();
            return match rule.action {
                RuleAction::FetchMoreEvidence => PolicyDecision::FetchMoreEvidence { reason },
                RuleAction::ReexecuteStep => PolicyDecision::ReexecuteStep {
                    reason,
                    added_constraints: rule.added_constraints.clone(),
                },
                RuleAction::ChangeExecutor => match (&rule.executor, &rule.template_id) {
                    (Some(name), Some(template)) => PolicyDecision::ChangeExecutor {
                        reason,
                        executor: ExecutorSpec::model(
                            name.clone(),
                            PromptTemplateRef::new(template.clone(), rule.template_version.clone()),
                        ),
                    },
                    // Rejected at load time; kept total for configs built in code.
                    _ => PolicyDecision::escalate(format!(
                        "revision rule '{}' names no target executor",
                        rule.id
                    )),
                },
                RuleAction::EscalateUncertainty => PolicyDecision::EscalateUncertainty { reason },
            };
        }

        warn!(
            domain = %ctx.domain,
            trigger = ?ctx.trigger,
            status = ?ctx.verification_status,
            "no revision rule matched; escalating by default"
        );
        PolicyDecision::escalate(format!(
            "escalated by default: no revision rule matched {:?} at retry {}",
            ctx.trigger, ctx.retry_count
        ))
    }

    fn finalize(&self, ctx: &PolicyContext) -> PolicyDecision {
        let Some(rules) = &self.config.finalization else {
            return PolicyDecision::Finalize;
        };
        if ctx.confidence < rules.block_if_confidence_below {
            warn!(
                domain = %ctx.domain,
                confidence = ctx.confidence,
                threshold = rules.block_if_confidence_below,
                "confidence below global block threshold"
            );
            return PolicyDecision::RequestClarification {
                reason: format!(
                    "{} Reason: confidence {:.2} is below global threshold {:.2}.",
                    rules.block_message, ctx.confidence, rules.block_if_confidence_below
                ),
            };
        }
        PolicyDecision::Finalize
    }
}

impl PolicyGate for TomlPolicyGate {
    /// `[settings]` with the matching `[[domains]]` entry laid over it.
    fn settings(&self, domain: &str) -> PolicySettings {
        let mut settings = self.config.settings.clone();
        if let Some(overrides) = self.config.domains.iter().find(|d| d.name == domain) {
            overrides.apply(&mut settings);
        }
        settings
    }

    fn decide(&self, ctx: &PolicyContext) -> PolicyDecision {
        match ctx.decision_point {
            DecisionPoint::Revision => self.revise(ctx),
            DecisionPoint::Finalization => self.finalize(ctx),
        }
    }

    fn route(&self, ctx: &RoutingContext<'_>) -> Option<ExecutorSpec> {
        if ctx.declared.kind != ExecutorKind::Model {
            return None;
        }
        let routing = &self.config.routing;
        let name = routing
            .step_overrides
            .iter()
            .find(|(reference, _)| PolicySettings::step_matches(reference, ctx.step_id, ctx.step_index))
            .map(|(_, name)| name)
            .or_else(|| routing.domain_overrides.get(ctx.domain))
            .or(routing.default_model_executor.as_ref())?;
        if *name == ctx.declared.name {
            return None;
        }
        Some(ExecutorSpec {
            name: name.clone(),
            ..ctx.declared.clone()
        })
    }
}

fn validate(config: &PolicyConfig) -> RokResult<()> {
    let unit = |field: &str, value: f64| {
        if (0.0..=1.0).contains(&value) {
            Ok(())
        } else {
            Err(config_error(format!("{field} must be within [0, 1], got {value}")))
        }
    };
    let s = &config.settings;
    unit("verification_confidence_threshold", s.verification_confidence_threshold)?;
    unit("min_evidence_relevance", s.min_evidence_relevance)?;
    unit("min_confidence_to_finalize", s.finalization.min_confidence_to_finalize)?;
    unit("revision_penalty", s.finalization.revision_penalty)?;
    unit("uncertainty_penalty", s.finalization.uncertainty_penalty)?;
    for domain in &config.domains {
        let overrides = [
            ("verification_confidence_threshold", domain.verification_confidence_threshold),
            ("min_evidence_relevance", domain.min_evidence_relevance),
            ("min_confidence_to_finalize", domain.min_confidence_to_finalize),
            ("revision_penalty", domain.revision_penalty),
            ("uncertainty_penalty", domain.uncertainty_penalty),
        ];
        for (field, value) in overrides {
            if let Some(v) = value {
                unit(&format!("domain '{}': {field}", domain.name), v)?;
            }
        }
    }
    for rule in &config.revision_rules {
        if rule.action == RuleAction::ChangeExecutor
            && (rule.executor.is_none() || rule.template_id.is_none())
        {
            return Err(config_error(format!(
                "revision rule '{}' uses change-executor without executor and template_id",
                rule.id
            )));
        }
    }
    Ok(())
}
