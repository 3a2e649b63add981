//! # rok-policy
//!
//! A TOML-driven policy gate for the reasoning orchestration kernel.
//!
//! ## Overview
//!
//! This crate provides [`TomlPolicyGate`], which implements the
//! [`PolicyGate`](rok_core::traits::PolicyGate) trait. A policy file
//! declares base settings, per-domain overrides, ordered revision rules,
//! executor routing, and finalization rules. The first matching revision
//! rule wins; if none matches, the step escalates uncertainty.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use std::path::Path;
//! use rok_policy::TomlPolicyGate;
//!
//! let gate = TomlPolicyGate::from_file(Path::new("policies/research.toml"))?;
//! ```

pub mod engine;
pub mod rule;

pub use engine::TomlPolicyGate;
pub use rule::{DomainPolicy, FinalizationConfig, PolicyConfig, RevisionRule, RoutingConfig, RuleAction};

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use rok_contracts::{
        error::RokError,
        ids::StepId,
        policy::{
            ConfidenceAggregation, DecisionPoint, PolicyContext, PolicyDecision, RevisionTrigger,
            RoutingContext,
        },
        step::{ExecutorSpec, PromptTemplateRef},
        verify::VerificationStatus,
    };
    use rok_core::traits::PolicyGate;

    use crate::TomlPolicyGate;

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn revision_ctx(
        domain: &str,
        trigger: RevisionTrigger,
        status: VerificationStatus,
        confidence: f64,
        retry_count: u32,
    ) -> PolicyContext {
        PolicyContext {
            decision_point: DecisionPoint::Revision,
            domain: domain.to_string(),
            step_id: Some(StepId::from("S1")),
            trigger: Some(trigger),
            verification_status: Some(status),
            confidence,
            retry_count,
            total_revisions: retry_count,
            evidence_count: 1,
            contradiction_severities: vec![],
        }
    }

    fn finalization_ctx(confidence: f64) -> PolicyContext {
        PolicyContext {
            decision_point: DecisionPoint::Finalization,
            domain: "research".to_string(),
            step_id: None,
            trigger: None,
            verification_status: None,
            confidence,
            retry_count: 0,
            total_revisions: 0,
            evidence_count: 0,
            contradiction_severities: vec![],
        }
    }

    const RESEARCH_POLICY: &str = r#"
        [settings]
        policy_id = "research-v1"
        verification_confidence_threshold = 0.7
        max_retries_per_step = 3

        [[domains]]
        name = "research"
        verification_confidence_threshold = 0.85
        evidence_required_steps = ["S2"]
        aggregation = "MEAN"
        min_confidence_to_finalize = 0.6

        [[revision_rules]]
        id = "refetch-on-insufficient"
        trigger = "EVIDENCE_INSUFFICIENT"
        below_retry_count = 2
        action = "fetch-more-evidence"

        [[revision_rules]]
        id = "retry-partial"
        domain = "research"
        status = "PARTIALLY_SUPPORTED"
        action = "reexecute-step"
        reason = "partial support; restate with the evidence figure"
        added_constraints = ["quote the evidence figure"]

        [[revision_rules]]
        id = "switch-model-on-failure"
        trigger = "EXECUTOR_FAILURE"
        action = "change-executor"
        executor = "o3_stub"
        template_id = "claim_extract"

        [routing]
        default_model_executor = "gpt_stub"
        domain_overrides = { research = "o3_stub" }
        step_overrides = { S2 = "gpt_stub" }

        [finalization]
        min_confidence_to_finalize = 0.5
        block_if_confidence_below = 0.3
        block_message = "Blocked."
    "#;

    fn gate() -> TomlPolicyGate {
        TomlPolicyGate::from_toml_str(RESEARCH_POLICY).unwrap()
    }

    // ── 1. settings and domain overrides ──────────────────────────────────────

    #[test]
    fn test_domain_overrides_lay_over_settings() {
        let research = gate().settings("research");
        assert_eq!(research.policy_id, "research-v1");
        assert_eq!(research.verification_confidence_threshold, 0.85);
        assert_eq!(research.evidence_required_steps, vec!["S2".to_string()]);
        assert_eq!(research.finalization.aggregation, ConfidenceAggregation::Mean);
        assert_eq!(research.finalization.min_confidence_to_finalize, 0.6);
        assert_eq!(research.max_retries_per_step, 3, "unset overrides keep the base value");

        let general = gate().settings("general");
        assert_eq!(general.verification_confidence_threshold, 0.7);
        assert_eq!(
            general.finalization.min_confidence_to_finalize, 0.5,
            "[finalization] feeds the base settings"
        );
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let gate = TomlPolicyGate::from_toml_str("").unwrap();
        let settings = gate.settings("anything");
        assert_eq!(settings.policy_id, "default");
        assert_eq!(settings.max_retries_per_step, 3);
    }

    // ── 2. escalate-by-default ────────────────────────────────────────────────

    #[test]
    fn test_unmatched_revision_escalates_by_default() {
        let gate = TomlPolicyGate::from_toml_str("revision_rules = []").unwrap();
        let decision = gate.decide(&revision_ctx(
            "research",
            RevisionTrigger::VerificationBelowThreshold,
            VerificationStatus::Weak,
            0.3,
            0,
        ));
        match decision {
            PolicyDecision::EscalateUncertainty { reason } => {
                assert!(reason.contains("escalated by default"), "unexpected reason: {reason}");
            }
            other => panic!("expected EscalateUncertainty, got {:?}", other),
        }
    }

    // ── 3. rule conditions ────────────────────────────────────────────────────

    #[test]
    fn test_partial_support_reexecutes_with_constraints() {
        let decision = gate().decide(&revision_ctx(
            "research",
            RevisionTrigger::VerificationBelowThreshold,
            VerificationStatus::PartiallySupported,
            0.78,
            0,
        ));
        match decision {
            PolicyDecision::ReexecuteStep { reason, added_constraints } => {
                assert!(reason.contains("partial support"));
                assert_eq!(added_constraints, vec!["quote the evidence figure".to_string()]);
            }
            other => panic!("expected ReexecuteStep, got {:?}", other),
        }
    }

    #[test]
    fn test_domain_condition_limits_rule() {
        let decision = gate().decide(&revision_ctx(
            "finance",
            RevisionTrigger::VerificationBelowThreshold,
            VerificationStatus::PartiallySupported,
            0.78,
            0,
        ));
        assert!(
            matches!(decision, PolicyDecision::EscalateUncertainty { .. }),
            "research-only rule must not fire for finance: {decision:?}"
        );
    }

    #[test]
    fn test_retry_count_condition_stops_refetching() {
        let ctx = |retries| {
            revision_ctx(
                "research",
                RevisionTrigger::EvidenceInsufficient,
                VerificationStatus::Unknown,
                0.0,
                retries,
            )
        };
        assert!(matches!(gate().decide(&ctx(1)), PolicyDecision::FetchMoreEvidence { .. }));
        assert!(matches!(gate().decide(&ctx(2)), PolicyDecision::EscalateUncertainty { .. }));
    }

    #[test]
    fn test_change_executor_builds_model_spec() {
        let decision = gate().decide(&revision_ctx(
            "research",
            RevisionTrigger::ExecutorFailure,
            VerificationStatus::Unknown,
            0.0,
            0,
        ));
        match decision {
            PolicyDecision::ChangeExecutor { executor, .. } => {
                assert_eq!(executor, ExecutorSpec::model("o3_stub", PromptTemplateRef::new("claim_extract", "1")));
            }
            other => panic!("expected ChangeExecutor, got {:?}", other),
        }
    }

    // ── 4. first-match wins ───────────────────────────────────────────────────

    #[test]
    fn test_first_match_wins() {
        let toml = r#"
            [[revision_rules]]
            id = "first"
            action = "reexecute-step"

            [[revision_rules]]
            id = "second"
            action = "escalate-uncertainty"
            reason = "this rule should never fire"
        "#;
        let gate = TomlPolicyGate::from_toml_str(toml).unwrap();
        let decision = gate.decide(&revision_ctx(
            "general",
            RevisionTrigger::VerificationBelowThreshold,
            VerificationStatus::Weak,
            0.2,
            0,
        ));
        match decision {
            PolicyDecision::ReexecuteStep { reason, .. } => {
                assert_eq!(reason, "revision rule 'first' matched");
            }
            other => panic!("expected ReexecuteStep, got {:?}", other),
        }
    }

    // ── 5. finalization ───────────────────────────────────────────────────────

    #[test]
    fn test_global_block_threshold_requests_clarification() {
        assert_eq!(gate().decide(&finalization_ctx(0.8)), PolicyDecision::Finalize);
        match gate().decide(&finalization_ctx(0.2)) {
            PolicyDecision::RequestClarification { reason } => {
                assert!(reason.starts_with("Blocked. Reason: confidence 0.20"), "unexpected reason: {reason}");
            }
            other => panic!("expected RequestClarification, got {:?}", other),
        }
    }

    // ── 6. routing ────────────────────────────────────────────────────────────

    #[test]
    fn test_routing_priority() {
        let declared = ExecutorSpec::model("declared", PromptTemplateRef::new("t", "1"));
        let s1 = StepId::from("S1");
        let s2 = StepId::from("S2");
        let route = |domain, id: &StepId, index| {
            gate().route(&RoutingContext {
                domain,
                step_id: id,
                step_index: index,
                declared: &declared,
            })
        };

        let step_override = route("research", &s2, 1).unwrap();
        assert_eq!(step_override.name, "gpt_stub", "step override beats domain override");
        assert_eq!(step_override.prompt_template, declared.prompt_template);

        assert_eq!(route("research", &s1, 0).unwrap().name, "o3_stub");
        assert_eq!(route("finance", &s1, 0).unwrap().name, "gpt_stub");
    }

    #[test]
    fn test_tool_steps_are_never_routed() {
        let declared = ExecutorSpec::tool("calculator");
        let id = StepId::from("S1");
        let choice = gate().route(&RoutingContext {
            domain: "research",
            step_id: &id,
            step_index: 0,
            declared: &declared,
        });
        assert!(choice.is_none());
    }

    // ── 7. configuration errors ───────────────────────────────────────────────

    #[test]
    fn test_toml_parse_error() {
        let result = TomlPolicyGate::from_toml_str("this is not valid toml ][[[");
        match result {
            Err(RokError::Config { reason }) => {
                assert!(
                    reason.contains("failed to parse policy TOML"),
                    "expected parse error message, got: {reason}"
                );
            }
            other => panic!("expected Config error, got {:?}", other),
        }
    }

    #[test]
    fn test_change_executor_without_target_is_rejected() {
        let toml = r#"
            [[revision_rules]]
            id = "broken"
            action = "change-executor"
        "#;
        let err = TomlPolicyGate::from_toml_str(toml).unwrap_err();
        assert!(matches!(err, RokError::Config { .. }));
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn test_threshold_out_of_range_is_rejected() {
        let toml = r#"
            [[domains]]
            name = "research"
            verification_confidence_threshold = 1.5
        "#;
        assert!(matches!(
            TomlPolicyGate::from_toml_str(toml),
            Err(RokError::Config { .. })
        ));
    }

    #[test]
    fn test_domain_relevance_out_of_range_is_rejected() {
        let toml = r#"
            [[domains]]
            name = "x"
            min_evidence_relevance = 1.5
        "#;
        match TomlPolicyGate::from_toml_str(toml) {
            Err(RokError::Config { reason }) => assert!(
                reason.contains("min_evidence_relevance") && reason.contains("'x'"),
                "error should name the domain and field, got: {reason}"
            ),
            Err(other) => panic!("expected Config error, got {other:?}"),
            Ok(_) => panic!("relevance floor above 1 would drop every candidate"),
        }
    }

    #[test]
    fn test_penalty_out_of_range_is_rejected() {
        let domain = r#"
            [[domains]]
            name = "x"
            uncertainty_penalty = -0.2
        "#;
        let settings = r#"
            [settings.finalization]
            revision_penalty = 2.0
        "#;
        for toml in [domain, settings] {
            assert!(
                matches!(TomlPolicyGate::from_toml_str(toml), Err(RokError::Config { .. })),
                "penalty outside [0, 1] should not load: {toml}"
            );
        }
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = TomlPolicyGate::from_file(std::path::Path::new("/nonexistent/policy.toml")).unwrap_err();
        assert!(err.to_string().contains("failed to read policy file"));
    }
}
