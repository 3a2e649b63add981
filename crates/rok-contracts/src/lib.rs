//! # rok-contracts
//!
//! The run document model for the reasoning orchestration kernel.
//!
//! Every crate in the workspace imports from here. This crate holds data
//! definitions, the error taxonomy, and the transition functions that keep
//! the document's invariants true. It contains no orchestration logic.

pub mod audit;
pub mod conclusion;
pub mod document;
pub mod error;
pub mod evidence;
pub mod ids;
pub mod policy;
pub mod revision;
pub mod step;
pub mod task;
pub mod verify;

/// Version of the run document format this crate reads and writes.
pub const RSL_VERSION: &str = "0.1";

/// Version of the kernel recorded in every audit section.
pub const KERNEL_VERSION: &str = "0.1.0";

#[cfg(test)]
mod tests {
    use super::*;
    use conclusion::{Contradiction, Severity};
    use document::RunDocument;
    use error::RokError;
    use evidence::{Evidence, SourceRef, SourceType};
    use ids::{RunId, StepId};
    use policy::{ConfidenceAggregation, PolicyDecision, PolicySettings, StepConfidence};
    use step::{ExecutorSpec, PromptTemplateRef, Step, StepPlan, StepStatus};
    use task::{Run, Task, TaskRequest, TaskStatus};
    use verify::{VerificationStatus, VerifierSpec};

    fn sample_document() -> RunDocument {
        let request = TaskRequest::new("verify the reported accuracy gain", "research_verification")
            .with_step(
                StepPlan::new(
                    "extract claim",
                    ExecutorSpec::model("stub", PromptTemplateRef::new("extract_claim", "1")),
                )
                .with_id("S1"),
            )
            .with_step(
                StepPlan::new(
                    "check claim",
                    ExecutorSpec::model("stub", PromptTemplateRef::new("check_claim", "1")),
                )
                .with_id("S2")
                .depends_on(&["S1"])
                .requires_evidence(),
            );
        let steps = request
            .steps
            .iter()
            .cloned()
            .enumerate()
            .map(|(i, p)| Step::from_plan(p, i))
            .collect();
        let run = Run::start(RunId::new(), None, "default", serde_json::json!({"k": 1}));
        RunDocument::new(Task::from_request(&request), run, steps)
    }

    // ── Enum wire format ─────────────────────────────────────────────────────

    #[test]
    fn step_status_serializes_screaming_snake_case() {
        let all = [
            (StepStatus::Created, "\"CREATED\""),
            (StepStatus::Scheduled, "\"SCHEDULED\""),
            (StepStatus::EvidenceAttached, "\"EVIDENCE_ATTACHED\""),
            (StepStatus::Executed, "\"EXECUTED\""),
            (StepStatus::Verified, "\"VERIFIED\""),
            (StepStatus::NeedsRevision, "\"NEEDS_REVISION\""),
            (StepStatus::Failed, "\"FAILED\""),
        ];
        for (status, wire) in all {
            assert_eq!(serde_json::to_string(&status).unwrap(), wire);
            let back: StepStatus = serde_json::from_str(wire).unwrap();
            assert_eq!(back, status);
        }
    }

    #[test]
    fn unknown_status_is_rejected() {
        let result: Result<StepStatus, _> = serde_json::from_str("\"RUNNING\"");
        assert!(result.is_err(), "unknown step status must not deserialize");
    }

    #[test]
    fn policy_decision_is_internally_tagged() {
        let decision = PolicyDecision::ReexecuteStep {
            reason: "weak".to_string(),
            added_constraints: vec!["cite the table".to_string()],
        };
        let json = serde_json::to_value(&decision).unwrap();
        assert_eq!(json["decision"], "REEXECUTE_STEP");
        let back: PolicyDecision = serde_json::from_value(json).unwrap();
        assert_eq!(back, decision);
    }

    // ── Document ─────────────────────────────────────────────────────────────

    #[test]
    fn document_round_trips_structurally() {
        let mut doc = sample_document();
        doc.advance_task(TaskStatus::Decomposed, None).unwrap();
        doc.with_step(&StepId::from("S1"), |s| s.schedule()).unwrap();
        doc.append_event(audit::AuditEventType::TaskDecomposed, serde_json::json!({"order": ["S1", "S2"]}));

        let json = doc.to_json_pretty().unwrap();
        let decoded = RunDocument::from_json(&json).unwrap();
        assert_eq!(decoded, doc);
        assert_eq!(decoded.to_json_pretty().unwrap(), json);
    }

    #[test]
    fn document_rejects_malformed_json() {
        let err = RunDocument::from_json("{\"rsl_version\": 1}").unwrap_err();
        assert!(matches!(err, RokError::SchemaValidation { .. }));
    }

    #[test]
    fn audit_events_are_sequenced() {
        let mut doc = sample_document();
        let a = doc.append_event(audit::AuditEventType::TaskReceived, serde_json::Value::Null);
        let b = doc.append_event(audit::AuditEventType::TaskDecomposed, serde_json::Value::Null);
        assert_eq!((a.sequence, b.sequence), (0, 1));
        assert_eq!(doc.audit().kernel_version, KERNEL_VERSION);
    }

    #[test]
    fn contradiction_must_reference_known_steps() {
        let mut doc = sample_document();
        let stray = Contradiction::new(
            vec![StepId::from("S9")],
            "conflict",
            Severity::High,
            VerifierSpec::rule("consistency"),
        )
        .unwrap();
        assert!(doc.add_contradiction(stray).is_err());
        assert!(doc.contradictions().is_empty());

        assert!(Contradiction::new(vec![], "empty", Severity::Low, VerifierSpec::default()).is_err());
    }

    #[test]
    fn finalize_rejects_unverified_supported_steps() {
        let mut doc = sample_document();
        doc.advance_task(TaskStatus::Decomposed, None).unwrap();
        doc.advance_task(TaskStatus::Running, None).unwrap();
        doc.advance_task(TaskStatus::ConsistencyChecked, None).unwrap();

        let conclusion = conclusion::FinalConclusion {
            content: "answer".to_string(),
            confidence: 0.9,
            supported_step_ids: vec![StepId::from("S1")],
            unresolved_contradiction_ids: vec![],
            finalized_at: chrono::Utc::now(),
        };
        let err = doc.finalize(conclusion).unwrap_err();
        assert!(err.to_string().contains("not VERIFIED"));
        assert!(doc.final_conclusion().is_none());
        assert_eq!(doc.task().status(), TaskStatus::ConsistencyChecked);
    }

    // ── Evidence & policy values ─────────────────────────────────────────────

    #[test]
    fn evidence_relevance_out_of_range_rejected() {
        let source = SourceRef {
            source_type: SourceType::Web,
            source_id: "x".to_string(),
            uri: None,
        };
        assert!(Evidence::new(source.clone(), "a", 1.2).is_err());
        assert!(Evidence::new(source.clone(), "a", f64::NAN).is_err());
        assert!(Evidence::new(source, "a", 1.0).is_ok());
    }

    #[test]
    fn aggregation_methods() {
        let items = vec![
            StepConfidence { step_id: StepId::from("S1"), confidence: 0.9, weight: 1.0 },
            StepConfidence { step_id: StepId::from("S2"), confidence: 0.6, weight: 3.0 },
        ];
        assert!((ConfidenceAggregation::Minimum.apply(&items) - 0.6).abs() < 1e-9);
        assert!((ConfidenceAggregation::Mean.apply(&items) - 0.75).abs() < 1e-9);
        assert!((ConfidenceAggregation::WeightedMean.apply(&items) - 0.675).abs() < 1e-9);
        assert!((ConfidenceAggregation::Product.apply(&items) - 0.54).abs() < 1e-9);
        assert_eq!(ConfidenceAggregation::Mean.apply(&[]), 0.0);
    }

    #[test]
    fn logical_step_references_match_by_index() {
        let id = StepId::from("step_abc");
        assert!(PolicySettings::step_matches("S2", &id, 1));
        assert!(!PolicySettings::step_matches("S2", &id, 0));
        assert!(PolicySettings::step_matches("step_abc", &id, 7));
        assert!(!PolicySettings::step_matches("Sx", &id, 0));
    }

    #[test]
    fn verification_strength_orders_statuses() {
        assert!(VerificationStatus::Supported.strength() > VerificationStatus::PartiallySupported.strength());
        assert!(VerificationStatus::Weak.strength() > VerificationStatus::Contradicted.strength());
    }

    // ── Error display ────────────────────────────────────────────────────────

    #[test]
    fn error_cyclic_dependency_display() {
        let err = RokError::CyclicDependency {
            step_ids: vec!["S1".to_string(), "S2".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("cyclic dependency"));
        assert!(msg.contains("S1, S2"));
    }

    #[test]
    fn error_timeout_is_executor_failure() {
        let err = RokError::Timeout {
            operation: "model:stub".to_string(),
            timeout_ms: 50,
        };
        assert!(err.is_executor_failure());
        assert!(err.to_string().contains("50 ms"));
        assert!(!RokError::validation("x").is_executor_failure());
    }
}
