//! Scenario: revision exhaustion.
//!
//! The claim-verification plan under the `research-strict` domain, which
//! demands 0.85. The paper's indoor scope caps S1 at PARTIALLY_SUPPORTED
//! 0.78, and re-executing cannot change that. `retry-partial-strict` keeps
//! asking for another attempt until the per-step ceiling forces an
//! uncertainty escalation. S2 is blocked by its failed dependency and the
//! run fails with nothing verified.

use rok_contracts::{error::RokResult, task::TaskRequest};

use super::{
    claim_verification::claim_request, execute, memory_store, policy_gate, ScenarioOptions,
    ScenarioRun, RESEARCH_POLICY,
};
use crate::{adapters::StubModelAdapter, mock_data::ACCURATE_PARAGRAPH};

pub const NAME: &str = "revision-exhaustion";

pub const DOMAIN: &str = "research-strict";

pub fn request() -> TaskRequest {
    claim_request(ACCURATE_PARAGRAPH, DOMAIN)
}

pub async fn run(options: &ScenarioOptions) -> RokResult<ScenarioRun> {
    let gate = policy_gate(options, RESEARCH_POLICY)?;
    let memory = memory_store(options, Vec::new())?;
    execute(NAME, request(), options, gate, StubModelAdapter::new(), memory).await
}

#[cfg(test)]
mod tests {
    use rok_contracts::{
        audit::AuditEventType,
        ids::StepId,
        revision::RevisionAction,
        step::StepStatus,
        task::{RunStatus, TaskStatus},
    };

    use super::*;

    #[tokio::test]
    async fn test_partial_support_exhausts_retries() {
        let run = run(&ScenarioOptions::default()).await.unwrap();
        let s1 = run.document.step(&StepId::from("S1")).unwrap();

        assert_eq!(s1.status(), StepStatus::Failed);
        assert!(s1.is_uncertain());
        assert_eq!(s1.retry_count(), 3, "research policy allows three retries");
        assert_eq!(s1.executions().len(), 4, "first attempt plus three retries");
        assert_eq!(s1.verifications().len(), 4);
        assert!(s1.verifications().iter().all(|v| (v.confidence - 0.78).abs() < 1e-9));

        let last = s1.latest_revision().unwrap();
        assert_eq!(last.action, RevisionAction::EscalateUncertainty);
        assert!(last.forced, "the ceiling overrides the rule's re-execute");
        assert!(s1.revisions()[..3]
            .iter()
            .all(|r| r.action == RevisionAction::ReexecuteStep && !r.forced));
    }

    #[tokio::test]
    async fn test_dependent_step_never_runs() {
        let run = run(&ScenarioOptions::default()).await.unwrap();
        let doc = &run.document;
        let s2 = doc.step(&StepId::from("S2")).unwrap();

        assert_eq!(s2.status(), StepStatus::Failed);
        assert!(!s2.is_uncertain());
        assert!(s2.executions().is_empty());
        assert_eq!(doc.task().status(), TaskStatus::Failed);
        assert_eq!(doc.run().status(), RunStatus::Failed);
        assert!(doc.final_conclusion().is_none());
        assert_eq!(doc.run().accounting.final_confidence, 0.0);
    }

    #[tokio::test]
    async fn test_exhaustion_is_audited() {
        let run = run(&ScenarioOptions::default()).await.unwrap();
        let events = run.document.events();
        assert_eq!(
            events
                .iter()
                .filter(|e| e.event_type == AuditEventType::RevisionExhausted)
                .count(),
            1
        );
        assert!(events
            .iter()
            .any(|e| e.event_type == AuditEventType::UncertaintyEscalated));
        rok_verify::invariants::enforce(&run.document).unwrap();
        assert!(run.audit.verify_integrity());
    }

    #[tokio::test]
    async fn test_policy_file_lowers_the_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strict.toml");
        let policy = RESEARCH_POLICY.replace("max_retries_per_step = 3", "max_retries_per_step = 1");
        std::fs::write(&path, policy).unwrap();

        let options = ScenarioOptions {
            policy: Some(path),
            ..ScenarioOptions::default()
        };
        let run = run(&options).await.unwrap();
        let s1 = run.document.step(&StepId::from("S1")).unwrap();
        assert_eq!(s1.executions().len(), 2);
        assert!(s1.latest_revision().unwrap().forced);
    }
}
