//! Finalizer.
//!
//! `conclude` decides the run outcome from the checked document and is
//! pure: the same document always yields the same `Conclusion`. `apply`
//! writes it back, together with the memory writes it implies.

use std::{collections::BTreeSet, sync::Arc};

use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use rok_contracts::{
    audit::AuditEventType,
    conclusion::{FinalConclusion, MemoryWrite, Severity},
    document::RunDocument,
    error::RokResult,
    ids::{ContradictionId, StepId},
    policy::{DecisionPoint, PolicyContext, PolicyDecision, PolicySettings},
    step::{Step, StepStatus},
    task::{Accounting, ClarificationRequest, RunStatus},
};

use crate::{
    context::RunContext,
    ledger,
    store::RunStore,
    trail::AuditTrail,
    traits::{MemoryStore, PolicyGate},
};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Finalize(FinalConclusion),
    Clarify(ClarificationRequest),
    Fail { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Conclusion {
    pub verdict: Verdict,
    pub accounting: Accounting,
}

/// VERIFIED steps that no other VERIFIED step depends on, in declaration order.
pub fn sink_steps(doc: &RunDocument) -> Vec<&Step> {
    let verified: Vec<&Step> = doc
        .steps()
        .iter()
        .filter(|s| s.status() == StepStatus::Verified)
        .collect();
    let depended_on: BTreeSet<&StepId> = verified.iter().flat_map(|s| s.depends_on()).collect();
    verified
        .into_iter()
        .filter(|s| !depended_on.contains(s.step_id()))
        .collect()
}

fn blocked(mut accounting: Accounting, verdict: Verdict, reason: &str) -> Conclusion {
    accounting.force_block(reason.to_string());
    Conclusion { verdict, accounting }
}

/// A reason not to finalize, from the kernel rules or from the gate.
#[derive(Debug, Clone, PartialEq)]
enum Block {
    Fail(String),
    Clarify(String),
}

impl Block {
    fn reason(&self) -> &str {
        match self {
            Block::Fail(r) | Block::Clarify(r) => r,
        }
    }

    fn from_decision(decision: PolicyDecision) -> Option<Block> {
        match decision {
            PolicyDecision::Finalize => None,
            PolicyDecision::RequestClarification { reason } => Some(Block::Clarify(reason)),
            PolicyDecision::Fail { reason } => Some(Block::Fail(reason)),
            other => Some(Block::Clarify(format!(
                "{} is not a finalization decision",
                other.label()
            ))),
        }
    }

    fn into_conclusion(self, accounting: Accounting, high: Vec<ContradictionId>) -> Conclusion {
        match self {
            Block::Fail(reason) => {
                let verdict = Verdict::Fail { reason: reason.clone() };
                blocked(accounting, verdict, &reason)
            }
            Block::Clarify(reason) => {
                let verdict = Verdict::Clarify(ClarificationRequest {
                    reason: reason.clone(),
                    aggregate_confidence: accounting.final_confidence,
                    blocking_contradiction_ids: high,
                });
                blocked(accounting, verdict, &reason)
            }
        }
    }
}

/// The first kernel rule that refuses finalization, in precedence order.
fn kernel_block(
    doc: &RunDocument,
    settings: &PolicySettings,
    verified: usize,
    confidence: f64,
    high: usize,
) -> Option<Block> {
    let rules = &settings.finalization;
    if verified == 0 {
        return Some(Block::Fail("no step was verified".to_string()));
    }

    let failed = doc
        .steps()
        .iter()
        .filter(|s| s.status() == StepStatus::Failed)
        .count();
    if failed > 0 && !rules.allow_partial_finalization {
        return Some(Block::Fail(format!(
            "{failed} step(s) failed and partial finalization is disabled"
        )));
    }
    let unverified = doc.steps().len() - verified;
    if unverified > 0 && rules.fail_closed_if_unverified {
        return Some(Block::Fail(format!(
            "{unverified} step(s) unverified and policy fails closed"
        )));
    }

    if confidence < rules.min_confidence_to_finalize {
        return Some(Block::Clarify(format!(
            "aggregate confidence {confidence:.3} is below {:.3}",
            rules.min_confidence_to_finalize
        )));
    }
    if high > 0 && !rules.finalize_through_high_contradictions {
        return Some(Block::Clarify(format!("{high} unresolved HIGH contradiction(s)")));
    }
    None
}

/// Decide how the run ends.
///
/// The gate is asked exactly once, at the FINALIZATION decision point,
/// before any blocking decision is made. Kernel rules then take
/// precedence: policy cannot weaken them, only block further. When both
/// block, the kernel's verdict stands and carries the gate's reason too.
/// Every clarification names the unresolved HIGH contradictions.
pub fn conclude(doc: &RunDocument, settings: &PolicySettings, gate: &dyn PolicyGate) -> Conclusion {
    let accounting = ledger::account(doc, settings, gate);
    let confidence = accounting.final_confidence;

    let high: Vec<ContradictionId> = doc
        .contradictions()
        .iter()
        .filter(|c| c.severity == Severity::High)
        .map(|c| c.contradiction_id.clone())
        .collect();
    let ctx = PolicyContext {
        decision_point: DecisionPoint::Finalization,
        domain: doc.task().domain().to_string(),
        step_id: None,
        trigger: None,
        verification_status: None,
        confidence,
        retry_count: 0,
        total_revisions: doc.run().revision_count,
        evidence_count: doc.steps().iter().map(|s| s.evidence().len()).sum(),
        contradiction_severities: doc.contradictions().iter().map(|c| c.severity).collect(),
    };
    let policy_block = Block::from_decision(gate.decide(&ctx));

    let verified: Vec<&Step> = doc
        .steps()
        .iter()
        .filter(|s| s.status() == StepStatus::Verified)
        .collect();
    let kernel = kernel_block(doc, settings, verified.len(), confidence, high.len());
    let block = match (kernel, policy_block) {
        (Some(kernel), Some(policy)) => {
            let reason = format!("{}; policy: {}", kernel.reason(), policy.reason());
            Some(match kernel {
                Block::Fail(_) => Block::Fail(reason),
                Block::Clarify(_) => Block::Clarify(reason),
            })
        }
        (kernel, policy) => kernel.or(policy),
    };
    if let Some(block) = block {
        return block.into_conclusion(accounting, high);
    }

    let content = sink_steps(doc)
        .iter()
        .filter_map(|s| s.current_output())
        .collect::<Vec<_>>()
        .join("\n");
    let conclusion = FinalConclusion {
        content,
        confidence,
        supported_step_ids: verified.iter().map(|s| s.step_id().clone()).collect(),
        unresolved_contradiction_ids: doc
            .contradictions()
            .iter()
            .map(|c| c.contradiction_id.clone())
            .collect(),
        finalized_at: doc
            .task()
            .consistency_checked_at()
            .unwrap_or_else(|| doc.task().updated_at()),
    };
    Conclusion {
        verdict: Verdict::Finalize(conclusion),
        accounting,
    }
}

/// FACT memory items for the supported sink steps of a finalized run.
pub fn memory_writes(doc: &RunDocument) -> RokResult<Vec<MemoryWrite>> {
    let run_id = doc.run().run_id.clone();
    sink_steps(doc)
        .into_iter()
        .filter_map(|s| {
            let output = s.current_output()?;
            let confidence = s.current_verification()?.confidence;
            Some(
                MemoryWrite::fact(output, confidence)
                    .map(|w| w.from_step(s.step_id().clone(), run_id.clone())),
            )
        })
        .collect()
}

/// Write `conclusion` into the document and persist memory.
pub fn apply(
    ctx: &RunContext,
    store: &RunStore,
    trail: &AuditTrail,
    memory: Option<&Arc<dyn MemoryStore>>,
    write_memory: bool,
    conclusion: Conclusion,
) -> RokResult<()> {
    let Conclusion { verdict, accounting } = conclusion;
    let written = store.write(|doc| {
        doc.set_accounting(accounting.clone());
        match &verdict {
            Verdict::Finalize(c) => doc.finalize(c.clone()),
            Verdict::Clarify(req) => doc.request_clarification(req.clone()),
            Verdict::Fail { reason } => doc.fail(reason.clone(), RunStatus::Failed),
        }
    });
    if let Err(e) = written {
        warn!(run_id = %ctx.run_id, error = %e, "finalization could not be applied");
        trail.record(AuditEventType::FinalizationFailed, json!({ "error": e.to_string() }));
        store.write(|doc| {
            let mut ledger = accounting;
            ledger.force_block(e.to_string());
            doc.set_accounting(ledger);
            doc.fail(e.to_string(), RunStatus::Failed)
        })?;
        return Err(e);
    }

    match &verdict {
        Verdict::Finalize(c) => {
            info!(run_id = %ctx.run_id, confidence = c.confidence, supported = c.supported_step_ids.len(), "final conclusion emitted");
            trail.record(
                AuditEventType::FinalConclusionEmitted,
                json!({
                    "confidence": c.confidence,
                    "supported_step_ids": c.supported_step_ids,
                    "unresolved_contradiction_ids": c.unresolved_contradiction_ids,
                }),
            );
        }
        Verdict::Clarify(req) => {
            info!(run_id = %ctx.run_id, reason = %req.reason, "clarification requested");
            trail.record(
                AuditEventType::ClarificationRequested,
                json!({
                    "reason": req.reason,
                    "aggregate_confidence": req.aggregate_confidence,
                    "blocking_contradiction_ids": req.blocking_contradiction_ids,
                }),
            );
        }
        Verdict::Fail { reason } => {
            warn!(run_id = %ctx.run_id, %reason, "run failed at finalization");
            trail.record(AuditEventType::FinalizationFailed, json!({ "reason": reason }));
        }
    }

    if matches!(verdict, Verdict::Finalize(_)) && write_memory && ctx.settings.memory.write_verified_facts {
        let writes = store.read(memory_writes)?;
        if !writes.is_empty() {
            if let Some(memory) = memory {
                if let Err(e) = memory.append(&writes) {
                    warn!(run_id = %ctx.run_id, error = %e, "memory store rejected writes; kept in run document");
                }
            }
            let ids: Vec<_> = writes.iter().map(|w| w.memory_id.clone()).collect();
            store.write(|doc| doc.record_memory_writes(writes));
            trail.record(AuditEventType::MemoryWritten, json!({ "memory_ids": ids }));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use tokio_util::sync::CancellationToken;

    use super::*;
    use rok_contracts::{
        conclusion::Contradiction,
        evidence::{Evidence, SourceRef, SourceType},
        ids::{ExecutionId, RunId},
        policy::FinalizationSettings,
        step::{DependencyGate, ExecutorSpec, StepExecution, StepPlan},
        task::{Run, Task, TaskRequest, TaskStatus},
        verify::{Verification, VerificationStatus, VerifierSpec},
    };

    use crate::memory::InMemoryMemoryStore;

    struct FixedGate(PolicyDecision);

    impl PolicyGate for FixedGate {
        fn settings(&self, _domain: &str) -> PolicySettings {
            PolicySettings::default()
        }

        fn decide(&self, _ctx: &PolicyContext) -> PolicyDecision {
            self.0.clone()
        }
    }

    fn finalize_gate() -> FixedGate {
        FixedGate(PolicyDecision::Finalize)
    }

    fn step(id: &str, index: usize, deps: &[&str], output: &str, confidence: Option<f64>) -> Step {
        let plan = StepPlan::new(id, ExecutorSpec::tool("t")).with_id(id).depends_on(deps);
        let mut step = Step::from_plan(plan, index);
        step.schedule().unwrap();
        let Some(confidence) = confidence else {
            step.fail("forced").unwrap();
            return step;
        };
        let exec = StepExecution {
            execution_id: ExecutionId::new(),
            attempt: 1,
            executor: ExecutorSpec::tool("t"),
            output: output.to_string(),
            prompt_template: None,
            parameters: serde_json::Value::Null,
            tool_call_ref: None,
            metadata: serde_json::Value::Null,
            revision_id: None,
            started_at: chrono::Utc::now(),
            ended_at: chrono::Utc::now(),
        };
        let ev = Evidence::new(
            SourceRef { source_type: SourceType::Tool, source_id: "t".to_string(), uri: None },
            output,
            1.0,
        )
        .unwrap();
        let ev_id = ev.evidence_id.clone();
        let satisfied = deps.iter().map(|d| StepId::from(*d)).collect();
        step.record_execution(exec, vec![ev], &DependencyGate::new(satisfied)).unwrap();
        let v = Verification::new(VerificationStatus::Supported, confidence, vec![], vec![ev_id], VerifierSpec::default()).unwrap();
        step.record_verification(v, true).unwrap();
        step
    }

    fn checked(steps: Vec<Step>) -> RunDocument {
        let mut doc = RunDocument::new(
            Task::from_request(&TaskRequest::new("o", "d")),
            Run::start(RunId::new(), None, "p", serde_json::Value::Null),
            steps,
        );
        doc.advance_task(TaskStatus::Decomposed, None).unwrap();
        doc.advance_task(TaskStatus::Running, None).unwrap();
        doc.advance_task(TaskStatus::ConsistencyChecked, None).unwrap();
        doc
    }

    fn chain() -> RunDocument {
        checked(vec![
            step("S1", 0, &[], "rate is 0.5% monthly", Some(0.9)),
            step("S2", 1, &["S1"], "payment is 1887.12", Some(0.95)),
        ])
    }

    // ── Outcomes ─────────────────────────────────────────────────────────────

    #[test]
    fn content_comes_from_sink_steps_only() {
        let out = conclude(&chain(), &PolicySettings::default(), &finalize_gate());
        let c = match out.verdict {
            Verdict::Finalize(c) => c,
            other => panic!("expected a conclusion, got {other:?}"),
        };
        assert_eq!(c.content, "payment is 1887.12");
        assert_eq!(c.supported_step_ids, vec![StepId::from("S1"), StepId::from("S2")]);
        assert_eq!(c.confidence, 0.9);
    }

    #[test]
    fn conclude_is_idempotent() {
        let doc = chain();
        let gate = finalize_gate();
        let a = serde_json::to_string(&conclude(&doc, &PolicySettings::default(), &gate)).unwrap();
        let b = serde_json::to_string(&conclude(&doc, &PolicySettings::default(), &gate)).unwrap();
        assert_eq!(a, b, "unchanged state must conclude byte-for-byte the same");
    }

    #[test]
    fn no_verified_steps_fails() {
        let doc = checked(vec![step("S1", 0, &[], "", None)]);
        let out = conclude(&doc, &PolicySettings::default(), &finalize_gate());
        assert!(matches!(out.verdict, Verdict::Fail { .. }));
        assert!(out.accounting.blocked);
        assert_eq!(out.accounting.total_risk, 1.0);
    }

    #[test]
    fn failed_step_blocks_when_partial_finalization_disabled() {
        let doc = checked(vec![step("S1", 0, &[], "ok", Some(0.9)), step("S2", 1, &[], "", None)]);
        let settings = PolicySettings {
            finalization: FinalizationSettings { allow_partial_finalization: false, ..FinalizationSettings::default() },
            ..PolicySettings::default()
        };
        assert!(matches!(conclude(&doc, &settings, &finalize_gate()).verdict, Verdict::Fail { .. }));
        assert!(matches!(
            conclude(&doc, &PolicySettings::default(), &finalize_gate()).verdict,
            Verdict::Finalize(_)
        ));
    }

    #[test]
    fn low_confidence_requests_clarification() {
        let doc = checked(vec![step("S1", 0, &[], "ok", Some(0.4))]);
        let out = conclude(&doc, &PolicySettings::default(), &finalize_gate());
        let Verdict::Clarify(req) = out.verdict else {
            panic!("expected clarification");
        };
        assert_eq!(req.aggregate_confidence, 0.4);
    }

    #[test]
    fn high_contradiction_blocks_finalization() {
        let mut doc = chain();
        let ids = vec![StepId::from("S1"), StepId::from("S2")];
        let c = Contradiction::new(ids, "gap", Severity::High, VerifierSpec::rule("c")).unwrap();
        let c_id = c.contradiction_id.clone();
        doc.add_contradiction(c).unwrap();

        let out = conclude(&doc, &PolicySettings::default(), &finalize_gate());
        let Verdict::Clarify(req) = out.verdict else {
            panic!("HIGH contradiction must block");
        };
        assert_eq!(req.blocking_contradiction_ids, vec![c_id]);

        let through = PolicySettings {
            finalization: FinalizationSettings { finalize_through_high_contradictions: true, ..FinalizationSettings::default() },
            ..PolicySettings::default()
        };
        assert!(matches!(conclude(&doc, &through, &finalize_gate()).verdict, Verdict::Finalize(_)));
    }

    #[test]
    fn gate_may_block_but_not_override_kernel_rules() {
        let blocked = conclude(&chain(), &PolicySettings::default(), &FixedGate(PolicyDecision::Fail { reason: "audit hold".to_string() }));
        assert_eq!(blocked.verdict, Verdict::Fail { reason: "audit hold".to_string() });

        let empty = checked(vec![step("S1", 0, &[], "", None)]);
        let out = conclude(&empty, &PolicySettings::default(), &finalize_gate());
        assert!(matches!(out.verdict, Verdict::Fail { .. }), "finalize decision cannot rescue an unverified run");
    }

    #[test]
    fn high_contradiction_is_named_when_confidence_also_blocks() {
        let mut doc = checked(vec![
            step("S1", 0, &[], "rate is 0.5% monthly", Some(0.7)),
            step("S2", 1, &[], "payment is 1887.12", Some(0.7)),
        ]);
        let ids = vec![StepId::from("S1"), StepId::from("S2")];
        let c = Contradiction::new(ids, "figures disagree", Severity::High, VerifierSpec::rule("consistency_checker")).unwrap();
        let c_id = c.contradiction_id.clone();
        doc.add_contradiction(c).unwrap();

        let out = conclude(&doc, &PolicySettings::default(), &finalize_gate());
        let Verdict::Clarify(req) = out.verdict else {
            panic!("low confidence with a HIGH contradiction must clarify");
        };
        assert!(
            req.aggregate_confidence < PolicySettings::default().finalization.min_confidence_to_finalize,
            "the HIGH penalty should pull confidence under the minimum, got {}",
            req.aggregate_confidence
        );
        assert_eq!(
            req.blocking_contradiction_ids,
            vec![c_id],
            "the clarification must name the contradiction behind it"
        );
    }

    #[test]
    fn gate_reason_joins_a_kernel_block() {
        let doc = checked(vec![step("S1", 0, &[], "ok", Some(0.4))]);
        let gate = FixedGate(PolicyDecision::Fail { reason: "audit hold".to_string() });
        let out = conclude(&doc, &PolicySettings::default(), &gate);
        let Verdict::Clarify(req) = out.verdict else {
            panic!("the kernel's clarification outranks the gate's failure");
        };
        assert!(req.reason.contains("below"), "kernel reason kept: {}", req.reason);
        assert!(req.reason.contains("audit hold"), "gate reason merged: {}", req.reason);
        let last = out.accounting.confidence_adjustments.last().unwrap();
        assert_eq!(last.source, "policy_block");
        assert_eq!(last.reason, req.reason, "the ledger records the merged reason");
    }

    // ── Gate queries ─────────────────────────────────────────────────────────

    struct CountingGate {
        calls: AtomicUsize,
        seen: Mutex<Vec<DecisionPoint>>,
    }

    impl CountingGate {
        fn new() -> Self {
            CountingGate { calls: AtomicUsize::new(0), seen: Mutex::new(Vec::new()) }
        }
    }

    impl PolicyGate for CountingGate {
        fn settings(&self, _domain: &str) -> PolicySettings {
            PolicySettings::default()
        }

        fn decide(&self, ctx: &PolicyContext) -> PolicyDecision {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(ctx.decision_point);
            PolicyDecision::Finalize
        }
    }

    #[test]
    fn gate_is_asked_once_on_every_outcome() {
        let strict = |f: fn(&mut FinalizationSettings)| {
            let mut s = PolicySettings::default();
            f(&mut s.finalization);
            s
        };
        let with_high = || {
            let mut doc = chain();
            let ids = vec![StepId::from("S1"), StepId::from("S2")];
            doc.add_contradiction(Contradiction::new(ids, "gap", Severity::High, VerifierSpec::rule("c")).unwrap())
                .unwrap();
            doc
        };
        let partial = || checked(vec![step("S1", 0, &[], "ok", Some(0.9)), step("S2", 1, &[], "", None)]);

        let cases: Vec<(&str, RunDocument, PolicySettings)> = vec![
            ("no verified step", checked(vec![step("S1", 0, &[], "", None)]), PolicySettings::default()),
            ("partial disabled", partial(), strict(|f| f.allow_partial_finalization = false)),
            ("fail closed", partial(), strict(|f| f.fail_closed_if_unverified = true)),
            ("low confidence", checked(vec![step("S1", 0, &[], "ok", Some(0.4))]), PolicySettings::default()),
            ("HIGH contradiction", with_high(), strict(|f| f.min_confidence_to_finalize = 0.0)),
            ("finalize", chain(), PolicySettings::default()),
        ];
        for (name, doc, settings) in cases {
            let gate = CountingGate::new();
            conclude(&doc, &settings, &gate);
            assert_eq!(gate.calls.load(Ordering::SeqCst), 1, "{name}: gate must be asked exactly once");
            assert_eq!(
                *gate.seen.lock().unwrap(),
                vec![DecisionPoint::Finalization],
                "{name}: asked at the finalization point"
            );
        }
    }

    // ── Apply ────────────────────────────────────────────────────────────────

    #[test]
    fn apply_finalizes_and_writes_memory() {
        let doc = chain();
        let store = RunStore::new(doc.clone());
        let trail = AuditTrail::new(store.clone(), None);
        let ctx = RunContext::new(RunId::new(), "d", PolicySettings::default(), CancellationToken::new(), None);
        let memory = Arc::new(InMemoryMemoryStore::default());
        let dyn_memory: Arc<dyn MemoryStore> = memory.clone();

        let conclusion = conclude(&doc, &ctx.settings, &finalize_gate());
        apply(&ctx, &store, &trail, Some(&dyn_memory), true, conclusion).unwrap();

        let after = store.snapshot();
        assert_eq!(after.task().status(), TaskStatus::Finalized);
        assert_eq!(after.run().status(), RunStatus::Finalized);
        assert_eq!(after.memory_writes().len(), 1);
        assert_eq!(memory.load().unwrap().len(), 1);
        assert_eq!(after.memory_writes()[0].source_step_id, Some(StepId::from("S2")));
    }

    #[test]
    fn apply_skips_memory_when_disabled() {
        let doc = chain();
        let store = RunStore::new(doc.clone());
        let trail = AuditTrail::new(store.clone(), None);
        let ctx = RunContext::new(RunId::new(), "d", PolicySettings::default(), CancellationToken::new(), None);
        let conclusion = conclude(&doc, &ctx.settings, &finalize_gate());
        apply(&ctx, &store, &trail, None, false, conclusion).unwrap();
        assert!(store.read(|d| d.memory_writes().is_empty()));
    }
}
