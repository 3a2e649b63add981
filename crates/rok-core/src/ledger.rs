//! Cost, risk, and confidence accounting for a finished step graph.

use rok_contracts::{
    document::RunDocument,
    policy::{PolicySettings, StepConfidence},
    step::StepStatus,
    task::Accounting,
};

use crate::traits::PolicyGate;

/// Risk added for a step that failed without escalating.
const FAILED_STEP_RISK: f64 = 0.05;

/// Per-step confidences of the VERIFIED steps, in declaration order.
///
/// A verifier config may carry a numeric `weight` for WEIGHTED_MEAN.
pub fn step_confidences(doc: &RunDocument) -> Vec<StepConfidence> {
    doc.steps()
        .iter()
        .filter(|s| s.status() == StepStatus::Verified)
        .filter_map(|s| {
            s.current_verification().map(|v| StepConfidence {
                step_id: s.step_id().clone(),
                confidence: v.confidence,
                weight: s
                    .verifier()
                    .config
                    .get("weight")
                    .and_then(serde_json::Value::as_f64)
                    .unwrap_or(1.0),
            })
        })
        .collect()
}

/// Build the run ledger. Deterministic for an unchanged document.
pub fn account(doc: &RunDocument, settings: &PolicySettings, gate: &dyn PolicyGate) -> Accounting {
    let rules = &settings.finalization;
    let base = gate.aggregate_confidence(&step_confidences(doc), rules.aggregation);
    let mut ledger = Accounting::with_base(base.clamp(0.0, 1.0));

    let cost: f64 = doc
        .steps()
        .iter()
        .flat_map(|s| s.executions())
        .filter_map(|e| e.metadata.get("cost").and_then(serde_json::Value::as_f64))
        .sum();
    ledger.add_cost(cost);

    for c in doc.contradictions() {
        let penalty = rules.severity_penalties.for_severity(c.severity);
        ledger.add_risk(penalty);
        if penalty > 0.0 {
            ledger.adjust(
                -penalty,
                "contradiction",
                format!("{:?} contradiction {}", c.severity, c.contradiction_id),
            );
        }
    }

    let revisions: usize = doc.steps().iter().map(|s| s.revisions().len()).sum();
    if revisions > 0 && rules.revision_penalty > 0.0 {
        ledger.adjust(
            -rules.revision_penalty,
            "revision",
            format!("{revisions} revision(s) recorded"),
        );
    }

    for step in doc.steps().iter().filter(|s| s.status() == StepStatus::Failed) {
        if step.is_uncertain() {
            ledger.add_risk(rules.uncertainty_penalty);
            if rules.uncertainty_penalty > 0.0 {
                ledger.adjust(
                    -rules.uncertainty_penalty,
                    "uncertainty",
                    format!("{} escalated uncertainty", step.logical_id()),
                );
            }
        } else {
            ledger.add_risk(FAILED_STEP_RISK);
        }
    }
    ledger
}
