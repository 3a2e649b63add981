//! Consistency checker.
//!
//! Runs once, after every step is terminal. Compares every VERIFIED step's
//! output against the other verified steps, against persistent memory
//! facts, and against the task's source documents.

use serde_json::json;
use tracing::{debug, info};

use rok_contracts::{
    audit::AuditEventType,
    conclusion::{Contradiction, MemoryType, MemoryWrite, Severity},
    document::RunDocument,
    error::{RokError, RokResult},
    policy::ConsistencySettings,
    step::{Step, StepStatus},
    task::TaskStatus,
    verify::VerifierSpec,
};

use crate::{
    context::RunContext,
    store::RunStore,
    text::{first_percentage, is_negated, jaccard, split_sentences, subject_tokens},
    trail::AuditTrail,
};

pub const DETECTOR_NAME: &str = "consistency_checker";

/// One conflict between two claims.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    pub severity: Severity,
    pub description: String,
}

fn numeric_conflict(a: &str, b: &str, settings: &ConsistencySettings) -> Option<Conflict> {
    let (pa, pb) = (first_percentage(a)?, first_percentage(b)?);
    let overlap = jaccard(&subject_tokens(a), &subject_tokens(b));
    let gap = (pa - pb).abs();
    if overlap < settings.subject_overlap || gap <= settings.numeric_tolerance {
        return None;
    }
    let severity = if gap >= settings.high_severity_delta {
        Severity::High
    } else {
        Severity::Medium
    };
    Some(Conflict {
        severity,
        description: format!("\"{a}\" states {pa}% but \"{b}\" states {pb}%"),
    })
}

fn negation_conflict(a: &str, b: &str, settings: &ConsistencySettings) -> Option<Conflict> {
    if is_negated(a) == is_negated(b) {
        return None;
    }
    let overlap = jaccard(&subject_tokens(a), &subject_tokens(b));
    (overlap >= settings.negation_overlap).then(|| Conflict {
        severity: Severity::High,
        description: format!("\"{a}\" directly negates \"{b}\""),
    })
}

/// First conflict between any sentence of `a` and any sentence of `b`.
pub fn compare(a: &str, b: &str, settings: &ConsistencySettings, numeric_only: bool) -> Option<Conflict> {
    let left = split_sentences(a);
    let right = split_sentences(b);
    left.iter().find_map(|sa| {
        right.iter().find_map(|sb| {
            numeric_conflict(sa, sb, settings).or_else(|| {
                if numeric_only {
                    None
                } else {
                    negation_conflict(sa, sb, settings)
                }
            })
        })
    })
}

fn verified_outputs(doc: &RunDocument) -> Vec<(&Step, &str)> {
    doc.steps()
        .iter()
        .filter(|s| s.status() == StepStatus::Verified)
        .filter_map(|s| s.current_output().map(|out| (s, out)))
        .collect()
}

/// Detect every contradiction in `doc`. Pure apart from fresh ids.
pub fn detect(
    doc: &RunDocument,
    memory: &[MemoryWrite],
    settings: &ConsistencySettings,
) -> RokResult<Vec<Contradiction>> {
    let detector = VerifierSpec::rule(DETECTOR_NAME);
    let claims = verified_outputs(doc);
    let mut found = Vec::new();

    for (i, (left, left_out)) in claims.iter().enumerate() {
        for (right, right_out) in claims.iter().skip(i + 1) {
            if let Some(conflict) = compare(left_out, right_out, settings, false) {
                found.push(Contradiction::new(
                    vec![left.step_id().clone(), right.step_id().clone()],
                    format!("{} vs {}: {}", left.logical_id(), right.logical_id(), conflict.description),
                    conflict.severity,
                    detector.clone(),
                )?);
            }
        }
    }

    for (step, output) in &claims {
        for fact in memory.iter().filter(|m| m.memory_type == MemoryType::Fact) {
            if let Some(conflict) = compare(output, &fact.content, settings, false) {
                found.push(
                    Contradiction::new(
                        vec![step.step_id().clone()],
                        format!("{} vs memory {}: {}", step.logical_id(), fact.memory_id, conflict.description),
                        conflict.severity,
                        detector.clone(),
                    )?
                    .with_memory(fact.memory_id.clone()),
                );
            }
        }
        for source in doc.task().sources() {
            if let Some(conflict) = compare(output, &source.content, settings, true) {
                found.push(
                    Contradiction::new(
                        vec![step.step_id().clone()],
                        format!("{} vs source {}: {}", step.logical_id(), source.source_id, conflict.description),
                        conflict.severity,
                        detector.clone(),
                    )?
                    .with_source(source.source_id.clone()),
                );
            }
        }
    }
    Ok(found)
}

/// Detect, append, and move the task to CONSISTENCY_CHECKED.
pub fn check(
    ctx: &RunContext,
    store: &RunStore,
    trail: &AuditTrail,
    memory: &[MemoryWrite],
) -> RokResult<Vec<Contradiction>> {
    let settings = &ctx.settings.consistency;
    let found = store.write(|doc| {
        let found = detect(doc, memory, settings)?;
        for c in &found {
            doc.add_contradiction(c.clone())?;
        }
        doc.advance_task(TaskStatus::ConsistencyChecked, None)?;
        Ok::<_, RokError>(found)
    })?;

    for c in &found {
        debug!(run_id = %ctx.run_id, severity = ?c.severity, description = %c.description, "contradiction detected");
        trail.record(
            AuditEventType::ContradictionDetected,
            json!({
                "contradiction_id": c.contradiction_id,
                "step_ids": c.step_ids,
                "severity": c.severity,
                "prior_memory_id": c.prior_memory_id,
                "source_id": c.source_id,
            }),
        );
    }
    info!(run_id = %ctx.run_id, contradictions = found.len(), "consistency checked");
    trail.record(
        AuditEventType::ConsistencyChecked,
        json!({ "contradictions": found.len(), "memory_items": memory.len() }),
    );
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rok_contracts::{
        evidence::{Evidence, SourceRef, SourceType},
        ids::{ExecutionId, RunId, StepId},
        step::{DependencyGate, ExecutorSpec, StepExecution, StepPlan},
        task::{Run, SourceDocument, Task, TaskRequest},
        verify::{Verification, VerificationStatus},
    };

    fn verified(id: &str, index: usize, output: &str) -> Step {
        let mut step = Step::from_plan(StepPlan::new(id, ExecutorSpec::tool("t")).with_id(id), index);
        step.schedule().unwrap();
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
        step.record_execution(exec, vec![ev], &DependencyGate::default()).unwrap();
        let v = Verification::new(VerificationStatus::Supported, 0.9, vec![], vec![ev_id], VerifierSpec::default()).unwrap();
        step.record_verification(v, true).unwrap();
        step
    }

    fn doc(steps: Vec<Step>, request: TaskRequest) -> RunDocument {
        RunDocument::new(
            Task::from_request(&request),
            Run::start(RunId::new(), None, "p", serde_json::Value::Null),
            steps,
        )
    }

    // ── Detectors ────────────────────────────────────────────────────────────

    #[test]
    fn large_percentage_gap_on_shared_subject_is_high() {
        let c = compare(
            "Method X improves accuracy on benchmark Y by 14.8%.",
            "Method X improves accuracy on benchmark Y by 9.1 percent.",
            &ConsistencySettings::default(),
            false,
        )
        .expect("conflict expected");
        assert_eq!(c.severity, Severity::High);
    }

    #[test]
    fn small_gap_within_high_delta_is_medium() {
        let c = compare(
            "Recall on the test set is 80.0%.",
            "Recall on the test set is 81.5%.",
            &ConsistencySettings::default(),
            false,
        )
        .expect("conflict expected");
        assert_eq!(c.severity, Severity::Medium);
    }

    #[test]
    fn gap_within_tolerance_is_not_a_conflict() {
        assert!(compare("Recall is 80.0%.", "Recall is 80.3%.", &ConsistencySettings::default(), false).is_none());
    }

    #[test]
    fn unrelated_subjects_do_not_conflict() {
        assert!(compare(
            "Loan interest rate is 5%.",
            "Benchmark accuracy rose 14.8%.",
            &ConsistencySettings::default(),
            false
        )
        .is_none());
    }

    #[test]
    fn direct_negation_is_detected() {
        let c = compare(
            "The method improves accuracy on benchmark Y.",
            "The method does not improve accuracy on benchmark Y.",
            &ConsistencySettings { negation_overlap: 0.5, ..ConsistencySettings::default() },
            false,
        )
        .expect("negation expected");
        assert_eq!(c.severity, Severity::High);
    }

    #[test]
    fn numeric_only_skips_negation() {
        assert!(compare(
            "The method improves accuracy on benchmark Y.",
            "The method does not improve accuracy on benchmark Y.",
            &ConsistencySettings { negation_overlap: 0.5, ..ConsistencySettings::default() },
            true,
        )
        .is_none());
    }

    // ── Document scan ────────────────────────────────────────────────────────

    #[test]
    fn step_pair_and_memory_conflicts_are_reported() {
        let d = doc(
            vec![
                verified("S1", 0, "Method X improves accuracy on benchmark Y by 14.8%."),
                verified("S2", 1, "Method X improves accuracy on benchmark Y by 3.2%."),
            ],
            TaskRequest::new("o", "research"),
        );
        let memory = vec![MemoryWrite::fact("Method X improves accuracy on benchmark Y by 14.8%.", 0.9).unwrap()];
        let found = detect(&d, &memory, &ConsistencySettings::default()).unwrap();

        assert_eq!(found.len(), 2, "S1 vs S2 and S2 vs memory");
        assert_eq!(found[0].step_ids, vec![StepId::from("S1"), StepId::from("S2")]);
        assert_eq!(found[1].prior_memory_id, Some(memory[0].memory_id.clone()));
        assert_eq!(found[0].detected_by.name, DETECTOR_NAME);
    }

    #[test]
    fn source_sentences_are_compared_numerically() {
        let request = TaskRequest::new("o", "research").with_source(SourceDocument::new(
            "paper",
            "We study method X. Method X improves accuracy on benchmark Y by 9.1%.",
        ));
        let d = doc(vec![verified("S1", 0, "Method X improves accuracy on benchmark Y by 14.8%.")], request);
        let found = detect(&d, &[], &ConsistencySettings::default()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].source_id.as_deref(), Some("paper"));
    }
}
