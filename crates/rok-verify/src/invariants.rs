//! Re-check a stored run document against the kernel's guarantees.
//!
//! The mutators on `RunDocument` enforce these rules while a run is live.
//! A document read back from disk has been through no mutator, so `check`
//! walks it and reports every rule it breaks. The policy in force is read
//! from the run's own `policy_snapshot`.

use std::collections::{BTreeSet, HashMap};

use rok_contracts::{
    document::RunDocument,
    error::{RokError, RokResult},
    ids::StepId,
    policy::PolicySettings,
    revision::RevisionAction,
    step::{Step, StepStatus},
    verify::Verification,
};
use rok_core::{
    context::{ABSOLUTE_MAX_RETRIES_PER_STEP, ABSOLUTE_MAX_TOTAL_REVISIONS},
    scheduler::topological_order,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Short kebab-case rule name.
    pub rule: &'static str,
    pub step_id: Option<StepId>,
    pub detail: String,
}

impl Violation {
    fn run(rule: &'static str, detail: impl Into<String>) -> Self {
        Self {
            rule,
            step_id: None,
            detail: detail.into(),
        }
    }

    fn step(rule: &'static str, step: &Step, detail: impl Into<String>) -> Self {
        Self {
            rule,
            step_id: Some(step.step_id().clone()),
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.step_id {
            Some(id) => write!(f, "[{}] step '{}': {}", self.rule, id, self.detail),
            None => write!(f, "[{}] {}", self.rule, self.detail),
        }
    }
}

fn passes(v: &Verification, threshold: f64) -> bool {
    v.status.is_supportive() && v.confidence >= threshold
}

/// The policy-derived limits a run was held to.
struct Limits {
    threshold: f64,
    retry_ceiling: u32,
    total_ceiling: u32,
    waived: BTreeSet<StepId>,
}

impl Limits {
    fn from_settings(settings: &PolicySettings) -> Self {
        Self {
            threshold: settings.verification_confidence_threshold,
            retry_ceiling: settings.max_retries_per_step.min(ABSOLUTE_MAX_RETRIES_PER_STEP),
            total_ceiling: settings.max_total_revisions.min(ABSOLUTE_MAX_TOTAL_REVISIONS),
            waived: settings.waived_dependencies.iter().cloned().collect(),
        }
    }
}

/// Every rule `doc` breaks, in document order.
///
/// An unreadable `policy_snapshot` is itself a violation, and the rules
/// that depend on policy (dependency waivers, the verification threshold,
/// the revision ceilings) are then skipped.
pub fn check(doc: &RunDocument) -> Vec<Violation> {
    let mut out = Vec::new();
    let limits = match serde_json::from_value::<PolicySettings>(doc.run().policy_snapshot.clone()) {
        Ok(settings) => Some(Limits::from_settings(&settings)),
        Err(e) => {
            out.push(Violation::run(
                "policy-snapshot",
                format!("policy snapshot does not parse as settings: {e}"),
            ));
            None
        }
    };
    let threshold = limits.as_ref().map(|l| l.threshold);
    check_graph(doc, &mut out);

    for step in doc.steps() {
        // Execution only behind verified or waived dependencies.
        if let Some(l) = limits.as_ref().filter(|_| !step.executions().is_empty()) {
            for dep in step.depends_on() {
                let verified = doc.step(dep).is_some_and(|d| d.status() == StepStatus::Verified);
                if !verified && !l.waived.contains(dep) {
                    out.push(Violation::step(
                        "dependency-gate",
                        step,
                        format!("executed although dependency '{dep}' is not VERIFIED"),
                    ));
                }
            }
        }

        // Verifications cite only attached evidence.
        let evidence = step.evidence_ids();
        for v in step.verifications() {
            if let Some(stray) = v.checked_evidence_ids.iter().find(|id| !evidence.contains(*id)) {
                out.push(Violation::step(
                    "evidence-citation",
                    step,
                    format!("verification cites evidence '{stray}' not attached to the step"),
                ));
            }
            if v.status.is_supportive() && step.evidence_required() && v.checked_evidence_ids.is_empty() {
                out.push(Violation::step(
                    "evidence-citation",
                    step,
                    format!("{:?} verification on an evidence-required step cites no evidence", v.status),
                ));
            }
        }

        if let Some(threshold) = threshold {
            if step.status() == StepStatus::Verified
                && !step.current_verification().is_some_and(|v| passes(v, threshold))
            {
                out.push(Violation::step(
                    "verified-status",
                    step,
                    format!("VERIFIED without a verification at or above {threshold}"),
                ));
            }
        }

        // Every revision follows a non-passing verification.
        for r in step.revisions() {
            let trigger = step
                .verifications()
                .iter()
                .filter(|v| v.verified_at <= r.created_at)
                .last();
            match trigger {
                None => out.push(Violation::step(
                    "revision-trigger",
                    step,
                    format!("revision '{}' has no prior verification", r.revision_id),
                )),
                Some(v) if threshold.is_some_and(|t| passes(v, t)) => out.push(Violation::step(
                    "revision-trigger",
                    step,
                    format!("revision '{}' follows a passing verification", r.revision_id),
                )),
                Some(_) => {}
            }
        }

        if let Some(ceiling) = limits.as_ref().map(|l| l.retry_ceiling) {
            if step.retry_count() > ceiling {
                out.push(Violation::step(
                    "retry-ceiling",
                    step,
                    format!("{} retries exceed the ceiling of {ceiling}", step.retry_count()),
                ));
            }
        }

        if step.is_uncertain() {
            let escalated = step
                .latest_revision()
                .is_some_and(|r| r.action == RevisionAction::EscalateUncertainty);
            if step.status() != StepStatus::Failed || !escalated {
                out.push(Violation::step(
                    "uncertainty",
                    step,
                    "uncertain flag set without an escalation that failed the step",
                ));
            }
        }
    }

    if let Some(ceiling) = limits.as_ref().map(|l| l.total_ceiling) {
        if doc.run().revision_count > ceiling {
            out.push(Violation::run(
                "revision-budget",
                format!(
                    "{} revisions exceed the task-wide ceiling of {ceiling}",
                    doc.run().revision_count
                ),
            ));
        }
    }

    if let Some(conclusion) = doc.final_conclusion() {
        let verified = doc.verified_step_ids();
        for id in conclusion.supported_step_ids.iter().filter(|id| !verified.contains(*id)) {
            out.push(Violation::run(
                "conclusion-support",
                format!("conclusion cites step '{id}' which is not VERIFIED"),
            ));
        }
    }

    if doc.task().status().is_terminal() && !doc.all_steps_terminal() {
        out.push(Violation::run(
            "terminal-run",
            format!("task is {:?} with steps still open", doc.task().status()),
        ));
    }

    for (index, event) in doc.events().iter().enumerate() {
        if event.sequence != index as u64 {
            out.push(Violation::run(
                "event-sequence",
                format!("event at position {index} carries sequence {}", event.sequence),
            ));
            break;
        }
    }

    out
}

fn check_graph(doc: &RunDocument, out: &mut Vec<Violation>) {
    let index: HashMap<&StepId, usize> = doc
        .steps()
        .iter()
        .enumerate()
        .map(|(i, s)| (s.step_id(), i))
        .collect();
    let mut graph = Vec::with_capacity(doc.steps().len());
    for step in doc.steps() {
        let mut deps = Vec::new();
        for dep in step.depends_on() {
            match index.get(dep) {
                Some(&i) => deps.push(i),
                None => out.push(Violation::step(
                    "unknown-dependency",
                    step,
                    format!("depends on unknown step '{dep}'"),
                )),
            }
        }
        graph.push(deps);
    }
    if let Err(stuck) = topological_order(&graph) {
        let ids: Vec<String> = stuck
            .iter()
            .filter_map(|&i| doc.steps().get(i))
            .map(|s| s.step_id().to_string())
            .collect();
        out.push(Violation::run(
            "acyclic",
            format!("dependency cycle through {}", ids.join(", ")),
        ));
    }
}

/// `check`, folded into a single error.
pub fn enforce(doc: &RunDocument) -> RokResult<()> {
    let violations = check(doc);
    if violations.is_empty() {
        return Ok(());
    }
    let reason = violations
        .iter()
        .map(Violation::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    Err(RokError::SchemaValidation { reason })
}
