//! Revision controller.
//!
//! Asks the policy gate what to do with a non-passing step, enforces the
//! per-step and task-wide ceilings, and appends the revision record before
//! the pipeline re-enters.

use serde_json::json;
use tracing::{debug, info, warn};

use rok_contracts::{
    audit::AuditEventType,
    error::{RokError, RokResult},
    ids::{RevisionId, StepId},
    policy::{DecisionPoint, PolicyContext, PolicyDecision, RevisionTrigger},
    revision::{RevisionAction, RevisionRecord},
    step::{ExecutorKind, ExecutorSpec},
};

use crate::{context::RunContext, store::RunStore, trail::AuditTrail, traits::PolicyGate};

/// Where the step pipeline resumes after a revision.
#[derive(Debug, Clone, PartialEq)]
pub enum Reentry {
    /// Gather and bind evidence again with the given round.
    Bind { round: u32, revision_id: RevisionId },
    /// Run the executor again.
    Execute { revision_id: RevisionId },
    /// The step escalated and is FAILED.
    Escalated,
}

struct Plan {
    action: RevisionAction,
    reason: String,
    constraints: Vec<String>,
    executor: Option<ExecutorSpec>,
    forced: bool,
}

impl Plan {
    fn escalate(reason: impl Into<String>, forced: bool) -> Self {
        Self {
            action: RevisionAction::EscalateUncertainty,
            reason: reason.into(),
            constraints: Vec::new(),
            executor: None,
            forced,
        }
    }
}

/// Translate a policy decision into a revision plan, before ceilings.
fn plan_for(decision: PolicyDecision, ctx: &RunContext) -> Plan {
    match decision {
        PolicyDecision::FetchMoreEvidence { reason } => Plan {
            action: RevisionAction::FetchMoreEvidence,
            reason,
            constraints: Vec::new(),
            executor: None,
            forced: false,
        },
        PolicyDecision::ReexecuteStep {
            reason,
            added_constraints,
        } => Plan {
            action: RevisionAction::ReexecuteStep,
            reason,
            constraints: added_constraints,
            executor: None,
            forced: false,
        },
        PolicyDecision::ChangeExecutor { reason, executor } => {
            if !ctx.settings.executor_allowed(&executor.name) {
                Plan::escalate(
                    format!("executor '{}' is not allowed by policy", executor.name),
                    false,
                )
            } else if executor.kind == ExecutorKind::Model && executor.prompt_template.is_none() {
                Plan::escalate(
                    format!("executor '{}' has no prompt template reference", executor.name),
                    false,
                )
            } else {
                Plan {
                    action: RevisionAction::ChangeExecutor,
                    reason,
                    constraints: Vec::new(),
                    executor: Some(executor),
                    forced: false,
                }
            }
        }
        PolicyDecision::EscalateUncertainty { reason } => Plan::escalate(reason, false),
        other => Plan::escalate(
            format!("{} is not a revision action", other.label()),
            false,
        ),
    }
}

/// Decide and record one revision for `step_id`.
///
/// The step must be NEEDS_REVISION with a current verification. `round` is
/// the evidence round the step last bound with.
pub fn revise(
    gate: &dyn PolicyGate,
    ctx: &RunContext,
    store: &RunStore,
    trail: &AuditTrail,
    step_id: &StepId,
    trigger: RevisionTrigger,
    round: u32,
) -> RokResult<Reentry> {
    let (verification, retry_count, evidence_count, severities) = store.read(|doc| {
        let step = doc
            .step(step_id)
            .ok_or_else(|| RokError::state(format!("unknown step '{step_id}'")))?;
        let verification = step.current_verification().cloned().ok_or_else(|| {
            RokError::state(format!("step '{step_id}': revision without a verification"))
        })?;
        let severities = doc.contradictions().iter().map(|c| c.severity).collect();
        Ok::<_, RokError>((verification, step.retry_count(), step.evidence().len(), severities))
    })?;

    let policy_ctx = PolicyContext {
        decision_point: DecisionPoint::Revision,
        domain: ctx.domain.clone(),
        step_id: Some(step_id.clone()),
        trigger: Some(trigger),
        verification_status: Some(verification.status),
        confidence: verification.confidence,
        retry_count,
        total_revisions: ctx.total_revisions(),
        evidence_count,
        contradiction_severities: severities,
    };
    let decision = gate.decide(&policy_ctx);
    debug!(run_id = %ctx.run_id, step_id = %step_id, decision = decision.label(), ?trigger, "revision decision");
    trail.record(
        AuditEventType::PolicyDecision,
        json!({ "step_id": step_id, "context": policy_ctx, "decision": decision }),
    );

    let mut plan = plan_for(decision, ctx);
    let mut reserved = false;
    if plan.action.is_retry() {
        let exhausted = if retry_count >= ctx.retry_ceiling() {
            Some(format!("per-step retry ceiling {} reached", ctx.retry_ceiling()))
        } else if !ctx.try_reserve_revision() {
            Some(format!("task revision ceiling {} reached", ctx.total_ceiling()))
        } else {
            reserved = true;
            None
        };
        if let Some(reason) = exhausted {
            warn!(run_id = %ctx.run_id, step_id = %step_id, %reason, "revision ceiling reached");
            trail.record(
                AuditEventType::RevisionExhausted,
                json!({
                    "step_id": step_id,
                    "requested_action": plan.action,
                    "retry_count": retry_count,
                    "total_revisions": ctx.total_revisions(),
                    "reason": reason,
                }),
            );
            plan = Plan::escalate(reason, true);
        }
    }

    let mut record = RevisionRecord::new(plan.action, plan.reason, &verification)
        .with_constraints(plan.constraints);
    if let Some(executor) = plan.executor {
        record = record.with_executor(executor);
    }
    if plan.forced {
        record = record.forced();
    }
    let revision_id = record.revision_id.clone();
    let action = record.action;

    let recorded = record.clone();
    let ceiling = ctx.retry_ceiling();
    let written = store.write(|doc| {
        doc.with_step(step_id, |s| s.record_revision(recorded, ceiling))?;
        let count = doc.steps().iter().map(|s| s.revisions().len() as u32).sum();
        doc.set_revision_count(count);
        Ok::<_, RokError>(())
    });
    if let Err(e) = written {
        if reserved {
            ctx.release_revision();
        }
        return Err(e);
    }

    trail.record(
        AuditEventType::RevisionRecorded,
        json!({
            "step_id": step_id,
            "revision_id": revision_id,
            "action": action,
            "reason": record.reason,
            "forced": record.forced,
            "added_constraints": record.added_constraints,
            "new_executor": record.new_executor.as_ref().map(|e| &e.name),
        }),
    );

    Ok(match action {
        RevisionAction::FetchMoreEvidence => Reentry::Bind {
            round: round + 1,
            revision_id,
        },
        RevisionAction::ReexecuteStep | RevisionAction::ChangeExecutor => {
            Reentry::Execute { revision_id }
        }
        RevisionAction::EscalateUncertainty => {
            info!(run_id = %ctx.run_id, step_id = %step_id, reason = %record.reason, "uncertainty escalated");
            trail.record(
                AuditEventType::UncertaintyEscalated,
                json!({ "step_id": step_id, "revision_id": revision_id, "reason": record.reason }),
            );
            trail.record(
                AuditEventType::StepFailed,
                json!({ "step_id": step_id, "uncertain": true, "reason": record.reason }),
            );
            Reentry::Escalated
        }
    })
}
