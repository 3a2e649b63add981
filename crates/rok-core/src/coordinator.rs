//! Verifier coordinator.
//!
//! Closed dispatch over `VerifierKind`, then the kernel's own checks:
//! checked ids are restricted to evidence actually on the step, supportive
//! judgements without checked evidence are downgraded, and passing requires
//! a supportive status at or above the policy threshold.

use std::{collections::BTreeSet, sync::Arc};

use serde_json::json;
use tracing::{debug, info, warn};

use rok_contracts::{
    audit::AuditEventType,
    error::{RokError, RokResult},
    evidence::check_unit_interval,
    ids::{EvidenceId, RevisionId, StepId},
    verify::{Verification, VerificationStatus, VerifierKind},
};

use crate::{
    context::RunContext,
    store::RunStore,
    trail::AuditTrail,
    traits::{Judgement, StepVerifier, StepView},
};

#[derive(Clone)]
pub struct Verifiers {
    pub rule: Arc<dyn StepVerifier>,
    pub model: Option<Arc<dyn StepVerifier>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VerifyOutcome {
    pub verification: Verification,
    pub passed: bool,
}

async fn judge_with(
    ctx: &RunContext,
    verifier: &Arc<dyn StepVerifier>,
    view: &StepView,
    label: &str,
) -> RokResult<Judgement> {
    match ctx.bounded(label, verifier.judge(view)).await {
        Ok(j) => match check_unit_interval("confidence", j.confidence) {
            Ok(()) => Ok(j),
            Err(e) => Ok(Judgement::new(VerificationStatus::Unknown, 0.0)
                .with_issue(format!("{label} returned an invalid judgement: {e}"))),
        },
        Err(e @ RokError::Cancelled { .. }) => Err(e),
        Err(e) => Ok(Judgement::new(VerificationStatus::Unknown, 0.0)
            .with_issue(format!("{label} failed: {e}"))),
    }
}

/// RULE status wins on disagreement; the weaker confidence is kept.
pub fn merge_hybrid(rule: Judgement, model: Judgement) -> Judgement {
    let mut issues = rule.issues;
    if rule.status != model.status {
        issues.push(format!(
            "model verifier judged {:?}; rule verdict {:?} kept",
            model.status, rule.status
        ));
    }
    for issue in model.issues {
        if !issues.contains(&issue) {
            issues.push(issue);
        }
    }
    let mut checked = rule.checked_evidence_ids;
    for id in model.checked_evidence_ids {
        if !checked.contains(&id) {
            checked.push(id);
        }
    }
    Judgement {
        status: rule.status,
        confidence: rule.confidence.min(model.confidence),
        issues,
        checked_evidence_ids: checked,
    }
}

/// Apply the kernel's evidence rules to a raw judgement.
pub fn sanitize(mut judgement: Judgement, view: &StepView) -> Judgement {
    let known: BTreeSet<EvidenceId> = view.evidence_ids().into_iter().collect();
    let before = judgement.checked_evidence_ids.len();
    judgement.checked_evidence_ids.retain(|id| known.contains(id));
    if judgement.checked_evidence_ids.len() < before {
        judgement
            .issues
            .push("verifier cited evidence not attached to the step".to_string());
    }

    if judgement.status.is_supportive()
        && view.evidence_required
        && judgement.checked_evidence_ids.is_empty()
    {
        judgement.issues.push(format!(
            "{:?} without checked evidence on an evidence-required step",
            judgement.status
        ));
        judgement.status = VerificationStatus::Unknown;
    }
    judgement
}

pub async fn verify(
    verifiers: &Verifiers,
    ctx: &RunContext,
    store: &RunStore,
    trail: &AuditTrail,
    step_id: &StepId,
    revision_id: Option<RevisionId>,
) -> RokResult<VerifyOutcome> {
    let view = store.view(step_id)?;
    let raw = match view.verifier.kind {
        VerifierKind::Rule => judge_with(ctx, &verifiers.rule, &view, "verifier:rule").await?,
        VerifierKind::Model => match &verifiers.model {
            Some(model) => judge_with(ctx, model, &view, "verifier:model").await?,
            None => judge_with(ctx, &verifiers.rule, &view, "verifier:rule")
                .await?
                .with_issue("no model verifier configured; rule verifier used"),
        },
        VerifierKind::Hybrid => {
            let rule = judge_with(ctx, &verifiers.rule, &view, "verifier:rule").await?;
            match &verifiers.model {
                Some(model) => {
                    let judged = judge_with(ctx, model, &view, "verifier:model").await?;
                    merge_hybrid(rule, judged)
                }
                None => rule.with_issue("no model verifier configured; rule verdict only"),
            }
        }
    };

    let judgement = sanitize(raw, &view);
    let threshold = ctx.settings.verification_confidence_threshold;
    let passed = judgement.status.is_supportive() && judgement.confidence >= threshold;

    let verification = Verification::new(
        judgement.status,
        judgement.confidence,
        judgement.issues,
        judgement.checked_evidence_ids,
        view.verifier.clone(),
    )?
    .with_revision(revision_id);

    let recorded = verification.clone();
    store.write(|doc| doc.with_step(step_id, |s| s.record_verification(recorded, passed)))?;

    let payload = json!({
        "step_id": step_id,
        "status": verification.status,
        "confidence": verification.confidence,
        "threshold": threshold,
        "checked_evidence_ids": verification.checked_evidence_ids,
        "issues": verification.issues,
        "revision_id": verification.revision_id,
    });
    if passed {
        info!(run_id = %ctx.run_id, step_id = %step_id, confidence = verification.confidence, "step verified");
        trail.record(AuditEventType::StepVerified, payload);
    } else {
        debug!(
            run_id = %ctx.run_id,
            step_id = %step_id,
            status = ?verification.status,
            confidence = verification.confidence,
            threshold,
            "verification below threshold"
        );
        if verification.status == VerificationStatus::Unknown {
            warn!(run_id = %ctx.run_id, step_id = %step_id, "verification produced UNKNOWN");
        }
        trail.record(AuditEventType::VerificationFailed, payload);
    }

    Ok(VerifyOutcome {
        verification,
        passed,
    })
}
