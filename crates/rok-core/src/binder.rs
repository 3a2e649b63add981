//! Evidence binder.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, warn};

use rok_contracts::{
    audit::AuditEventType,
    error::{RokError, RokResult},
    evidence::Evidence,
    ids::StepId,
    step::ExecutorKind,
};

use crate::{context::RunContext, store::RunStore, trail::AuditTrail, traits::EvidenceSource};

#[derive(Debug, Clone, PartialEq)]
pub enum BindOutcome {
    Attached(usize),
    /// Nothing new survived and the step does not need more; status unchanged.
    NothingAttached,
    /// The step requires evidence and no candidate survived filtering.
    Insufficient { reason: String },
}

/// Drop candidates below `min_relevance`, keeping order.
pub fn filter_candidates(candidates: Vec<Evidence>, min_relevance: f64) -> (Vec<Evidence>, usize) {
    let total = candidates.len();
    let kept: Vec<Evidence> = candidates
        .into_iter()
        .filter(|e| e.relevance >= min_relevance)
        .collect();
    let dropped = total - kept.len();
    (kept, dropped)
}

/// Filter `candidates` and attach the survivors to `step_id`.
pub fn bind(
    ctx: &RunContext,
    store: &RunStore,
    trail: &AuditTrail,
    step_id: &StepId,
    candidates: Vec<Evidence>,
) -> RokResult<BindOutcome> {
    let offered = candidates.len();
    let (survivors, dropped) = filter_candidates(candidates, ctx.settings.min_evidence_relevance);

    let (required, is_tool, already) = store.read(|doc| {
        doc.step(step_id)
            .map(|s| {
                (
                    s.evidence_required(),
                    s.executor().kind == ExecutorKind::Tool,
                    s.evidence().len(),
                )
            })
            .ok_or_else(|| RokError::state(format!("unknown step '{step_id}'")))
    })?;

    if survivors.is_empty() {
        // Tool steps bring their own evidence with the execution, and evidence
        // bound in an earlier round still satisfies the requirement.
        if required && !is_tool && already == 0 {
            let reason = format!(
                "{offered} candidate(s), none at or above relevance {}",
                ctx.settings.min_evidence_relevance
            );
            warn!(run_id = %ctx.run_id, step_id = %step_id, %reason, "evidence insufficient");
            trail.record(
                AuditEventType::EvidenceInsufficient,
                json!({ "step_id": step_id, "offered": offered, "dropped": dropped, "reason": reason }),
            );
            return Ok(BindOutcome::Insufficient { reason });
        }
        return Ok(BindOutcome::NothingAttached);
    }

    let ids: Vec<_> = survivors.iter().map(|e| e.evidence_id.clone()).collect();
    let attached = store.write(|doc| doc.with_step(step_id, |s| s.attach_evidence(survivors)))?;
    if attached == 0 {
        return Ok(BindOutcome::NothingAttached);
    }

    debug!(run_id = %ctx.run_id, step_id = %step_id, attached, dropped, "evidence attached");
    trail.record(
        AuditEventType::EvidenceAttached,
        json!({ "step_id": step_id, "attached": attached, "dropped": dropped, "evidence_ids": ids }),
    );
    Ok(BindOutcome::Attached(attached))
}

/// Ask the evidence source for candidates, then bind them.
///
/// Without a source the candidate list is empty.
pub async fn gather_and_bind(
    ctx: &RunContext,
    store: &RunStore,
    trail: &AuditTrail,
    source: Option<&Arc<dyn EvidenceSource>>,
    step_id: &StepId,
    round: u32,
) -> RokResult<BindOutcome> {
    let candidates = match source {
        Some(source) => {
            let view = store.view(step_id)?;
            match ctx
                .bounded("evidence:gather", source.gather(&view, round))
                .await
            {
                Ok(found) => found,
                Err(e @ RokError::Cancelled { .. }) => return Err(e),
                Err(e) => {
                    warn!(run_id = %ctx.run_id, step_id = %step_id, error = %e, "evidence source failed");
                    Vec::new()
                }
            }
        }
        None => Vec::new(),
    };
    bind(ctx, store, trail, step_id, candidates)
}
