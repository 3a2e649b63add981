//! Deterministic rule verifier.
//!
//! `RuleVerifier` implements the `StepVerifier` trait from `rok-core`.
//! Verification runs in phases and stops at the first that decides:
//!
//! 1. **Presence**: a step without output, or an evidence-required step
//!    without evidence, is UNKNOWN at confidence 0.
//! 2. **Structural**: when the step's verifier config carries an
//!    `output_schema`, the output is parsed as JSON and validated with the
//!    `jsonschema` crate. Every violation is reported, not only the first.
//! 3. **Claim support**: a tool step whose output is its own tool record
//!    is SUPPORTED. Otherwise, with evidence attached, the output is judged
//!    against the evidence text (see [`crate::claim`]).
//!
//! A step that passes every phase that applies to it is SUPPORTED.

use async_trait::async_trait;
use tracing::{debug, warn};

use rok_contracts::{
    error::RokResult,
    evidence::SourceType,
    ids::EvidenceId,
    step::ExecutorKind,
    verify::VerificationStatus,
};
use rok_core::traits::{Judgement, StepVerifier, StepView};

use crate::claim;

/// Confidence for outputs that pass presence and structural checks and have
/// no evidence to be judged against.
pub const STRUCTURAL_CONFIDENCE: f64 = 0.95;

/// Confidence for outputs that fail schema validation.
const SCHEMA_FAILURE_CONFIDENCE: f64 = 0.2;

#[derive(Debug, Clone, Default)]
pub struct RuleVerifier;

impl RuleVerifier {
    pub fn new() -> Self {
        Self
    }

    /// Validate `output` against the JSON Schema in `schema`.
    ///
    /// Returns every violation as an issue; an empty list means the output
    /// conforms.
    pub fn schema_issues(output: &str, schema: &serde_json::Value) -> Vec<String> {
        let instance: serde_json::Value = match serde_json::from_str(output) {
            Ok(v) => v,
            Err(e) => return vec![format!("output is not valid JSON: {e}")],
        };
        match jsonschema::validator_for(schema) {
            Ok(validator) => validator
                .iter_errors(&instance)
                .map(|error| format!("JSON Schema violation at {}: {}", error.instance_path, error))
                .collect(),
            Err(e) => vec![format!("invalid JSON Schema document: {e}")],
        }
    }
}

#[async_trait]
impl StepVerifier for RuleVerifier {
    async fn judge(&self, step: &StepView) -> RokResult<Judgement> {
        // ── Phase 1: presence ────────────────────────────────────────────────
        let output = match step.output.as_deref().map(str::trim) {
            Some(text) if !text.is_empty() => text,
            _ => {
                return Ok(Judgement::new(VerificationStatus::Unknown, 0.0)
                    .with_issue("step produced no output"));
            }
        };
        if step.evidence_required && step.evidence.is_empty() {
            return Ok(Judgement::new(VerificationStatus::Unknown, 0.0)
                .with_issue("step requires evidence but none is attached"));
        }

        // ── Phase 2: structural ──────────────────────────────────────────────
        if let Some(schema) = step.verifier.config.get("output_schema") {
            let issues = Self::schema_issues(output, schema);
            if !issues.is_empty() {
                for issue in &issues {
                    warn!(step_id = %step.step_id, %issue, "structural validation failure");
                }
                let mut judgement = Judgement::new(VerificationStatus::Weak, SCHEMA_FAILURE_CONFIDENCE);
                judgement.issues = issues;
                return Ok(judgement.checking(step.evidence_ids()));
            }
        }

        // ── Phase 3: claim support ───────────────────────────────────────────
        if step.executor.kind == ExecutorKind::Tool {
            let own: Vec<EvidenceId> = step
                .evidence
                .iter()
                .filter(|e| {
                    e.source.source_type == SourceType::Tool
                        && e.source.source_id == step.executor.name
                        && e.content.trim() == output
                })
                .map(|e| e.evidence_id.clone())
                .collect();
            if !own.is_empty() {
                debug!(step_id = %step.step_id, tool = %step.executor.name, "output matches tool record");
                return Ok(Judgement::new(VerificationStatus::Supported, STRUCTURAL_CONFIDENCE).checking(own));
            }
        }
        if step.evidence.is_empty() {
            debug!(step_id = %step.step_id, "verified by structural checks");
            return Ok(Judgement::new(VerificationStatus::Supported, STRUCTURAL_CONFIDENCE));
        }
        let support = claim::assess(output, &step.evidence);
        debug!(
            step_id = %step.step_id,
            status = ?support.status,
            confidence = support.confidence,
            evidence = step.evidence.len(),
            "claim support assessed"
        );
        Ok(Judgement {
            status: support.status,
            confidence: support.confidence,
            issues: support.issues,
            checked_evidence_ids: step.evidence_ids(),
        })
    }
}
