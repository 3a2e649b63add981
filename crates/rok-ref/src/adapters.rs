//! Deterministic stand-ins for model executors and a model verifier.
//!
//! No network calls are made. Each template renders a fixed response from
//! the step view, so every run of a scenario produces the same document.

use std::{collections::BTreeSet, sync::OnceLock};

use async_trait::async_trait;
use regex::Regex;
use serde_json::json;
use tracing::debug;

use rok_contracts::{
    error::{RokError, RokResult},
    verify::VerificationStatus,
};
use rok_core::{
    text::{first_percentage, split_sentences},
    traits::{Judgement, ModelAdapter, ModelRequest, ModelResponse, StepVerifier, StepView},
};

pub const GPT_STUB: &str = "gpt_stub";
pub const O3_STUB: &str = "o3_stub";

/// Templates the stubs know how to render.
pub mod templates {
    pub const FORMULA_SELECT: &str = "formula_select";
    pub const EXPLAIN_PAYMENT: &str = "explain_payment";
    pub const CLAIM_EXTRACT: &str = "claim_extract";
    pub const CLAIM_CHECK: &str = "claim_check";
}

fn figure_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\d+(?:\.\d+)?(\s*(?:percent|%))").expect("figure pattern is valid")
    })
}

/// Both model stubs behind one adapter, dispatched by executor name.
#[derive(Debug, Clone, Default)]
pub struct StubModelAdapter {
    /// Executor names that fail every call.
    outages: BTreeSet<String>,
}

impl StubModelAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call to `executor` fail.
    pub fn with_outage(mut self, executor: impl Into<String>) -> Self {
        self.outages.insert(executor.into());
        self
    }

    fn cost(executor: &str) -> f64 {
        match executor {
            O3_STUB => 0.03,
            _ => 0.01,
        }
    }

    fn generic(executor: &str) -> String {
        match executor {
            O3_STUB => "O3 analysis: Step executed with advanced reasoning simulation.".to_string(),
            _ => "GPT stub generated this generic response.".to_string(),
        }
    }
}

/// The claim a claim template starts from: the latest dependency output,
/// else the `paragraph` input.
fn base_claim(step: &StepView, prefer_dependency: bool) -> Option<String> {
    let dependency = step.dependency_outputs.last().map(|(_, out)| out.clone());
    let paragraph = step.inputs.get("paragraph").and_then(|p| p.as_str()).map(str::to_string);
    if prefer_dependency {
        dependency.or(paragraph)
    } else {
        paragraph.or(dependency)
    }
}

/// The first figure stated by any attached evidence sentence.
fn evidence_figure(step: &StepView) -> Option<f64> {
    step.evidence
        .iter()
        .flat_map(|e| split_sentences(&e.content))
        .find_map(|s| first_percentage(&s))
}

/// Apply revision constraints the stub understands to `claim`.
fn honor_constraints(claim: String, step: &StepView) -> String {
    let restate = step.constraints.iter().any(|c| c.contains("evidence figure"));
    if !restate {
        return claim;
    }
    match evidence_figure(step) {
        Some(figure) => figure_pattern()
            .replace(&claim, |caps: &regex::Captures<'_>| format!("{figure}{}", &caps[1]))
            .into_owned(),
        None => claim,
    }
}

fn render(executor: &str, request: &ModelRequest) -> String {
    let step = &request.step;
    match request.template.template_id.as_str() {
        templates::FORMULA_SELECT => "Use the standard amortized loan payment formula.".to_string(),
        templates::EXPLAIN_PAYMENT => match step.dependency_outputs.last() {
            Some((_, payment)) => format!("The monthly payment is {payment}."),
            None => StubModelAdapter::generic(executor),
        },
        templates::CLAIM_EXTRACT | templates::CLAIM_CHECK => {
            let prefer_dependency = request.template.template_id == templates::CLAIM_CHECK;
            match base_claim(step, prefer_dependency) {
                Some(claim) => honor_constraints(claim, step),
                None => StubModelAdapter::generic(executor),
            }
        }
        _ => StubModelAdapter::generic(executor),
    }
}

#[async_trait]
impl ModelAdapter for StubModelAdapter {
    async fn invoke(&self, request: &ModelRequest) -> RokResult<ModelResponse> {
        let executor = request.executor.as_str();
        if !matches!(executor, GPT_STUB | O3_STUB) {
            return Err(RokError::ExecutorFailure {
                executor: executor.to_string(),
                reason: "unknown model executor".to_string(),
            });
        }
        if self.outages.contains(executor) {
            return Err(RokError::ExecutorFailure {
                executor: executor.to_string(),
                reason: "model endpoint unavailable".to_string(),
            });
        }
        let text = render(executor, request);
        debug!(
            executor,
            template = %request.template.template_id,
            step_id = %request.step.step_id,
            "stub model rendered"
        );
        Ok(ModelResponse {
            text,
            metadata: json!({
                "model": executor,
                "template_version": request.template.version,
                "cost": Self::cost(executor),
            }),
        })
    }
}

// ── Model verifier ───────────────────────────────────────────────────────────

/// A stand-in for a second model judging an output.
///
/// An output that restates every dependency result is SUPPORTED; one that
/// drops a dependency result is WEAK.
#[derive(Debug, Clone, Default)]
pub struct StubModelVerifier;

#[async_trait]
impl StepVerifier for StubModelVerifier {
    async fn judge(&self, step: &StepView) -> RokResult<Judgement> {
        let Some(output) = step.output.as_deref().filter(|o| !o.trim().is_empty()) else {
            return Ok(Judgement::new(VerificationStatus::Unknown, 0.0).with_issue("nothing to judge"));
        };
        let missing: Vec<String> = step
            .dependency_outputs
            .iter()
            .filter(|(_, dep)| !output.contains(dep.trim()))
            .map(|(id, _)| id.to_string())
            .collect();
        let judgement = if missing.is_empty() {
            Judgement::new(VerificationStatus::Supported, 0.9)
        } else {
            Judgement::new(VerificationStatus::Weak, 0.4)
                .with_issue(format!("output does not restate the result of {}", missing.join(", ")))
        };
        Ok(judgement.checking(step.evidence_ids()))
    }
}
