//! Scenario: claim verification.
//!
//! Two steps over the mock paper:
//!
//!   1. S1 extracts the claim from the paragraph (`claim_extract`).
//!   2. S2 checks the extracted claim against the paper (`claim_check`).
//!      The research policy marks S2 evidence-required.
//!
//! The paper scopes its figure to the indoor setting, so both steps verify
//! as PARTIALLY_SUPPORTED at 0.78, which the `research` domain accepts.
//! Seeded with a conflicting prior fact, the consistency checker flags the
//! claim against memory and the run ends in a clarification request.

use rok_contracts::{
    error::RokResult,
    step::{ExecutorSpec, PromptTemplateRef, StepPlan},
    task::TaskRequest,
};

use super::{execute, memory_store, policy_gate, ScenarioOptions, ScenarioRun, RESEARCH_POLICY};
use crate::{
    adapters::{templates, StubModelAdapter, GPT_STUB},
    mock_data::{paper, prior_memory, ACCURATE_PARAGRAPH},
};

pub const NAME: &str = "claim-verification";

pub const OBJECTIVE: &str = "Verify the accuracy claim in the paragraph against the paper";

/// The extract-then-check plan for `paragraph` under `domain`.
pub fn claim_request(paragraph: &str, domain: &str) -> TaskRequest {
    TaskRequest::new(OBJECTIVE, domain)
        .with_source(paper())
        .with_inputs(serde_json::json!({ "paragraph": paragraph }))
        .with_step(
            StepPlan::new(
                "Extract the claim",
                ExecutorSpec::model(GPT_STUB, PromptTemplateRef::new(templates::CLAIM_EXTRACT, "1")),
            )
            .with_id("S1"),
        )
        .with_step(
            StepPlan::new(
                "Check the claim against the paper",
                ExecutorSpec::model(GPT_STUB, PromptTemplateRef::new(templates::CLAIM_CHECK, "1")),
            )
            .with_id("S2")
            .depends_on(&["S1"]),
        )
}

pub fn request() -> TaskRequest {
    claim_request(ACCURATE_PARAGRAPH, "research")
}

pub async fn run(options: &ScenarioOptions) -> RokResult<ScenarioRun> {
    let gate = policy_gate(options, RESEARCH_POLICY)?;
    let memory = memory_store(options, Vec::new())?;
    execute(NAME, request(), options, gate, StubModelAdapter::new(), memory).await
}

/// Same task with memory seeded by a fact that disagrees with the paper.
pub async fn run_against_prior_memory(options: &ScenarioOptions) -> RokResult<ScenarioRun> {
    let gate = policy_gate(options, RESEARCH_POLICY)?;
    let memory = memory_store(options, prior_memory()?)?;
    execute(NAME, request(), options, gate, StubModelAdapter::new(), memory).await
}
