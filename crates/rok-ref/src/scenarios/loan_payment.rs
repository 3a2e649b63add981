//! Scenario: loan payment.
//!
//! A three-step chain through model, tool, and model executors:
//!
//!   1. S1 selects the formula (`gpt_stub`, `formula_select`).
//!   2. S2 computes the payment with the `calculator` tool. Its output is
//!      backed by the tool's own evidence record.
//!   3. S3 explains the result. Policy routes it to `o3_stub`, and a hybrid
//!      verifier checks it restates the S2 figure.
//!
//! The finance policy finalizes with the S3 sentence as the conclusion.

use rok_contracts::{
    error::RokResult,
    step::{ExecutorSpec, PromptTemplateRef, StepPlan},
    task::TaskRequest,
    verify::VerifierSpec,
};

use super::{execute, memory_store, policy_gate, ScenarioOptions, ScenarioRun, FINANCE_POLICY};
use crate::{
    adapters::{templates, StubModelAdapter, GPT_STUB},
    mock_data::{loan_inputs, LOAN_OBJECTIVE},
    tools::CALCULATOR,
};

pub const NAME: &str = "loan-payment";

pub fn request() -> TaskRequest {
    TaskRequest::new(LOAN_OBJECTIVE, "finance")
        .with_inputs(loan_inputs())
        .with_constraint("state the payment in dollars and cents")
        .with_step(
            StepPlan::new(
                "Select payment formula",
                ExecutorSpec::model(GPT_STUB, PromptTemplateRef::new(templates::FORMULA_SELECT, "1")),
            )
            .with_id("S1"),
        )
        .with_step(
            StepPlan::new("Compute monthly payment", ExecutorSpec::tool(CALCULATOR))
                .with_id("S2")
                .depends_on(&["S1"]),
        )
        .with_step(
            StepPlan::new(
                "Explain the payment",
                ExecutorSpec::model(GPT_STUB, PromptTemplateRef::new(templates::EXPLAIN_PAYMENT, "1")),
            )
            .with_id("S3")
            .depends_on(&["S2"])
            .with_verifier(VerifierSpec::hybrid("explanation_check")),
        )
}

pub async fn run(options: &ScenarioOptions) -> RokResult<ScenarioRun> {
    run_with_model(options, StubModelAdapter::new()).await
}

/// Run with a caller-supplied model adapter, e.g. one with an outage.
pub async fn run_with_model(options: &ScenarioOptions, model: StubModelAdapter) -> RokResult<ScenarioRun> {
    let gate = policy_gate(options, FINANCE_POLICY)?;
    let memory = memory_store(options, Vec::new())?;
    execute(NAME, request(), options, gate, model, memory).await
}
