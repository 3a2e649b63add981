//! Scenario: self correction.
//!
//! The claim-verification plan run over a paragraph that overstates the
//! paper's figure (20 percent against 14.8). S1's first output is
//! CONTRADICTED by the evidence; the `restate-contradicted` rule re-executes
//! it with a constraint to use the evidence figure, the restated claim
//! verifies, and S2 checks the corrected claim. The run finalizes with one
//! revision on record.

use rok_contracts::{error::RokResult, task::TaskRequest};

use super::{
    claim_verification::claim_request, execute, memory_store, policy_gate, ScenarioOptions,
    ScenarioRun, RESEARCH_POLICY,
};
use crate::{adapters::StubModelAdapter, mock_data::OVERSTATED_PARAGRAPH};

pub const NAME: &str = "self-correction";

pub fn request() -> TaskRequest {
    claim_request(OVERSTATED_PARAGRAPH, "research")
}

pub async fn run(options: &ScenarioOptions) -> RokResult<ScenarioRun> {
    let gate = policy_gate(options, RESEARCH_POLICY)?;
    let memory = memory_store(options, Vec::new())?;
    execute(NAME, request(), options, gate, StubModelAdapter::new(), memory).await
}
