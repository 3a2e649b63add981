//! Fixed inputs for the reference scenarios.
//!
//! Everything here is fictional. The paper stands in for a retrieved source
//! document; the prior fact stands in for memory left behind by an earlier,
//! conflicting run.

use rok_contracts::{
    conclusion::MemoryWrite,
    error::RokResult,
    task::SourceDocument,
};

// ── Research ─────────────────────────────────────────────────────────────────

pub const PAPER_ID: &str = "paper-model-x";
pub const PAPER_URI: &str = "mock://papers/model-x-dataset-y";

/// The mock paper. Only the second sentence states a figure, and it scopes
/// the figure to the indoor setting.
pub const PAPER_TEXT: &str = "We evaluate Model X on Dataset Y. \
Model X improves accuracy by 14.8 percent on Dataset Y in the indoor setting. \
Training took 12 hours on four GPUs. \
Results on outdoor scenes were not evaluated.";

/// A paragraph whose claim matches the paper's figure.
pub const ACCURATE_PARAGRAPH: &str = "Model X improves accuracy by 14.8 percent on Dataset Y.";

/// A paragraph that overstates the paper's figure.
pub const OVERSTATED_PARAGRAPH: &str = "Model X improves accuracy by 20 percent on Dataset Y.";

/// A fact from an earlier run that disagrees with the paper.
pub const PRIOR_FACT: &str = "Model X improves accuracy by 9.1 percent on Dataset Y.";

pub fn paper() -> SourceDocument {
    SourceDocument {
        uri: Some(PAPER_URI.to_string()),
        ..SourceDocument::new(PAPER_ID, PAPER_TEXT)
    }
}

/// Memory seeded with [`PRIOR_FACT`].
pub fn prior_memory() -> RokResult<Vec<MemoryWrite>> {
    Ok(vec![MemoryWrite::fact(PRIOR_FACT, 0.9)?])
}

// ── Finance ──────────────────────────────────────────────────────────────────

pub const LOAN_OBJECTIVE: &str =
    "What is the monthly payment for a 10000 dollar loan at 5 percent annual interest for 3 years?";

/// Loan terms as the calculator reads them.
pub fn loan_inputs() -> serde_json::Value {
    serde_json::json!({
        "principal": 10000,
        "annual_rate": 0.05,
        "months": 36,
    })
}
