//! Contradictions, the final conclusion, and memory writes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::{RokError, RokResult},
    evidence::check_unit_interval,
    ids::{ContradictionId, MemoryId, RunId, StepId},
    verify::VerifierSpec,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// A detected conflict between steps, sources, or persistent memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contradiction {
    pub contradiction_id: ContradictionId,
    pub step_ids: Vec<StepId>,
    pub description: String,
    pub severity: Severity,
    pub detected_by: VerifierSpec,
    pub detected_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior_memory_id: Option<MemoryId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
}

impl Contradiction {
    pub fn new(
        step_ids: Vec<StepId>,
        description: impl Into<String>,
        severity: Severity,
        detected_by: VerifierSpec,
    ) -> RokResult<Self> {
        if step_ids.is_empty() {
            return Err(RokError::validation(
                "a contradiction must implicate at least one step",
            ));
        }
        Ok(Self {
            contradiction_id: ContradictionId::new(),
            step_ids,
            description: description.into(),
            severity,
            detected_by,
            detected_at: Utc::now(),
            prior_memory_id: None,
            source_id: None,
        })
    }

    pub fn with_memory(mut self, memory_id: MemoryId) -> Self {
        self.prior_memory_id = Some(memory_id);
        self
    }

    pub fn with_source(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalConclusion {
    pub content: String,
    pub confidence: f64,
    pub supported_step_ids: Vec<StepId>,
    #[serde(default)]
    pub unresolved_contradiction_ids: Vec<ContradictionId>,
    pub finalized_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemoryType {
    Fact,
    Observation,
}

/// An item persisted across runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryWrite {
    pub memory_id: MemoryId,
    pub memory_type: MemoryType,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_step_id: Option<StepId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

impl MemoryWrite {
    pub fn fact(content: impl Into<String>, confidence: f64) -> RokResult<Self> {
        check_unit_interval("confidence", confidence)?;
        Ok(Self {
            memory_id: MemoryId::new(),
            memory_type: MemoryType::Fact,
            content: content.into(),
            source_step_id: None,
            run_id: None,
            confidence,
            created_at: Utc::now(),
        })
    }

    pub fn from_step(mut self, step_id: StepId, run_id: RunId) -> Self {
        self.source_step_id = Some(step_id);
        self.run_id = Some(run_id);
        self
    }
}
