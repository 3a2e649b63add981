//! Evidence entries and their source references.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::{RokError, RokResult},
    ids::EvidenceId,
};

/// Where a piece of evidence came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceType {
    Document,
    Tool,
    Memory,
    Web,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub source_type: SourceType,
    pub source_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

/// A sourced snippet or tool output. Immutable once created.
///
/// Verifications and final conclusions reference evidence by id; entries are
/// never copied between steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub evidence_id: EvidenceId,
    pub source: SourceRef,
    /// Snippet text, or the rendered output of a tool call.
    pub content: String,
    /// Structured tool output, when there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Relevance to the step, in `[0, 1]`.
    pub relevance: f64,
    pub extracted_at: DateTime<Utc>,
}

impl Evidence {
    /// Build an evidence entry, rejecting relevance scores outside `[0, 1]`.
    pub fn new(
        source: SourceRef,
        content: impl Into<String>,
        relevance: f64,
    ) -> RokResult<Self> {
        check_unit_interval("relevance", relevance)?;
        Ok(Self {
            evidence_id: EvidenceId::new(),
            source,
            content: content.into(),
            data: None,
            relevance,
            extracted_at: Utc::now(),
        })
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_id(mut self, id: EvidenceId) -> Self {
        self.evidence_id = id;
        self
    }
}

/// Reject scores that are NaN or fall outside `[0, 1]`.
pub fn check_unit_interval(field: &str, value: f64) -> RokResult<()> {
    if value.is_nan() || !(0.0..=1.0).contains(&value) {
        return Err(RokError::validation(format!(
            "{field} must be within [0, 1], got {value}"
        )));
    }
    Ok(())
}
