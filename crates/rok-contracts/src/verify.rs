//! Verification records and verifier specifications.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::RokResult,
    evidence::check_unit_interval,
    ids::{EvidenceId, RevisionId},
};

/// The judged support level of a step's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationStatus {
    Supported,
    PartiallySupported,
    Weak,
    Contradicted,
    Unknown,
}

impl VerificationStatus {
    /// SUPPORTED and PARTIALLY_SUPPORTED are the only statuses that can
    /// carry a step to VERIFIED.
    pub fn is_supportive(self) -> bool {
        matches!(
            self,
            VerificationStatus::Supported | VerificationStatus::PartiallySupported
        )
    }

    /// Ordering used when two verifiers must be merged: lower is weaker.
    pub fn strength(self) -> u8 {
        match self {
            VerificationStatus::Contradicted => 0,
            VerificationStatus::Unknown => 1,
            VerificationStatus::Weak => 2,
            VerificationStatus::PartiallySupported => 3,
            VerificationStatus::Supported => 4,
        }
    }
}

/// How a verifier reaches its judgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerifierKind {
    /// Deterministic checks (schema, evidence presence, claim support).
    Rule,
    /// A second model call judging support.
    Model,
    /// Both; RULE wins on disagreement.
    Hybrid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifierSpec {
    pub kind: VerifierKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub config: serde_json::Value,
}

impl VerifierSpec {
    pub fn rule(name: impl Into<String>) -> Self {
        Self {
            kind: VerifierKind::Rule,
            name: name.into(),
            config: serde_json::Value::Null,
        }
    }

    pub fn model(name: impl Into<String>) -> Self {
        Self {
            kind: VerifierKind::Model,
            name: name.into(),
            config: serde_json::Value::Null,
        }
    }

    pub fn hybrid(name: impl Into<String>) -> Self {
        Self {
            kind: VerifierKind::Hybrid,
            name: name.into(),
            config: serde_json::Value::Null,
        }
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }
}

impl Default for VerifierSpec {
    fn default() -> Self {
        Self::rule("rule_verifier")
    }
}

/// One judged assessment of a step's output. Prior verifications persist in
/// the step's history; the last one is current.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    pub status: VerificationStatus,
    pub confidence: f64,
    #[serde(default)]
    pub issues: Vec<String>,
    pub checked_evidence_ids: Vec<EvidenceId>,
    pub verifier: VerifierSpec,
    /// The revision whose re-entry produced this verification, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_id: Option<RevisionId>,
    pub verified_at: DateTime<Utc>,
}

impl Verification {
    pub fn new(
        status: VerificationStatus,
        confidence: f64,
        issues: Vec<String>,
        checked_evidence_ids: Vec<EvidenceId>,
        verifier: VerifierSpec,
    ) -> RokResult<Self> {
        check_unit_interval("confidence", confidence)?;
        Ok(Self {
            status,
            confidence,
            issues,
            checked_evidence_ids,
            verifier,
            revision_id: None,
            verified_at: Utc::now(),
        })
    }

    /// An UNKNOWN, zero-confidence verification recorded by the kernel when
    /// no verifier judgement exists (executor failure, missing evidence).
    pub fn kernel_unknown(issue: impl Into<String>) -> Self {
        Self {
            status: VerificationStatus::Unknown,
            confidence: 0.0,
            issues: vec![issue.into()],
            checked_evidence_ids: Vec::new(),
            verifier: VerifierSpec::rule("kernel"),
            revision_id: None,
            verified_at: Utc::now(),
        }
    }

    pub fn with_revision(mut self, revision_id: Option<RevisionId>) -> Self {
        self.revision_id = revision_id;
        self
    }
}
