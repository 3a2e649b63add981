//! Structural validation of RSL run documents.
//!
//! The JSON Schema ships inside the crate so a stored document can be
//! checked without the kernel that produced it.

use std::path::Path;

use tracing::warn;

use rok_contracts::{
    document::RunDocument,
    error::{RokError, RokResult},
};

/// The RSL run-document schema (JSON Schema draft 2020-12).
pub const RSL_SCHEMA: &str = include_str!("../schema/rsl.schema.json");

fn schema_error(reason: impl Into<String>) -> RokError {
    RokError::SchemaValidation {
        reason: reason.into(),
    }
}

/// Every schema violation in `document`, formatted as `path: message`.
pub fn schema_violations(document: &serde_json::Value) -> RokResult<Vec<String>> {
    let schema: serde_json::Value = serde_json::from_str(RSL_SCHEMA)
        .map_err(|e| schema_error(format!("embedded RSL schema is not JSON: {e}")))?;
    let validator = jsonschema::validator_for(&schema)
        .map_err(|e| schema_error(format!("invalid JSON Schema document: {e}")))?;
    Ok(validator
        .iter_errors(document)
        .map(|error| {
            let path = error.instance_path.to_string();
            let path = if path.is_empty() { "/".to_string() } else { path };
            format!("{path}: {error}")
        })
        .collect())
}

/// Validate `document` against the RSL schema.
///
/// Returns `RokError::SchemaValidation` listing every violation.
pub fn validate_document(document: &serde_json::Value) -> RokResult<()> {
    let violations = schema_violations(document)?;
    if violations.is_empty() {
        return Ok(());
    }
    for violation in &violations {
        warn!(%violation, "RSL schema violation");
    }
    Err(schema_error(violations.join("; ")))
}

/// Read, schema-check, and parse the run document at `path`.
pub fn load_document(path: &Path) -> RokResult<RunDocument> {
    let text = std::fs::read_to_string(path).map_err(|e| RokError::Storage {
        reason: format!("failed to read run document '{}': {e}", path.display()),
    })?;
    let value: serde_json::Value = serde_json::from_str(&text)
        .map_err(|e| schema_error(format!("'{}' is not JSON: {e}", path.display())))?;
    validate_document(&value)?;
    RunDocument::from_json(&text)
}
