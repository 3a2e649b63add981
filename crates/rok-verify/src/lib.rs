//! # rok-verify
//!
//! Verification for the reasoning orchestration kernel.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - [`engine::RuleVerifier`], the deterministic
//!   [`StepVerifier`](rok_core::traits::StepVerifier): presence checks,
//!   optional JSON Schema validation of the output, and claim support
//!   against attached evidence.
//! - [`schema`], the embedded RSL run-document schema and
//!   [`validate_document`].
//! - [`invariants`], which re-checks a stored document against the rules the
//!   kernel enforces while a run is live.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use rok_verify::{validate_document, invariants, RuleVerifier};
//!
//! let verifiers = Verifiers { rule: Arc::new(RuleVerifier::new()), model: None };
//!
//! let doc = kernel.run(request, cancel).await;
//! validate_document(&doc.to_value()?)?;
//! invariants::enforce(&doc)?;
//! ```

pub mod claim;
pub mod engine;
pub mod invariants;
pub mod schema;

pub use engine::RuleVerifier;
pub use invariants::Violation;
pub use schema::{load_document, validate_document, RSL_SCHEMA};

// ── Tests ─────────────────────────────────────────────────────────────────────
