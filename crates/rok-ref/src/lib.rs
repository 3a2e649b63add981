//! # rok-ref
//!
//! Reference runtime for the reasoning orchestration kernel.
//!
//! Wires the real kernel, policy gate, verifiers, and audit sinks to
//! deterministic stand-ins and runs four scenarios over mock data:
//!
//! 1. **Claim Verification**: a research claim is extracted from a paragraph
//!    and checked against a source paper. Seeding memory with a conflicting
//!    prior fact turns the same run into a clarification request.
//! 2. **Self Correction**: an overstated figure is contradicted by the
//!    evidence, restated under a revision constraint, and then finalized.
//! 3. **Revision Exhaustion**: under the strict research policy a partially
//!    supported claim is retried until the per-step ceiling forces an
//!    uncertainty escalation.
//! 4. **Loan Payment**: model, tool, and model steps chained through policy
//!    routing and a hybrid verifier.
//!
//! All data is hardcoded and fictional. No external calls are made.

pub mod adapters;
pub mod mock_data;
pub mod retriever;
pub mod scenarios;
pub mod tools;
