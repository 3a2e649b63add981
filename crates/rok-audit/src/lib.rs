//! # rok-audit
//!
//! Append-only, SHA-256 hash-chained audit sinks for the reasoning
//! orchestration kernel.
//!
//! ## Overview
//!
//! The kernel appends every event to the run document and then hands it to
//! an [`AuditSink`](rok_core::traits::AuditSink). The sinks here wrap each
//! event in a `ChainedEvent` linked to the previous one by its SHA-256
//! hash. Tampering with any entry, even a single byte, breaks the chain and
//! is detected by `verify_chain`.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use rok_audit::InMemoryAuditSink;
//!
//! let sink = Arc::new(InMemoryAuditSink::new("demo"));
//! let kernel = Kernel::new(gate, executors, verifiers).with_audit_sink(sink.clone());
//! kernel.run(request, CancellationToken::new()).await;
//! assert!(sink.verify_integrity());
//! ```

pub mod chain;
pub mod event;
pub mod jsonl;
pub mod memory;

pub use chain::{chain_events, first_break, hash_event, verify_chain};
pub use event::{ChainedEvent, SealedLog};
pub use jsonl::{read_chain, JsonLinesAuditSink};
pub use memory::InMemoryAuditSink;

// ── Tests ─────────────────────────────────────────────────────────────────────
