//! # rok-core
//!
//! The reasoning orchestration kernel: deterministic control flow around
//! non-deterministic collaborators.
//!
//! This crate provides:
//! - The collaborator traits (`ModelAdapter`, `ToolInterface`, `EvidenceSource`,
//!   `StepVerifier`, `PolicyGate`, `AuditSink`, `MemoryStore`)
//! - The `Kernel` that drives a task from intake to a final conclusion,
//!   a clarification request, or a failure
//! - Replay and diff over stored run documents
//!
//! ## Usage
//!
//! ```rust,ignore
//! use rok_core::{Kernel, Executors, Verifiers};
//!
//! let kernel = Kernel::new(gate, executors, verifiers).with_memory(memory);
//! let doc = kernel.run(request, CancellationToken::new()).await;
//! ```

pub mod binder;
pub mod consistency;
pub mod context;
pub mod coordinator;
pub mod diff;
pub mod dispatcher;
pub mod finalizer;
pub mod intake;
pub mod kernel;
pub mod ledger;
pub mod memory;
pub mod pipeline;
pub mod replay;
pub mod revision;
pub mod scheduler;
pub mod store;
pub mod text;
pub mod trail;
pub mod traits;

pub use coordinator::Verifiers;
pub use diff::{diff_runs, RunDiff};
pub use dispatcher::Executors;
pub use kernel::{Kernel, RunOptions};
pub use memory::{InMemoryMemoryStore, JsonFileMemoryStore};
pub use replay::replay_request;
