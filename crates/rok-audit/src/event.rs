//! Chained audit entries and sealed logs.
//!
//! `ChainedEvent` wraps one kernel `LogEvent` with its position in the sink's
//! chain and the SHA-256 hashes that make tampering detectable. A sink may
//! receive events from many runs, so `position` is the chain's own counter
//! and never the event's per-run `sequence`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use rok_contracts::audit::LogEvent;

/// A single entry in the SHA-256 hash chain of one sink.
///
/// Modifying any field, including the embedded event's payload, invalidates
/// `this_hash` and every later `prev_hash`, which `verify_chain` detects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainedEvent {
    /// Monotonically increasing position in the chain, starting at 0.
    pub position: u64,

    /// The chain this entry belongs to.
    pub chain_id: String,

    /// The event exactly as the kernel recorded it.
    pub event: LogEvent,

    /// SHA-256 hash (hex) of the previous entry, or `GENESIS_HASH` for the
    /// first entry.
    pub prev_hash: String,

    /// SHA-256 hash (hex) over (chain_id, position, prev_hash, canonical
    /// JSON of event).
    pub this_hash: String,
}

impl ChainedEvent {
    /// The sentinel `prev_hash` of the first entry in every chain.
    pub const GENESIS_HASH: &'static str =
        "0000000000000000000000000000000000000000000000000000000000000000";
}

/// A sealed export of one chain.
///
/// `terminal_hash` is the `this_hash` of the last entry and commits to the
/// entire log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedLog {
    pub chain_id: String,
    pub events: Vec<ChainedEvent>,
    pub sealed_at: DateTime<Utc>,
    /// Empty string if the log is empty.
    pub terminal_hash: String,
}
