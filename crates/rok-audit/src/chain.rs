//! Hash-chain primitives: hashing, chaining, and integrity verification.
//!
//! Hash input layout (bytes, in order):
//!   1. chain_id as UTF-8 bytes
//!   2. position as 8-byte little-endian
//!   3. prev_hash as UTF-8 bytes (64 ASCII hex chars)
//!   4. canonical JSON of the event (serde_json, no pretty-printing)

use sha2::{Digest, Sha256};

use rok_contracts::audit::LogEvent;

use crate::event::ChainedEvent;

/// Compute the SHA-256 hash for one chain entry.
///
/// Returns a lowercase 64-character hex string.
///
/// # Panics
///
/// Panics if `event` cannot be serialized to JSON, which cannot happen for
/// a `LogEvent` whose payload is a `serde_json::Value`.
pub fn hash_event(chain_id: &str, position: u64, event: &LogEvent, prev_hash: &str) -> String {
    let event_json = serde_json::to_vec(event).expect("LogEvent must always be serializable to JSON");

    let mut hasher = Sha256::new();
    hasher.update(chain_id.as_bytes());
    hasher.update(position.to_le_bytes());
    hasher.update(prev_hash.as_bytes());
    hasher.update(&event_json);

    hex::encode(hasher.finalize())
}

/// Append `event` after `prev_hash` at `position`.
pub fn link(chain_id: &str, position: u64, event: &LogEvent, prev_hash: &str) -> ChainedEvent {
    ChainedEvent {
        position,
        chain_id: chain_id.to_string(),
        event: event.clone(),
        prev_hash: prev_hash.to_string(),
        this_hash: hash_event(chain_id, position, event, prev_hash),
    }
}

/// Chain a whole event stream, e.g. the audit section of a stored run
/// document.
pub fn chain_events(chain_id: &str, events: &[LogEvent]) -> Vec<ChainedEvent> {
    let mut prev = ChainedEvent::GENESIS_HASH.to_string();
    events
        .iter()
        .enumerate()
        .map(|(i, event)| {
            let entry = link(chain_id, i as u64, event, &prev);
            prev = entry.this_hash.clone();
            entry
        })
        .collect()
}

/// Verify the integrity of a hash chain.
///
/// Valid when every entry's `prev_hash` equals the previous entry's
/// `this_hash` (or `GENESIS_HASH` first), positions run 0, 1, 2, … and every
/// `this_hash` matches the recomputed value. An empty chain is valid.
pub fn verify_chain(events: &[ChainedEvent]) -> bool {
    first_break(events).is_none()
}

/// Position of the first entry that breaks the chain, if any.
pub fn first_break(events: &[ChainedEvent]) -> Option<u64> {
    let mut expected_prev = ChainedEvent::GENESIS_HASH.to_string();

    for (i, entry) in events.iter().enumerate() {
        if entry.position != i as u64 || entry.prev_hash != expected_prev {
            return Some(i as u64);
        }
        let recomputed = hash_event(&entry.chain_id, entry.position, &entry.event, &entry.prev_hash);
        if entry.this_hash != recomputed {
            return Some(i as u64);
        }
        expected_prev = entry.this_hash.clone();
    }

    None
}
