//! In-memory implementation of `AuditSink`.
//!
//! `InMemoryAuditSink` keeps every chained entry in a `Vec` behind a
//! `Mutex`, so the kernel's concurrent step workers can emit through one
//! shared sink.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::info;

use rok_contracts::{
    audit::LogEvent,
    error::{RokError, RokResult},
};
use rok_core::traits::AuditSink;

use crate::{
    chain::{link, verify_chain},
    event::{ChainedEvent, SealedLog},
};

// ── Internal mutable state ────────────────────────────────────────────────────

pub(crate) struct ChainState {
    pub(crate) events: Vec<ChainedEvent>,
    /// The `this_hash` of the last entry, or `GENESIS_HASH` before any.
    pub(crate) last_hash: String,
}

impl ChainState {
    pub(crate) fn new() -> Self {
        Self {
            events: Vec::new(),
            last_hash: ChainedEvent::GENESIS_HASH.to_string(),
        }
    }

    pub(crate) fn append(&mut self, chain_id: &str, event: &LogEvent) -> ChainedEvent {
        let entry = link(chain_id, self.events.len() as u64, event, &self.last_hash);
        self.last_hash = entry.this_hash.clone();
        self.events.push(entry.clone());
        entry
    }
}

// ── Public sink ───────────────────────────────────────────────────────────────

/// An in-memory, append-only audit sink backed by a SHA-256 hash chain.
#[derive(Clone)]
pub struct InMemoryAuditSink {
    chain_id: String,
    pub(crate) state: Arc<Mutex<ChainState>>,
}

impl InMemoryAuditSink {
    pub fn new(chain_id: impl Into<String>) -> Self {
        Self {
            chain_id: chain_id.into(),
            state: Arc::new(Mutex::new(ChainState::new())),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.events.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Export a sealed log of every entry so far.
    pub fn export_log(&self) -> RokResult<SealedLog> {
        let state = lock(&self.state)?;
        Ok(SealedLog {
            chain_id: self.chain_id.clone(),
            events: state.events.clone(),
            sealed_at: Utc::now(),
            terminal_hash: state.events.last().map(|e| e.this_hash.clone()).unwrap_or_default(),
        })
    }

    /// Verify that the in-memory chain has not been tampered with.
    pub fn verify_integrity(&self) -> bool {
        self.state.lock().map(|s| verify_chain(&s.events)).unwrap_or(false)
    }
}

fn lock(state: &Mutex<ChainState>) -> RokResult<std::sync::MutexGuard<'_, ChainState>> {
    state.lock().map_err(|e| RokError::AuditWriteFailed {
        reason: format!("audit state lock poisoned: {e}"),
    })
}

// ── AuditSink impl ────────────────────────────────────────────────────────────

impl AuditSink for InMemoryAuditSink {
    fn emit(&self, event: &LogEvent) -> RokResult<()> {
        lock(&self.state)?.append(&self.chain_id, event);
        Ok(())
    }

    fn flush(&self) -> RokResult<()> {
        let state = lock(&self.state)?;
        info!(
            chain_id = %self.chain_id,
            event_count = state.events.len(),
            terminal_hash = %state.last_hash,
            "audit chain flushed"
        );
        Ok(())
    }
}
