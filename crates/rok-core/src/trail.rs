//! Kernel-side audit trail.
//!
//! Events are appended to the run document first and handed to the
//! external sink second, so a failing sink can never lose an event.

use std::sync::Arc;

use tracing::warn;

use rok_contracts::audit::{AuditEventType, LogEvent};

use crate::{store::RunStore, traits::AuditSink};

#[derive(Clone)]
pub struct AuditTrail {
    store: RunStore,
    sink: Option<Arc<dyn AuditSink>>,
}

impl AuditTrail {
    pub fn new(store: RunStore, sink: Option<Arc<dyn AuditSink>>) -> Self {
        Self { store, sink }
    }

    /// Record one event and forward it to the sink.
    pub fn record(&self, event_type: AuditEventType, payload: serde_json::Value) -> LogEvent {
        let event = self
            .store
            .write(|doc| doc.append_event(event_type, payload));
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.emit(&event) {
                warn!(
                    sequence = event.sequence,
                    event_type = ?event.event_type,
                    error = %e,
                    "audit sink rejected event; kept in run document"
                );
            }
        }
        event
    }

    pub fn flush(&self) {
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.flush() {
                warn!(error = %e, "audit sink flush failed");
            }
        }
    }
}
