//! Structured audit trail for boundary actions.
//!
//! Every inbound operation (request submit, bid submit, select, confirm, decline, cancel,
//! failure report, job completion) emits one [`AuditEvent`]: who did what to which
//! session, and whether it was accepted. The per-session transition log in
//! [`crate::session::SessionRecord`] covers state changes; this trail covers the callers.

use serde::Serialize;

use crate::types::{now_millis, SessionId};

/// Single audit record: one line of JSON per event.
#[derive(Clone, Debug, Serialize)]
pub struct AuditEvent {
    /// UTC milliseconds.
    pub timestamp_ms: u64,
    /// Who performed the action (requester id, provider id, "operator", "api").
    pub actor: String,
    /// request_submit, bid_submit, offer_select, offer_confirm, offer_decline,
    /// session_close, session_cancel, failure_report, job_completed.
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
    /// accepted, rejected, error.
    pub outcome: String,
}

impl AuditEvent {
    pub fn now(
        actor: impl Into<String>,
        action: impl Into<String>,
        session_id: Option<SessionId>,
        detail: Option<serde_json::Value>,
        outcome: impl Into<String>,
    ) -> Self {
        Self {
            timestamp_ms: now_millis(),
            actor: actor.into(),
            action: action.into(),
            session_id,
            detail,
            outcome: outcome.into(),
        }
    }

    /// Outcome label for an operation result.
    pub fn outcome_of<T, E: std::fmt::Display>(result: &Result<T, E>) -> String {
        match result {
            Ok(_) => "accepted".into(),
            Err(e) => format!("rejected: {e}"),
        }
    }
}

/// Sink for audit events. Implementations write to stdout, file, or in-memory (tests).
pub trait AuditSink: Send + Sync {
    fn emit(&self, event: &AuditEvent);
}

/// Writes one JSON line per event to stdout.
pub struct StdoutAuditSink;

impl AuditSink for StdoutAuditSink {
    fn emit(&self, event: &AuditEvent) {
        if let Ok(line) = serde_json::to_string(event) {
            println!("{}", line);
        }
    }
}

/// Discards events.
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn emit(&self, _event: &AuditEvent) {}
}

/// In-memory sink that stores events for tests. Clone shares the same backing buffer.
#[derive(Clone, Default)]
pub struct InMemoryAuditSink {
    events: std::sync::Arc<std::sync::Mutex<Vec<AuditEvent>>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn actions(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.action).collect()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn emit(&self, event: &AuditEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}
