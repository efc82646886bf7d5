//! Engine error taxonomy.
//!
//! `NoEligibleProviders` and offer timeouts are not errors: they drive the session state
//! machine and surface as [`crate::events::EngineEvent`]s.

use crate::types::{SessionId, SessionState};
use thiserror::Error;

/// Why a bid was refused. Serialized in snake_case on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BidRejection {
    WindowClosed,
    Ineligible,
    DuplicateActive,
}

impl std::fmt::Display for BidRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            BidRejection::WindowClosed => "window_closed",
            BidRejection::Ineligible => "ineligible",
            BidRejection::DuplicateActive => "duplicate_active",
        })
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Malformed request, bid or configuration. Not retried.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("bid rejected: {0}")]
    BidRejected(BidRejection),

    #[error("session {0} not found")]
    SessionNotFound(SessionId),

    #[error("operation {operation} not allowed in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("re-broadcast cap exceeded after {attempts} attempts")]
    ReBroadcastCapExceeded { attempts: u32 },

    /// Confirmation refused by capacity accounting; the offer moves to the next bid.
    #[error("{0}")]
    CapacityExceeded(String),

    /// Two mutations raced on one session; the later one is replayed.
    #[error("concurrency conflict on session {session}: {reason}")]
    ConcurrencyConflict { session: SessionId, reason: String },

    #[error("external collaborator unavailable: {0}")]
    CollaboratorUnavailable(String),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub(crate) fn invalid_state(operation: &'static str, state: SessionState) -> Self {
        EngineError::InvalidState { operation, state }
    }
}
