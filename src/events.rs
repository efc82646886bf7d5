//! Outbound engine events.
//!
//! Sessions queue these as they transition; the session manager fans them out to
//! subscribers (requester UI / auto-accept policy, provider notifications, billing).

use crate::eligibility::Relaxation;
use crate::error::BidRejection;
use crate::scoring::RankedBid;
use crate::types::{BidId, Outcome, ProviderId, SessionId};

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Ranking for the current round is available.
    CandidatesReady {
        session_id: SessionId,
        ranked: Vec<RankedBid>,
    },
    /// A provider has until `deadline` (UTC ms) to confirm.
    OfferExtended {
        session_id: SessionId,
        provider_id: ProviderId,
        bid_id: BidId,
        rank: usize,
        deadline: u64,
    },
    /// An outstanding offer lapsed or was withdrawn before confirmation.
    OfferWithdrawn {
        session_id: SessionId,
        provider_id: ProviderId,
        bid_id: BidId,
        reason: String,
    },
    /// A bid was refused; the provider is told why.
    BidRejected {
        session_id: SessionId,
        provider_id: ProviderId,
        reason: BidRejection,
    },
    NoEligibleProviders {
        session_id: SessionId,
        attempt: u32,
    },
    Rebroadcast {
        session_id: SessionId,
        attempt: u32,
        relaxation: Relaxation,
        candidates: usize,
    },
    SessionTerminal {
        session_id: SessionId,
        outcome: Outcome,
        /// Number of re-broadcasts performed.
        attempts: u32,
        relaxation: Relaxation,
        winner: Option<ProviderId>,
        cause: Option<String>,
    },
    /// A matched session was replaced by a derived session for the remaining work.
    Superseded {
        session_id: SessionId,
        derived_session_id: SessionId,
    },
}

impl EngineEvent {
    pub fn session_id(&self) -> SessionId {
        match self {
            EngineEvent::CandidatesReady { session_id, .. }
            | EngineEvent::OfferExtended { session_id, .. }
            | EngineEvent::OfferWithdrawn { session_id, .. }
            | EngineEvent::BidRejected { session_id, .. }
            | EngineEvent::NoEligibleProviders { session_id, .. }
            | EngineEvent::Rebroadcast { session_id, .. }
            | EngineEvent::SessionTerminal { session_id, .. }
            | EngineEvent::Superseded { session_id, .. } => *session_id,
        }
    }

    /// Short name used in logs and audit records.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::CandidatesReady { .. } => "candidates_ready",
            EngineEvent::OfferExtended { .. } => "offer_extended",
            EngineEvent::OfferWithdrawn { .. } => "offer_withdrawn",
            EngineEvent::BidRejected { .. } => "bid_rejected",
            EngineEvent::NoEligibleProviders { .. } => "no_eligible_providers",
            EngineEvent::Rebroadcast { .. } => "rebroadcast",
            EngineEvent::SessionTerminal { .. } => "session_terminal",
            EngineEvent::Superseded { .. } => "superseded",
        }
    }
}
