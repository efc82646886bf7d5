//! Core types and IDs for the auction engine.
//!
//! Numeric identifiers are newtype wrappers. [`Request`], [`Bid`] and
//! [`ProviderProfile`] are the inputs the engine consumes; [`SessionState`] and
//! [`Outcome`] describe where a bid session is in its lifecycle.

use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::EngineError;
use crate::geo::{Location, ServiceArea};

/// Bid session identifier (allocated by the session manager).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Provider (carrier) identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct ProviderId(pub u64);

/// Bid identifier, chosen by the submitting provider.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct BidId(pub u64);

/// Requester (shipper) identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct RequesterId(pub u64);

/// Request identifier. Textual so derived requests can carry their lineage (`orig/r1`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct RequestId(pub String);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Priority tier of a request. Ordered: `Standard < Express < Emergency`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum PriorityTier {
    Standard,
    Express,
    Emergency,
}

impl PriorityTier {
    /// One level up; `Emergency` stays `Emergency`.
    pub fn escalate(self) -> Self {
        match self {
            PriorityTier::Standard => PriorityTier::Express,
            PriorityTier::Express | PriorityTier::Emergency => PriorityTier::Emergency,
        }
    }
}

/// How the winning bid is picked once ranking is available.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SelectionMode {
    /// Offer the top-ranked bid as soon as ranking completes.
    #[default]
    Auto,
    /// Wait for the requester to select; fall back to the top bid after the selection window.
    Manual,
}

/// Transport request (immutable once submitted).
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Request {
    pub request_id: RequestId,
    pub requester_id: RequesterId,
    pub origin: Location,
    pub destination: Location,
    #[serde(default)]
    pub required_tags: BTreeSet<String>,
    /// Capacity units the job occupies.
    pub size: Decimal,
    /// UTC milliseconds.
    pub earliest_start: u64,
    /// UTC milliseconds.
    pub latest_delivery: u64,
    pub declared_value: Decimal,
    pub priority: PriorityTier,
    #[serde(default)]
    pub selection: SelectionMode,
    /// Set on corrections and derived (reassignment) requests.
    #[serde(default)]
    pub supersedes: Option<RequestId>,
    /// Providers barred from bidding on this request.
    #[serde(default)]
    pub excluded_providers: BTreeSet<ProviderId>,
}

impl Request {
    /// Rejects malformed requests before a session is opened.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.request_id.0.trim().is_empty() {
            return Err(EngineError::Validation("request_id must not be empty".into()));
        }
        if self.size <= Decimal::ZERO {
            return Err(EngineError::Validation("request size must be positive".into()));
        }
        if self.latest_delivery <= self.earliest_start {
            return Err(EngineError::Validation(
                "latest_delivery must be after earliest_start".into(),
            ));
        }
        if self.declared_value < Decimal::ZERO {
            return Err(EngineError::Validation("declared_value must not be negative".into()));
        }
        if !self.origin.is_valid() || !self.destination.is_valid() {
            return Err(EngineError::Validation("coordinates out of range".into()));
        }
        Ok(())
    }

    /// Length of the requested delivery window in milliseconds.
    pub fn window_ms(&self) -> u64 {
        self.latest_delivery.saturating_sub(self.earliest_start)
    }
}

/// A provider's offer against one request.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Bid {
    pub bid_id: BidId,
    pub provider_id: ProviderId,
    pub price: Decimal,
    /// Promised pickup, UTC milliseconds.
    pub pickup_eta: u64,
    /// Promised delivery, UTC milliseconds.
    pub delivery_eta: u64,
    /// Provider-declared confidence in `[0, 1]`.
    pub confidence: f64,
    /// Submission time, UTC milliseconds. Stamped by the engine on receipt.
    #[serde(default)]
    pub submitted_at: u64,
}

impl Bid {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.price <= Decimal::ZERO {
            return Err(EngineError::Validation("bid price must be positive".into()));
        }
        if self.pickup_eta > self.delivery_eta {
            return Err(EngineError::Validation("pickup_eta must not be after delivery_eta".into()));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(EngineError::Validation("confidence must be within [0, 1]".into()));
        }
        Ok(())
    }

    /// [`Self::validate`] plus a horizon check: neither ETA may fall later than one request
    /// window past `latest_delivery`.
    pub fn validate_for(&self, request: &Request) -> Result<(), EngineError> {
        self.validate()?;
        let horizon = request.latest_delivery.saturating_add(request.window_ms());
        if self.delivery_eta > horizon {
            return Err(EngineError::Validation(format!(
                "delivery_eta {} is beyond the request horizon {}",
                self.delivery_eta, horizon
            )));
        }
        Ok(())
    }
}

/// Flag a requester attaches to a provider.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ProviderFlag {
    /// Flat +10% score boost (capped at 1.0).
    Preferred,
    /// Bids are excluded from ranking.
    Avoid,
    /// Not a candidate at all.
    Blacklisted,
}

/// Reputation and capability snapshot of one provider. Read-only to the engine.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ProviderProfile {
    pub provider_id: ProviderId,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Declared capacity in the same units as [`Request::size`].
    pub capacity: Decimal,
    pub service_area: ServiceArea,
    pub in_flight_jobs: u32,
    pub max_concurrent_jobs: u32,
    /// Historical on-time rate in `[0, 1]`.
    pub on_time_rate: f64,
    /// Historical cancellation rate in `[0, 1]`.
    pub cancellation_rate: f64,
    pub completed_jobs: u32,
    /// Completed jobs per capability tag. Empty when the provider has no per-category history.
    #[serde(default)]
    pub completed_by_tag: BTreeMap<String, u32>,
    /// Equipment/asset quality in `[0, 1]`.
    pub equipment_score: f64,
    #[serde(default)]
    pub requester_flags: BTreeMap<RequesterId, ProviderFlag>,
}

impl ProviderProfile {
    pub fn flag_for(&self, requester: RequesterId) -> Option<ProviderFlag> {
        self.requester_flags.get(&requester).copied()
    }

    /// Completed jobs in the category a request's tags describe: the smallest per-tag count
    /// over `required`. Untagged requests, and providers without per-tag history, use the
    /// overall count.
    pub fn completed_jobs_for(&self, required: &BTreeSet<String>) -> u32 {
        if required.is_empty() || self.completed_by_tag.is_empty() {
            return self.completed_jobs;
        }
        required
            .iter()
            .map(|tag| self.completed_by_tag.get(tag).copied().unwrap_or(0))
            .min()
            .unwrap_or(self.completed_jobs)
    }
}

/// Bid session lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SessionState {
    Open,
    Ranking,
    Offered,
    Exhausted,
    Matched,
    Unmatched,
    Expired,
    Cancelled,
    Superseded,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Matched
                | SessionState::Unmatched
                | SessionState::Expired
                | SessionState::Cancelled
                | SessionState::Superseded
        )
    }
}

/// Terminal outcome of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Outcome {
    Matched,
    Unmatched,
    Expired,
    Cancelled,
    Superseded,
}

impl From<Outcome> for SessionState {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Matched => SessionState::Matched,
            Outcome::Unmatched => SessionState::Unmatched,
            Outcome::Expired => SessionState::Expired,
            Outcome::Cancelled => SessionState::Cancelled,
            Outcome::Superseded => SessionState::Superseded,
        }
    }
}

/// Returns the current UTC time in milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
