//! # Dispatch Auction Engine
//!
//! Broadcast-auction reconciliation for on-demand transport: a shipper's request is
//! broadcast to eligible carriers, bids are collected for a bounded window, ranked by a
//! weighted score, and offered one at a time until a carrier confirms. Sessions that run
//! out of bids re-broadcast with relaxed eligibility; a carrier that withdraws after
//! matching triggers a derived, escalated request for the remaining work.
//!
//! ## Entry point
//!
//! Use [`SessionManager`] for all inbound operations and [`SessionManager::subscribe`]
//! for out-events. [`ReassignmentCoordinator`] handles provider withdrawals.
//!
//! ## Example
//!
//! ```rust
//! use dispatch_auction_engine::{
//!     EngineConfig, InMemoryDirectory, Location, PriorityTier, Request, RequestId, RequesterId,
//!     SelectionMode, SessionManager, SessionState,
//! };
//! use rust_decimal::Decimal;
//! use std::collections::BTreeSet;
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let directory = Arc::new(InMemoryDirectory::default());
//! let manager = SessionManager::new(EngineConfig::default(), directory).unwrap();
//! let now = manager.now_ms();
//! let request = Request {
//!     request_id: RequestId("job-1".into()),
//!     requester_id: RequesterId(1),
//!     origin: Location { lat: 44.97, lon: -93.26 },
//!     destination: Location { lat: 44.95, lon: -93.09 },
//!     required_tags: BTreeSet::new(),
//!     size: Decimal::from(4),
//!     earliest_start: now,
//!     latest_delivery: now + 4 * 3_600_000,
//!     declared_value: Decimal::from(800),
//!     priority: PriorityTier::Standard,
//!     selection: SelectionMode::Auto,
//!     supersedes: None,
//!     excluded_providers: BTreeSet::new(),
//! };
//! let session = manager.submit_request(request).await.unwrap();
//! // No providers are registered, so the session re-broadcasts up to the cap and gives up.
//! let view = manager.session_view(session).await.unwrap();
//! assert_eq!(view.state, SessionState::Unmatched);
//! # }
//! ```
//!
//! ## Lower-level API
//!
//! [`BidSession`] is the synchronous, clock-free state machine the manager drives;
//! [`eligibility::filter`] and [`scoring::rank`] can be used on their own.

pub mod api;
pub mod audit;
pub mod capacity;
pub mod config;
pub mod directory;
pub mod eligibility;
pub mod error;
pub mod events;
pub mod geo;
pub mod manager;
pub mod persistence;
pub mod reassignment;
pub mod scoring;
pub mod session;
pub mod simulation;
pub mod types;

pub use audit::{AuditEvent, AuditSink, InMemoryAuditSink, NullAuditSink, StdoutAuditSink};
pub use capacity::{CapacityDenial, CapacityLedger, Reservation};
pub use config::EngineConfig;
pub use directory::{InMemoryDirectory, ProviderDirectory};
pub use eligibility::Relaxation;
pub use error::{BidRejection, EngineError};
pub use events::EngineEvent;
pub use geo::{Location, ServiceArea};
pub use manager::{SessionManager, SessionManagerBuilder};
pub use persistence::{FileArchive, InMemoryArchive, SessionArchive};
pub use reassignment::{ReassignmentCoordinator, RemainingWork, WorkScope};
pub use scoring::{RankedBid, ScoreWeights, SubScores};
pub use session::{BidAck, BidSession, Offer, SessionRecord, SessionView};
pub use simulation::{Generator, GeneratorConfig};
pub use types::{
    Bid, BidId, Outcome, PriorityTier, ProviderFlag, ProviderId, ProviderProfile, Request, RequestId, RequesterId,
    SelectionMode, SessionId, SessionState,
};
