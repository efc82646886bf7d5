//! Bid session state machine.
//!
//! A [`BidSession`] owns one request's auction: `Open` (collecting bids) → `Ranking` →
//! `Offered` (one bid awaiting confirmation) → `Matched`. Declines and offer timeouts
//! return to `Ranking` and offer the next untried bid without re-scoring; running out of
//! bids moves to `Exhausted`, which re-broadcasts with relaxed eligibility until the cap
//! is reached and the session ends `Unmatched`.
//!
//! The machine is synchronous and clock-free: every operation takes `now` (UTC ms) and
//! queues the [`EngineEvent`]s it caused; callers drain them with
//! [`BidSession::take_events`]. Timers are the caller's job: sleep until
//! [`BidSession::next_deadline`] and call [`BidSession::on_deadline`].

use log::debug;
use std::collections::{BTreeMap, BTreeSet};

use crate::config::EngineConfig;
use crate::eligibility::{self, Relaxation};
use crate::error::{BidRejection, EngineError};
use crate::events::EngineEvent;
use crate::scoring::{self, RankedBid};
use crate::types::{
    Bid, BidId, Outcome, ProviderId, ProviderProfile, Request, SelectionMode, SessionId, SessionState,
};

/// One entry of the session transition log.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Transition {
    pub at: u64,
    /// `None` for the creation entry.
    pub from: Option<SessionState>,
    pub to: SessionState,
    pub cause: String,
}

/// What happened to a submitted bid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BidStatus {
    Accepted,
    /// Accepted, replacing the provider's previous bid in this round.
    Replaced,
    Rejected(BidRejection),
}

/// One entry of the append-only bid log.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BidLogEntry {
    pub at: u64,
    /// Broadcast round (0 = original, n = n-th re-broadcast).
    pub round: u32,
    pub bid: Bid,
    pub status: BidStatus,
}

/// The offer currently awaiting confirmation.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Offer {
    pub bid_id: BidId,
    pub provider_id: ProviderId,
    pub rank: usize,
    pub deadline: u64,
}

/// Acknowledgement for an accepted bid.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BidAck {
    pub bid_id: BidId,
    pub replaced: bool,
    pub close_deadline: u64,
}

#[derive(Debug)]
pub struct BidSession {
    id: SessionId,
    request: Request,
    config: EngineConfig,
    profiles: BTreeMap<ProviderId, ProviderProfile>,
    stale_snapshot: bool,
    state: SessionState,
    opened_at: u64,
    close_deadline: u64,
    relaxation: Relaxation,
    candidates: BTreeSet<ProviderId>,
    active_bids: BTreeMap<ProviderId, Bid>,
    seen_bid_ids: BTreeSet<BidId>,
    ranked: Vec<RankedBid>,
    rank_runs: u32,
    tried: BTreeSet<BidId>,
    offer: Option<Offer>,
    selection_deadline: Option<u64>,
    rebroadcasts: u32,
    outcome: Option<Outcome>,
    winner: Option<RankedBid>,
    cause: Option<String>,
    derived_from: Option<SessionId>,
    bid_log: Vec<BidLogEntry>,
    transitions: Vec<Transition>,
    outbox: Vec<EngineEvent>,
}

impl BidSession {
    /// Opens a session over a provider snapshot. The snapshot and `config` (including the
    /// score weights) are fixed for the session's lifetime. If no provider qualifies the
    /// session re-broadcasts immediately.
    pub fn open(
        id: SessionId,
        request: Request,
        snapshot: Vec<ProviderProfile>,
        stale_snapshot: bool,
        config: EngineConfig,
        now: u64,
    ) -> Self {
        let relaxation = Relaxation::for_attempt(&config, 0);
        let profiles = snapshot.into_iter().map(|p| (p.provider_id, p)).collect();
        let mut session = Self {
            id,
            request,
            config,
            profiles,
            stale_snapshot,
            state: SessionState::Open,
            opened_at: now,
            close_deadline: now,
            relaxation,
            candidates: BTreeSet::new(),
            active_bids: BTreeMap::new(),
            seen_bid_ids: BTreeSet::new(),
            ranked: Vec::new(),
            rank_runs: 0,
            tried: BTreeSet::new(),
            offer: None,
            selection_deadline: None,
            rebroadcasts: 0,
            outcome: None,
            winner: None,
            cause: None,
            derived_from: None,
            bid_log: Vec::new(),
            transitions: vec![Transition {
                at: now,
                from: None,
                to: SessionState::Open,
                cause: "request submitted".into(),
            }],
            outbox: Vec::new(),
        };
        session.begin_round(now);
        session
    }

    /// Links this session to the matched session whose remaining work it covers.
    pub fn mark_derived_from(&mut self, original: SessionId) {
        self.derived_from = Some(original);
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn rebroadcasts(&self) -> u32 {
        self.rebroadcasts
    }

    pub fn relaxation(&self) -> Relaxation {
        self.relaxation
    }

    pub fn candidates(&self) -> &BTreeSet<ProviderId> {
        &self.candidates
    }

    pub fn ranked(&self) -> &[RankedBid] {
        &self.ranked
    }

    /// How many times the scorer has ranked this session (once per round with bids).
    pub fn rank_runs(&self) -> u32 {
        self.rank_runs
    }

    pub fn current_offer(&self) -> Option<Offer> {
        self.offer
    }

    pub fn winner(&self) -> Option<&RankedBid> {
        self.winner.as_ref()
    }

    pub fn profile(&self, provider: ProviderId) -> Option<&ProviderProfile> {
        self.profiles.get(&provider)
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    pub fn bid_log(&self) -> &[BidLogEntry] {
        &self.bid_log
    }

    pub fn close_deadline(&self) -> u64 {
        self.close_deadline
    }

    /// Drains queued out-events in emission order.
    pub fn take_events(&mut self) -> Vec<EngineEvent> {
        std::mem::take(&mut self.outbox)
    }

    /// Earliest instant at which [`Self::on_deadline`] has work to do.
    pub fn next_deadline(&self) -> Option<u64> {
        if self.is_terminal() {
            return None;
        }
        let state_deadline = match self.state {
            SessionState::Open => Some(self.close_deadline),
            SessionState::Ranking => self.selection_deadline,
            SessionState::Offered => self.offer.map(|o| o.deadline),
            _ => None,
        };
        Some(match state_deadline {
            Some(d) => d.min(self.request.latest_delivery),
            None => self.request.latest_delivery,
        })
    }

    /// Fires whichever timer has elapsed at `now`. Calling early is a no-op.
    pub fn on_deadline(&mut self, now: u64) {
        if self.is_terminal() {
            return;
        }
        if now >= self.request.latest_delivery {
            self.withdraw_offer("request expired");
            self.terminate(Outcome::Expired, "request delivery window elapsed", now);
            return;
        }
        match self.state {
            SessionState::Open if now >= self.close_deadline => {
                self.close_window(now, "open window elapsed");
            }
            SessionState::Ranking if self.selection_deadline.is_some_and(|d| now >= d) => {
                self.selection_deadline = None;
                self.offer_next(now);
            }
            SessionState::Offered if self.offer.is_some_and(|o| now >= o.deadline) => {
                self.withdraw_offer("offer timeout");
                self.transition(SessionState::Ranking, "offer timeout", now);
                self.offer_next(now);
            }
            _ => {}
        }
    }

    /// Accepts or rejects a bid. Rejections for closed windows, ineligible providers and
    /// replayed bid ids are logged and announced to the provider.
    pub fn submit_bid(&mut self, mut bid: Bid, now: u64) -> Result<BidAck, EngineError> {
        bid.validate_for(&self.request)?;
        bid.submitted_at = now;
        let rejection = if self.state != SessionState::Open || now >= self.close_deadline {
            Some(BidRejection::WindowClosed)
        } else if !self.candidates.contains(&bid.provider_id) {
            Some(BidRejection::Ineligible)
        } else if self.seen_bid_ids.contains(&bid.bid_id) {
            Some(BidRejection::DuplicateActive)
        } else {
            None
        };
        if let Some(reason) = rejection {
            self.outbox.push(EngineEvent::BidRejected {
                session_id: self.id,
                provider_id: bid.provider_id,
                reason,
            });
            self.log_bid(bid, BidStatus::Rejected(reason), now);
            return Err(EngineError::BidRejected(reason));
        }
        self.seen_bid_ids.insert(bid.bid_id);
        let replaced = self.active_bids.insert(bid.provider_id, bid.clone()).is_some();
        let ack = BidAck {
            bid_id: bid.bid_id,
            replaced,
            close_deadline: self.close_deadline,
        };
        let status = if replaced { BidStatus::Replaced } else { BidStatus::Accepted };
        self.log_bid(bid, status, now);
        Ok(ack)
    }

    /// Requester-initiated close of the bidding window.
    pub fn close_early(&mut self, now: u64) -> Result<(), EngineError> {
        if self.state != SessionState::Open {
            return Err(EngineError::invalid_state("close_early", self.state));
        }
        self.close_window(now, "closed early by requester");
        Ok(())
    }

    /// Manually offers a specific ranked, untried bid.
    pub fn select_bid(&mut self, bid_id: BidId, now: u64) -> Result<Offer, EngineError> {
        if self.state != SessionState::Ranking {
            return Err(EngineError::invalid_state("select_bid", self.state));
        }
        let Some(index) = self
            .ranked
            .iter()
            .position(|r| r.bid.bid_id == bid_id && !self.tried.contains(&r.bid.bid_id))
        else {
            return Err(EngineError::Validation(format!(
                "bid {} is not an untried ranked bid",
                bid_id.0
            )));
        };
        Ok(self.extend_offer(index, now, "selected by requester"))
    }

    /// Provider confirmed the outstanding offer. A confirmation arriving after the offer
    /// deadline is treated as a timeout and refused.
    pub fn confirm(&mut self, now: u64) -> Result<RankedBid, EngineError> {
        let Some(offer) = self.offer.filter(|_| self.state == SessionState::Offered) else {
            return Err(EngineError::invalid_state("confirm_offer", self.state));
        };
        if now >= offer.deadline {
            self.on_deadline(now);
            return Err(EngineError::invalid_state("confirm_offer", self.state));
        }
        let Some(winner) = self.ranked.iter().find(|r| r.bid.bid_id == offer.bid_id).cloned() else {
            self.fail("offered bid missing from ranking", now);
            return Err(EngineError::Internal("offered bid missing from ranking".into()));
        };
        self.winner = Some(winner.clone());
        self.offer = None;
        self.terminate(
            Outcome::Matched,
            &format!("provider {} confirmed", offer.provider_id.0),
            now,
        );
        Ok(winner)
    }

    /// Provider declined (or could not take) the outstanding offer; the next untried bid
    /// is offered. The declined bid is never offered again in this session.
    pub fn decline(&mut self, cause: &str, now: u64) -> Result<(), EngineError> {
        if self.state != SessionState::Offered {
            return Err(EngineError::invalid_state("decline_offer", self.state));
        }
        self.offer = None;
        self.transition(SessionState::Ranking, cause, now);
        self.offer_next(now);
        Ok(())
    }

    /// Requester cancellation. Allowed until the session is terminal.
    pub fn cancel(&mut self, reason: &str, now: u64) -> Result<(), EngineError> {
        match self.state {
            SessionState::Open | SessionState::Ranking | SessionState::Offered => {
                self.withdraw_offer("session cancelled");
                self.terminate(Outcome::Cancelled, reason, now);
                Ok(())
            }
            state => Err(EngineError::invalid_state("cancel_session", state)),
        }
    }

    /// Forces the session to `Unmatched` after an unrecoverable internal fault.
    pub fn fail(&mut self, cause: &str, now: u64) {
        if self.is_terminal() {
            return;
        }
        self.withdraw_offer("internal error");
        self.terminate(Outcome::Unmatched, &format!("internal error: {cause}"), now);
    }

    /// Structural invariants; used by tests and debug assertions.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.offer.is_some() != (self.state == SessionState::Offered) {
            return Err(format!("offer present={} in state {:?}", self.offer.is_some(), self.state));
        }
        if self.rebroadcasts > self.config.max_rebroadcasts {
            return Err(format!("rebroadcasts {} exceed cap", self.rebroadcasts));
        }
        if self.outcome.is_some() != self.is_terminal() {
            return Err(format!("outcome {:?} in state {:?}", self.outcome, self.state));
        }
        if (self.outcome == Some(Outcome::Matched)) != self.winner.is_some() {
            return Err("winner set without a match".into());
        }
        let ranked_ids: BTreeSet<BidId> = self.ranked.iter().map(|r| r.bid.bid_id).collect();
        if !self.tried.is_subset(&ranked_ids) {
            return Err("tried bid outside the current ranking".into());
        }
        Ok(())
    }

    /// Archive form of this session.
    pub fn to_record(&self) -> SessionRecord {
        SessionRecord {
            session_id: self.id,
            request: self.request.clone(),
            state: self.state,
            outcome: self.outcome,
            opened_at: self.opened_at,
            rebroadcasts: self.rebroadcasts,
            relaxation: self.relaxation,
            stale_snapshot: self.stale_snapshot,
            winner: self.winner.clone(),
            cause: self.cause.clone(),
            derived_from: self.derived_from,
            superseded_by: None,
            bid_log: self.bid_log.clone(),
            transitions: self.transitions.clone(),
        }
    }

    /// Read-only view for requesters and operators.
    pub fn view(&self) -> SessionView {
        SessionView {
            session_id: self.id,
            request_id: self.request.request_id.clone(),
            state: self.state,
            outcome: self.outcome,
            close_deadline: self.close_deadline,
            rebroadcasts: self.rebroadcasts,
            relaxation: self.relaxation,
            candidates: self.candidates.len(),
            active_bids: self.active_bids.len(),
            ranked: self.ranked.clone(),
            rank_runs: self.rank_runs,
            offer: self.offer,
            winner: self.winner.as_ref().map(|w| w.bid.provider_id),
            stale_snapshot: self.stale_snapshot,
            cause: self.cause.clone(),
            derived_from: self.derived_from,
            superseded_by: None,
        }
    }

    fn begin_round(&mut self, now: u64) {
        loop {
            self.relaxation = Relaxation::for_attempt(&self.config, self.rebroadcasts);
            let snapshot: Vec<ProviderProfile> = self.profiles.values().cloned().collect();
            self.candidates = eligibility::filter(&self.request, &snapshot, &self.relaxation)
                .into_iter()
                .collect();
            if self.rebroadcasts > 0 {
                self.outbox.push(EngineEvent::Rebroadcast {
                    session_id: self.id,
                    attempt: self.rebroadcasts,
                    relaxation: self.relaxation,
                    candidates: self.candidates.len(),
                });
            }
            if !self.candidates.is_empty() {
                self.close_deadline = now + self.config.open_window_for(self.request.priority);
                return;
            }
            self.outbox.push(EngineEvent::NoEligibleProviders {
                session_id: self.id,
                attempt: self.rebroadcasts,
            });
            if !self.rebroadcast(now, "no eligible providers") {
                return;
            }
        }
    }

    fn close_window(&mut self, now: u64, cause: &str) {
        if self.active_bids.is_empty() {
            if self.rebroadcast(now, "no bids received") {
                self.begin_round(now);
            }
            return;
        }
        self.transition(SessionState::Ranking, cause, now);
        let bids: Vec<Bid> = self.active_bids.values().cloned().collect();
        let ranked = match scoring::rank(
            &bids,
            &self.request,
            &self.profiles,
            self.config.weights,
            self.config.experience_cap,
        ) {
            Ok(ranked) => ranked,
            Err(e) => {
                self.fail(&e.to_string(), now);
                return;
            }
        };
        self.rank_runs += 1;
        self.ranked = ranked;
        self.tried.clear();
        self.outbox.push(EngineEvent::CandidatesReady {
            session_id: self.id,
            ranked: self.ranked.clone(),
        });
        match self.request.selection {
            SelectionMode::Auto => self.offer_next(now),
            SelectionMode::Manual if self.ranked.is_empty() => self.offer_next(now),
            SelectionMode::Manual => {
                self.selection_deadline = Some(now + self.config.selection_window_ms);
            }
        }
    }

    fn offer_next(&mut self, now: u64) {
        match self.ranked.iter().position(|r| !self.tried.contains(&r.bid.bid_id)) {
            Some(index) => {
                self.extend_offer(index, now, "next ranked bid");
            }
            None => {
                if self.rebroadcast(now, "all bids declined or timed out") {
                    self.begin_round(now);
                }
            }
        }
    }

    fn extend_offer(&mut self, index: usize, now: u64, cause: &str) -> Offer {
        let ranked = &self.ranked[index];
        let offer = Offer {
            bid_id: ranked.bid.bid_id,
            provider_id: ranked.bid.provider_id,
            rank: ranked.rank,
            deadline: now + self.config.offer_window_ms,
        };
        self.tried.insert(offer.bid_id);
        self.selection_deadline = None;
        self.offer = Some(offer);
        self.transition(SessionState::Offered, cause, now);
        self.outbox.push(EngineEvent::OfferExtended {
            session_id: self.id,
            provider_id: offer.provider_id,
            bid_id: offer.bid_id,
            rank: offer.rank,
            deadline: offer.deadline,
        });
        offer
    }

    /// Moves to `Exhausted`, then either reopens (returns `true`) or ends `Unmatched`.
    fn rebroadcast(&mut self, now: u64, cause: &str) -> bool {
        self.offer = None;
        self.selection_deadline = None;
        self.transition(SessionState::Exhausted, cause, now);
        if self.rebroadcasts >= self.config.max_rebroadcasts {
            let err = EngineError::ReBroadcastCapExceeded {
                attempts: self.rebroadcasts,
            };
            self.terminate(Outcome::Unmatched, &err.to_string(), now);
            return false;
        }
        self.rebroadcasts += 1;
        self.active_bids.clear();
        self.ranked.clear();
        self.tried.clear();
        self.transition(
            SessionState::Open,
            &format!("re-broadcast {} of {}", self.rebroadcasts, self.config.max_rebroadcasts),
            now,
        );
        true
    }

    fn withdraw_offer(&mut self, reason: &str) {
        if let Some(offer) = self.offer.take() {
            self.outbox.push(EngineEvent::OfferWithdrawn {
                session_id: self.id,
                provider_id: offer.provider_id,
                bid_id: offer.bid_id,
                reason: reason.into(),
            });
        }
    }

    fn terminate(&mut self, outcome: Outcome, cause: &str, now: u64) {
        self.offer = None;
        self.selection_deadline = None;
        self.outcome = Some(outcome);
        self.cause = Some(cause.to_string());
        self.transition(outcome.into(), cause, now);
        self.outbox.push(EngineEvent::SessionTerminal {
            session_id: self.id,
            outcome,
            attempts: self.rebroadcasts,
            relaxation: self.relaxation,
            winner: self.winner.as_ref().map(|w| w.bid.provider_id),
            cause: self.cause.clone(),
        });
    }

    fn transition(&mut self, to: SessionState, cause: &str, now: u64) {
        debug!(
            "session transition session_id={} from={:?} to={:?} cause={}",
            self.id.0, self.state, to, cause
        );
        self.transitions.push(Transition {
            at: now,
            from: Some(self.state),
            to,
            cause: cause.to_string(),
        });
        self.state = to;
    }

    fn log_bid(&mut self, bid: Bid, status: BidStatus, now: u64) {
        self.bid_log.push(BidLogEntry {
            at: now,
            round: self.rebroadcasts,
            bid,
            status,
        });
    }
}

/// Serializable snapshot of a live or archived session.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SessionView {
    pub session_id: SessionId,
    pub request_id: crate::types::RequestId,
    pub state: SessionState,
    pub outcome: Option<Outcome>,
    pub close_deadline: u64,
    pub rebroadcasts: u32,
    pub relaxation: Relaxation,
    pub candidates: usize,
    pub active_bids: usize,
    pub ranked: Vec<RankedBid>,
    pub rank_runs: u32,
    pub offer: Option<Offer>,
    pub winner: Option<ProviderId>,
    pub stale_snapshot: bool,
    pub cause: Option<String>,
    pub derived_from: Option<SessionId>,
    pub superseded_by: Option<SessionId>,
}

/// Durable record of a terminal session: request, bid log and transition log are enough
/// to reconstruct the whole auction.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub request: Request,
    pub state: SessionState,
    pub outcome: Option<Outcome>,
    pub opened_at: u64,
    pub rebroadcasts: u32,
    pub relaxation: Relaxation,
    pub stale_snapshot: bool,
    pub winner: Option<RankedBid>,
    pub cause: Option<String>,
    pub derived_from: Option<SessionId>,
    pub superseded_by: Option<SessionId>,
    pub bid_log: Vec<BidLogEntry>,
    pub transitions: Vec<Transition>,
}

impl SessionRecord {
    /// Marks a matched session as replaced by `derived`. The original is never reopened.
    pub fn supersede(&mut self, derived: SessionId, now: u64) -> Result<EngineEvent, EngineError> {
        if self.state != SessionState::Matched {
            return Err(EngineError::invalid_state("supersede", self.state));
        }
        let cause = format!("provider withdrew; remaining work moved to session {}", derived.0);
        self.transitions.push(Transition {
            at: now,
            from: Some(self.state),
            to: SessionState::Superseded,
            cause: cause.clone(),
        });
        self.state = SessionState::Superseded;
        self.outcome = Some(Outcome::Superseded);
        self.superseded_by = Some(derived);
        self.cause = Some(cause);
        Ok(EngineEvent::Superseded {
            session_id: self.session_id,
            derived_session_id: derived,
        })
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            session_id: self.session_id,
            request_id: self.request.request_id.clone(),
            state: self.state,
            outcome: self.outcome,
            close_deadline: 0,
            rebroadcasts: self.rebroadcasts,
            relaxation: self.relaxation,
            candidates: 0,
            active_bids: 0,
            ranked: Vec::new(),
            rank_runs: 0,
            offer: None,
            winner: self.winner.as_ref().map(|w| w.bid.provider_id),
            stale_snapshot: self.stale_snapshot,
            cause: self.cause.clone(),
            derived_from: self.derived_from,
            superseded_by: self.superseded_by,
        }
    }
}
