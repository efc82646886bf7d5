//! Session manager: creates, indexes and drives bid sessions.
//!
//! Each live session runs in its own tokio task that owns the [`BidSession`] outright.
//! Every mutation (bid submission, selection, confirm/decline, cancellation, timer
//! firing) reaches the session through that task's command channel, so a session has
//! exactly one writer and its events are processed strictly in arrival order. The task
//! waits on whichever comes first: the next command, or the session's next deadline.
//!
//! Terminal sessions are archived and removed from the index. Commands that race the
//! archival (the caller looked the session up just before it closed) are logged and
//! replayed against the archived record, never dropped.

use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;

use crate::audit::{AuditEvent, AuditSink, NullAuditSink};
use crate::capacity::{CapacityLedger, Reservation};
use crate::config::EngineConfig;
use crate::directory::ProviderDirectory;
use crate::error::{BidRejection, EngineError};
use crate::events::EngineEvent;
use crate::persistence::{InMemoryArchive, SessionArchive};
use crate::scoring::RankedBid;
use crate::session::{BidAck, BidSession, Offer, SessionRecord, SessionView};
use crate::types::{Bid, BidId, ProviderProfile, Request, RequestId, SessionId, SessionState};

const COMMAND_BUFFER: usize = 64;
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Maps engine time (UTC ms) onto the tokio clock so timers honour paused test time.
#[derive(Clone, Copy, Debug)]
struct EngineClock {
    origin: Instant,
    origin_ms: u64,
}

impl EngineClock {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            origin_ms: crate::types::now_millis(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.origin_ms + self.origin.elapsed().as_millis() as u64
    }

    /// Instant for UTC `ms`. Deadlines past what `Instant` can hold are parked far in the future.
    fn instant_at(&self, ms: u64) -> Instant {
        let offset = Duration::from_millis(ms.saturating_sub(self.origin_ms));
        self.origin
            .checked_add(offset)
            .unwrap_or_else(|| Instant::now() + FAR_FUTURE)
    }
}

enum Command {
    SubmitBid {
        bid: Bid,
        reply: oneshot::Sender<Result<BidAck, EngineError>>,
    },
    CloseEarly {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Select {
        bid_id: BidId,
        reply: oneshot::Sender<Result<Offer, EngineError>>,
    },
    Confirm {
        reply: oneshot::Sender<Result<RankedBid, EngineError>>,
    },
    Decline {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Cancel {
        reason: String,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    View {
        reply: oneshot::Sender<Result<SessionView, EngineError>>,
    },
}

struct SessionHandle {
    commands: mpsc::Sender<Command>,
    request_id: RequestId,
}

struct Inner {
    config: EngineConfig,
    directory: Arc<dyn ProviderDirectory>,
    archive: Arc<dyn SessionArchive>,
    audit: Arc<dyn AuditSink>,
    sessions: Mutex<HashMap<SessionId, SessionHandle>>,
    active_requests: Mutex<HashSet<RequestId>>,
    ledger: Mutex<CapacityLedger>,
    last_snapshot: Mutex<Option<Vec<ProviderProfile>>>,
    reassigning: Mutex<HashSet<SessionId>>,
    events: broadcast::Sender<EngineEvent>,
    next_session_id: AtomicU64,
    clock: EngineClock,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct SessionManagerBuilder {
    config: EngineConfig,
    directory: Arc<dyn ProviderDirectory>,
    archive: Option<Arc<dyn SessionArchive>>,
    audit: Option<Arc<dyn AuditSink>>,
}

impl SessionManagerBuilder {
    pub fn archive(mut self, archive: Arc<dyn SessionArchive>) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Validates the configuration and builds the manager. Must run inside a tokio runtime.
    pub fn build(self) -> Result<SessionManager, EngineError> {
        self.config.validate()?;
        let (events, _) = broadcast::channel(self.config.event_buffer);
        let archive: Arc<dyn SessionArchive> = match self.archive {
            Some(archive) => archive,
            None => Arc::new(InMemoryArchive::new()),
        };
        let audit: Arc<dyn AuditSink> = match self.audit {
            Some(audit) => audit,
            None => Arc::new(NullAuditSink),
        };
        Ok(SessionManager {
            inner: Arc::new(Inner {
                directory: self.directory,
                archive,
                audit,
                sessions: Mutex::new(HashMap::new()),
                active_requests: Mutex::new(HashSet::new()),
                ledger: Mutex::new(CapacityLedger::new()),
                last_snapshot: Mutex::new(None),
                reassigning: Mutex::new(HashSet::new()),
                events,
                next_session_id: AtomicU64::new(1),
                clock: EngineClock::new(),
                config: self.config,
            }),
        })
    }
}

/// Entry point for all inbound operations. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn builder(config: EngineConfig, directory: Arc<dyn ProviderDirectory>) -> SessionManagerBuilder {
        SessionManagerBuilder {
            config,
            directory,
            archive: None,
            audit: None,
        }
    }

    /// Manager with an in-memory archive and no audit output.
    pub fn new(config: EngineConfig, directory: Arc<dyn ProviderDirectory>) -> Result<Self, EngineError> {
        Self::builder(config, directory).build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Current engine time, UTC ms.
    pub fn now_ms(&self) -> u64 {
        self.inner.clock.now_ms()
    }

    /// Out-event stream. Slow subscribers may lag and miss events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    pub fn active_sessions(&self) -> usize {
        lock(&self.inner.sessions).len()
    }

    /// Opens a bid session for `request`; the session is `Open` on return (or already
    /// terminal if no provider qualified under any relaxation).
    pub async fn submit_request(&self, request: Request) -> Result<SessionId, EngineError> {
        let actor = format!("requester:{}", request.requester_id.0);
        let detail = serde_json::json!({ "request_id": request.request_id });
        let result = self.open_session(request, None);
        self.audit(&actor, "request_submit", result.as_ref().ok().copied(), Some(detail), &result);
        result
    }

    pub async fn submit_bid(&self, session_id: SessionId, bid: Bid) -> Result<BidAck, EngineError> {
        let actor = format!("provider:{}", bid.provider_id.0);
        let detail = serde_json::json!({ "bid_id": bid.bid_id, "price": bid.price });
        let result = self
            .dispatch(session_id, "submit_bid", |reply| Command::SubmitBid { bid, reply })
            .await;
        self.audit(&actor, "bid_submit", Some(session_id), Some(detail), &result);
        result
    }

    /// Requester closes the bidding window before its deadline.
    pub async fn close_early(&self, session_id: SessionId) -> Result<(), EngineError> {
        let result = self
            .dispatch(session_id, "close_early", |reply| Command::CloseEarly { reply })
            .await;
        self.audit("requester", "session_close", Some(session_id), None, &result);
        result
    }

    /// Manual selection: offers `bid_id` to its provider.
    pub async fn select_bid(&self, session_id: SessionId, bid_id: BidId) -> Result<Offer, EngineError> {
        let result = self
            .dispatch(session_id, "select_bid", |reply| Command::Select { bid_id, reply })
            .await;
        let detail = serde_json::json!({ "bid_id": bid_id });
        self.audit("requester", "offer_select", Some(session_id), Some(detail), &result);
        result
    }

    /// Provider accepts the outstanding offer. Capacity is reserved before the session
    /// matches; a denial declines the offer and moves on to the next bid.
    pub async fn confirm_offer(&self, session_id: SessionId) -> Result<RankedBid, EngineError> {
        let result = self
            .dispatch(session_id, "confirm_offer", |reply| Command::Confirm { reply })
            .await;
        self.audit("provider", "offer_confirm", Some(session_id), None, &result);
        result
    }

    pub async fn decline_offer(&self, session_id: SessionId) -> Result<(), EngineError> {
        let result = self
            .dispatch(session_id, "decline_offer", |reply| Command::Decline { reply })
            .await;
        self.audit("provider", "offer_decline", Some(session_id), None, &result);
        result
    }

    pub async fn cancel_session(&self, session_id: SessionId, reason: impl Into<String>) -> Result<(), EngineError> {
        let reason = reason.into();
        let detail = serde_json::json!({ "reason": reason });
        let result = self
            .dispatch(session_id, "cancel_session", |reply| Command::Cancel { reason, reply })
            .await;
        self.audit("requester", "session_cancel", Some(session_id), Some(detail), &result);
        result
    }

    /// Live view for open sessions; archived view for terminal ones.
    pub async fn session_view(&self, session_id: SessionId) -> Result<SessionView, EngineError> {
        let handle = lock(&self.inner.sessions)
            .get(&session_id)
            .map(|h| h.commands.clone());
        if let Some(commands) = handle {
            let (reply, rx) = oneshot::channel();
            if commands.send(Command::View { reply }).await.is_ok() {
                if let Ok(view) = rx.await {
                    return view;
                }
            }
        }
        match self.inner.archive.load(session_id)? {
            Some(record) => Ok(record.view()),
            None => Err(EngineError::SessionNotFound(session_id)),
        }
    }

    /// Execution finished: releases the capacity reserved by a matched session.
    pub async fn job_completed(&self, session_id: SessionId) -> Result<(), EngineError> {
        let result = self.release_completed(session_id).await;
        self.audit("provider", "job_completed", Some(session_id), None, &result);
        result
    }

    async fn release_completed(&self, session_id: SessionId) -> Result<(), EngineError> {
        let record = self.settled_record(session_id, "job_completed").await?;
        if record.state != SessionState::Matched {
            return Err(EngineError::invalid_state("job_completed", record.state));
        }
        match self.release_capacity(session_id) {
            Some(_) => {
                info!("job completed session_id={} capacity released", session_id.0);
                Ok(())
            }
            None => Err(EngineError::Validation(format!(
                "session {} holds no capacity reservation",
                session_id.0
            ))),
        }
    }

    pub(crate) fn open_session(&self, request: Request, derived_from: Option<SessionId>) -> Result<SessionId, EngineError> {
        request.validate()?;
        {
            let mut active = lock(&self.inner.active_requests);
            if !active.insert(request.request_id.clone()) {
                return Err(EngineError::Validation(format!(
                    "request {} already has an active session",
                    request.request_id
                )));
            }
        }
        let (snapshot, stale) = self.snapshot(&request);
        let session_id = SessionId(self.inner.next_session_id.fetch_add(1, Ordering::SeqCst));
        let request_id = request.request_id.clone();
        let now = self.now_ms();
        let mut session = BidSession::open(session_id, request, snapshot, stale, self.inner.config.clone(), now);
        if let Some(original) = derived_from {
            session.mark_derived_from(original);
        }
        info!(
            "session opened session_id={} request_id={} priority={:?} candidates={} close_deadline={} stale_snapshot={}",
            session_id.0,
            request_id,
            session.request().priority,
            session.candidates().len(),
            session.close_deadline(),
            stale
        );
        let (commands, rx) = mpsc::channel(COMMAND_BUFFER);
        lock(&self.inner.sessions).insert(session_id, SessionHandle { commands, request_id });
        tokio::spawn(run_session(self.clone(), session, rx));
        Ok(session_id)
    }

    fn snapshot(&self, request: &Request) -> (Vec<ProviderProfile>, bool) {
        match self.inner.directory.snapshot(request) {
            Ok(snapshot) => {
                *lock(&self.inner.last_snapshot) = Some(snapshot.clone());
                (snapshot, false)
            }
            Err(e) => {
                warn!(
                    "provider directory unavailable, using last known snapshot request_id={} error={}",
                    request.request_id, e
                );
                (lock(&self.inner.last_snapshot).clone().unwrap_or_default(), true)
            }
        }
    }

    async fn dispatch<T, F>(&self, session_id: SessionId, operation: &'static str, make: F) -> Result<T, EngineError>
    where
        F: FnOnce(oneshot::Sender<Result<T, EngineError>>) -> Command,
    {
        let handle = lock(&self.inner.sessions)
            .get(&session_id)
            .map(|h| h.commands.clone());
        let Some(commands) = handle else {
            return self.replay_on_archive(session_id, operation);
        };
        let (reply, rx) = oneshot::channel();
        if commands.send(make(reply)).await.is_err() {
            let conflict = EngineError::ConcurrencyConflict {
                session: session_id,
                reason: format!("{operation} raced session archival"),
            };
            warn!("{}; replaying against archive", conflict);
            return self.replay_on_archive(session_id, operation);
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "session task dropped reply session_id={} operation={}; replaying against archive",
                    session_id.0, operation
                );
                self.replay_on_archive(session_id, operation)
            }
        }
    }

    /// Answers an operation addressed to a session that is no longer live.
    fn replay_on_archive<T>(&self, session_id: SessionId, operation: &'static str) -> Result<T, EngineError> {
        match self.inner.archive.load(session_id)? {
            None => Err(EngineError::SessionNotFound(session_id)),
            Some(_) if operation == "submit_bid" => Err(EngineError::BidRejected(BidRejection::WindowClosed)),
            Some(record) => Err(EngineError::invalid_state(operation, record.state)),
        }
    }

    fn handle_command(&self, session: &mut BidSession, command: Command) {
        let now = self.now_ms();
        match command {
            Command::SubmitBid { bid, reply } => {
                let _ = reply.send(session.submit_bid(bid, now));
            }
            Command::CloseEarly { reply } => {
                let _ = reply.send(session.close_early(now));
            }
            Command::Select { bid_id, reply } => {
                let _ = reply.send(session.select_bid(bid_id, now));
            }
            Command::Confirm { reply } => {
                let _ = reply.send(self.confirm(session, now));
            }
            Command::Decline { reply } => {
                let _ = reply.send(session.decline("declined by provider", now));
            }
            Command::Cancel { reason, reply } => {
                let _ = reply.send(session.cancel(&reason, now));
            }
            Command::View { reply } => {
                let _ = reply.send(Ok(session.view()));
            }
        }
    }

    fn confirm(&self, session: &mut BidSession, now: u64) -> Result<RankedBid, EngineError> {
        let offer = match session.current_offer() {
            Some(offer) if session.state() == SessionState::Offered && now < offer.deadline => offer,
            _ => return session.confirm(now),
        };
        let bid = session
            .ranked()
            .iter()
            .find(|r| r.bid.bid_id == offer.bid_id)
            .map(|r| r.bid.clone());
        let profile = session.profile(offer.provider_id).cloned();
        let (Some(bid), Some(profile)) = (bid, profile) else {
            return session.confirm(now);
        };
        let reservation = Reservation {
            session_id: session.id(),
            provider_id: offer.provider_id,
            size: session.request().size,
            start: bid.pickup_eta,
            end: bid.delivery_eta.max(bid.pickup_eta.saturating_add(1)),
        };
        let denied = lock(&self.inner.ledger).try_reserve(reservation, &profile);
        if let Err(denial) = denied {
            warn!(
                "confirmation denied session_id={} provider_id={} reason={}",
                session.id().0,
                offer.provider_id.0,
                denial
            );
            session.decline(&denial.to_string(), now)?;
            return Err(EngineError::CapacityExceeded(denial.to_string()));
        }
        let result = session.confirm(now);
        if result.is_err() {
            self.release_capacity(session.id());
        }
        result
    }

    fn publish(&self, events: Vec<EngineEvent>) {
        for event in events {
            debug!("engine event session_id={} kind={}", event.session_id().0, event.kind());
            let _ = self.inner.events.send(event);
        }
    }

    fn finish(&self, session: &mut BidSession, rx: &mut mpsc::Receiver<Command>) {
        let record = session.to_record();
        if let Err(e) = self.inner.archive.store(&record) {
            warn!("archive failed session_id={} error={}", session.id().0, e);
        }
        let handle = lock(&self.inner.sessions).remove(&session.id());
        if let Some(handle) = handle {
            lock(&self.inner.active_requests).remove(&handle.request_id);
        }
        info!(
            "session terminal session_id={} outcome={:?} rebroadcasts={} winner={:?} cause={:?}",
            session.id().0,
            record.outcome,
            record.rebroadcasts,
            record.winner.as_ref().map(|w| w.bid.provider_id.0),
            record.cause
        );
        rx.close();
        while let Ok(command) = rx.try_recv() {
            self.handle_command(session, command);
        }
        self.publish(session.take_events());
    }

    /// Archived record of a session that has reached a terminal state. A session that
    /// terminated an instant ago may not be archived yet; the view round-trip waits for
    /// its task to finish archiving.
    pub(crate) async fn settled_record(
        &self,
        session_id: SessionId,
        operation: &'static str,
    ) -> Result<SessionRecord, EngineError> {
        if let Some(record) = self.inner.archive.load(session_id)? {
            return Ok(record);
        }
        let view = self.session_view(session_id).await?;
        match self.inner.archive.load(session_id)? {
            Some(record) => Ok(record),
            None => Err(EngineError::invalid_state(operation, view.state)),
        }
    }

    pub(crate) fn store_record(&self, record: &SessionRecord) -> Result<(), EngineError> {
        self.inner.archive.store(record)
    }

    pub(crate) fn release_capacity(&self, session_id: SessionId) -> Option<Reservation> {
        lock(&self.inner.ledger).release(session_id)
    }

    pub(crate) fn emit(&self, event: EngineEvent) {
        self.publish(vec![event]);
    }

    /// Marks `session_id` as being reassigned. Returns `false` if another reassignment holds it.
    pub(crate) fn claim_reassignment(&self, session_id: SessionId) -> bool {
        lock(&self.inner.reassigning).insert(session_id)
    }

    pub(crate) fn release_reassignment(&self, session_id: SessionId) {
        lock(&self.inner.reassigning).remove(&session_id);
    }

    pub(crate) fn audit<T>(
        &self,
        actor: &str,
        action: &str,
        session_id: Option<SessionId>,
        detail: Option<serde_json::Value>,
        result: &Result<T, EngineError>,
    ) {
        self.inner
            .audit
            .emit(&AuditEvent::now(actor, action, session_id, detail, AuditEvent::outcome_of(result)));
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

async fn run_session(manager: SessionManager, mut session: BidSession, mut rx: mpsc::Receiver<Command>) {
    manager.publish(session.take_events());
    while !session.is_terminal() {
        let deadline = session
            .next_deadline()
            .map(|ms| manager.inner.clock.instant_at(ms));
        tokio::select! {
            command = rx.recv() => match command {
                Some(command) => manager.handle_command(&mut session, command),
                None => break,
            },
            _ = sleep_until_opt(deadline) => {
                session.on_deadline(manager.now_ms());
            }
        }
        debug_assert!(session.check_invariants().is_ok(), "{:?}", session.check_invariants());
        manager.publish(session.take_events());
    }
    manager.finish(&mut session, &mut rx);
}
