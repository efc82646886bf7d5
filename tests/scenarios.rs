//! End-to-end auction scenarios through the session manager, under paused tokio time.

use dispatch_auction_engine::{
    Bid, BidId, BidRejection, EngineConfig, EngineError, EngineEvent, InMemoryAuditSink, InMemoryDirectory,
    Location, Outcome, PriorityTier, ProviderId, ProviderProfile, ReassignmentCoordinator, RemainingWork, Request,
    RequestId, RequesterId, SelectionMode, ServiceArea, SessionManager, SessionState, WorkScope,
};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const HOUR: u64 = 3_600_000;

fn init_log() {
    let _ = env_logger::try_init();
}

fn provider(id: u64) -> ProviderProfile {
    ProviderProfile {
        provider_id: ProviderId(id),
        tags: BTreeSet::new(),
        capacity: Decimal::from(20),
        service_area: ServiceArea::rect(44.8, -93.4, 45.1, -93.0),
        in_flight_jobs: 0,
        max_concurrent_jobs: 2,
        on_time_rate: 0.9,
        cancellation_rate: 0.05,
        completed_jobs: 40,
        equipment_score: 0.7,
        completed_by_tag: BTreeMap::new(),
        requester_flags: BTreeMap::new(),
    }
}

fn setup(profiles: Vec<ProviderProfile>) -> (SessionManager, Arc<InMemoryDirectory>, InMemoryAuditSink) {
    init_log();
    let directory = Arc::new(InMemoryDirectory::new(profiles));
    let audit = InMemoryAuditSink::new();
    let manager = SessionManager::builder(EngineConfig::default(), directory.clone())
        .audit(Arc::new(audit.clone()))
        .build()
        .unwrap();
    (manager, directory, audit)
}

fn request(m: &SessionManager, id: &str) -> Request {
    let now = m.now_ms();
    Request {
        request_id: RequestId(id.into()),
        requester_id: RequesterId(1),
        origin: Location { lat: 44.9, lon: -93.2 },
        destination: Location { lat: 45.0, lon: -93.1 },
        required_tags: BTreeSet::new(),
        size: Decimal::from(10),
        earliest_start: now,
        latest_delivery: now + 24 * HOUR,
        declared_value: Decimal::from(2_500),
        priority: PriorityTier::Standard,
        selection: SelectionMode::Auto,
        supersedes: None,
        excluded_providers: BTreeSet::new(),
    }
}

fn bid(m: &SessionManager, id: u64, provider: u64, price: i64) -> Bid {
    let now = m.now_ms();
    Bid {
        bid_id: BidId(id),
        provider_id: ProviderId(provider),
        price: Decimal::from(price),
        pickup_eta: now + 2 * HOUR,
        delivery_eta: now + 4 * HOUR,
        confidence: 0.9,
        submitted_at: 0,
    }
}

async fn wait_for<F>(rx: &mut broadcast::Receiver<EngineEvent>, mut pred: F) -> EngineEvent
where
    F: FnMut(&EngineEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(24 * 3600), async {
        loop {
            let event = rx.recv().await.expect("event stream open");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event before timeout")
}

#[tokio::test(start_paused = true)]
async fn scenario_a_cheapest_equal_bid_wins() {
    let (m, _, audit) = setup(vec![provider(1), provider(2), provider(3)]);
    let mut events = m.subscribe();
    let id = m.submit_request(request(&m, "job-a")).await.unwrap();
    m.submit_bid(id, bid(&m, 11, 1, 1000)).await.unwrap();
    m.submit_bid(id, bid(&m, 12, 2, 900)).await.unwrap();
    m.submit_bid(id, bid(&m, 13, 3, 1100)).await.unwrap();

    let ready = wait_for(&mut events, |e| matches!(e, EngineEvent::CandidatesReady { .. })).await;
    let EngineEvent::CandidatesReady { ranked, .. } = ready else { unreachable!() };
    let prices: Vec<Decimal> = ranked.iter().map(|r| r.bid.price).collect();
    assert_eq!(prices, vec![Decimal::from(900), Decimal::from(1000), Decimal::from(1100)]);

    let offered = wait_for(&mut events, |e| matches!(e, EngineEvent::OfferExtended { .. })).await;
    assert!(matches!(offered, EngineEvent::OfferExtended { provider_id: ProviderId(2), rank: 1, .. }));

    let winner = m.confirm_offer(id).await.unwrap();
    assert_eq!(winner.bid.provider_id, ProviderId(2));
    let terminal = wait_for(&mut events, |e| matches!(e, EngineEvent::SessionTerminal { .. })).await;
    assert!(matches!(
        terminal,
        EngineEvent::SessionTerminal { outcome: Outcome::Matched, winner: Some(ProviderId(2)), .. }
    ));
    let view = m.session_view(id).await.unwrap();
    assert_eq!(view.state, SessionState::Matched);
    assert_eq!(view.winner, Some(ProviderId(2)));
    assert!(audit.actions().contains(&"offer_confirm".to_string()));
}

#[tokio::test(start_paused = true)]
async fn scenario_b_no_candidates_rebroadcasts_immediately() {
    let mut tight = provider(1);
    // Fits only once the capacity margin drops to 10%.
    tight.capacity = Decimal::new(112, 1);
    let (m, _, _) = setup(vec![tight]);
    let mut events = m.subscribe();
    let before = m.now_ms();
    let id = m.submit_request(request(&m, "job-b")).await.unwrap();

    let view = m.session_view(id).await.unwrap();
    assert_eq!(view.state, SessionState::Open);
    assert_eq!(view.rebroadcasts, 1);
    assert_eq!(view.candidates, 1);
    assert_eq!(view.relaxation.capacity_margin, Decimal::new(10, 2));
    assert_eq!(view.close_deadline, before + m.config().open_window_ms);

    let first = wait_for(&mut events, |_| true).await;
    assert!(matches!(first, EngineEvent::NoEligibleProviders { attempt: 0, .. }));
    let second = wait_for(&mut events, |_| true).await;
    assert!(matches!(second, EngineEvent::Rebroadcast { attempt: 1, candidates: 1, .. }));
}

#[tokio::test(start_paused = true)]
async fn scenario_c_offer_timeout_moves_to_rank_two_without_rescoring() {
    let (m, _, _) = setup(vec![provider(1), provider(2)]);
    let mut events = m.subscribe();
    let id = m.submit_request(request(&m, "job-c")).await.unwrap();
    m.submit_bid(id, bid(&m, 1, 1, 500)).await.unwrap();
    m.submit_bid(id, bid(&m, 2, 2, 700)).await.unwrap();
    m.close_early(id).await.unwrap();
    let first = m.session_view(id).await.unwrap().offer.unwrap();
    assert_eq!(first.provider_id, ProviderId(1));

    let withdrawn = wait_for(&mut events, |e| matches!(e, EngineEvent::OfferWithdrawn { .. })).await;
    assert!(matches!(withdrawn, EngineEvent::OfferWithdrawn { provider_id: ProviderId(1), .. }));
    let next = wait_for(&mut events, |e| matches!(e, EngineEvent::OfferExtended { .. })).await;
    assert!(matches!(next, EngineEvent::OfferExtended { provider_id: ProviderId(2), rank: 2, .. }));

    let view = m.session_view(id).await.unwrap();
    assert_eq!(view.state, SessionState::Offered);
    assert_eq!(view.rank_runs, 1);
    assert_eq!(view.offer.unwrap().deadline, first.deadline + m.config().offer_window_ms);
}

#[tokio::test(start_paused = true)]
async fn scenario_d_failure_in_transit_opens_emergency_session() {
    let (m, _, audit) = setup(vec![provider(1), provider(2)]);
    let coordinator = ReassignmentCoordinator::new(m.clone());
    let mut events = m.subscribe();
    let original = m.submit_request(request(&m, "job-d")).await.unwrap();
    m.submit_bid(original, bid(&m, 1, 1, 500)).await.unwrap();
    m.close_early(original).await.unwrap();
    m.confirm_offer(original).await.unwrap();

    let work = RemainingWork {
        scope: WorkScope::RemainingLeg {
            origin: Location { lat: 44.95, lon: -93.15 },
            destination: None,
            size: None,
        },
        in_transit: true,
        reason: "vehicle breakdown".into(),
    };
    let t0 = m.now_ms();
    let derived = coordinator.report_failure(original, work.clone()).await.unwrap();
    let t1 = m.now_ms();

    let superseded = wait_for(&mut events, |e| matches!(e, EngineEvent::Superseded { .. })).await;
    assert_eq!(
        superseded,
        EngineEvent::Superseded { session_id: original, derived_session_id: derived }
    );

    let old = m.session_view(original).await.unwrap();
    assert_eq!(old.state, SessionState::Superseded);
    assert_eq!(old.superseded_by, Some(derived));

    let new = m.session_view(derived).await.unwrap();
    assert_eq!(new.state, SessionState::Open);
    assert_eq!(new.derived_from, Some(original));
    assert_eq!(new.request_id, RequestId("job-d/r1".into()));
    assert!(new.close_deadline >= t0 + 60_000 && new.close_deadline <= t1 + 60_000);
    assert_eq!(new.candidates, 1);

    let err = m.submit_bid(derived, bid(&m, 9, 1, 400)).await.unwrap_err();
    assert_eq!(err, EngineError::BidRejected(BidRejection::Ineligible));
    m.submit_bid(derived, bid(&m, 10, 2, 650)).await.unwrap();

    // The original is never reopened or reassigned twice.
    let again = coordinator.report_failure(original, work).await.unwrap_err();
    assert!(matches!(again, EngineError::InvalidState { state: SessionState::Superseded, .. }));
    assert!(audit.actions().contains(&"failure_report".to_string()));
}

#[tokio::test(start_paused = true)]
async fn scenario_e_rebroadcast_cap_ends_unmatched() {
    let (m, _, _) = setup(vec![provider(1)]);
    let mut events = m.subscribe();
    let id = m.submit_request(request(&m, "job-e")).await.unwrap();
    let terminal = wait_for(&mut events, |e| matches!(e, EngineEvent::SessionTerminal { .. })).await;
    let EngineEvent::SessionTerminal { outcome, attempts, relaxation, cause, .. } = terminal else {
        unreachable!()
    };
    assert_eq!(outcome, Outcome::Unmatched);
    assert_eq!(attempts, 2);
    assert_eq!(relaxation.level, 2);
    assert!(cause.unwrap().contains("re-broadcast cap exceeded"));

    tokio::time::sleep(Duration::from_millis(1)).await;
    let view = m.session_view(id).await.unwrap();
    assert_eq!(view.state, SessionState::Unmatched);
    assert_eq!(view.rebroadcasts, 2);
    assert_eq!(m.active_sessions(), 0);
}

#[tokio::test(start_paused = true)]
async fn request_expires_when_delivery_window_passes() {
    let (m, _, _) = setup(vec![provider(1)]);
    let mut events = m.subscribe();
    let mut r = request(&m, "job-expiring");
    r.latest_delivery = r.earliest_start + 400_000;
    let id = m.submit_request(r).await.unwrap();
    let terminal = wait_for(&mut events, |e| matches!(e, EngineEvent::SessionTerminal { .. })).await;
    assert!(matches!(
        terminal,
        EngineEvent::SessionTerminal { outcome: Outcome::Expired, attempts: 1, .. }
    ));
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(m.session_view(id).await.unwrap().state, SessionState::Expired);
}

#[tokio::test(start_paused = true)]
async fn manual_selection_falls_back_to_top_bid() {
    let (m, _, _) = setup(vec![provider(1), provider(2)]);
    let mut events = m.subscribe();
    let mut r = request(&m, "job-manual");
    r.selection = SelectionMode::Manual;
    let id = m.submit_request(r).await.unwrap();
    m.submit_bid(id, bid(&m, 1, 1, 500)).await.unwrap();
    m.submit_bid(id, bid(&m, 2, 2, 700)).await.unwrap();
    m.close_early(id).await.unwrap();
    assert_eq!(m.session_view(id).await.unwrap().state, SessionState::Ranking);

    let offered = wait_for(&mut events, |e| matches!(e, EngineEvent::OfferExtended { .. })).await;
    assert!(matches!(offered, EngineEvent::OfferExtended { provider_id: ProviderId(1), .. }));
}

#[tokio::test(start_paused = true)]
async fn manual_selection_offers_chosen_bid() {
    let (m, _, _) = setup(vec![provider(1), provider(2)]);
    let mut r = request(&m, "job-pick");
    r.selection = SelectionMode::Manual;
    let id = m.submit_request(r).await.unwrap();
    m.submit_bid(id, bid(&m, 1, 1, 500)).await.unwrap();
    m.submit_bid(id, bid(&m, 2, 2, 700)).await.unwrap();
    m.close_early(id).await.unwrap();
    let offer = m.select_bid(id, BidId(2)).await.unwrap();
    assert_eq!(offer.provider_id, ProviderId(2));
    assert_eq!(offer.rank, 2);
    let err = m.select_bid(id, BidId(1)).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState { state: SessionState::Offered, .. }));
    assert_eq!(m.confirm_offer(id).await.unwrap().bid.bid_id, BidId(2));
}

#[tokio::test(start_paused = true)]
async fn no_double_match_across_overlapping_sessions() {
    let mut solo = provider(1);
    solo.max_concurrent_jobs = 1;
    let (m, _, _) = setup(vec![solo]);

    let a = m.submit_request(request(&m, "job-1")).await.unwrap();
    m.submit_bid(a, bid(&m, 1, 1, 500)).await.unwrap();
    m.close_early(a).await.unwrap();
    m.confirm_offer(a).await.unwrap();

    let b = m.submit_request(request(&m, "job-2")).await.unwrap();
    m.submit_bid(b, bid(&m, 2, 1, 500)).await.unwrap();
    m.close_early(b).await.unwrap();
    let err = m.confirm_offer(b).await.unwrap_err();
    assert!(matches!(err, EngineError::CapacityExceeded(ref msg) if msg.starts_with("capacity_exceeded")));

    // The only bid was refused, so the session re-broadcasts instead of matching.
    let view = m.session_view(b).await.unwrap();
    assert_eq!(view.state, SessionState::Open);
    assert_eq!(view.rebroadcasts, 1);
    assert_eq!(view.winner, None);

    // Completing the first job frees the provider.
    m.job_completed(a).await.unwrap();
    m.submit_bid(b, bid(&m, 3, 1, 500)).await.unwrap();
    m.close_early(b).await.unwrap();
    assert_eq!(m.confirm_offer(b).await.unwrap().bid.provider_id, ProviderId(1));
}

#[tokio::test(start_paused = true)]
async fn cancel_and_confirm_race_resolves_to_one_outcome() {
    let (m, _, _) = setup(vec![provider(1)]);
    let id = m.submit_request(request(&m, "job-race")).await.unwrap();
    m.submit_bid(id, bid(&m, 1, 1, 500)).await.unwrap();
    m.close_early(id).await.unwrap();

    let (cancel, confirm) = tokio::join!(m.cancel_session(id, "changed plans"), m.confirm_offer(id));
    assert!(cancel.is_ok() != confirm.is_ok(), "exactly one mutation wins");
    tokio::time::sleep(Duration::from_millis(1)).await;
    let view = m.session_view(id).await.unwrap();
    if confirm.is_ok() {
        assert_eq!(view.state, SessionState::Matched);
        assert_eq!(view.winner, Some(ProviderId(1)));
    } else {
        assert_eq!(view.state, SessionState::Cancelled);
        assert_eq!(view.winner, None);
    }
}

#[tokio::test(start_paused = true)]
async fn replayed_bid_id_rejected_and_new_bid_replaces() {
    let (m, _, _) = setup(vec![provider(1)]);
    let id = m.submit_request(request(&m, "job-dup")).await.unwrap();
    assert!(!m.submit_bid(id, bid(&m, 1, 1, 500)).await.unwrap().replaced);
    let err = m.submit_bid(id, bid(&m, 1, 1, 450)).await.unwrap_err();
    assert_eq!(err, EngineError::BidRejected(BidRejection::DuplicateActive));
    assert!(m.submit_bid(id, bid(&m, 2, 1, 450)).await.unwrap().replaced);
    assert_eq!(m.session_view(id).await.unwrap().active_bids, 1);
}

#[tokio::test(start_paused = true)]
async fn directory_outage_runs_on_stale_snapshot() {
    let (m, directory, _) = setup(vec![provider(1), provider(2)]);
    m.submit_request(request(&m, "warm")).await.unwrap();
    directory.set_available(false);
    let id = m.submit_request(request(&m, "during-outage")).await.unwrap();
    let view = m.session_view(id).await.unwrap();
    assert!(view.stale_snapshot);
    assert_eq!(view.candidates, 2);
    m.submit_bid(id, bid(&m, 1, 2, 300)).await.unwrap();
}
