//! Property-based invariant tests for ranking and the bid session state machine.
//!
//! Uses proptest to generate synthetic fleets, bids and operation sequences, then asserts:
//! deterministic ranking, at most one outstanding offer, monotonic and capped
//! re-broadcasts, and that every session reaches a terminal state.

use dispatch_auction_engine::scoring::rank;
use dispatch_auction_engine::{
    BidId, BidSession, EngineConfig, EngineEvent, Generator, GeneratorConfig, ProviderId, ProviderProfile,
    SelectionMode, SessionId, SessionState,
};
use proptest::prelude::*;
use std::collections::BTreeMap;

#[derive(Clone, Debug)]
enum Op {
    Bid { provider: u64 },
    Close,
    Select(u64),
    Confirm,
    Decline,
    Advance(u64),
    FireDeadline,
    Cancel,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (1u64..=6).prop_map(|provider| Op::Bid { provider }),
        2 => Just(Op::Close),
        1 => (1u64..=40).prop_map(Op::Select),
        2 => Just(Op::Confirm),
        3 => Just(Op::Decline),
        2 => (1u64..=200_000).prop_map(Op::Advance),
        3 => Just(Op::FireDeadline),
        1 => Just(Op::Cancel),
    ]
}

fn fleet(seed: u64) -> (Generator, Vec<ProviderProfile>) {
    let mut generator = Generator::new(GeneratorConfig {
        seed,
        num_providers: 6,
        tagged_ratio: 0.0,
        ..Default::default()
    });
    let providers = generator.providers();
    (generator, providers)
}

fn profile_map(providers: &[ProviderProfile]) -> BTreeMap<ProviderId, ProviderProfile> {
    providers.iter().map(|p| (p.provider_id, p.clone())).collect()
}

/// Drives the session to a terminal state by firing each deadline in turn.
fn run_to_terminal(session: &mut BidSession, now: &mut u64) {
    for _ in 0..500 {
        if session.is_terminal() {
            return;
        }
        let deadline = session.next_deadline().expect("live session has a deadline");
        *now = (*now).max(deadline);
        session.on_deadline(*now);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Same bids and snapshot ⇒ same ranking, regardless of input order.
    #[test]
    fn prop_ranking_is_deterministic(seed in 0u64..100_000u64, reverse in any::<bool>()) {
        let (mut generator, providers) = fleet(seed);
        let request = generator.next_request(0);
        let ids: Vec<ProviderId> = providers.iter().map(|p| p.provider_id).collect();
        let bids = generator.bids(&ids, &request);
        let profiles = profile_map(&providers);
        let config = EngineConfig::default();

        let first = rank(&bids, &request, &profiles, config.weights, config.experience_cap).unwrap();
        let mut shuffled = bids.clone();
        if reverse {
            shuffled.reverse();
        } else {
            let len = shuffled.len();
            shuffled.rotate_left(seed as usize % len);
        }
        let second = rank(&shuffled, &request, &profiles, config.weights, config.experience_cap).unwrap();
        prop_assert_eq!(&first, &second);
        for (i, r) in first.iter().enumerate() {
            prop_assert_eq!(r.rank, i + 1);
            prop_assert!((0.0..=1.0).contains(&r.score));
        }
        for pair in first.windows(2) {
            prop_assert!(pair[0].score >= pair[1].score);
        }
    }

    /// Any operation sequence keeps one offer at most, never decreases or exceeds the
    /// re-broadcast cap, and leaves a session that terminates when its timers run out.
    #[test]
    fn prop_session_invariants_hold(
        seed in 0u64..100_000u64,
        manual in any::<bool>(),
        ops in prop::collection::vec(op(), 1..60),
    ) {
        let (mut generator, providers) = fleet(seed);
        let mut request = generator.next_request(0);
        if manual {
            request.selection = SelectionMode::Manual;
        }
        let config = EngineConfig::default();
        let cap = config.max_rebroadcasts;
        let mut session = BidSession::open(SessionId(1), request.clone(), providers, false, config, 0);
        let mut now = 0u64;
        let mut rebroadcasts = session.rebroadcasts();
        let mut next_bid = 1u64;

        for op in ops {
            match op {
                Op::Bid { provider } => {
                    let mut bid = generator.bid(ProviderId(provider), &request);
                    bid.bid_id = BidId(next_bid);
                    next_bid += 1;
                    let _ = session.submit_bid(bid, now);
                }
                Op::Close => { let _ = session.close_early(now); }
                Op::Select(bid) => { let _ = session.select_bid(BidId(bid), now); }
                Op::Confirm => { let _ = session.confirm(now); }
                Op::Decline => { let _ = session.decline("declined", now); }
                Op::Advance(ms) => {
                    now += ms;
                    session.on_deadline(now);
                }
                Op::FireDeadline => {
                    if let Some(deadline) = session.next_deadline() {
                        now = now.max(deadline);
                        session.on_deadline(now);
                    }
                }
                Op::Cancel => { let _ = session.cancel("cancelled", now); }
            }
            prop_assert!(session.check_invariants().is_ok(), "{:?}", session.check_invariants());
            prop_assert!(session.rebroadcasts() >= rebroadcasts);
            prop_assert!(session.rebroadcasts() <= cap);
            rebroadcasts = session.rebroadcasts();

            let offers = session
                .take_events()
                .into_iter()
                .filter(|e| matches!(e, EngineEvent::OfferExtended { .. }))
                .count();
            prop_assert!(offers <= 1, "one operation extended {} offers", offers);
        }

        run_to_terminal(&mut session, &mut now);
        prop_assert!(session.is_terminal());
        prop_assert!(session.outcome().is_some());
        prop_assert!(session.next_deadline().is_none());
    }

    /// Declining or timing out every ranked bid reaches `Exhausted` within one offer window
    /// of the last decision.
    #[test]
    fn prop_exhaustion_follows_last_decision(
        seed in 0u64..100_000u64,
        timeouts in prop::collection::vec(any::<bool>(), 6),
    ) {
        let (mut generator, providers) = fleet(seed);
        let request = generator.next_request(0);
        let config = EngineConfig::default();
        let offer_window = config.offer_window_ms;
        let ids: Vec<ProviderId> = providers.iter().map(|p| p.provider_id).collect();
        let mut session = BidSession::open(SessionId(7), request.clone(), providers, false, config, 0);
        for bid in generator.bids(&ids, &request) {
            let _ = session.submit_bid(bid, 1);
        }
        if session.close_early(2).is_err() || session.state() != SessionState::Offered {
            return Ok(());
        }

        let mut now = 2u64;
        let mut last_decision = now;
        let mut step = 0;
        while session.state() == SessionState::Offered && session.rebroadcasts() == 0 {
            let offer = session.current_offer().unwrap();
            if timeouts[step % timeouts.len()] {
                now = offer.deadline;
                session.on_deadline(now);
            } else {
                now += 1;
                session.decline("declined", now).unwrap();
            }
            last_decision = now;
            step += 1;
        }
        prop_assert_eq!(session.rank_runs(), 1);
        let exhausted = session
            .transitions()
            .iter()
            .find(|t| t.to == SessionState::Exhausted)
            .expect("session exhausted its bids");
        prop_assert!(exhausted.at <= last_decision + offer_window);
    }
}

/// Same seed ⇒ same auction outcome.
#[test]
fn deterministic_replay_same_seed_same_outcome() {
    let outcome = |seed: u64| {
        let (mut generator, providers) = fleet(seed);
        let request = generator.next_request(0);
        let ids: Vec<ProviderId> = providers.iter().map(|p| p.provider_id).collect();
        let mut session = BidSession::open(SessionId(1), request.clone(), providers, false, EngineConfig::default(), 0);
        for bid in generator.bids(&ids, &request) {
            let _ = session.submit_bid(bid, 5);
        }
        let _ = session.close_early(10);
        let winner = session.confirm(11).map(|w| w.bid.bid_id).ok();
        (winner, session.state(), session.ranked().to_vec())
    };
    assert_eq!(outcome(999), outcome(999));
}
