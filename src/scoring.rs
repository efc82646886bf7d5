//! Bid scoring and deterministic ranking.
//!
//! [`score`] is a fixed weighted sum of five normalized sub-scores (price, time,
//! reliability, experience, asset quality). [`rank`] orders scored bids by score
//! descending, then earliest submission, then provider id, so the order is total and
//! repeated calls over the same inputs always agree.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::error::EngineError;
use crate::types::{Bid, ProviderFlag, ProviderId, ProviderProfile, Request};

/// Flat multiplicative boost for requester-preferred providers.
pub const PREFERRED_BOOST: f64 = 1.10;

const WEIGHT_EPSILON: f64 = 1e-9;

/// Sub-score weights. Must be non-negative and sum to 1.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ScoreWeights {
    pub price: f64,
    pub time: f64,
    pub reliability: f64,
    pub experience: f64,
    pub quality: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            price: 0.30,
            time: 0.30,
            reliability: 0.20,
            experience: 0.10,
            quality: 0.10,
        }
    }
}

impl ScoreWeights {
    fn as_array(&self) -> [f64; 5] {
        [self.price, self.time, self.reliability, self.experience, self.quality]
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let weights = self.as_array();
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(EngineError::Validation("score weights must be finite and non-negative".into()));
        }
        let sum: f64 = weights.iter().sum();
        if (sum - 1.0).abs() > WEIGHT_EPSILON {
            return Err(EngineError::Validation(format!("score weights must sum to 1, got {sum}")));
        }
        Ok(())
    }

    /// Parses `price,time,reliability,experience,quality`.
    pub fn parse(raw: &str) -> Result<Self, EngineError> {
        let parts = raw
            .split(',')
            .map(|p| p.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| EngineError::Validation(format!("SCORE_WEIGHTS: {e}")))?;
        let [price, time, reliability, experience, quality] = parts[..] else {
            return Err(EngineError::Validation("SCORE_WEIGHTS needs exactly five values".into()));
        };
        let weights = Self { price, time, reliability, experience, quality };
        weights.validate()?;
        Ok(weights)
    }
}

/// Normalized sub-scores, each in `[0, 1]`.
#[derive(Clone, Copy, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SubScores {
    pub price: f64,
    pub time: f64,
    pub reliability: f64,
    pub experience: f64,
    pub quality: f64,
}

impl SubScores {
    fn weighted(&self, w: &ScoreWeights) -> f64 {
        self.price * w.price
            + self.time * w.time
            + self.reliability * w.reliability
            + self.experience * w.experience
            + self.quality * w.quality
    }
}

/// Min and max bid price within one session round.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PriceRange {
    pub min: Decimal,
    pub max: Decimal,
}

impl PriceRange {
    pub fn of<'a>(bids: impl IntoIterator<Item = &'a Bid>) -> Option<Self> {
        bids.into_iter().fold(None, |acc, bid| match acc {
            None => Some(Self { min: bid.price, max: bid.price }),
            Some(r) => Some(Self {
                min: r.min.min(bid.price),
                max: r.max.max(bid.price),
            }),
        })
    }

    /// Lower price maps to a higher sub-score; a degenerate range scores everyone 1.0.
    fn normalize(&self, price: Decimal) -> f64 {
        let spread = self.max - self.min;
        if spread <= Decimal::ZERO {
            return 1.0;
        }
        ((self.max - price) / spread).to_f64().unwrap_or(0.0).clamp(0.0, 1.0)
    }
}

/// Scoring inputs fixed for the lifetime of one session.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScoringContext {
    pub weights: ScoreWeights,
    pub experience_cap: u32,
    pub price_range: PriceRange,
}

/// A bid with its score and 1-based rank.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RankedBid {
    pub rank: usize,
    pub bid: Bid,
    pub score: f64,
    pub sub_scores: SubScores,
    pub preferred: bool,
}

/// Scores one bid. Returns `Ok(None)` when the requester flagged the provider as avoided.
pub fn score(
    bid: &Bid,
    request: &Request,
    profile: &ProviderProfile,
    ctx: &ScoringContext,
) -> Result<Option<(f64, SubScores)>, EngineError> {
    let flag = profile.flag_for(request.requester_id);
    if matches!(flag, Some(ProviderFlag::Avoid | ProviderFlag::Blacklisted)) {
        return Ok(None);
    }
    let subs = SubScores {
        price: ctx.price_range.normalize(bid.price),
        time: time_score(bid, request),
        reliability: profile.on_time_rate.clamp(0.0, 1.0),
        experience: experience_score(profile.completed_jobs_for(&request.required_tags), ctx.experience_cap),
        quality: profile.equipment_score.clamp(0.0, 1.0),
    };
    let mut total = subs.weighted(&ctx.weights);
    if flag == Some(ProviderFlag::Preferred) {
        total *= PREFERRED_BOOST;
    }
    if !total.is_finite() {
        return Err(EngineError::Internal(format!(
            "non-finite score for bid {} of provider {}",
            bid.bid_id.0, bid.provider_id.0
        )));
    }
    Ok(Some((total.clamp(0.0, 1.0), subs)))
}

/// Mean of pickup promptness and delivery slack, each as a share of the request window.
/// Pickup promptness falls from 1 at `earliest_start` to 0 a full window later; a pickup
/// promised before `earliest_start` earns nothing. Late delivery zeroes the whole score.
fn time_score(bid: &Bid, request: &Request) -> f64 {
    let window = request.window_ms();
    if window == 0 || bid.delivery_eta > request.latest_delivery {
        return 0.0;
    }
    let pickup = match bid.pickup_eta.checked_sub(request.earliest_start) {
        Some(lead) => 1.0 - (lead as f64 / window as f64).min(1.0),
        None => 0.0,
    };
    let slack = request.latest_delivery - bid.delivery_eta.max(request.earliest_start);
    let delivery = (slack as f64 / window as f64).clamp(0.0, 1.0);
    (pickup + delivery) / 2.0
}

fn experience_score(completed: u32, cap: u32) -> f64 {
    if cap == 0 {
        return 1.0;
    }
    let capped = completed.min(cap) as f64;
    ((1.0 + capped).ln() / (1.0 + cap as f64).ln()).clamp(0.0, 1.0)
}

/// Scores and orders `bids`. Bids without a profile or from avoided providers are dropped
/// before the price distribution is taken.
pub fn rank(
    bids: &[Bid],
    request: &Request,
    profiles: &BTreeMap<ProviderId, ProviderProfile>,
    weights: ScoreWeights,
    experience_cap: u32,
) -> Result<Vec<RankedBid>, EngineError> {
    let scorable: Vec<(&Bid, &ProviderProfile)> = bids
        .iter()
        .filter_map(|bid| profiles.get(&bid.provider_id).map(|p| (bid, p)))
        .filter(|(_, p)| {
            !matches!(
                p.flag_for(request.requester_id),
                Some(ProviderFlag::Avoid | ProviderFlag::Blacklisted)
            )
        })
        .collect();
    let Some(price_range) = PriceRange::of(scorable.iter().map(|(bid, _)| *bid)) else {
        return Ok(Vec::new());
    };
    let ctx = ScoringContext { weights, experience_cap, price_range };
    let mut ranked = Vec::with_capacity(scorable.len());
    for (bid, profile) in scorable {
        if let Some((score, sub_scores)) = score(bid, request, profile, &ctx)? {
            ranked.push(RankedBid {
                rank: 0,
                bid: bid.clone(),
                score,
                sub_scores,
                preferred: profile.flag_for(request.requester_id) == Some(ProviderFlag::Preferred),
            });
        }
    }
    ranked.sort_by(compare_ranked);
    for (i, r) in ranked.iter_mut().enumerate() {
        r.rank = i + 1;
    }
    Ok(ranked)
}

fn compare_ranked(a: &RankedBid, b: &RankedBid) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.bid.submitted_at.cmp(&b.bid.submitted_at))
        .then_with(|| a.bid.provider_id.cmp(&b.bid.provider_id))
        .then_with(|| a.bid.bid_id.cmp(&b.bid.bid_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::{Location, ServiceArea};
    use crate::types::{BidId, PriorityTier, RequestId, RequesterId, SelectionMode};
    use std::collections::BTreeSet;

    fn request() -> Request {
        Request {
            request_id: RequestId("r1".into()),
            requester_id: RequesterId(9),
            origin: Location { lat: 44.9, lon: -93.2 },
            destination: Location { lat: 45.0, lon: -93.1 },
            required_tags: BTreeSet::new(),
            size: Decimal::from(10),
            earliest_start: 0,
            latest_delivery: 100_000,
            declared_value: Decimal::from(1_000),
            priority: PriorityTier::Standard,
            selection: SelectionMode::Auto,
            supersedes: None,
            excluded_providers: BTreeSet::new(),
        }
    }

    fn profile(id: u64) -> ProviderProfile {
        ProviderProfile {
            provider_id: ProviderId(id),
            tags: BTreeSet::new(),
            capacity: Decimal::from(20),
            service_area: ServiceArea::rect(44.0, -94.0, 46.0, -92.0),
            in_flight_jobs: 0,
            max_concurrent_jobs: 3,
            on_time_rate: 0.9,
            cancellation_rate: 0.05,
            completed_jobs: 50,
            equipment_score: 0.8,
            completed_by_tag: BTreeMap::new(),
            requester_flags: BTreeMap::new(),
        }
    }

    fn bid(id: u64, provider: u64, price: i64, submitted_at: u64) -> Bid {
        Bid {
            bid_id: BidId(id),
            provider_id: ProviderId(provider),
            price: Decimal::from(price),
            pickup_eta: 10_000,
            delivery_eta: 50_000,
            confidence: 0.9,
            submitted_at,
        }
    }

    fn profiles(ids: &[u64]) -> BTreeMap<ProviderId, ProviderProfile> {
        ids.iter().map(|&id| (ProviderId(id), profile(id))).collect()
    }

    #[test]
    fn default_weights_sum_to_one() {
        assert!(ScoreWeights::default().validate().is_ok());
    }

    #[test]
    fn parse_weights() {
        let w = ScoreWeights::parse("0.4, 0.2, 0.2, 0.1, 0.1").unwrap();
        assert_eq!(w.price, 0.4);
        assert!(ScoreWeights::parse("0.5,0.5").is_err());
        assert!(ScoreWeights::parse("1.2,-0.2,0,0,0").is_err());
    }

    #[test]
    fn cheaper_bid_ranks_first_when_all_else_equal() {
        let bids = vec![bid(1, 1, 1000, 1), bid(2, 2, 900, 2), bid(3, 3, 1100, 3)];
        let ranked = rank(&bids, &request(), &profiles(&[1, 2, 3]), ScoreWeights::default(), 100).unwrap();
        let prices: Vec<i64> = ranked.iter().map(|r| r.bid.price.try_into().unwrap()).collect();
        assert_eq!(prices, vec![900, 1000, 1100]);
        assert_eq!(ranked[0].rank, 1);
        assert_eq!(ranked[0].sub_scores.price, 1.0);
        assert_eq!(ranked[2].sub_scores.price, 0.0);
    }

    #[test]
    fn ties_break_on_submission_then_provider() {
        let bids = vec![bid(1, 5, 1000, 20), bid(2, 3, 1000, 10), bid(3, 4, 1000, 10)];
        let ranked = rank(&bids, &request(), &profiles(&[3, 4, 5]), ScoreWeights::default(), 100).unwrap();
        let order: Vec<u64> = ranked.iter().map(|r| r.bid.provider_id.0).collect();
        assert_eq!(order, vec![3, 4, 5]);
    }

    #[test]
    fn ranking_is_repeatable() {
        let bids = vec![bid(1, 1, 1000, 3), bid(2, 2, 950, 1), bid(3, 3, 990, 2)];
        let p = profiles(&[1, 2, 3]);
        let a = rank(&bids, &request(), &p, ScoreWeights::default(), 100).unwrap();
        let b = rank(&bids, &request(), &p, ScoreWeights::default(), 100).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn preferred_boost_capped_at_one() {
        let mut p = profiles(&[1]);
        let prof = p.get_mut(&ProviderId(1)).unwrap();
        prof.on_time_rate = 1.0;
        prof.equipment_score = 1.0;
        prof.completed_jobs = 1000;
        prof.requester_flags.insert(RequesterId(9), ProviderFlag::Preferred);
        let mut b = bid(1, 1, 500, 1);
        b.delivery_eta = 0;
        b.pickup_eta = 0;
        let ranked = rank(&[b], &request(), &p, ScoreWeights::default(), 100).unwrap();
        assert_eq!(ranked[0].score, 1.0);
        assert!(ranked[0].preferred);
    }

    #[test]
    fn preferred_outranks_slightly_better_bid() {
        let mut p = profiles(&[1, 2, 3]);
        p.get_mut(&ProviderId(2))
            .unwrap()
            .requester_flags
            .insert(RequesterId(9), ProviderFlag::Preferred);
        let bids = vec![bid(1, 1, 1000, 1), bid(2, 2, 1010, 2), bid(3, 3, 2000, 3)];
        let ranked = rank(&bids, &request(), &p, ScoreWeights::default(), 100).unwrap();
        assert_eq!(ranked[0].bid.provider_id, ProviderId(2));
    }

    #[test]
    fn avoided_provider_excluded_not_penalized() {
        let mut p = profiles(&[1, 2]);
        p.get_mut(&ProviderId(1))
            .unwrap()
            .requester_flags
            .insert(RequesterId(9), ProviderFlag::Avoid);
        let bids = vec![bid(1, 1, 100, 1), bid(2, 2, 1000, 2)];
        let ranked = rank(&bids, &request(), &p, ScoreWeights::default(), 100).unwrap();
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].bid.provider_id, ProviderId(2));
    }

    #[test]
    fn late_delivery_scores_zero_time() {
        let mut b = bid(1, 1, 100, 1);
        b.delivery_eta = 200_000;
        assert_eq!(time_score(&b, &request()), 0.0);
        b.delivery_eta = 50_000;
        assert!((time_score(&b, &request()) - 0.7).abs() < 1e-9);
    }

    #[test]
    fn earlier_pickup_scores_higher_with_same_delivery() {
        let mut early = bid(1, 1, 100, 1);
        early.pickup_eta = 0;
        let mut late = bid(2, 2, 100, 1);
        late.pickup_eta = 49_999;
        let (e, l) = (time_score(&early, &request()), time_score(&late, &request()));
        assert!((e - 0.75).abs() < 1e-9, "got {e}");
        assert!(l < e, "late pickup {l} should trail early pickup {e}");

        let ranked = rank(&[late, early], &request(), &profiles(&[1, 2]), ScoreWeights::default(), 100).unwrap();
        assert_eq!(ranked[0].bid.provider_id, ProviderId(1));
    }

    #[test]
    fn pickup_before_earliest_start_earns_no_pickup_credit() {
        let mut r = request();
        r.earliest_start = 20_000;
        r.latest_delivery = 120_000;
        let mut b = bid(1, 1, 100, 1);
        b.pickup_eta = 10_000;
        b.delivery_eta = 70_000;
        assert!((time_score(&b, &r) - 0.25).abs() < 1e-9);
    }

    #[test]
    fn experience_counts_jobs_in_the_requested_category() {
        let mut r = request();
        r.required_tags.insert("reefer".into());
        let mut p = profiles(&[1, 2]);
        for (id, reefer_jobs) in [(1, 2), (2, 90)] {
            let prof = p.get_mut(&ProviderId(id)).unwrap();
            prof.completed_jobs = 100;
            prof.completed_by_tag.insert("reefer".into(), reefer_jobs);
        }
        let ranked = rank(&[bid(1, 1, 100, 1), bid(2, 2, 100, 1)], &r, &p, ScoreWeights::default(), 100).unwrap();
        assert_eq!(ranked[0].bid.provider_id, ProviderId(2));
        assert!(ranked[0].sub_scores.experience > ranked[1].sub_scores.experience);
    }

    #[test]
    fn experience_is_log_scaled_and_capped() {
        assert_eq!(experience_score(0, 100), 0.0);
        assert_eq!(experience_score(100, 100), 1.0);
        assert_eq!(experience_score(5000, 100), 1.0);
        let mid = experience_score(10, 100);
        assert!(mid > 0.5 && mid < 0.6, "got {mid}");
    }

    #[test]
    fn score_stays_in_unit_interval() {
        let bids = vec![bid(1, 1, 10, 1), bid(2, 2, 10_000, 2)];
        let ranked = rank(&bids, &request(), &profiles(&[1, 2]), ScoreWeights::default(), 100).unwrap();
        for r in ranked {
            assert!((0.0..=1.0).contains(&r.score));
        }
    }

    #[test]
    fn empty_bid_set_ranks_empty() {
        let ranked = rank(&[], &request(), &profiles(&[1]), ScoreWeights::default(), 100).unwrap();
        assert!(ranked.is_empty());
    }
}
