//! Synthetic marketplace generator.
//!
//! Deterministic provider fleets, requests and bids for demos, load tests and
//! benchmarks. Same seed ⇒ same fleet and same streams.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet};

use crate::geo::{Location, ServiceArea};
use crate::types::{
    Bid, BidId, PriorityTier, ProviderId, ProviderProfile, Request, RequestId, RequesterId, SelectionMode,
};

/// All ranges are inclusive.
#[derive(Clone, Debug)]
pub struct GeneratorConfig {
    pub seed: u64,
    pub num_providers: u64,
    pub num_requesters: u64,
    /// Operating region `(min_lat, min_lon, max_lat, max_lon)`; requests fall inside it.
    pub region: (f64, f64, f64, f64),
    pub price_min: i64,
    pub price_max: i64,
    pub size_min: i64,
    pub size_max: i64,
    /// Pool of capability tags; each provider gets a random subset.
    pub tags: Vec<String>,
    /// Probability a request requires one tag from the pool.
    pub tagged_ratio: f64,
    /// Probability a request is Express, then Emergency; Standard otherwise.
    pub express_ratio: f64,
    pub emergency_ratio: f64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            num_providers: 20,
            num_requesters: 5,
            region: (44.8, -93.4, 45.1, -93.0),
            price_min: 200,
            price_max: 2_000,
            size_min: 1,
            size_max: 20,
            tags: vec!["refrigerated".into(), "liftgate".into(), "hazmat".into()],
            tagged_ratio: 0.2,
            express_ratio: 0.2,
            emergency_ratio: 0.05,
        }
    }
}

pub struct Generator {
    rng: StdRng,
    config: GeneratorConfig,
    next_request: u64,
    next_bid: u64,
}

impl Generator {
    pub fn new(config: GeneratorConfig) -> Self {
        Self {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            next_request: 1,
            next_bid: 1,
        }
    }

    fn point(&mut self) -> Location {
        let (min_lat, min_lon, max_lat, max_lon) = self.config.region;
        Location {
            lat: self.rng.gen_range(min_lat..=max_lat),
            lon: self.rng.gen_range(min_lon..=max_lon),
        }
    }

    /// Provider fleet with ids `1..=num_providers`. Every service area covers the region,
    /// padded by a random margin.
    pub fn providers(&mut self) -> Vec<ProviderProfile> {
        let (min_lat, min_lon, max_lat, max_lon) = self.config.region;
        (1..=self.config.num_providers)
            .map(|id| {
                let pad = self.rng.gen_range(0.0..0.2);
                let tags: BTreeSet<String> = self
                    .config
                    .tags
                    .iter()
                    .filter(|_| self.rng.gen_bool(0.5))
                    .cloned()
                    .collect();
                let completed_jobs = self.rng.gen_range(0..=250);
                let completed_by_tag = tags
                    .iter()
                    .map(|tag| (tag.clone(), self.rng.gen_range(0..=completed_jobs)))
                    .collect();
                ProviderProfile {
                    provider_id: ProviderId(id),
                    tags,
                    capacity: Decimal::from(self.rng.gen_range(self.config.size_max..=self.config.size_max * 3)),
                    service_area: ServiceArea::rect(min_lat - pad, min_lon - pad, max_lat + pad, max_lon + pad),
                    in_flight_jobs: 0,
                    max_concurrent_jobs: self.rng.gen_range(1..=5),
                    on_time_rate: self.rng.gen_range(0.6..=1.0),
                    cancellation_rate: self.rng.gen_range(0.0..=0.2),
                    completed_jobs,
                    equipment_score: self.rng.gen_range(0.3..=1.0),
                    completed_by_tag,
                    requester_flags: BTreeMap::new(),
                }
            })
            .collect()
    }

    /// Next request, open for delivery within the next day.
    pub fn next_request(&mut self, now: u64) -> Request {
        let id = self.next_request;
        self.next_request += 1;
        let r = self.rng.gen::<f64>();
        let priority = if r < self.config.emergency_ratio {
            PriorityTier::Emergency
        } else if r < self.config.emergency_ratio + self.config.express_ratio {
            PriorityTier::Express
        } else {
            PriorityTier::Standard
        };
        let mut required_tags = BTreeSet::new();
        if !self.config.tags.is_empty() && self.rng.gen::<f64>() < self.config.tagged_ratio {
            let i = self.rng.gen_range(0..self.config.tags.len());
            required_tags.insert(self.config.tags[i].clone());
        }
        Request {
            request_id: RequestId(format!("sim-{id}")),
            requester_id: RequesterId(self.rng.gen_range(1..=self.config.num_requesters.max(1))),
            origin: self.point(),
            destination: self.point(),
            required_tags,
            size: Decimal::from(self.rng.gen_range(self.config.size_min..=self.config.size_max)),
            earliest_start: now,
            latest_delivery: now + 24 * 3_600_000,
            declared_value: Decimal::from(self.rng.gen_range(100..=50_000)),
            priority,
            selection: SelectionMode::Auto,
            supersedes: None,
            excluded_providers: BTreeSet::new(),
        }
    }

    /// One bid from `provider` against `request`, promising delivery inside its window.
    pub fn bid(&mut self, provider: ProviderId, request: &Request) -> Bid {
        let id = self.next_bid;
        self.next_bid += 1;
        let window = request.window_ms().max(2);
        let pickup = request.earliest_start + self.rng.gen_range(0..window / 2);
        let delivery = pickup + self.rng.gen_range(1..=window / 2);
        Bid {
            bid_id: BidId(id),
            provider_id: provider,
            price: Decimal::from(self.rng.gen_range(self.config.price_min..=self.config.price_max)),
            pickup_eta: pickup,
            delivery_eta: delivery,
            confidence: self.rng.gen_range(0.5..=1.0),
            submitted_at: 0,
        }
    }

    /// Bids from every listed provider.
    pub fn bids(&mut self, providers: &[ProviderId], request: &Request) -> Vec<Bid> {
        providers.iter().map(|&p| self.bid(p, request)).collect()
    }
}
