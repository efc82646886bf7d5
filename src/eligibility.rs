//! Eligibility filter: which providers may bid on a request.
//!
//! [`filter`] is pure and deterministic. An empty result is a normal outcome; the
//! session reacts to it by relaxing eligibility (see [`Relaxation::for_attempt`]).

use rust_decimal::Decimal;

use crate::config::EngineConfig;
use crate::types::{ProviderFlag, ProviderId, ProviderProfile, Request};

/// Eligibility parameters in force for one broadcast round.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Relaxation {
    /// 0 for the original broadcast, n for the n-th re-broadcast.
    pub level: u32,
    pub capacity_margin: Decimal,
    /// Providers whose service area lies within this distance of a stop still qualify.
    pub area_buffer_km: f64,
}

impl Relaxation {
    /// Parameters for broadcast `attempt` (0 = original). Each level lowers the capacity
    /// margin by `margin_step` (never below zero) and widens the area buffer by `area_step_km`.
    pub fn for_attempt(config: &EngineConfig, attempt: u32) -> Self {
        let margin = config.capacity_margin - config.margin_step * Decimal::from(attempt);
        Self {
            level: attempt,
            capacity_margin: margin.max(Decimal::ZERO),
            area_buffer_km: config.area_step_km * attempt as f64,
        }
    }
}

/// Returns the ids of providers allowed to bid, in ascending id order.
pub fn filter(request: &Request, snapshot: &[ProviderProfile], relaxation: &Relaxation) -> Vec<ProviderId> {
    let required = request.size * (Decimal::ONE + relaxation.capacity_margin);
    let mut out: Vec<ProviderId> = snapshot
        .iter()
        .filter(|p| is_candidate(request, p, required, relaxation.area_buffer_km))
        .map(|p| p.provider_id)
        .collect();
    out.sort();
    out.dedup();
    out
}

fn is_candidate(request: &Request, p: &ProviderProfile, required_capacity: Decimal, buffer_km: f64) -> bool {
    if request.excluded_providers.contains(&p.provider_id) {
        return false;
    }
    if p.flag_for(request.requester_id) == Some(ProviderFlag::Blacklisted) {
        return false;
    }
    if !request.required_tags.is_subset(&p.tags) {
        return false;
    }
    if p.capacity < required_capacity {
        return false;
    }
    if p.in_flight_jobs >= p.max_concurrent_jobs {
        return false;
    }
    p.service_area.covers(request.origin, buffer_km) && p.service_area.covers(request.destination, buffer_km)
}
