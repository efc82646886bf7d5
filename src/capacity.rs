//! Capacity accounting across sessions.
//!
//! Each confirmed match reserves `size` units of the winning provider's declared capacity
//! over the promised execution window (pickup to delivery). A confirmation that would
//! push overlapping reservations past the declared capacity, or past the provider's
//! concurrent-job ceiling, is denied.

use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::types::{ProviderId, ProviderProfile, SessionId};

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Reservation {
    pub session_id: SessionId,
    pub provider_id: ProviderId,
    pub size: Decimal,
    /// Execution window `[start, end)`, UTC ms.
    pub start: u64,
    pub end: u64,
}

impl Reservation {
    fn overlaps(&self, other: &Reservation) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum CapacityDenial {
    ConcurrentJobs { overlapping: usize, max: u32 },
    Capacity { reserved: Decimal, requested: Decimal, declared: Decimal },
}

impl std::fmt::Display for CapacityDenial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CapacityDenial::ConcurrentJobs { overlapping, max } => {
                write!(f, "capacity_exceeded: {overlapping} overlapping jobs, ceiling {max}")
            }
            CapacityDenial::Capacity { reserved, requested, declared } => write!(
                f,
                "capacity_exceeded: {reserved} reserved + {requested} requested > {declared} declared"
            ),
        }
    }
}

#[derive(Debug, Default)]
pub struct CapacityLedger {
    by_provider: HashMap<ProviderId, Vec<Reservation>>,
}

impl CapacityLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves capacity for a confirmation. Re-reserving for the same session is a no-op.
    pub fn try_reserve(&mut self, reservation: Reservation, profile: &ProviderProfile) -> Result<(), CapacityDenial> {
        let existing = self.by_provider.entry(reservation.provider_id).or_default();
        if existing.iter().any(|r| r.session_id == reservation.session_id) {
            return Ok(());
        }
        let overlapping: Vec<&Reservation> = existing.iter().filter(|r| r.overlaps(&reservation)).collect();
        if overlapping.len() + 1 > profile.max_concurrent_jobs as usize {
            return Err(CapacityDenial::ConcurrentJobs {
                overlapping: overlapping.len(),
                max: profile.max_concurrent_jobs,
            });
        }
        let reserved: Decimal = overlapping.iter().map(|r| r.size).sum();
        if reserved + reservation.size > profile.capacity {
            return Err(CapacityDenial::Capacity {
                reserved,
                requested: reservation.size,
                declared: profile.capacity,
            });
        }
        existing.push(reservation);
        Ok(())
    }

    /// Releases the reservation held by `session_id`, if any.
    pub fn release(&mut self, session_id: SessionId) -> Option<Reservation> {
        for reservations in self.by_provider.values_mut() {
            if let Some(pos) = reservations.iter().position(|r| r.session_id == session_id) {
                return Some(reservations.remove(pos));
            }
        }
        None
    }

    pub fn reservations_for(&self, provider: ProviderId) -> &[Reservation] {
        self.by_provider.get(&provider).map(Vec::as_slice).unwrap_or(&[])
    }
}
