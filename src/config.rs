//! Per-deployment engine configuration.
//!
//! Defaults follow the dispatch contract (5 min open window, 30 s offer window, 60 s
//! emergency window, two re-broadcasts). [`EngineConfig::from_env`] overrides individual
//! values from environment variables:
//!
//! | Variable | Meaning |
//! |---|---|
//! | `OPEN_WINDOW_SECS` | bid collection window |
//! | `OFFER_WINDOW_SECS` | per-offer confirmation window |
//! | `EMERGENCY_OPEN_WINDOW_SECS` | open window for emergency requests |
//! | `SELECTION_WINDOW_SECS` | manual selection fallback |
//! | `MAX_REBROADCASTS` | re-broadcast cap |
//! | `CAPACITY_MARGIN` | capacity safety margin (decimal, e.g. `0.15`) |
//! | `SCORE_WEIGHTS` | five comma-separated weights: price,time,reliability,experience,quality |

use rust_decimal::Decimal;
use std::str::FromStr;

use crate::error::EngineError;
use crate::scoring::ScoreWeights;
use crate::types::PriorityTier;

/// Upper bound for any configured window (one year).
const MAX_WINDOW_MS: u64 = 365 * 24 * 3_600_000;

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct EngineConfig {
    pub open_window_ms: u64,
    pub offer_window_ms: u64,
    pub emergency_open_window_ms: u64,
    pub selection_window_ms: u64,
    pub max_rebroadcasts: u32,
    /// Base capacity safety margin (0.15 = request size must fit with 15% headroom).
    pub capacity_margin: Decimal,
    /// Margin removed per re-broadcast (floored at zero).
    pub margin_step: Decimal,
    /// Service-area buffer added per re-broadcast.
    pub area_step_km: f64,
    /// Completed-job count at which the experience sub-score saturates.
    pub experience_cap: u32,
    pub weights: ScoreWeights,
    /// Capacity of the out-event broadcast channel.
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            open_window_ms: 5 * 60 * 1000,
            offer_window_ms: 30 * 1000,
            emergency_open_window_ms: 60 * 1000,
            selection_window_ms: 2 * 60 * 1000,
            max_rebroadcasts: 2,
            capacity_margin: Decimal::new(15, 2),
            margin_step: Decimal::new(5, 2),
            area_step_km: 25.0,
            experience_cap: 100,
            weights: ScoreWeights::default(),
            event_buffer: 256,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by process environment variables.
    pub fn from_env() -> Result<Self, EngineError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by `lookup(name)`; used by [`Self::from_env`] and tests.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, EngineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(ms) = parse_secs(&lookup, "OPEN_WINDOW_SECS")? {
            config.open_window_ms = ms;
        }
        if let Some(ms) = parse_secs(&lookup, "OFFER_WINDOW_SECS")? {
            config.offer_window_ms = ms;
        }
        if let Some(ms) = parse_secs(&lookup, "EMERGENCY_OPEN_WINDOW_SECS")? {
            config.emergency_open_window_ms = ms;
        }
        if let Some(ms) = parse_secs(&lookup, "SELECTION_WINDOW_SECS")? {
            config.selection_window_ms = ms;
        }
        if let Some(cap) = parse::<u32>(&lookup, "MAX_REBROADCASTS")? {
            config.max_rebroadcasts = cap;
        }
        if let Some(margin) = parse::<Decimal>(&lookup, "CAPACITY_MARGIN")? {
            config.capacity_margin = margin;
        }
        if let Some(raw) = lookup("SCORE_WEIGHTS") {
            config.weights = ScoreWeights::parse(&raw)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.open_window_ms == 0 || self.offer_window_ms == 0 || self.emergency_open_window_ms == 0 {
            return Err(EngineError::Validation("time windows must be non-zero".into()));
        }
        let windows = [
            self.open_window_ms,
            self.offer_window_ms,
            self.emergency_open_window_ms,
            self.selection_window_ms,
        ];
        if windows.iter().any(|w| *w > MAX_WINDOW_MS) {
            return Err(EngineError::Validation("time windows must not exceed one year".into()));
        }
        if self.capacity_margin < Decimal::ZERO || self.margin_step < Decimal::ZERO {
            return Err(EngineError::Validation("capacity margins must not be negative".into()));
        }
        if self.area_step_km.is_nan() || self.area_step_km < 0.0 {
            return Err(EngineError::Validation("area_step_km must not be negative".into()));
        }
        if self.event_buffer == 0 {
            return Err(EngineError::Validation("event_buffer must be positive".into()));
        }
        self.weights.validate()
    }

    /// Open window for a request of the given tier.
    pub fn open_window_for(&self, priority: PriorityTier) -> u64 {
        match priority {
            PriorityTier::Emergency => self.emergency_open_window_ms,
            PriorityTier::Standard | PriorityTier::Express => self.open_window_ms,
        }
    }
}

/// Reads a whole-second duration and returns it in milliseconds.
fn parse_secs(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<u64>, EngineError> {
    let Some(secs) = parse::<u64>(lookup, key)? else {
        return Ok(None);
    };
    secs
        .checked_mul(1000)
        .filter(|ms| *ms <= MAX_WINDOW_MS)
        .map(Some)
        .ok_or_else(|| EngineError::Validation(format!("{key}: {secs} seconds is out of range")))
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, EngineError>
where
    T: FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| EngineError::Validation(format!("{key}: cannot parse {raw:?}"))),
    }
}
