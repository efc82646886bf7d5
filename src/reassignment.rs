//! Reassignment after a matched provider withdraws.
//!
//! A failure report against a matched session derives a new request covering the
//! remaining work, escalates its priority tier, bars the withdrawn provider and opens it
//! through the normal session path. The original session is marked `Superseded` and
//! keeps a link to the derived one; it is never reopened.

use log::{info, warn};
use rust_decimal::Decimal;

use crate::error::EngineError;
use crate::geo::Location;
use crate::manager::SessionManager;
use crate::session::SessionRecord;
use crate::types::{PriorityTier, RequestId, SelectionMode, SessionId, SessionState};

/// Which part of the job still has to be done.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkScope {
    /// Nothing was picked up; the whole request is re-auctioned.
    #[default]
    Entire,
    /// Cargo is partway: a new leg starts at `origin`.
    RemainingLeg {
        origin: Location,
        #[serde(default)]
        destination: Option<Location>,
        #[serde(default)]
        size: Option<Decimal>,
    },
}

#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RemainingWork {
    #[serde(default)]
    pub scope: WorkScope,
    /// Cargo is already loaded; the derived request goes out as `Emergency`.
    #[serde(default)]
    pub in_transit: bool,
    #[serde(default)]
    pub reason: String,
}

/// Next lineage id: `job` → `job/r1`, `job/r1` → `job/r2`.
pub fn next_derived_id(id: &RequestId) -> RequestId {
    if let Some((base, n)) = id.0.rsplit_once("/r") {
        if let Ok(n) = n.parse::<u32>() {
            return RequestId(format!("{base}/r{}", n + 1));
        }
    }
    RequestId(format!("{}/r1", id.0))
}

/// Builds the request for the remaining work of `original`, as of `now`.
pub fn derive_request(
    original: &SessionRecord,
    work: &RemainingWork,
    now: u64,
    config: &crate::config::EngineConfig,
) -> Result<crate::types::Request, EngineError> {
    let Some(winner) = original.winner.as_ref() else {
        return Err(EngineError::invalid_state("report_failure", original.state));
    };
    let base = &original.request;
    let mut request = base.clone();
    request.request_id = next_derived_id(&base.request_id);
    request.supersedes = Some(base.request_id.clone());
    request.excluded_providers.insert(winner.bid.provider_id);
    request.priority = if work.in_transit {
        PriorityTier::Emergency
    } else {
        base.priority.escalate()
    };
    if request.priority == PriorityTier::Emergency {
        request.selection = SelectionMode::Auto;
    }
    if let WorkScope::RemainingLeg { origin, destination, size } = &work.scope {
        request.origin = *origin;
        if let Some(destination) = destination {
            request.destination = *destination;
        }
        if let Some(size) = size {
            request.size = *size;
        }
    }
    request.earliest_start = now;
    let auction_span = config.open_window_for(request.priority) + config.offer_window_ms;
    request.latest_delivery = base.latest_delivery.max(now + auction_span);
    request.validate()?;
    Ok(request)
}

/// Handles provider withdrawals for matched sessions.
#[derive(Clone)]
pub struct ReassignmentCoordinator {
    manager: SessionManager,
}

impl ReassignmentCoordinator {
    pub fn new(manager: SessionManager) -> Self {
        Self { manager }
    }

    /// Opens a derived session for the remaining work of `original` and supersedes it.
    /// Concurrent reports against the same session are refused with a conflict.
    pub async fn report_failure(&self, original: SessionId, work: RemainingWork) -> Result<SessionId, EngineError> {
        let detail = serde_json::json!({ "in_transit": work.in_transit, "reason": work.reason });
        let result = if self.manager.claim_reassignment(original) {
            let result = self.reassign(original, &work).await;
            self.manager.release_reassignment(original);
            result
        } else {
            Err(EngineError::ConcurrencyConflict {
                session: original,
                reason: "reassignment already in progress".into(),
            })
        };
        self.manager
            .audit("provider", "failure_report", Some(original), Some(detail), &result);
        result
    }

    async fn reassign(&self, original: SessionId, work: &RemainingWork) -> Result<SessionId, EngineError> {
        let mut record = self.manager.settled_record(original, "report_failure").await?;
        if record.state != SessionState::Matched {
            return Err(EngineError::invalid_state("report_failure", record.state));
        }
        let now = self.manager.now_ms();
        let request = derive_request(&record, work, now, self.manager.config())?;
        let priority = request.priority;
        let derived = self.manager.open_session(request, Some(original))?;
        let event = record.supersede(derived, now)?;
        if let Err(e) = self.manager.store_record(&record) {
            warn!("failed to archive superseded session session_id={} error={}", original.0, e);
        }
        if self.manager.release_capacity(original).is_none() {
            warn!("superseded session held no reservation session_id={}", original.0);
        }
        self.manager.emit(event);
        info!(
            "session reassigned session_id={} derived_session_id={} priority={:?} in_transit={} reason={}",
            original.0, derived.0, priority, work.in_transit, work.reason
        );
        Ok(derived)
    }
}
