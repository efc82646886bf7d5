//! REST + WebSocket API for the auction engine.
//!
//! Used by the binary and by integration tests. Create with [`create_router`].
//! Uses Extension for state so the router is `Router<()>` and works with `into_make_service()`.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Extension, Path, Query,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use log::{debug, info, warn};
use tokio::sync::broadcast::error::RecvError;

use crate::error::EngineError;
use crate::manager::SessionManager;
use crate::reassignment::{ReassignmentCoordinator, RemainingWork};
use crate::types::{Bid, BidId, Request, SessionId};

/// Shared app state: one manager per process.
#[derive(Clone)]
pub struct AppState {
    pub(crate) manager: SessionManager,
    pub(crate) coordinator: ReassignmentCoordinator,
}

/// Builds the router with state. Returns `Router<()>` so you can call `.into_make_service()` for `axum::serve`.
pub fn create_router(manager: SessionManager) -> Router<()> {
    let state = AppState {
        coordinator: ReassignmentCoordinator::new(manager.clone()),
        manager,
    };
    Router::new()
        .route("/health", get(health))
        .route("/requests", post(submit_request))
        .route("/sessions/:id", get(session_view))
        .route("/sessions/:id/bids", post(submit_bid))
        .route("/sessions/:id/close", post(close_early))
        .route("/sessions/:id/select", post(select_bid))
        .route("/sessions/:id/confirm", post(confirm_offer))
        .route("/sessions/:id/decline", post(decline_offer))
        .route("/sessions/:id/cancel", post(cancel_session))
        .route("/sessions/:id/failure", post(report_failure))
        .route("/sessions/:id/completed", post(job_completed))
        .route("/ws/events", get(events_ws))
        .layer(Extension(state))
}

/// Error body: `{"error": "...", "reason": "window_closed"}` (`reason` only for bid rejections).
struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::Validation(_) => StatusCode::BAD_REQUEST,
            EngineError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            EngineError::BidRejected(_)
            | EngineError::InvalidState { .. }
            | EngineError::ReBroadcastCapExceeded { .. }
            | EngineError::CapacityExceeded(_)
            | EngineError::ConcurrencyConflict { .. } => StatusCode::CONFLICT,
            EngineError::CollaboratorUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Archive(_) | EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = match &self.0 {
            EngineError::BidRejected(reason) => serde_json::json!({ "error": self.0.to_string(), "reason": reason }),
            e => serde_json::json!({ "error": e.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

#[derive(serde::Serialize)]
struct Opened {
    session_id: SessionId,
}

async fn submit_request(Extension(state): Extension<AppState>, Json(request): Json<Request>) -> Response {
    match state.manager.submit_request(request).await {
        Ok(session_id) => (StatusCode::CREATED, Json(Opened { session_id })).into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

async fn session_view(
    Extension(state): Extension<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<crate::session::SessionView> {
    Ok(Json(state.manager.session_view(SessionId(id)).await?))
}

async fn submit_bid(
    Extension(state): Extension<AppState>,
    Path(id): Path<u64>,
    Json(bid): Json<Bid>,
) -> ApiResult<crate::session::BidAck> {
    Ok(Json(state.manager.submit_bid(SessionId(id), bid).await?))
}

async fn close_early(
    Extension(state): Extension<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<crate::session::SessionView> {
    let id = SessionId(id);
    state.manager.close_early(id).await?;
    Ok(Json(state.manager.session_view(id).await?))
}

#[derive(serde::Deserialize)]
struct SelectBody {
    bid_id: u64,
}

async fn select_bid(
    Extension(state): Extension<AppState>,
    Path(id): Path<u64>,
    Json(body): Json<SelectBody>,
) -> ApiResult<crate::session::Offer> {
    Ok(Json(state.manager.select_bid(SessionId(id), BidId(body.bid_id)).await?))
}

async fn confirm_offer(
    Extension(state): Extension<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<crate::scoring::RankedBid> {
    Ok(Json(state.manager.confirm_offer(SessionId(id)).await?))
}

async fn decline_offer(
    Extension(state): Extension<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<crate::session::SessionView> {
    let id = SessionId(id);
    state.manager.decline_offer(id).await?;
    Ok(Json(state.manager.session_view(id).await?))
}

#[derive(serde::Deserialize)]
struct CancelBody {
    #[serde(default)]
    reason: Option<String>,
}

async fn cancel_session(
    Extension(state): Extension<AppState>,
    Path(id): Path<u64>,
    body: Option<Json<CancelBody>>,
) -> ApiResult<crate::session::SessionView> {
    let id = SessionId(id);
    let reason = body
        .and_then(|Json(b)| b.reason)
        .unwrap_or_else(|| "cancelled by requester".into());
    state.manager.cancel_session(id, reason).await?;
    Ok(Json(state.manager.session_view(id).await?))
}

#[derive(serde::Serialize)]
struct Reassigned {
    derived_session_id: SessionId,
}

async fn report_failure(
    Extension(state): Extension<AppState>,
    Path(id): Path<u64>,
    Json(work): Json<RemainingWork>,
) -> Response {
    match state.coordinator.report_failure(SessionId(id), work).await {
        Ok(derived_session_id) => (StatusCode::CREATED, Json(Reassigned { derived_session_id })).into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

async fn job_completed(
    Extension(state): Extension<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<serde_json::Value> {
    state.manager.job_completed(SessionId(id)).await?;
    Ok(Json(serde_json::json!({ "released": true })))
}

#[derive(serde::Deserialize)]
struct EventsParams {
    /// Only forward events for this session.
    session_id: Option<u64>,
}

async fn events_ws(
    ws: WebSocketUpgrade,
    Query(params): Query<EventsParams>,
    Extension(state): Extension<AppState>,
) -> impl IntoResponse {
    let filter = params.session_id.map(SessionId);
    ws.on_upgrade(move |socket| stream_events(socket, state.manager, filter))
}

/// Forwards engine events as JSON text frames until the client goes away.
async fn stream_events(mut socket: WebSocket, manager: SessionManager, filter: Option<SessionId>) {
    let mut events = manager.subscribe();
    info!("event stream connected filter={:?}", filter.map(|s| s.0));
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if filter.is_some_and(|id| id != event.session_id()) {
                        continue;
                    }
                    let Ok(json) = serde_json::to_string(&event) else { continue };
                    if socket.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("event stream lagging, skipped={}", skipped);
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Ping(payload))) => {
                    if socket.send(Message::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(other)) => debug!("ignoring client frame {:?}", other),
            },
        }
    }
    info!("event stream disconnected filter={:?}", filter.map(|s| s.0));
}
