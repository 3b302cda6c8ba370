//! HTTP surface: booking, confirmation, the live floor plan and the admin
//! dashboard.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::JsonRejection;
use axum::extract::{MatchedPath, Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, warn};
use ulid::Ulid;

use crate::engine::{Engine, EngineError, ErrorKind, ProjectionPolicy, ReservationFilter, now_ms, parse_date};
use crate::model::*;
use crate::notify::Channel;
use crate::observability as obs;

/// Who may use the dashboard routes.
#[derive(Debug, Clone)]
pub struct AdminAuth {
    token: String,
    /// Lowercased allow-list.
    emails: Vec<String>,
}

impl AdminAuth {
    pub fn new(token: String, emails: Vec<String>) -> Self {
        let emails = emails.into_iter().map(|e| e.trim().to_lowercase()).collect();
        Self { token, emails }
    }

    /// `Authorization: Bearer <token>` and an allow-listed `X-Admin-Email`.
    fn allows(&self, headers: &HeaderMap) -> bool {
        let bearer = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim);
        let email = headers
            .get("x-admin-email")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_lowercase());
        match (bearer, email) {
            (Some(token), Some(email)) => token == self.token && self.emails.contains(&email),
            _ => false,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub admin: Arc<AdminAuth>,
    pub limiter: Arc<Semaphore>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>, admin: AdminAuth, max_in_flight: usize) -> Self {
        Self {
            engine,
            admin: Arc::new(admin),
            limiter: Arc::new(Semaphore::new(max_in_flight)),
        }
    }
}

// ── Errors ───────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("Unauthorized")]
    Unauthorized,
    #[error("{0}")]
    BadRequest(String),
    #[error("server busy")]
    Busy,
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Engine(e) => match e.kind() {
                ErrorKind::Validation => StatusCode::BAD_REQUEST,
                ErrorKind::Conflict => StatusCode::CONFLICT,
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                ErrorKind::Storage => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Unauthorized => StatusCode::FORBIDDEN,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Busy => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("request failed: {self}");
        }
        let body = match &self {
            ApiError::Engine(EngineError::Conflict(ids)) => json!({ "error": self.to_string(), "conflicts": ids }),
            _ => json!({ "error": self.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

fn parse_id(raw: &str) -> Result<Ulid, ApiError> {
    Ulid::from_string(raw.trim()).map_err(|_| ApiError::BadRequest(format!("invalid id: {raw}")))
}

// ── Router ───────────────────────────────────────────────

pub fn router(state: AppState) -> Router {
    let dashboard = Router::new()
        .route("/reservations", get(list_reservations))
        .route("/reservations/cancel", patch(cancel_by_body).post(cancel_by_body))
        .route("/reservations/{id}", patch(update_reservation).delete(delete_reservation))
        .route("/reservations/{id}/cancel", patch(cancel_by_path).post(cancel_by_path))
        .route("/reservations/{id}/update", patch(update_reservation))
        .route("/tables", get(dashboard_tables))
        .route("/tables/{id}/reservations", delete(delete_by_table))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));

    Router::new()
        .route("/health", get(health))
        .route("/api/reserve", post(reserve))
        .route("/api/confirm", post(confirm_by_body))
        .route("/api/confirm/{token}", post(confirm_by_path).get(confirm_by_path))
        .route("/api/tables", get(list_tables))
        .route("/api/events", get(floor_events))
        .route("/api/events/tables/{id}", get(table_events))
        .nest("/api/dashboard", dashboard)
        .route_layer(middleware::from_fn(track_requests))
        .layer(middleware::from_fn_with_state(state.clone(), limit_in_flight))
        .with_state(state)
}

async fn track_requests(request: Request, next: Next) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map_or("other", |p| obs::route_label(p.as_str()));
    let start = Instant::now();
    let response = next.run(request).await;
    metrics::histogram!(obs::HTTP_REQUEST_DURATION_SECONDS, "route" => route)
        .record(start.elapsed().as_secs_f64());
    metrics::counter!(
        obs::HTTP_REQUESTS_TOTAL,
        "route" => route,
        "status" => response.status().as_u16().to_string()
    )
    .increment(1);
    response
}

async fn limit_in_flight(State(state): State<AppState>, request: Request, next: Next) -> Result<Response, ApiError> {
    let Ok(_permit) = state.limiter.clone().try_acquire_owned() else {
        metrics::counter!(obs::REQUESTS_REJECTED_TOTAL).increment(1);
        warn!("request limit reached, rejecting {}", request.uri().path());
        return Err(ApiError::Busy);
    };
    Ok(next.run(request).await)
}

async fn require_admin(State(state): State<AppState>, request: Request, next: Next) -> Result<Response, ApiError> {
    if !state.admin.allows(request.headers()) {
        metrics::counter!(obs::AUTH_FAILURES_TOTAL).increment(1);
        return Err(ApiError::Unauthorized);
    }
    Ok(next.run(request).await)
}

// ── Public routes ────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "tables": state.engine.table_count(),
        "reservations": state.engine.reservation_count(),
    }))
}

async fn reserve(
    State(state): State<AppState>,
    body: Result<Json<ReservationRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(request) = body?;
    let reservation = state.engine.create_reservation(request, now_ms()).await?;
    Ok(Json(json!({ "success": true, "reservationId": reservation.id })))
}

#[derive(Debug, Deserialize)]
struct ConfirmBody {
    #[serde(default)]
    token: Option<String>,
}

fn confirm_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "status": "error", "message": message }))).into_response()
}

async fn confirm_token(engine: &Engine, token: Option<&str>) -> Response {
    let Some(token) = token.map(str::trim).filter(|t| !t.is_empty()) else {
        return confirm_error(StatusCode::BAD_REQUEST, "Token missing");
    };
    match engine.confirm(token, now_ms()).await {
        Ok(outcome) => Json(json!({ "status": outcome.status })).into_response(),
        Err(e) if e.kind() == ErrorKind::NotFound => confirm_error(StatusCode::NOT_FOUND, "Invalid token"),
        Err(e) => {
            error!("confirmation failed: {e}");
            confirm_error(StatusCode::INTERNAL_SERVER_ERROR, "Could not confirm reservation")
        }
    }
}

async fn confirm_by_body(State(state): State<AppState>, body: Result<Json<ConfirmBody>, JsonRejection>) -> Response {
    let token = body.ok().and_then(|Json(b)| b.token);
    confirm_token(&state.engine, token.as_deref()).await
}

async fn confirm_by_path(State(state): State<AppState>, Path(token): Path<String>) -> Response {
    confirm_token(&state.engine, Some(&token)).await
}

async fn list_tables(State(state): State<AppState>) -> Json<Vec<TableView>> {
    Json(state.engine.list_tables(now_ms(), ProjectionPolicy::Floor).await)
}

// ── Live updates ─────────────────────────────────────────

/// Tracks one open stream in the subscriber gauge.
struct SubscriberGauge;

impl SubscriberGauge {
    fn open() -> Self {
        metrics::gauge!(obs::SUBSCRIBERS_ACTIVE).increment(1.0);
        SubscriberGauge
    }
}

impl Drop for SubscriberGauge {
    fn drop(&mut self) {
        metrics::gauge!(obs::SUBSCRIBERS_ACTIVE).decrement(1.0);
    }
}

struct Subscription {
    engine: Arc<Engine>,
    channel: Channel,
    rx: broadcast::Receiver<Update>,
    _gauge: SubscriberGauge,
}

impl Subscription {
    /// Current state after falling behind. None once the table is gone.
    async fn resync(&self) -> Option<Update> {
        let now = now_ms();
        match self.channel {
            Channel::Floor => Some(self.engine.snapshot(now).await),
            Channel::Table(id) => self
                .engine
                .table_view(id, now, ProjectionPolicy::Floor)
                .await
                .ok()
                .map(Update::Table),
        }
    }
}

fn sse_event(update: &Update) -> Result<SseEvent, axum::Error> {
    SseEvent::default().event(UPDATE_EVENT).json_data(update)
}

fn live_stream(first: Update, subscription: Subscription) -> impl Stream<Item = Result<SseEvent, axum::Error>> {
    let rest = stream::unfold(subscription, |mut sub| async move {
        let update = match sub.rx.recv().await {
            Ok(update) => update,
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, "live subscriber lagged, resending state");
                sub.resync().await?
            }
            Err(RecvError::Closed) => return None,
        };
        Some((sse_event(&update), sub))
    });
    stream::once(async move { sse_event(&first) }).chain(rest)
}

/// Floor-plan stream: one snapshot, then per-table deltas.
async fn floor_events(State(state): State<AppState>) -> Sse<impl Stream<Item = Result<SseEvent, axum::Error>>> {
    let rx = state.engine.dispatcher().hub().subscribe(Channel::Floor);
    let first = state.engine.snapshot(now_ms()).await;
    let subscription = Subscription {
        engine: state.engine.clone(),
        channel: Channel::Floor,
        rx,
        _gauge: SubscriberGauge::open(),
    };
    Sse::new(live_stream(first, subscription)).keep_alive(KeepAlive::default())
}

async fn table_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, axum::Error>>>, ApiError> {
    let id = parse_id(&id)?;
    let rx = state.engine.dispatcher().hub().subscribe(Channel::Table(id));
    let view = state
        .engine
        .table_view(id, now_ms(), ProjectionPolicy::Floor)
        .await?;
    let subscription = Subscription {
        engine: state.engine.clone(),
        channel: Channel::Table(id),
        rx,
        _gauge: SubscriberGauge::open(),
    };
    Ok(Sse::new(live_stream(Update::Table(view), subscription)).keep_alive(KeepAlive::default()))
}

// ── Dashboard ────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    date: Option<String>,
    include_past: Option<String>,
}

async fn list_reservations(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<ReservationDetail>>, ApiError> {
    let date = query
        .date
        .as_deref()
        .filter(|d| !d.trim().is_empty())
        .map(parse_date)
        .transpose()?;
    let include_past = query
        .include_past
        .as_deref()
        .is_some_and(|v| matches!(v.trim(), "true" | "1" | "yes"));
    let filter = ReservationFilter { date, include_past };
    Ok(Json(state.engine.list_reservations(filter, now_ms()).await))
}

async fn dashboard_tables(State(state): State<AppState>) -> Json<Vec<TableView>> {
    Json(state.engine.list_tables(now_ms(), ProjectionPolicy::Dashboard).await)
}

#[derive(Debug, Deserialize)]
struct CancelBody {
    id: Option<String>,
}

async fn cancel(engine: &Engine, id: Ulid) -> Result<Json<ReservationDetail>, ApiError> {
    let now = now_ms();
    engine.cancel(id, now).await?;
    Ok(Json(engine.get_reservation(id, now).await?))
}

async fn cancel_by_path(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ReservationDetail>, ApiError> {
    cancel(&state.engine, parse_id(&id)?).await
}

async fn cancel_by_body(
    State(state): State<AppState>,
    body: Result<Json<CancelBody>, JsonRejection>,
) -> Result<Json<ReservationDetail>, ApiError> {
    let Json(body) = body?;
    let id = body
        .id
        .ok_or_else(|| ApiError::BadRequest("missing field: id".into()))?;
    cancel(&state.engine, parse_id(&id)?).await
}

async fn update_reservation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<ReservationPatch>, JsonRejection>,
) -> Result<Json<ReservationDetail>, ApiError> {
    let id = parse_id(&id)?;
    let Json(patch) = body?;
    let now = now_ms();
    state.engine.update(id, patch, now).await?;
    Ok(Json(state.engine.get_reservation(id, now).await?))
}

async fn delete_reservation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = parse_id(&id)?;
    state.engine.delete_reservation(id, now_ms()).await?;
    Ok(Json(json!({ "success": true, "id": id })))
}

async fn delete_by_table(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let table_id = parse_id(&id)?;
    let outcome = state.engine.delete_by_table(table_id, now_ms()).await?;
    Ok(Json(json!({
        "success": true,
        "unlinked": outcome.unlinked,
        "deleted": outcome.deleted,
    })))
}
