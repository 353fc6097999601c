//! HTTP routes: order actions, state snapshots, and the SSE event stream.
//!
//! The SSE endpoint is a thin loop over the event log's `read_since` +
//! `block_until_newer` pair. Clients resume after a disconnect by passing
//! their last-seen id back as `from_id`; a cursor that has fallen out of the
//! retained window silently resumes from the oldest retained event, and the
//! client is expected to re-fetch order state from the snapshot endpoints.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    response::Json,
    routing::get,
    Router,
};
use futures_util::stream::{self, Stream};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tracing::warn;
use uuid::Uuid;

use crate::bridge::{AccountStore, EventLog, ExecutionRouter, OrderStore};
use crate::error::BridgeError;
use crate::models::{GatewayEvent, OrderSide};

/// How long one blocking wait on the event log lasts before the SSE loop
/// re-checks; keepalive comments cover the quiet stretches.
const STREAM_WAIT: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub struct AppState {
    pub log: Arc<EventLog>,
    pub orders: Arc<OrderStore>,
    pub balances: Arc<AccountStore>,
    pub router: Arc<ExecutionRouter>,
    pub stream_connected: Arc<AtomicBool>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/orders", get(list_orders).post(place_order))
        .route("/api/orders/:id", get(get_order).delete(cancel_order))
        .route("/api/balances", get(balances))
        .route("/api/activity", get(activity))
        .route("/api/events", get(events))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "mode": state.router.mode().as_str(),
        "user_stream_connected": state.stream_connected.load(Ordering::Relaxed),
        "last_event_id": state.log.last_id(),
    }))
}

async fn list_orders(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "orders": state.orders.list() }))
}

async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    state
        .orders
        .get(&id)
        .map(|record| Json(json!(record)))
        .ok_or(StatusCode::NOT_FOUND)
}

async fn balances(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "balances": state.balances.snapshot() }))
}

async fn activity(State(state): State<AppState>) -> Json<Value> {
    let events: Vec<Value> = state
        .log
        .recent_activity()
        .into_iter()
        .map(|(id, event)| json!({ "id": id, "event": event }))
        .collect();
    Json(json!({ "activity": events }))
}

#[derive(Debug, Deserialize)]
struct PlaceOrderRequest {
    symbol: String,
    side: String,
    qty: f64,
    price: f64,
    client_order_id: Option<String>,
}

async fn place_order(
    State(state): State<AppState>,
    Json(request): Json<PlaceOrderRequest>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let side = OrderSide::parse(&request.side)
        .ok_or((StatusCode::BAD_REQUEST, "side must be BUY or SELL".into()))?;
    if !(request.qty > 0.0) {
        return Err((StatusCode::BAD_REQUEST, "qty must be positive".into()));
    }
    if !(request.price > 0.0) {
        return Err((StatusCode::BAD_REQUEST, "price must be positive".into()));
    }

    let client_order_id = request
        .client_order_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

    state
        .router
        .place_order(side, &request.symbol, request.qty, request.price, &client_order_id)
        .await
        .map_err(bridge_error_response)?;

    Ok(Json(json!({
        "client_order_id": client_order_id,
        "submitted": true,
    })))
}

#[derive(Debug, Deserialize)]
struct CancelParams {
    symbol: Option<String>,
}

async fn cancel_order(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<CancelParams>,
) -> Result<Json<Value>, (StatusCode, String)> {
    state
        .router
        .cancel_order(&id, params.symbol.as_deref())
        .await
        .map_err(bridge_error_response)?;
    Ok(Json(json!({ "client_order_id": id, "submitted": true })))
}

fn bridge_error_response(e: BridgeError) -> (StatusCode, String) {
    let status = match e {
        BridgeError::ChannelClosed => StatusCode::BAD_GATEWAY,
        BridgeError::VenueUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        BridgeError::Spawn { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

#[derive(Debug, Deserialize)]
struct EventStreamParams {
    from_id: Option<u64>,
}

struct StreamCursor {
    log: Arc<EventLog>,
    cursor: Option<u64>,
    pending: VecDeque<(u64, GatewayEvent)>,
}

async fn events(
    State(state): State<AppState>,
    Query(params): Query<EventStreamParams>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let cursor = StreamCursor {
        log: state.log.clone(),
        cursor: params.from_id,
        pending: VecDeque::new(),
    };

    let stream = stream::unfold(cursor, |mut st| async move {
        loop {
            if let Some((id, event)) = st.pending.pop_front() {
                st.cursor = Some(id);
                let sse = SseEvent::default()
                    .id(id.to_string())
                    .json_data(&event)
                    .unwrap_or_else(|e| {
                        warn!(error = %e, "event serialization failed");
                        SseEvent::default().comment("serialization failure")
                    });
                return Some((Ok::<_, Infallible>(sse), st));
            }

            // The condvar wait is a true blocking call; keep it off the
            // async workers.
            let log = st.log.clone();
            let cursor = st.cursor;
            let batch = tokio::task::spawn_blocking(move || {
                log.block_until_newer(cursor.unwrap_or(0), STREAM_WAIT);
                log.read_since(cursor).0
            })
            .await
            .ok()?;

            // Empty batch means the wait timed out; loop and wait again.
            st.pending = batch.into();
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
