//! Axum router and HTTP handlers for otb-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers, so tests can drive the bare router.

use std::{convert::Infallible, sync::Arc};

use axum::{
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use otb_schemas::NewOrder;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{error, info};

use crate::{
    api_types::{CreateOrderRequest, ErrorResponse, HealthResponse, OrderLogsResponse, OrdersResponse},
    state::{AppState, BusMsg},
};

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/status", get(status_handler))
        .route("/v1/stream", get(stream))
        .route("/v1/orders", get(list_orders).post(create_order))
        .route("/v1/orders/:id", get(get_order))
        .route("/v1/orders/:id/logs", get(order_logs))
        .with_state(state)
}

fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
        .into_response()
}

fn store_failure(op: &str, err: anyhow::Error) -> Response {
    error!(op, error = %format!("{err:#}"), "order store failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{op} failed"))
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service.to_string(),
            version: st.build.version.to_string(),
        }),
    )
}

// ---------------------------------------------------------------------------
// GET /v1/status
// ---------------------------------------------------------------------------

pub(crate) async fn status_handler(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    let snap = st.snapshot().await;
    let _ = st.bus.send(BusMsg::Status(snap.clone()));
    (StatusCode::OK, Json(snap))
}

// ---------------------------------------------------------------------------
// /v1/orders
// ---------------------------------------------------------------------------

pub(crate) async fn list_orders(State(st): State<Arc<AppState>>) -> Response {
    match st.store.list().await {
        Ok(orders) => (StatusCode::OK, Json(OrdersResponse { orders })).into_response(),
        Err(e) => store_failure("list orders", e),
    }
}

/// Validated order entry. Rejected input never reaches the store.
pub(crate) async fn create_order(
    State(st): State<Arc<AppState>>,
    Json(req): Json<CreateOrderRequest>,
) -> Response {
    let new = match NewOrder::new(&req.item, req.quantity) {
        Ok(n) => n,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };
    match st.store.create(new).await {
        Ok(order) => {
            info!(order_id = order.id, item = %order.item, quantity = order.quantity, "order created");
            (StatusCode::CREATED, Json(order)).into_response()
        }
        Err(e) => store_failure("create order", e),
    }
}

pub(crate) async fn get_order(State(st): State<Arc<AppState>>, Path(id): Path<i64>) -> Response {
    match st.store.get(id).await {
        Ok(Some(order)) => (StatusCode::OK, Json(order)).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, format!("order {id} not found")),
        Err(e) => store_failure("get order", e),
    }
}

pub(crate) async fn order_logs(State(st): State<Arc<AppState>>, Path(id): Path<i64>) -> Response {
    let order = match st.store.get(id).await {
        Ok(Some(order)) => order,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, format!("order {id} not found")),
        Err(e) => return store_failure("get order", e),
    };
    match st.store.production_logs(id).await {
        Ok(logs) => (StatusCode::OK, Json(OrderLogsResponse { order, logs })).into_response(),
        Err(e) => store_failure("production logs", e),
    }
}

// ---------------------------------------------------------------------------
// GET /v1/stream  (SSE)
// ---------------------------------------------------------------------------

pub(crate) async fn stream(State(st): State<Arc<AppState>>) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
    headers.insert("Connection", HeaderValue::from_static("keep-alive"));

    let rx = st.bus.subscribe();
    let events = broadcast_to_sse(rx);

    (headers, Sse::new(events).keep_alive(KeepAlive::new())).into_response()
}

fn broadcast_to_sse(
    rx: broadcast::Receiver<BusMsg>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(m) => {
                let event_name = match &m {
                    BusMsg::Heartbeat { .. } => "heartbeat",
                    BusMsg::Status(_) => "status",
                    BusMsg::Order { .. } => "order",
                    BusMsg::LogLine { .. } => "log",
                };
                let data = serde_json::to_string(&m).ok()?;
                Some(Ok(Event::default().event(event_name).data(data)))
            }
            Err(_) => None, // lagged
        }
    })
}
