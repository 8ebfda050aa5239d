//! Shared runtime state for otb-daemon.
//!
//! Handlers receive `State<Arc<AppState>>` from Axum. The dispatcher owns
//! its status snapshot; the daemon only reads it.

use std::sync::Arc;
use std::time::Duration;

use otb_bridge::{BridgeEvent, DispatcherStatus};
use otb_db::OrderStore;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};

// ---------------------------------------------------------------------------
// BusMsg: SSE event bus payload
// ---------------------------------------------------------------------------

/// Messages broadcast over the internal event bus and surfaced as SSE events.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMsg {
    Heartbeat { ts_millis: i64 },
    Status(StatusSnapshot),
    Order { event: BridgeEvent },
    LogLine { level: String, msg: String },
}

// ---------------------------------------------------------------------------
// BuildInfo
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

// ---------------------------------------------------------------------------
// StatusSnapshot
// ---------------------------------------------------------------------------

/// Returned by GET /v1/status and carried inside SSE `status` events.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub daemon_uptime_secs: u64,
    pub dispatcher: DispatcherStatus,
}

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    /// Broadcast bus for SSE.
    pub bus: broadcast::Sender<BusMsg>,
    pub build: BuildInfo,
    pub store: Arc<dyn OrderStore>,
    /// Written by the dispatcher task.
    pub dispatcher: Arc<RwLock<DispatcherStatus>>,
}

impl AppState {
    pub fn new(store: Arc<dyn OrderStore>, dispatcher: Arc<RwLock<DispatcherStatus>>) -> Self {
        let (bus, _rx) = broadcast::channel::<BusMsg>(1024);
        Self {
            bus,
            build: BuildInfo {
                service: "otb-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
            store,
            dispatcher,
        }
    }

    pub async fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            daemon_uptime_secs: uptime_secs(),
            dispatcher: self.dispatcher.read().await.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Seconds since first call (process lifetime).
pub fn uptime_secs() -> u64 {
    static START: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    START
        .get_or_init(std::time::Instant::now)
        .elapsed()
        .as_secs()
}

/// Spawn a background task that emits a heartbeat SSE every `interval`.
pub fn spawn_heartbeat(bus: broadcast::Sender<BusMsg>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let ts = chrono::Utc::now().timestamp_millis();
            let _ = bus.send(BusMsg::Heartbeat { ts_millis: ts });
        }
    });
}

/// Relay dispatcher events onto the SSE bus until the dispatcher goes away.
///
/// Failed orders are also surfaced as `log` lines so an operator watching
/// the stream sees them without decoding order events.
pub fn spawn_event_relay(
    bus: broadcast::Sender<BusMsg>,
    mut events: broadcast::Receiver<BridgeEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(e) => e,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "event relay lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            if let BridgeEvent::OrderFinished {
                order_id,
                error: Some(reason),
                ..
            } = &event
            {
                let _ = bus.send(BusMsg::LogLine {
                    level: "ERROR".to_string(),
                    msg: format!("order {order_id} failed: {reason}"),
                });
            }
            let _ = bus.send(BusMsg::Order { event });
        }
    })
}
