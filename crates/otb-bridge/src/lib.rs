//! otb-bridge
//!
//! Moves orders from the store onto the device and records what the device
//! reports back.
//!
//! ```text
//! loop:
//!   next_pending() ── none ──► sleep idle
//!        │
//!   connect ── fail ──► log, order stays NEW, sleep backoff
//!        │
//!   write id, qty, key, nonce, (presence), start coil
//!   NEW → IN_PROGRESS
//!        │
//!   poll echo (id, nonce) ── other job ──► wait
//!        │ ours
//!   read produced / done ──► log row per increase
//!        ├─ done            → COMPLETED
//!        └─ stalled ≥ limit → abort (nonce-targeted), FAILED (timeout)
//!        │
//!   disconnect (every path)
//! ```
//!
//! Errors inside one iteration never escape [`BridgeDispatcher::tick`]: the
//! in-flight order is marked `FAILED`, the error is logged and the loop backs
//! off.

use serde::{Deserialize, Serialize};

mod dispatcher;
mod nonce;

pub use dispatcher::{BridgeDispatcher, BridgeSettings, Iteration};
pub use nonce::NonceSource;

use otb_link::TransportError;
use otb_schemas::{OrderStatus, TransitionError};
use otb_surface::RangeError;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum DispatchError {
    /// The device could not be reached or the link dropped.
    Connection(TransportError),
    /// The device answered, but refused or garbled a request.
    Transport(TransportError),
    /// The order store failed.
    Persistence(anyhow::Error),
    /// Order id or quantity does not fit a register word.
    ProtocolRange(RangeError),
    /// An order status move the lifecycle does not allow.
    Lifecycle(TransitionError),
    /// Shutdown was requested while a job was in flight.
    Shutdown,
}

impl DispatchError {
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::Connection(_) => "connection",
            DispatchError::Transport(_) => "transport",
            DispatchError::Persistence(_) => "persistence",
            DispatchError::ProtocolRange(_) => "protocol_range",
            DispatchError::Lifecycle(_) => "lifecycle",
            DispatchError::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchError::Connection(e) => write!(f, "connection error: {e}"),
            DispatchError::Transport(e) => write!(f, "transport error: {e}"),
            DispatchError::Persistence(e) => write!(f, "persistence error: {e:#}"),
            DispatchError::ProtocolRange(e) => write!(f, "protocol range error: {e}"),
            DispatchError::Lifecycle(e) => write!(f, "lifecycle error: {e}"),
            DispatchError::Shutdown => write!(f, "bridge shutting down"),
        }
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DispatchError::Connection(e) | DispatchError::Transport(e) => Some(e),
            DispatchError::Persistence(e) => Some(e.as_ref()),
            DispatchError::ProtocolRange(e) => Some(e),
            DispatchError::Lifecycle(e) => Some(e),
            DispatchError::Shutdown => None,
        }
    }
}

impl From<TransportError> for DispatchError {
    fn from(e: TransportError) -> Self {
        if e.is_connection_error() {
            DispatchError::Connection(e)
        } else {
            DispatchError::Transport(e)
        }
    }
}

impl From<RangeError> for DispatchError {
    fn from(e: RangeError) -> Self {
        DispatchError::ProtocolRange(e)
    }
}

impl From<TransitionError> for DispatchError {
    fn from(e: TransitionError) -> Self {
        DispatchError::Lifecycle(e)
    }
}

// ---------------------------------------------------------------------------
// Outcomes, status, events
// ---------------------------------------------------------------------------

/// Terminal result of one dispatched order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed { order_id: i64, produced: i32 },
    TimedOut { order_id: i64, produced: i32 },
}

impl JobOutcome {
    pub fn order_id(&self) -> i64 {
        match *self {
            JobOutcome::Completed { order_id, .. } | JobOutcome::TimedOut { order_id, .. } => {
                order_id
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchPhase {
    Idle,
    Starting,
    Polling,
    Backoff,
    Stopped,
}

/// Point-in-time view of the dispatcher, served by the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherStatus {
    pub endpoint: String,
    pub phase: DispatchPhase,
    pub current_order: Option<i64>,
    pub last_produced: Option<i32>,
    pub completed: u64,
    pub failed: u64,
    pub connection_failures: u64,
    pub last_error: Option<String>,
}

impl DispatcherStatus {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            phase: DispatchPhase::Idle,
            current_order: None,
            last_produced: None,
            completed: 0,
            failed: 0,
            connection_failures: 0,
            last_error: None,
        }
    }
}

/// Order lifecycle notifications, fanned out to daemon subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    OrderStarted { order_id: i64, quantity: i32 },
    Progress { order_id: i64, produced: i32 },
    OrderFinished { order_id: i64, status: OrderStatus, error: Option<String> },
}
