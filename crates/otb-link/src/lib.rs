//! otb-link
//!
//! Transport boundary between the bridge and the device.
//!
//! The bridge only ever talks to a [`DeviceTransport`]; how the bytes move
//! is decided by the [`Connector`] it was built with:
//!
//! ```text
//! BridgeDispatcher
//!     │
//!     └──► Connector::link() ──► DeviceTransport
//!                                   ├── LocalLink  (same process, tests)
//!                                   └── TcpLink    (Modbus/TCP client)
//!                                            │
//!                                            ▼
//!                                      server::serve ──► ControlSurface
//!                                                   └──► SurfaceEvent channel
//! ```
//!
//! Every remote write that lands on the surface produces exactly one
//! [`SurfaceEvent`](otb_surface::SurfaceEvent), after the write is visible.

use async_trait::async_trait;

pub mod client;
pub mod codec;
mod local;
pub mod server;

pub use client::{TcpConnector, TcpLink};
pub use local::{LocalConnector, LocalLink};

// ---------------------------------------------------------------------------
// Transport contract
// ---------------------------------------------------------------------------

/// Register-protocol client primitive.
///
/// A link starts disconnected. Every operation other than `connect` on a
/// disconnected link returns [`TransportError::NotConnected`]. `disconnect`
/// is idempotent.
#[async_trait]
pub trait DeviceTransport: Send {
    async fn connect(&mut self) -> Result<(), TransportError>;

    async fn disconnect(&mut self) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    async fn write_coil(&mut self, address: u16, value: bool) -> Result<(), TransportError>;

    async fn write_register(&mut self, address: u16, value: i16) -> Result<(), TransportError>;

    async fn read_input_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<i16>, TransportError>;

    async fn read_discrete_inputs(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<bool>, TransportError>;
}

/// Factory for fresh, disconnected links. One link per dispatch attempt.
pub trait Connector: Send + Sync {
    type Link: DeviceTransport;

    fn link(&self) -> Self::Link;

    /// Human-readable endpoint for logs (e.g. `"127.0.0.1:502"`).
    fn endpoint(&self) -> String;
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The device could not be reached at connect time.
    Unreachable(String),
    /// An operation was attempted on a link that is not connected.
    NotConnected,
    /// The connection failed mid-operation.
    Io(String),
    /// No response within the link's timeout.
    Timeout,
    /// The device answered with a protocol exception.
    Exception { function: u8, code: u8 },
    /// The device answered with something that is not a valid response.
    Protocol(String),
}

impl TransportError {
    /// `true` for errors that mean the device is gone rather than that one
    /// request was refused.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            TransportError::Unreachable(_)
                | TransportError::NotConnected
                | TransportError::Io(_)
                | TransportError::Timeout
        )
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Unreachable(msg) => write!(f, "device unreachable: {msg}"),
            TransportError::NotConnected => write!(f, "link not connected"),
            TransportError::Io(msg) => write!(f, "link io error: {msg}"),
            TransportError::Timeout => write!(f, "device did not answer in time"),
            TransportError::Exception { function, code } => {
                write!(f, "device exception code={code:#04x} for function={function:#04x}")
            }
            TransportError::Protocol(msg) => write!(f, "protocol error: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {}
