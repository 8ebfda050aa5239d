//! In-process link: the bridge writes straight into a shared surface.
//!
//! Behaves like a Modbus server from the bridge's point of view (range
//! checks become exception responses, writes emit change events) without a
//! socket. Reachability can be toggled to simulate a device outage.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use otb_surface::{ControlSurface, SurfaceError, SurfaceEvent};
use tokio::sync::mpsc;
use tracing::debug;

use crate::codec::{exception, function};
use crate::{Connector, DeviceTransport, TransportError};

/// Hands out [`LocalLink`]s onto one shared surface.
#[derive(Clone)]
pub struct LocalConnector {
    surface: Arc<ControlSurface>,
    events: mpsc::UnboundedSender<SurfaceEvent>,
    reachable: Arc<AtomicBool>,
}

impl LocalConnector {
    pub fn new(surface: Arc<ControlSurface>, events: mpsc::UnboundedSender<SurfaceEvent>) -> Self {
        Self {
            surface,
            events,
            reachable: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate the device going away (`false`) or coming back (`true`).
    ///
    /// Affects `connect` on links created before or after the call.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }
}

impl Connector for LocalConnector {
    type Link = LocalLink;

    fn link(&self) -> LocalLink {
        LocalLink {
            surface: Arc::clone(&self.surface),
            events: self.events.clone(),
            reachable: Arc::clone(&self.reachable),
            connected: false,
        }
    }

    fn endpoint(&self) -> String {
        "local".to_string()
    }
}

pub struct LocalLink {
    surface: Arc<ControlSurface>,
    events: mpsc::UnboundedSender<SurfaceEvent>,
    reachable: Arc<AtomicBool>,
    connected: bool,
}

impl LocalLink {
    fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.connected {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }

    fn notify(&self, event: SurfaceEvent) {
        if self.events.send(event).is_err() {
            debug!(?event, "no device listening for surface events");
        }
    }
}

fn address_exception(function: u8) -> impl FnOnce(SurfaceError) -> TransportError {
    move |_| TransportError::Exception {
        function,
        code: exception::ILLEGAL_DATA_ADDRESS,
    }
}

#[async_trait]
impl DeviceTransport for LocalLink {
    async fn connect(&mut self) -> Result<(), TransportError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable("local device offline".to_string()));
        }
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn write_coil(&mut self, address: u16, value: bool) -> Result<(), TransportError> {
        self.ensure_connected()?;
        self.surface
            .write_coils(address, &[value])
            .map_err(address_exception(function::WRITE_SINGLE_COIL))?;
        self.notify(SurfaceEvent::CoilsChanged {
            start: address,
            count: 1,
        });
        Ok(())
    }

    async fn write_register(&mut self, address: u16, value: i16) -> Result<(), TransportError> {
        self.ensure_connected()?;
        self.surface
            .write_holding_registers(address, &[value])
            .map_err(address_exception(function::WRITE_SINGLE_REGISTER))?;
        self.notify(SurfaceEvent::HoldingChanged {
            start: address,
            count: 1,
        });
        Ok(())
    }

    async fn read_input_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<i16>, TransportError> {
        self.ensure_connected()?;
        self.surface
            .read_input_registers(address, count)
            .map_err(address_exception(function::READ_INPUT_REGISTERS))
    }

    async fn read_discrete_inputs(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<bool>, TransportError> {
        self.ensure_connected()?;
        self.surface
            .read_discrete_inputs(address, count)
            .map_err(address_exception(function::READ_DISCRETE_INPUTS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use otb_surface::map::{BANK_SIZE, COIL_START, HR_NONCE};

    fn setup() -> (
        LocalConnector,
        Arc<ControlSurface>,
        mpsc::UnboundedReceiver<SurfaceEvent>,
    ) {
        let surface = Arc::new(ControlSurface::new());
        let (tx, rx) = mpsc::unbounded_channel();
        (LocalConnector::new(Arc::clone(&surface), tx), surface, rx)
    }

    #[tokio::test]
    async fn writes_land_on_surface_and_emit_events_in_order() {
        let (conn, surface, mut rx) = setup();
        let mut link = conn.link();
        link.connect().await.unwrap();

        link.write_register(HR_NONCE, 42).await.unwrap();
        link.write_coil(COIL_START, true).await.unwrap();

        assert_eq!(surface.holding(HR_NONCE), 42);
        assert!(surface.start_requested());
        assert_eq!(
            rx.recv().await,
            Some(SurfaceEvent::HoldingChanged {
                start: HR_NONCE,
                count: 1
            })
        );
        assert_eq!(
            rx.recv().await,
            Some(SurfaceEvent::CoilsChanged {
                start: COIL_START,
                count: 1
            })
        );
    }

    #[tokio::test]
    async fn operations_require_connect() {
        let (conn, _surface, _rx) = setup();
        let mut link = conn.link();
        assert_eq!(
            link.write_coil(COIL_START, true).await,
            Err(TransportError::NotConnected)
        );
    }

    #[tokio::test]
    async fn unreachable_device_refuses_connect() {
        let (conn, _surface, _rx) = setup();
        conn.set_reachable(false);
        let mut link = conn.link();
        let err = link.connect().await.unwrap_err();
        assert!(err.is_connection_error());
        assert!(!link.is_connected());

        conn.set_reachable(true);
        link.connect().await.unwrap();
        assert!(link.is_connected());
    }

    #[tokio::test]
    async fn out_of_range_read_is_an_exception() {
        let (conn, _surface, _rx) = setup();
        let mut link = conn.link();
        link.connect().await.unwrap();
        let err = link.read_input_registers(BANK_SIZE, 1).await.unwrap_err();
        assert_eq!(
            err,
            TransportError::Exception {
                function: function::READ_INPUT_REGISTERS,
                code: exception::ILLEGAL_DATA_ADDRESS
            }
        );
        assert!(!err.is_connection_error());
    }
}
