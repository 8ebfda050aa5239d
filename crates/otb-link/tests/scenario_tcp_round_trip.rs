//! Scenario: a TcpLink talks to server::serve over a real socket.
//!
//! Writes must be visible on the surface and announced on the event channel
//! by the time the client sees the acknowledgement; reads see device-side
//! state; exceptions and a vanished server surface as the right errors.

use std::sync::Arc;
use std::time::Duration;

use otb_link::codec::{exception, function};
use otb_link::{server, Connector, DeviceTransport, TcpConnector, TransportError};
use otb_surface::map::{BANK_SIZE, COIL_START, DI_DONE, HR_NONCE, IR_ACTIVE_ORDER};
use otb_surface::{ControlSurface, SurfaceEvent};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

struct Running {
    connector: TcpConnector,
    surface: Arc<ControlSurface>,
    events: mpsc::UnboundedReceiver<SurfaceEvent>,
    shutdown: watch::Sender<bool>,
    task: tokio::task::JoinHandle<std::io::Result<()>>,
}

async fn start() -> Running {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let surface = Arc::new(ControlSurface::new());
    let (tx, rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(server::serve(
        listener,
        Arc::clone(&surface),
        tx,
        shutdown_rx,
    ));
    Running {
        connector: TcpConnector::new(addr.to_string(), Duration::from_secs(2)),
        surface,
        events: rx,
        shutdown: shutdown_tx,
        task,
    }
}

#[tokio::test]
async fn writes_are_applied_then_announced() {
    let mut srv = start().await;
    let mut link = srv.connector.link();
    link.connect().await.unwrap();

    link.write_register(HR_NONCE, 1234).await.unwrap();
    link.write_coil(COIL_START, true).await.unwrap();

    // Acknowledged means applied and announced.
    assert_eq!(srv.surface.holding(HR_NONCE), 1234);
    assert!(srv.surface.start_requested());
    assert_eq!(
        srv.events.try_recv().unwrap(),
        SurfaceEvent::HoldingChanged {
            start: HR_NONCE,
            count: 1
        }
    );
    assert_eq!(
        srv.events.try_recv().unwrap(),
        SurfaceEvent::CoilsChanged {
            start: COIL_START,
            count: 1
        }
    );

    link.disconnect().await.unwrap();
    srv.shutdown.send(true).unwrap();
    srv.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn reads_see_device_state() {
    let srv = start().await;
    srv.surface.publish_produced(2);
    srv.surface.set_active_job(17, 300);
    srv.surface.mark_done();

    let mut link = srv.connector.link();
    link.connect().await.unwrap();
    assert_eq!(
        link.read_input_registers(0, 4).await.unwrap(),
        vec![2, 2, 17, 300]
    );
    assert_eq!(
        link.read_input_registers(IR_ACTIVE_ORDER, 1).await.unwrap(),
        vec![17]
    );
    assert_eq!(
        link.read_discrete_inputs(DI_DONE, 2).await.unwrap(),
        vec![true, true]
    );
    srv.shutdown.send(true).unwrap();
}

#[tokio::test]
async fn out_of_range_is_an_exception_and_link_stays_up() {
    let srv = start().await;
    let mut link = srv.connector.link();
    link.connect().await.unwrap();

    let err = link.read_input_registers(BANK_SIZE - 1, 2).await.unwrap_err();
    assert_eq!(
        err,
        TransportError::Exception {
            function: function::READ_INPUT_REGISTERS,
            code: exception::ILLEGAL_DATA_ADDRESS
        }
    );
    assert!(link.is_connected());
    assert!(link.read_input_registers(0, 1).await.is_ok());
    srv.shutdown.send(true).unwrap();
}

#[tokio::test]
async fn nothing_listening_is_unreachable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut link = TcpConnector::new(addr.to_string(), Duration::from_millis(500)).link();
    let err = link.connect().await.unwrap_err();
    assert!(matches!(err, TransportError::Unreachable(_)), "{err}");
    assert!(err.is_connection_error());
    assert_eq!(
        link.write_coil(COIL_START, true).await,
        Err(TransportError::NotConnected)
    );
}
