//! Modbus/TCP server exposing a [`ControlSurface`].
//!
//! # Invariants
//!
//! - A write request is applied to the surface before its change event is
//!   sent, and the event is sent before the response goes back. A device
//!   task woken by the event therefore always sees the written values.
//! - Requests on one connection are handled in arrival order.
//! - Each remote write produces exactly one [`SurfaceEvent`].

use std::sync::Arc;

use otb_surface::{ControlSurface, SurfaceEvent};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::codec::{self, exception, ExceptionResponse, Frame, Request};

/// Accept connections until `shutdown` flips to `true`.
pub async fn serve(
    listener: TcpListener,
    surface: Arc<ControlSurface>,
    events: mpsc::UnboundedSender<SurfaceEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "modbus server listening");
    }

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                debug!(%peer, "modbus client connected");
                let surface = Arc::clone(&surface);
                let events = events.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, surface, events, shutdown).await {
                        warn!(%peer, error = %e, "modbus connection ended with error");
                    } else {
                        debug!(%peer, "modbus client disconnected");
                    }
                });
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("modbus server stopping");
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    surface: Arc<ControlSurface>,
    events: mpsc::UnboundedSender<SurfaceEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    loop {
        let frame = tokio::select! {
            frame = codec::read_frame(&mut stream) => frame?,
            _ = shutdown.changed() => return Ok(()),
        };
        let Some(frame) = frame else {
            return Ok(());
        };

        let (pdu, event) = apply(&surface, &frame.pdu);
        if let Some(event) = event {
            if events.send(event).is_err() {
                debug!(?event, "no device listening for surface events");
            }
        }

        let reply = Frame {
            transaction_id: frame.transaction_id,
            unit: frame.unit,
            pdu,
        };
        stream.write_all(&reply.encode()).await?;
    }
}

/// Execute one request PDU against the surface.
///
/// Returns the response PDU and, for successful writes, the change event.
pub fn apply(surface: &ControlSurface, pdu: &[u8]) -> (Vec<u8>, Option<SurfaceEvent>) {
    let request = match Request::decode(pdu) {
        Ok(r) => r,
        Err(exc) => return (exc.encode(), None),
    };
    let func = request.function();
    let out_of_range = || ExceptionResponse::new(func, exception::ILLEGAL_DATA_ADDRESS).encode();

    match request {
        Request::ReadCoils { address, count } => match surface.read_coils(address, count) {
            Ok(v) => (codec::encode_bits_response(func, &v), None),
            Err(_) => (out_of_range(), None),
        },
        Request::ReadDiscreteInputs { address, count } => {
            match surface.read_discrete_inputs(address, count) {
                Ok(v) => (codec::encode_bits_response(func, &v), None),
                Err(_) => (out_of_range(), None),
            }
        }
        Request::ReadHoldingRegisters { address, count } => {
            match surface.read_holding_registers(address, count) {
                Ok(v) => (codec::encode_words_response(func, &v), None),
                Err(_) => (out_of_range(), None),
            }
        }
        Request::ReadInputRegisters { address, count } => {
            match surface.read_input_registers(address, count) {
                Ok(v) => (codec::encode_words_response(func, &v), None),
                Err(_) => (out_of_range(), None),
            }
        }
        Request::WriteSingleCoil { address, value } => match surface.write_coils(address, &[value]) {
            Ok(()) => (
                pdu.to_vec(),
                Some(SurfaceEvent::CoilsChanged {
                    start: address,
                    count: 1,
                }),
            ),
            Err(_) => (out_of_range(), None),
        },
        Request::WriteSingleRegister { address, value } => {
            match surface.write_holding_registers(address, &[value]) {
                Ok(()) => (
                    pdu.to_vec(),
                    Some(SurfaceEvent::HoldingChanged {
                        start: address,
                        count: 1,
                    }),
                ),
                Err(_) => (out_of_range(), None),
            }
        }
        Request::WriteMultipleCoils { address, values } => {
            let count = values.len() as u16;
            match surface.write_coils(address, &values) {
                Ok(()) => (
                    codec::encode_write_ack(func, address, count),
                    Some(SurfaceEvent::CoilsChanged {
                        start: address,
                        count,
                    }),
                ),
                Err(_) => (out_of_range(), None),
            }
        }
        Request::WriteMultipleRegisters { address, values } => {
            let count = values.len() as u16;
            match surface.write_holding_registers(address, &values) {
                Ok(()) => (
                    codec::encode_write_ack(func, address, count),
                    Some(SurfaceEvent::HoldingChanged {
                        start: address,
                        count,
                    }),
                ),
                Err(_) => (out_of_range(), None),
            }
        }
    }
}
