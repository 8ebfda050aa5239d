//! Modbus/TCP client link.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::codec::{self, function, Frame, Request};
use crate::{Connector, DeviceTransport, TransportError};

pub const DEFAULT_UNIT: u8 = 1;

/// Builds [`TcpLink`]s to one `host:port`.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
    timeout: Duration,
    unit: u8,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
            unit: DEFAULT_UNIT,
        }
    }

    pub fn with_unit(mut self, unit: u8) -> Self {
        self.unit = unit;
        self
    }
}

impl Connector for TcpConnector {
    type Link = TcpLink;

    fn link(&self) -> TcpLink {
        TcpLink {
            addr: self.addr.clone(),
            timeout: self.timeout,
            unit: self.unit,
            stream: None,
            next_tid: 0,
        }
    }

    fn endpoint(&self) -> String {
        self.addr.clone()
    }
}

/// One Modbus/TCP connection. Requests are strictly sequential; any I/O
/// failure or timeout drops the stream, after which the link reports
/// disconnected.
pub struct TcpLink {
    addr: String,
    timeout: Duration,
    unit: u8,
    stream: Option<TcpStream>,
    next_tid: u16,
}

impl TcpLink {
    async fn transact(&mut self, pdu: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        let timeout = self.timeout;
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;

        self.next_tid = self.next_tid.wrapping_add(1);
        let tid = self.next_tid;
        let request = Frame {
            transaction_id: tid,
            unit: self.unit,
            pdu,
        };

        let exchange = async {
            stream.write_all(&request.encode()).await?;
            codec::read_frame(&mut *stream).await
        };

        let reply = match tokio::time::timeout(timeout, exchange).await {
            Err(_) => {
                self.drop_stream("timeout");
                return Err(TransportError::Timeout);
            }
            Ok(Err(e)) => {
                self.drop_stream("io error");
                return Err(TransportError::Io(e.to_string()));
            }
            Ok(Ok(None)) => {
                self.drop_stream("closed by peer");
                return Err(TransportError::Io("connection closed by device".to_string()));
            }
            Ok(Ok(Some(frame))) => frame,
        };

        if reply.transaction_id != tid {
            return Err(TransportError::Protocol(format!(
                "transaction id mismatch: sent {tid}, got {}",
                reply.transaction_id
            )));
        }
        Ok(reply.pdu)
    }

    fn drop_stream(&mut self, reason: &str) {
        if self.stream.take().is_some() {
            warn!(addr = %self.addr, reason, "modbus link dropped");
        }
    }
}

#[async_trait]
impl DeviceTransport for TcpLink {
    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let stream = match tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr)).await
        {
            Err(_) => {
                return Err(TransportError::Unreachable(format!(
                    "{}: connect timed out",
                    self.addr
                )))
            }
            Ok(Err(e)) => return Err(TransportError::Unreachable(format!("{}: {e}", self.addr))),
            Ok(Ok(s)) => s,
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "set_nodelay failed");
        }
        debug!(addr = %self.addr, "modbus link connected");
        self.stream = Some(stream);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        if let Some(mut stream) = self.stream.take() {
            // Peer may already be gone; nothing to recover either way.
            let _ = stream.shutdown().await;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn write_coil(&mut self, address: u16, value: bool) -> Result<(), TransportError> {
        let pdu = Request::WriteSingleCoil { address, value }.encode();
        let reply = self.transact(pdu.clone()).await?;
        codec::check_echo(&reply, &pdu)
    }

    async fn write_register(&mut self, address: u16, value: i16) -> Result<(), TransportError> {
        let pdu = Request::WriteSingleRegister { address, value }.encode();
        let reply = self.transact(pdu.clone()).await?;
        codec::check_echo(&reply, &pdu)
    }

    async fn read_input_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<i16>, TransportError> {
        let reply = self
            .transact(Request::ReadInputRegisters { address, count }.encode())
            .await?;
        codec::decode_words_response(&reply, function::READ_INPUT_REGISTERS, count)
    }

    async fn read_discrete_inputs(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<bool>, TransportError> {
        let reply = self
            .transact(Request::ReadDiscreteInputs { address, count }.encode())
            .await?;
        codec::decode_bits_response(&reply, function::READ_DISCRETE_INPUTS, count)
    }
}
