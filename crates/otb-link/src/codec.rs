//! Modbus/TCP framing and PDU encoding.
//!
//! ```text
//! ┌──────────── MBAP header (7 bytes) ────────────┐┌──── PDU ────┐
//! │ transaction id │ protocol id │ length │ unit  ││ fn │ data…  │
//! │      u16       │   u16 = 0   │  u16   │  u8   ││ u8 │        │
//! └───────────────────────────────────────────────┘└─────────────┘
//! ```
//!
//! `length` counts the unit byte plus the PDU. All multi-byte fields are
//! big-endian; packed bit fields are LSB-first within each byte.
//!
//! Both sides use this module: the server decodes [`Request`]s and encodes
//! responses, the client does the opposite.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::TransportError;

pub mod function {
    pub const READ_COILS: u8 = 0x01;
    pub const READ_DISCRETE_INPUTS: u8 = 0x02;
    pub const READ_HOLDING_REGISTERS: u8 = 0x03;
    pub const READ_INPUT_REGISTERS: u8 = 0x04;
    pub const WRITE_SINGLE_COIL: u8 = 0x05;
    pub const WRITE_SINGLE_REGISTER: u8 = 0x06;
    pub const WRITE_MULTIPLE_COILS: u8 = 0x0F;
    pub const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;
}

pub mod exception {
    pub const ILLEGAL_FUNCTION: u8 = 0x01;
    pub const ILLEGAL_DATA_ADDRESS: u8 = 0x02;
    pub const ILLEGAL_DATA_VALUE: u8 = 0x03;
}

/// Exception responses set the high bit of the function code.
pub const EXCEPTION_FLAG: u8 = 0x80;

pub const MAX_READ_BITS: u16 = 2000;
pub const MAX_READ_REGISTERS: u16 = 125;
pub const MAX_WRITE_COILS: u16 = 1968;
pub const MAX_WRITE_REGISTERS: u16 = 123;

const HEADER_LEN: usize = 7;
const MAX_PDU_LEN: usize = 253;

const COIL_ON: u16 = 0xFF00;
const COIL_OFF: u16 = 0x0000;

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub transaction_id: u16,
    pub unit: u8,
    pub pdu: Vec<u8>,
}

impl Frame {
    pub fn encode(&self) -> Vec<u8> {
        let length = (self.pdu.len() + 1) as u16;
        let mut out = Vec::with_capacity(HEADER_LEN + self.pdu.len());
        out.extend_from_slice(&self.transaction_id.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&length.to_be_bytes());
        out.push(self.unit);
        out.extend_from_slice(&self.pdu);
        out
    }
}

/// Read one frame. `Ok(None)` means the peer closed the connection between
/// frames.
pub async fn read_frame<R>(reader: &mut R) -> std::io::Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let transaction_id = u16::from_be_bytes([header[0], header[1]]);
    let protocol = u16::from_be_bytes([header[2], header[3]]);
    let length = usize::from(u16::from_be_bytes([header[4], header[5]]));
    let unit = header[6];

    if protocol != 0 {
        return Err(invalid(format!("protocol id {protocol} is not modbus")));
    }
    if length < 2 || length - 1 > MAX_PDU_LEN {
        return Err(invalid(format!("frame length {length} out of bounds")));
    }

    let mut pdu = vec![0u8; length - 1];
    reader.read_exact(&mut pdu).await?;
    Ok(Some(Frame {
        transaction_id,
        unit,
        pdu,
    }))
}

fn invalid(msg: String) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg)
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    ReadCoils { address: u16, count: u16 },
    ReadDiscreteInputs { address: u16, count: u16 },
    ReadHoldingRegisters { address: u16, count: u16 },
    ReadInputRegisters { address: u16, count: u16 },
    WriteSingleCoil { address: u16, value: bool },
    WriteSingleRegister { address: u16, value: i16 },
    WriteMultipleCoils { address: u16, values: Vec<bool> },
    WriteMultipleRegisters { address: u16, values: Vec<i16> },
}

/// A request the server refuses, already in wire form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionResponse {
    pub function: u8,
    pub code: u8,
}

impl ExceptionResponse {
    pub fn new(function: u8, code: u8) -> Self {
        Self { function, code }
    }

    pub fn encode(&self) -> Vec<u8> {
        vec![self.function | EXCEPTION_FLAG, self.code]
    }
}

impl Request {
    pub fn function(&self) -> u8 {
        match self {
            Request::ReadCoils { .. } => function::READ_COILS,
            Request::ReadDiscreteInputs { .. } => function::READ_DISCRETE_INPUTS,
            Request::ReadHoldingRegisters { .. } => function::READ_HOLDING_REGISTERS,
            Request::ReadInputRegisters { .. } => function::READ_INPUT_REGISTERS,
            Request::WriteSingleCoil { .. } => function::WRITE_SINGLE_COIL,
            Request::WriteSingleRegister { .. } => function::WRITE_SINGLE_REGISTER,
            Request::WriteMultipleCoils { .. } => function::WRITE_MULTIPLE_COILS,
            Request::WriteMultipleRegisters { .. } => function::WRITE_MULTIPLE_REGISTERS,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.function()];
        match self {
            Request::ReadCoils { address, count }
            | Request::ReadDiscreteInputs { address, count }
            | Request::ReadHoldingRegisters { address, count }
            | Request::ReadInputRegisters { address, count } => {
                push_u16(&mut out, *address);
                push_u16(&mut out, *count);
            }
            Request::WriteSingleCoil { address, value } => {
                push_u16(&mut out, *address);
                push_u16(&mut out, if *value { COIL_ON } else { COIL_OFF });
            }
            Request::WriteSingleRegister { address, value } => {
                push_u16(&mut out, *address);
                push_u16(&mut out, *value as u16);
            }
            Request::WriteMultipleCoils { address, values } => {
                let packed = pack_bits(values);
                push_u16(&mut out, *address);
                push_u16(&mut out, values.len() as u16);
                out.push(packed.len() as u8);
                out.extend_from_slice(&packed);
            }
            Request::WriteMultipleRegisters { address, values } => {
                push_u16(&mut out, *address);
                push_u16(&mut out, values.len() as u16);
                out.push((values.len() * 2) as u8);
                for v in values {
                    push_u16(&mut out, *v as u16);
                }
            }
        }
        out
    }

    /// Parse a request PDU. Structural problems become the exception the
    /// server should answer with; address ranges are checked later against
    /// the surface.
    pub fn decode(pdu: &[u8]) -> Result<Self, ExceptionResponse> {
        let Some((&func, body)) = pdu.split_first() else {
            return Err(ExceptionResponse::new(0, exception::ILLEGAL_FUNCTION));
        };
        let bad_value = ExceptionResponse::new(func, exception::ILLEGAL_DATA_VALUE);

        match func {
            function::READ_COILS
            | function::READ_DISCRETE_INPUTS
            | function::READ_HOLDING_REGISTERS
            | function::READ_INPUT_REGISTERS => {
                if body.len() != 4 {
                    return Err(bad_value);
                }
                let address = be_u16(body, 0);
                let count = be_u16(body, 2);
                let max = if func <= function::READ_DISCRETE_INPUTS {
                    MAX_READ_BITS
                } else {
                    MAX_READ_REGISTERS
                };
                if count == 0 || count > max {
                    return Err(bad_value);
                }
                Ok(match func {
                    function::READ_COILS => Request::ReadCoils { address, count },
                    function::READ_DISCRETE_INPUTS => Request::ReadDiscreteInputs { address, count },
                    function::READ_HOLDING_REGISTERS => {
                        Request::ReadHoldingRegisters { address, count }
                    }
                    _ => Request::ReadInputRegisters { address, count },
                })
            }
            function::WRITE_SINGLE_COIL => {
                if body.len() != 4 {
                    return Err(bad_value);
                }
                let value = match be_u16(body, 2) {
                    COIL_ON => true,
                    COIL_OFF => false,
                    _ => return Err(bad_value),
                };
                Ok(Request::WriteSingleCoil {
                    address: be_u16(body, 0),
                    value,
                })
            }
            function::WRITE_SINGLE_REGISTER => {
                if body.len() != 4 {
                    return Err(bad_value);
                }
                Ok(Request::WriteSingleRegister {
                    address: be_u16(body, 0),
                    value: be_u16(body, 2) as i16,
                })
            }
            function::WRITE_MULTIPLE_COILS => {
                if body.len() < 5 {
                    return Err(bad_value);
                }
                let address = be_u16(body, 0);
                let count = be_u16(body, 2);
                let byte_count = usize::from(body[4]);
                let data = &body[5..];
                if count == 0
                    || count > MAX_WRITE_COILS
                    || byte_count != usize::from(count).div_ceil(8)
                    || data.len() != byte_count
                {
                    return Err(bad_value);
                }
                Ok(Request::WriteMultipleCoils {
                    address,
                    values: unpack_bits(data, count),
                })
            }
            function::WRITE_MULTIPLE_REGISTERS => {
                if body.len() < 5 {
                    return Err(bad_value);
                }
                let address = be_u16(body, 0);
                let count = be_u16(body, 2);
                let byte_count = usize::from(body[4]);
                let data = &body[5..];
                if count == 0
                    || count > MAX_WRITE_REGISTERS
                    || byte_count != usize::from(count) * 2
                    || data.len() != byte_count
                {
                    return Err(bad_value);
                }
                let values = data
                    .chunks_exact(2)
                    .map(|w| u16::from_be_bytes([w[0], w[1]]) as i16)
                    .collect();
                Ok(Request::WriteMultipleRegisters { address, values })
            }
            other => Err(ExceptionResponse::new(other, exception::ILLEGAL_FUNCTION)),
        }
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

pub fn encode_bits_response(function: u8, values: &[bool]) -> Vec<u8> {
    let packed = pack_bits(values);
    let mut out = Vec::with_capacity(2 + packed.len());
    out.push(function);
    out.push(packed.len() as u8);
    out.extend_from_slice(&packed);
    out
}

pub fn encode_words_response(function: u8, values: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + values.len() * 2);
    out.push(function);
    out.push((values.len() * 2) as u8);
    for v in values {
        push_u16(&mut out, *v as u16);
    }
    out
}

/// Multi-write acknowledgement: function, start address, quantity.
pub fn encode_write_ack(function: u8, address: u16, count: u16) -> Vec<u8> {
    let mut out = vec![function];
    push_u16(&mut out, address);
    push_u16(&mut out, count);
    out
}

/// Strip the function byte from a response, turning exception responses
/// into [`TransportError::Exception`].
fn response_body(pdu: &[u8], function: u8) -> Result<&[u8], TransportError> {
    match pdu {
        [f, code] if *f == function | EXCEPTION_FLAG => Err(TransportError::Exception {
            function,
            code: *code,
        }),
        [f, body @ ..] if *f == function => Ok(body),
        _ => Err(TransportError::Protocol(format!(
            "unexpected response to function {function:#04x}"
        ))),
    }
}

pub fn decode_bits_response(
    pdu: &[u8],
    function: u8,
    count: u16,
) -> Result<Vec<bool>, TransportError> {
    let body = response_body(pdu, function)?;
    let expected = usize::from(count).div_ceil(8);
    match body.split_first() {
        Some((&n, data)) if usize::from(n) == expected && data.len() == expected => {
            Ok(unpack_bits(data, count))
        }
        _ => Err(TransportError::Protocol("bit response has wrong length".to_string())),
    }
}

pub fn decode_words_response(
    pdu: &[u8],
    function: u8,
    count: u16,
) -> Result<Vec<i16>, TransportError> {
    let body = response_body(pdu, function)?;
    let expected = usize::from(count) * 2;
    match body.split_first() {
        Some((&n, data)) if usize::from(n) == expected && data.len() == expected => Ok(data
            .chunks_exact(2)
            .map(|w| u16::from_be_bytes([w[0], w[1]]) as i16)
            .collect()),
        _ => Err(TransportError::Protocol(
            "register response has wrong length".to_string(),
        )),
    }
}

/// Single writes are acknowledged by echoing the request.
pub fn check_echo(pdu: &[u8], request: &[u8]) -> Result<(), TransportError> {
    let function = request.first().copied().unwrap_or_default();
    response_body(pdu, function)?;
    if pdu == request {
        Ok(())
    } else {
        Err(TransportError::Protocol("write echo mismatch".to_string()))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn push_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn be_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

pub fn pack_bits(values: &[bool]) -> Vec<u8> {
    let mut out = vec![0u8; values.len().div_ceil(8)];
    for (i, v) in values.iter().enumerate() {
        if *v {
            out[i / 8] |= 1 << (i % 8);
        }
    }
    out
}

pub fn unpack_bits(bytes: &[u8], count: u16) -> Vec<bool> {
    (0..usize::from(count))
        .map(|i| bytes.get(i / 8).is_some_and(|b| b & (1 << (i % 8)) != 0))
        .collect()
}
