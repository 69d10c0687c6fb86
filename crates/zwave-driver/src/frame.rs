//! Serial API frames and link-layer events
//!
//! The controller speaks a simple byte protocol:
//!
//! ```text
//! single byte:  ACK (0x06) | NAK (0x15) | CAN (0x18)
//! data frame:   SOF (0x01) | LEN | TYPE | FUNC | PAYLOAD... | CHECKSUM
//! ```
//!
//! `LEN` counts everything after itself (type, function, payload, checksum).
//! The checksum is `0xFF` XOR-ed with every byte from `LEN` to the end of the
//! payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use tracing::{trace, warn};

use crate::error::{DriverError, Result};

/// Start of frame
pub const SOF: u8 = 0x01;
/// Positive acknowledgement
pub const ACK: u8 = 0x06;
/// Negative acknowledgement
pub const NAK: u8 = 0x15;
/// Cancel, sent by the controller on collisions
pub const CAN: u8 = 0x18;

/// Largest data frame the controller can send (LEN is a single byte)
pub const MAX_FRAME_SIZE: usize = 257;

/// Smallest valid LEN value (type + function + checksum)
const MIN_LENGTH_BYTE: usize = 3;

/// Largest payload that still fits the single LEN byte
pub const MAX_PAYLOAD_SIZE: usize = u8::MAX as usize - MIN_LENGTH_BYTE;

/// Direction marker carried in every data frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Unsolicited frame or callback
    Request,
    /// Immediate answer to a request
    Response,
}

impl FrameType {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(FrameType::Request),
            0x01 => Some(FrameType::Response),
            _ => None,
        }
    }

    fn as_byte(self) -> u8 {
        match self {
            FrameType::Request => 0x00,
            FrameType::Response => 0x01,
        }
    }
}

/// Serial API function identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionType(pub u8);

impl FunctionType {
    /// Command received from a node
    pub const APPLICATION_COMMAND: FunctionType = FunctionType(0x04);
    /// Transmit a command to one node
    pub const SEND_DATA: FunctionType = FunctionType(0x13);
    /// Transmit a command to several nodes
    pub const SEND_DATA_MULTICAST: FunctionType = FunctionType(0x14);
    /// Query the controller library version
    pub const GET_CONTROLLER_VERSION: FunctionType = FunctionType(0x15);
    /// Abort the SendData currently in progress
    pub const SEND_DATA_ABORT: FunctionType = FunctionType(0x16);
    /// Node information and other network updates
    pub const APPLICATION_UPDATE: FunctionType = FunctionType(0x49);
    /// Command received from a node, bridge controller variant
    pub const BRIDGE_APPLICATION_COMMAND: FunctionType = FunctionType(0xA8);

    /// Human readable name for well-known functions
    pub fn name(&self) -> Option<&'static str> {
        match *self {
            FunctionType::APPLICATION_COMMAND => Some("ApplicationCommand"),
            FunctionType::SEND_DATA => Some("SendData"),
            FunctionType::SEND_DATA_MULTICAST => Some("SendDataMulticast"),
            FunctionType::GET_CONTROLLER_VERSION => Some("GetControllerVersion"),
            FunctionType::SEND_DATA_ABORT => Some("SendDataAbort"),
            FunctionType::APPLICATION_UPDATE => Some("ApplicationUpdate"),
            FunctionType::BRIDGE_APPLICATION_COMMAND => Some("BridgeApplicationCommand"),
            _ => None,
        }
    }
}

impl fmt::Debug for FunctionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}(0x{:02X})", name, self.0),
            None => write!(f, "FunctionType(0x{:02X})", self.0),
        }
    }
}

impl fmt::Display for FunctionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "0x{:02X}", self.0),
        }
    }
}

/// A decoded serial API data frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Request or response
    pub frame_type: FrameType,
    /// Serial API function
    pub function: FunctionType,
    /// Function-specific payload
    pub payload: Bytes,
}

impl Frame {
    /// Create a request frame
    pub fn request(function: FunctionType, payload: impl Into<Bytes>) -> Self {
        Self {
            frame_type: FrameType::Request,
            function,
            payload: payload.into(),
        }
    }

    /// Create a response frame
    pub fn response(function: FunctionType, payload: impl Into<Bytes>) -> Self {
        Self {
            frame_type: FrameType::Response,
            function,
            payload: payload.into(),
        }
    }

    /// Whether this is a request frame
    pub fn is_request(&self) -> bool {
        self.frame_type == FrameType::Request
    }

    /// Whether this is a response frame
    pub fn is_response(&self) -> bool {
        self.frame_type == FrameType::Response
    }

    /// Serialize with SOF, length and checksum
    pub fn encode(&self) -> Result<Bytes> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(DriverError::InvalidFrame(format!(
                "{} payload of {} bytes exceeds {}",
                self.function,
                self.payload.len(),
                MAX_PAYLOAD_SIZE
            )));
        }
        let length = self.payload.len() + MIN_LENGTH_BYTE;
        let mut buf = BytesMut::with_capacity(length + 2);
        buf.put_u8(SOF);
        buf.put_u8(length as u8);
        buf.put_u8(self.frame_type.as_byte());
        buf.put_u8(self.function.0);
        buf.extend_from_slice(&self.payload);
        let cs = checksum(&buf[1..]);
        buf.put_u8(cs);
        Ok(buf.freeze())
    }
}

/// Checksum over the bytes following SOF, excluding the checksum itself
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0xFF, |acc, b| acc ^ b)
}

/// Everything the controller can send us
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerialEvent {
    /// Frame accepted
    Ack,
    /// Frame rejected
    Nak,
    /// Frame dropped due to a collision
    Can,
    /// A data frame
    Frame(Frame),
}

impl From<Frame> for SerialEvent {
    fn from(frame: Frame) -> Self {
        SerialEvent::Frame(frame)
    }
}

/// Incremental decoder for the controller's byte stream
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    /// Create an empty decoder
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(MAX_FRAME_SIZE * 2),
        }
    }

    /// Append bytes read from the port
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Number of buffered bytes not yet decoded
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop everything buffered
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Try to decode the next event from the buffer
    ///
    /// Returns `Ok(None)` when more bytes are needed. A corrupt frame is
    /// consumed and reported as an error so the caller can NAK it.
    pub fn decode(&mut self) -> Result<Option<SerialEvent>> {
        // Skip anything that cannot start an event
        let start = self
            .buffer
            .iter()
            .position(|b| matches!(*b, SOF | ACK | NAK | CAN));
        match start {
            Some(0) => {}
            Some(pos) => {
                warn!(discarded = pos, "Discarding bytes before frame start");
                self.buffer.advance(pos);
            }
            None => {
                if !self.buffer.is_empty() {
                    warn!(discarded = self.buffer.len(), "Discarding buffer without frame start");
                    self.buffer.clear();
                }
                return Ok(None);
            }
        }

        match self.buffer[0] {
            ACK => {
                self.buffer.advance(1);
                return Ok(Some(SerialEvent::Ack));
            }
            NAK => {
                self.buffer.advance(1);
                return Ok(Some(SerialEvent::Nak));
            }
            CAN => {
                self.buffer.advance(1);
                return Ok(Some(SerialEvent::Can));
            }
            _ => {}
        }

        if self.buffer.len() < 2 {
            return Ok(None);
        }

        let length = self.buffer[1] as usize;
        if length < MIN_LENGTH_BYTE {
            // Not a real frame start, skip the SOF and resync
            self.buffer.advance(1);
            return Err(DriverError::InvalidFrame(format!(
                "Frame length {} is below minimum",
                length
            )));
        }

        let total_size = length + 2;
        if self.buffer.len() < total_size {
            trace!(
                have = self.buffer.len(),
                need = total_size,
                "Waiting for complete frame"
            );
            return Ok(None);
        }

        let raw = self.buffer.split_to(total_size);
        let expected = checksum(&raw[1..total_size - 1]);
        let got = raw[total_size - 1];
        if expected != got {
            return Err(DriverError::InvalidChecksum { expected, got });
        }

        let frame_type = FrameType::from_byte(raw[2]).ok_or_else(|| {
            DriverError::InvalidFrame(format!("Unknown frame type 0x{:02X}", raw[2]))
        })?;

        let frame = Frame {
            frame_type,
            function: FunctionType(raw[3]),
            payload: Bytes::copy_from_slice(&raw[4..total_size - 1]),
        };
        trace!(function = %frame.function, size = frame.payload.len(), "Decoded frame");
        Ok(Some(SerialEvent::Frame(frame)))
    }
}
