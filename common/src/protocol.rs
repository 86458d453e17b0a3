//! Framed binary protocol of the host link.
//!
//! Every frame is laid out as
//!
//! ```text
//! START_BYTE | id | len | payload (len bytes) | checksum
//! ```
//!
//! where the checksum is the wrapping sum of id, len and all payload bytes.
//! Multi-byte fields are little endian.

use core::convert::TryFrom;
use core::fmt;

use crate::bulk::BulkStatus;
use crate::clock::Instant;
use crate::homing::{HomingMode, HomingRequest};
use crate::pool::PoolError;
use crate::sensor::HomeState;

/// Sync byte for the protocol.
pub const START_BYTE: u8 = 0xA5;

/// Longest accepted payload.
pub const MAX_PAYLOAD: usize = 64;

/// Longest frame, including framing overhead.
pub const MAX_FRAME: usize = MAX_PAYLOAD + 4;

/// Object id used in error reports that do not concern a sensor.
pub const NO_OID: u8 = 0xff;

// Command ids (host to MCU)
pub const MSG_CONFIG: u8 = 0x01;
pub const MSG_CONFIG_WITH_INTB: u8 = 0x02;
pub const MSG_SETUP_HOME: u8 = 0x03;
pub const MSG_QUERY_HOME_STATE: u8 = 0x04;
pub const MSG_QUERY: u8 = 0x05;
pub const MSG_QUERY_STATUS: u8 = 0x06;

// Response ids (MCU to host)
pub const MSG_HOME_STATE: u8 = 0x81;
pub const MSG_BULK_STATUS: u8 = 0x82;
pub const MSG_BULK_DATA: u8 = 0x83;
pub const MSG_TRIGGER: u8 = 0x84;
pub const MSG_ERROR: u8 = 0x85;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Config {
        oid: u8,
        bus_device: u8,
        intb_pin: Option<u8>,
    },
    SetupHome {
        oid: u8,
        request: HomingRequest,
    },
    QueryHomeState {
        oid: u8,
    },
    /// Start (non-zero `rest_ticks`) or stop sampling.
    Query {
        oid: u8,
        rest_ticks: u32,
    },
    QueryStatus {
        oid: u8,
    },
}

impl Command {
    pub fn oid(&self) -> u8 {
        match *self {
            Command::Config { oid, .. }
            | Command::SetupHome { oid, .. }
            | Command::QueryHomeState { oid }
            | Command::Query { oid, .. }
            | Command::QueryStatus { oid } => oid,
        }
    }
}

/// Error codes reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    UnknownOid = 1,
    OidOutOfRange = 2,
    OidInUse = 3,
    UnknownBusDevice = 4,
    InvalidHomingMode = 5,
    MalformedFrame = 6,
    /// The requested data ready pin does not exist or is taken.
    InvalidPin = 7,
}

impl From<PoolError> for ErrorCode {
    fn from(error: PoolError) -> Self {
        match error {
            PoolError::OutOfRange(_) => ErrorCode::OidOutOfRange,
            PoolError::AlreadyConfigured(_) => ErrorCode::OidInUse,
            PoolError::NotConfigured(_) => ErrorCode::UnknownOid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    BadChecksum { expected: u8, received: u8 },
    UnknownMessage(u8),
    PayloadTooLong(u8),
    /// Payload length does not match the message id.
    BadLength { id: u8, len: u8 },
    InvalidHomingMode { oid: u8, mode: u8 },
}

impl ProtocolError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ProtocolError::InvalidHomingMode { .. } => ErrorCode::InvalidHomingMode,
            _ => ErrorCode::MalformedFrame,
        }
    }

    /// The object id the failed command was addressed to, if known.
    pub fn oid(&self) -> u8 {
        match *self {
            ProtocolError::InvalidHomingMode { oid, .. } => oid,
            _ => NO_OID,
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadChecksum { expected, received } => write!(
                f,
                "Bad checksum (expected {:#04x}, received {:#04x})",
                expected, received
            ),
            Self::UnknownMessage(id) => write!(f, "Unknown message id {:#04x}", id),
            Self::PayloadTooLong(len) => write!(f, "Payload too long ({} bytes)", len),
            Self::BadLength { id, len } => {
                write!(f, "Bad payload length {} for message {:#04x}", len, id)
            }
            Self::InvalidHomingMode { oid, mode } => {
                write!(f, "Invalid homing mode {} for oid {}", mode, oid)
            }
        }
    }
}

fn expected_len(id: u8) -> Option<u8> {
    match id {
        MSG_CONFIG => Some(2),
        MSG_CONFIG_WITH_INTB => Some(3),
        MSG_SETUP_HOME => Some(13),
        MSG_QUERY_HOME_STATE | MSG_QUERY_STATUS => Some(1),
        MSG_QUERY => Some(5),
        _ => None,
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn decode_command(id: u8, payload: &[u8]) -> Result<Command, ProtocolError> {
    let len = payload.len() as u8;
    match expected_len(id) {
        None => return Err(ProtocolError::UnknownMessage(id)),
        Some(expected) if expected != len => return Err(ProtocolError::BadLength { id, len }),
        Some(_) => {}
    }
    let oid = payload[0];
    let command = match id {
        MSG_CONFIG => Command::Config {
            oid,
            bus_device: payload[1],
            intb_pin: None,
        },
        MSG_CONFIG_WITH_INTB => Command::Config {
            oid,
            bus_device: payload[1],
            intb_pin: Some(payload[2]),
        },
        MSG_SETUP_HOME => {
            let mode = HomingMode::try_from(payload[12])
                .map_err(|mode| ProtocolError::InvalidHomingMode { oid, mode })?;
            Command::SetupHome {
                oid,
                request: HomingRequest {
                    grace_deadline: Instant::from_ticks(read_u32(&payload[1..5])),
                    trigger_threshold: read_u32(&payload[5..9]),
                    sync_oid: payload[9],
                    trigger_reason: payload[10],
                    error_reason: payload[11],
                    mode,
                },
            }
        }
        MSG_QUERY_HOME_STATE => Command::QueryHomeState { oid },
        MSG_QUERY => Command::Query {
            oid,
            rest_ticks: read_u32(&payload[1..5]),
        },
        MSG_QUERY_STATUS => Command::QueryStatus { oid },
        _ => return Err(ProtocolError::UnknownMessage(id)),
    };
    Ok(command)
}

enum State {
    WaitStart,
    WaitId,
    WaitLen { id: u8 },
    Payload { id: u8, len: u8 },
    WaitChecksum { id: u8, len: u8 },
}

/// Byte-at-a-time command parser.
///
/// After an error the parser waits for the next start byte.
pub struct Parser {
    state: State,
    checksum: u8,
    payload: [u8; MAX_PAYLOAD],
    received: usize,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    pub const fn new() -> Self {
        Self {
            state: State::WaitStart,
            checksum: 0,
            payload: [0; MAX_PAYLOAD],
            received: 0,
        }
    }

    /// Process a single incoming byte. Returns `Some` once a frame is
    /// complete or has been rejected.
    pub fn push(&mut self, byte: u8) -> Option<Result<Command, ProtocolError>> {
        match self.state {
            State::WaitStart => {
                if byte == START_BYTE {
                    self.state = State::WaitId;
                    self.checksum = 0;
                    self.received = 0;
                }
            }
            State::WaitId => {
                self.checksum = self.checksum.wrapping_add(byte);
                if expected_len(byte).is_none() {
                    self.state = State::WaitStart;
                    return Some(Err(ProtocolError::UnknownMessage(byte)));
                }
                self.state = State::WaitLen { id: byte };
            }
            State::WaitLen { id } => {
                self.checksum = self.checksum.wrapping_add(byte);
                if usize::from(byte) > MAX_PAYLOAD {
                    self.state = State::WaitStart;
                    return Some(Err(ProtocolError::PayloadTooLong(byte)));
                }
                self.state = if byte == 0 {
                    State::WaitChecksum { id, len: 0 }
                } else {
                    State::Payload { id, len: byte }
                };
            }
            State::Payload { id, len } => {
                self.checksum = self.checksum.wrapping_add(byte);
                self.payload[self.received] = byte;
                self.received += 1;
                if self.received == usize::from(len) {
                    self.state = State::WaitChecksum { id, len };
                }
            }
            State::WaitChecksum { id, len } => {
                self.state = State::WaitStart;
                if byte != self.checksum {
                    return Some(Err(ProtocolError::BadChecksum {
                        expected: self.checksum,
                        received: byte,
                    }));
                }
                return Some(decode_command(id, &self.payload[..usize::from(len)]));
            }
        }
        None
    }
}

/// Messages sent to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response<'a> {
    HomeState(HomeState),
    BulkStatus(BulkStatus),
    BulkData {
        oid: u8,
        sequence: u16,
        data: &'a [u8],
    },
    Trigger {
        sync_oid: u8,
        reason: u8,
    },
    Error {
        code: ErrorCode,
        oid: u8,
    },
}

struct FrameWriter<'a> {
    buf: &'a mut [u8; MAX_FRAME],
    pos: usize,
}

impl<'a> FrameWriter<'a> {
    fn new(buf: &'a mut [u8; MAX_FRAME], id: u8) -> Self {
        buf[0] = START_BYTE;
        buf[1] = id;
        Self { buf, pos: 3 }
    }

    fn put(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    fn finish(self) -> usize {
        let len = self.pos - 3;
        self.buf[2] = len as u8;
        let checksum = self.buf[1..self.pos]
            .iter()
            .fold(0u8, |sum, byte| sum.wrapping_add(*byte));
        self.buf[self.pos] = checksum;
        self.pos + 1
    }
}

impl<'a> Response<'a> {
    /// Encode the frame into `buf`, return the frame length.
    pub fn encode(&self, buf: &mut [u8; MAX_FRAME]) -> usize {
        match *self {
            Response::HomeState(state) => {
                let mut w = FrameWriter::new(buf, MSG_HOME_STATE);
                w.put(&[state.oid, u8::from(state.homing)]);
                w.put(&state.trigger_clock.to_le_bytes());
                w.finish()
            }
            Response::BulkStatus(status) => {
                let mut w = FrameWriter::new(buf, MSG_BULK_STATUS);
                w.put(&[status.oid]);
                w.put(&status.clock.to_le_bytes());
                w.put(&status.query_ticks.to_le_bytes());
                w.put(&status.next_sequence.to_le_bytes());
                w.put(&status.buffered.to_le_bytes());
                w.put(&status.possible_overflows.to_le_bytes());
                w.finish()
            }
            Response::BulkData {
                oid,
                sequence,
                data,
            } => {
                let mut w = FrameWriter::new(buf, MSG_BULK_DATA);
                w.put(&[oid]);
                w.put(&sequence.to_le_bytes());
                w.put(data);
                w.finish()
            }
            Response::Trigger { sync_oid, reason } => {
                let mut w = FrameWriter::new(buf, MSG_TRIGGER);
                w.put(&[sync_oid, reason]);
                w.finish()
            }
            Response::Error { code, oid } => {
                let mut w = FrameWriter::new(buf, MSG_ERROR);
                w.put(&[code as u8, oid]);
                w.finish()
            }
        }
    }
}
