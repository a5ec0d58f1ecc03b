//! Relay messages
//!
//! The plaintext carried inside a RELAY cell once every onion layer has been
//! removed. Layout of the 509-byte relay body:
//!
//! ```text
//! Command (1) | Recognized (2) | StreamID (2) | Digest (4) | Length (2) | Data (498)
//! ```

use std::ops::Range;

use super::cell::{BodyReader, RelayBody, CELL_BODY_LEN};
use crate::error::{Result, TorError};

/// Size of the fixed relay header
pub const RELAY_HEADER_LEN: usize = 11;

/// Maximum data size in a relay cell
pub const RELAY_PAYLOAD_LEN: usize = CELL_BODY_LEN - RELAY_HEADER_LEN;

/// Position of the running-digest field inside a relay body
pub const DIGEST_RANGE: Range<usize> = 5..9;

/// Length of a SENDME v1 authentication tag
pub const SENDME_TAG_LEN: usize = 20;

/// Relay command types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RelayCommand {
    /// BEGIN - open stream
    Begin = 1,
    /// DATA - relay data
    Data = 2,
    /// END - close stream
    End = 3,
    /// CONNECTED - stream connected
    Connected = 4,
    /// SENDME - flow control
    Sendme = 5,
    /// EXTEND - extend circuit (deprecated)
    Extend = 6,
    /// EXTENDED - circuit extended (deprecated)
    Extended = 7,
    /// TRUNCATE - truncate circuit
    Truncate = 8,
    /// TRUNCATED - circuit truncated
    Truncated = 9,
    /// DROP - drop cell
    Drop = 10,
    /// RESOLVE - DNS resolve
    Resolve = 11,
    /// RESOLVED - DNS resolved
    Resolved = 12,
    /// BEGIN_DIR - begin directory connection
    BeginDir = 13,
    /// EXTEND2 - extend circuit (current)
    Extend2 = 14,
    /// EXTENDED2 - circuit extended (current)
    Extended2 = 15,
}

impl RelayCommand {
    /// Parse relay command from byte
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            1 => Some(RelayCommand::Begin),
            2 => Some(RelayCommand::Data),
            3 => Some(RelayCommand::End),
            4 => Some(RelayCommand::Connected),
            5 => Some(RelayCommand::Sendme),
            6 => Some(RelayCommand::Extend),
            7 => Some(RelayCommand::Extended),
            8 => Some(RelayCommand::Truncate),
            9 => Some(RelayCommand::Truncated),
            10 => Some(RelayCommand::Drop),
            11 => Some(RelayCommand::Resolve),
            12 => Some(RelayCommand::Resolved),
            13 => Some(RelayCommand::BeginDir),
            14 => Some(RelayCommand::Extend2),
            15 => Some(RelayCommand::Extended2),
            _ => None,
        }
    }
}

/// END reason sent when we are done with a stream
pub const END_REASON_DONE: u8 = 6;

/// END reason assumed when the relay sends an END without one
pub const END_REASON_MISC: u8 = 1;

/// A decoded relay message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMsg {
    /// Open a stream; `target` is the raw `ADDRPORT [FLAGS]` body
    Begin { target: Vec<u8> },
    /// Stream data
    Data(Vec<u8>),
    /// Stream closed
    End { reason: u8 },
    /// Stream opened; the body (resolved address, TTL) is left raw
    Connected(Vec<u8>),
    /// Flow-control acknowledgement
    Sendme { version: u8, tag: Option<[u8; SENDME_TAG_LEN]> },
    /// Open a stream to the relay's directory port
    BeginDir,
    /// Long-range padding
    Drop,
    /// Any command this client does not interpret
    Unrecognized { command: u8, body: Vec<u8> },
}

impl RelayMsg {
    /// Command byte for this message
    pub fn command_byte(&self) -> u8 {
        match self {
            RelayMsg::Begin { .. } => RelayCommand::Begin as u8,
            RelayMsg::Data(_) => RelayCommand::Data as u8,
            RelayMsg::End { .. } => RelayCommand::End as u8,
            RelayMsg::Connected(_) => RelayCommand::Connected as u8,
            RelayMsg::Sendme { .. } => RelayCommand::Sendme as u8,
            RelayMsg::BeginDir => RelayCommand::BeginDir as u8,
            RelayMsg::Drop => RelayCommand::Drop as u8,
            RelayMsg::Unrecognized { command, .. } => *command,
        }
    }

    /// Relay command, if the byte is one we know
    pub fn command(&self) -> Option<RelayCommand> {
        RelayCommand::from_u8(self.command_byte())
    }

    /// SENDME carrying the given version; v1 authenticates with `tag`
    pub fn sendme(version: u8, tag: [u8; SENDME_TAG_LEN]) -> Self {
        if version == 0 {
            RelayMsg::Sendme { version, tag: None }
        } else {
            RelayMsg::Sendme {
                version,
                tag: Some(tag),
            }
        }
    }

    fn encode_payload(&self) -> Vec<u8> {
        match self {
            RelayMsg::Begin { target } => target.clone(),
            RelayMsg::Data(data) | RelayMsg::Connected(data) => data.clone(),
            RelayMsg::End { reason } => vec![*reason],
            RelayMsg::Sendme { version, tag } => match tag {
                None => Vec::new(),
                Some(tag) => {
                    let mut out = Vec::with_capacity(3 + SENDME_TAG_LEN);
                    out.push(*version);
                    out.extend_from_slice(&(SENDME_TAG_LEN as u16).to_be_bytes());
                    out.extend_from_slice(tag);
                    out
                }
            },
            RelayMsg::BeginDir | RelayMsg::Drop => Vec::new(),
            RelayMsg::Unrecognized { body, .. } => body.clone(),
        }
    }

    fn decode_payload(command: u8, payload: &[u8]) -> Result<Self> {
        let msg = match RelayCommand::from_u8(command) {
            Some(RelayCommand::Begin) => RelayMsg::Begin {
                target: payload.to_vec(),
            },
            Some(RelayCommand::Data) => RelayMsg::Data(payload.to_vec()),
            Some(RelayCommand::End) => RelayMsg::End {
                reason: payload.first().copied().unwrap_or(END_REASON_MISC),
            },
            Some(RelayCommand::Connected) => RelayMsg::Connected(payload.to_vec()),
            Some(RelayCommand::Sendme) => {
                if payload.is_empty() {
                    RelayMsg::Sendme {
                        version: 0,
                        tag: None,
                    }
                } else {
                    let mut r = BodyReader::new(payload);
                    let version = r.u8()?;
                    let len = r.u16()? as usize;
                    let data = r.take(len)?;
                    let tag: Option<[u8; SENDME_TAG_LEN]> = match version {
                        0 => None,
                        _ => Some(data.try_into().map_err(|_| {
                            TorError::Malformed(format!("SENDME v{} tag of {} bytes", version, len))
                        })?),
                    };
                    RelayMsg::Sendme { version, tag }
                }
            }
            Some(RelayCommand::BeginDir) => RelayMsg::BeginDir,
            Some(RelayCommand::Drop) => RelayMsg::Drop,
            _ => RelayMsg::Unrecognized {
                command,
                body: payload.to_vec(),
            },
        };
        Ok(msg)
    }
}

/// A relay message addressed to a stream (0 = the circuit itself)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCell {
    /// Stream ID
    pub stream_id: u16,

    /// Message
    pub msg: RelayMsg,
}

impl RelayCell {
    /// Create a new relay cell
    pub fn new(stream_id: u16, msg: RelayMsg) -> Self {
        Self { stream_id, msg }
    }

    /// Relay command byte
    pub fn command_byte(&self) -> u8 {
        self.msg.command_byte()
    }

    /// Lay the message out as a relay body with a zeroed digest field
    pub fn encode(&self) -> Result<RelayBody> {
        let payload = self.msg.encode_payload();
        if payload.len() > RELAY_PAYLOAD_LEN {
            return Err(TorError::Malformed(format!(
                "relay payload is {} bytes, limit is {}",
                payload.len(),
                RELAY_PAYLOAD_LEN
            )));
        }

        let mut body = [0u8; CELL_BODY_LEN];
        body[0] = self.command_byte();
        // Recognized (1..3) and digest (5..9) stay zero
        body[3..5].copy_from_slice(&self.stream_id.to_be_bytes());
        body[9..11].copy_from_slice(&(payload.len() as u16).to_be_bytes());
        body[RELAY_HEADER_LEN..RELAY_HEADER_LEN + payload.len()].copy_from_slice(&payload);
        Ok(body)
    }

    /// Interpret a fully decrypted relay body
    pub fn decode(body: &RelayBody) -> Result<Self> {
        let command = body[0];
        let stream_id = u16::from_be_bytes([body[3], body[4]]);
        let length = u16::from_be_bytes([body[9], body[10]]) as usize;

        if length > RELAY_PAYLOAD_LEN {
            return Err(TorError::Malformed(format!(
                "relay length field {} exceeds {}",
                length, RELAY_PAYLOAD_LEN
            )));
        }

        let payload = &body[RELAY_HEADER_LEN..RELAY_HEADER_LEN + length];
        let msg = RelayMsg::decode_payload(command, payload)?;

        Ok(Self { stream_id, msg })
    }
}
