//! Tor cell protocol
//!
//! Implements the channel-level cell format exchanged with a relay.
//! Fixed-length cells always carry a 509-byte body; variable-length cells
//! (VERSIONS and every command >= 128) carry a 2-byte length prefix instead.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::{Result, TorError};

/// Body size of every fixed-length cell
pub const CELL_BODY_LEN: usize = 509;

/// Size of the key material carried by CREATE_FAST / CREATED_FAST
pub const FAST_KEY_LEN: usize = 20;

/// The opaque body of a RELAY cell before (or after) onion crypto
pub type RelayBody = [u8; CELL_BODY_LEN];

/// Cell command types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CellCommand {
    /// PADDING - used for padding
    Padding = 0,
    /// CREATE - create a circuit (deprecated)
    Create = 1,
    /// CREATED - circuit created (deprecated)
    Created = 2,
    /// RELAY - relay cell
    Relay = 3,
    /// DESTROY - destroy a circuit
    Destroy = 4,
    /// CREATE_FAST - fast circuit creation
    CreateFast = 5,
    /// CREATED_FAST - fast circuit created
    CreatedFast = 6,
    /// VERSIONS - negotiate versions
    Versions = 7,
    /// NETINFO - network info exchange
    Netinfo = 8,
    /// RELAY_EARLY - relay cell that can be sent early
    RelayEarly = 9,
    /// CREATE2 - create a circuit (current)
    Create2 = 10,
    /// CREATED2 - circuit created (current)
    Created2 = 11,
    /// PADDING_NEGOTIATE - negotiate padding
    PaddingNegotiate = 12,
    /// VPADDING - variable-length padding
    Vpadding = 128,
    /// CERTS - certificate cell
    Certs = 129,
    /// AUTH_CHALLENGE - authentication challenge
    AuthChallenge = 130,
    /// AUTHENTICATE - authenticate
    Authenticate = 131,
    /// AUTHORIZE - authorize
    Authorize = 132,
}

impl CellCommand {
    /// Parse command from byte
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            0 => Some(CellCommand::Padding),
            1 => Some(CellCommand::Create),
            2 => Some(CellCommand::Created),
            3 => Some(CellCommand::Relay),
            4 => Some(CellCommand::Destroy),
            5 => Some(CellCommand::CreateFast),
            6 => Some(CellCommand::CreatedFast),
            7 => Some(CellCommand::Versions),
            8 => Some(CellCommand::Netinfo),
            9 => Some(CellCommand::RelayEarly),
            10 => Some(CellCommand::Create2),
            11 => Some(CellCommand::Created2),
            12 => Some(CellCommand::PaddingNegotiate),
            128 => Some(CellCommand::Vpadding),
            129 => Some(CellCommand::Certs),
            130 => Some(CellCommand::AuthChallenge),
            131 => Some(CellCommand::Authenticate),
            132 => Some(CellCommand::Authorize),
            _ => None,
        }
    }

    /// Whether a command byte denotes a variable-length cell
    pub fn is_var_len_code(cmd: u8) -> bool {
        cmd == CellCommand::Versions as u8 || cmd >= 128
    }

    /// Whether this command is sent as a variable-length cell
    pub fn is_var_len(self) -> bool {
        Self::is_var_len_code(self as u8)
    }

    /// Width of the circuit-id field for a command byte.
    ///
    /// VERSIONS is negotiated before the link protocol is known and keeps the
    /// old 2-byte circuit id; everything else uses 4 bytes.
    pub fn circ_id_len(cmd: u8) -> usize {
        if cmd == CellCommand::Versions as u8 {
            2
        } else {
            4
        }
    }
}

/// Reason code carried by a DESTROY cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DestroyReason(u8);

impl DestroyReason {
    pub const NONE: DestroyReason = DestroyReason(0);
    pub const PROTOCOL: DestroyReason = DestroyReason(1);
    pub const INTERNAL: DestroyReason = DestroyReason(2);
    pub const REQUESTED: DestroyReason = DestroyReason(3);
    pub const HIBERNATING: DestroyReason = DestroyReason(4);
    pub const RESOURCELIMIT: DestroyReason = DestroyReason(5);
    pub const CONNECTFAILED: DestroyReason = DestroyReason(6);
    pub const OR_IDENTITY: DestroyReason = DestroyReason(7);
    pub const CHANNEL_CLOSED: DestroyReason = DestroyReason(8);
    pub const FINISHED: DestroyReason = DestroyReason(9);
    pub const TIMEOUT: DestroyReason = DestroyReason(10);
    pub const DESTROYED: DestroyReason = DestroyReason(11);
    pub const NOSUCHSERVICE: DestroyReason = DestroyReason(12);

    /// Raw reason byte
    pub fn code(self) -> u8 {
        self.0
    }

    /// Human-readable reason name
    pub fn name(self) -> &'static str {
        match self.0 {
            0 => "NONE",
            1 => "PROTOCOL",
            2 => "INTERNAL",
            3 => "REQUESTED",
            4 => "HIBERNATING",
            5 => "RESOURCELIMIT",
            6 => "CONNECTFAILED",
            7 => "OR_IDENTITY",
            8 => "CHANNEL_CLOSED",
            9 => "FINISHED",
            10 => "TIMEOUT",
            11 => "DESTROYED",
            12 => "NOSUCHSERVICE",
            _ => "UNKNOWN",
        }
    }
}

impl From<u8> for DestroyReason {
    fn from(code: u8) -> Self {
        DestroyReason(code)
    }
}

/// One certificate inside a CERTS cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertEntry {
    /// Certificate type
    pub cert_type: u8,
    /// Encoded certificate, left uninterpreted
    pub body: Vec<u8>,
}

/// An address record inside a NETINFO cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetAddr {
    /// Address type (4 = IPv4, 6 = IPv6, anything else is opaque)
    pub addr_type: u8,
    /// Raw address bytes
    pub value: Vec<u8>,
}

impl NetAddr {
    pub const TYPE_IPV4: u8 = 4;
    pub const TYPE_IPV6: u8 = 6;

    /// Encode an IP address
    pub fn from_ip(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Self {
                addr_type: Self::TYPE_IPV4,
                value: v4.octets().to_vec(),
            },
            IpAddr::V6(v6) => Self {
                addr_type: Self::TYPE_IPV6,
                value: v6.octets().to_vec(),
            },
        }
    }

    /// Interpret the record as an IP address, if it is one
    pub fn to_ip(&self) -> Option<IpAddr> {
        match (self.addr_type, self.value.len()) {
            (Self::TYPE_IPV4, 4) => {
                let octets: [u8; 4] = self.value.as_slice().try_into().ok()?;
                Some(IpAddr::V4(Ipv4Addr::from(octets)))
            }
            (Self::TYPE_IPV6, 16) => {
                let octets: [u8; 16] = self.value.as_slice().try_into().ok()?;
                Some(IpAddr::V6(Ipv6Addr::from(octets)))
            }
            _ => None,
        }
    }

    fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        let len = u8::try_from(self.value.len())
            .map_err(|_| TorError::Malformed("NETINFO address too long".into()))?;
        out.push(self.addr_type);
        out.push(len);
        out.extend_from_slice(&self.value);
        Ok(())
    }

    fn decode(r: &mut BodyReader<'_>) -> Result<Self> {
        let addr_type = r.u8()?;
        let len = r.u8()? as usize;
        let value = r.take(len)?.to_vec();
        Ok(Self { addr_type, value })
    }
}

/// Decoded body of a channel cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChanMsg {
    /// Link protocol versions we (or the relay) support
    Versions { versions: Vec<u16> },
    /// Certificate bundle
    Certs { certs: Vec<CertEntry> },
    /// Relay authentication challenge; a client has no use for its contents
    AuthChallenge,
    /// Time and address information
    Netinfo {
        timestamp: u32,
        other_addr: NetAddr,
        my_addrs: Vec<NetAddr>,
    },
    /// One-hop handshake request
    CreateFast { key_material: [u8; FAST_KEY_LEN] },
    /// One-hop handshake response
    CreatedFast {
        key_material: [u8; FAST_KEY_LEN],
        kh: [u8; FAST_KEY_LEN],
    },
    /// Onion-encrypted relay body, opaque until decrypted by the circuit
    Relay { body: Box<RelayBody> },
    /// Circuit teardown
    Destroy { reason: DestroyReason },
}

impl ChanMsg {
    /// Command byte for this message
    pub fn command(&self) -> CellCommand {
        match self {
            ChanMsg::Versions { .. } => CellCommand::Versions,
            ChanMsg::Certs { .. } => CellCommand::Certs,
            ChanMsg::AuthChallenge => CellCommand::AuthChallenge,
            ChanMsg::Netinfo { .. } => CellCommand::Netinfo,
            ChanMsg::CreateFast { .. } => CellCommand::CreateFast,
            ChanMsg::CreatedFast { .. } => CellCommand::CreatedFast,
            ChanMsg::Relay { .. } => CellCommand::Relay,
            ChanMsg::Destroy { .. } => CellCommand::Destroy,
        }
    }

    fn encode_body(&self, out: &mut Vec<u8>) -> Result<()> {
        match self {
            ChanMsg::Versions { versions } => {
                for v in versions {
                    out.extend_from_slice(&v.to_be_bytes());
                }
            }
            ChanMsg::Certs { certs } => {
                let n = u8::try_from(certs.len())
                    .map_err(|_| TorError::Malformed("too many certificates".into()))?;
                out.push(n);
                for cert in certs {
                    let len = u16::try_from(cert.body.len())
                        .map_err(|_| TorError::Malformed("certificate too long".into()))?;
                    out.push(cert.cert_type);
                    out.extend_from_slice(&len.to_be_bytes());
                    out.extend_from_slice(&cert.body);
                }
            }
            ChanMsg::AuthChallenge => {}
            ChanMsg::Netinfo {
                timestamp,
                other_addr,
                my_addrs,
            } => {
                out.extend_from_slice(&timestamp.to_be_bytes());
                other_addr.encode(out)?;
                let n = u8::try_from(my_addrs.len())
                    .map_err(|_| TorError::Malformed("too many NETINFO addresses".into()))?;
                out.push(n);
                for addr in my_addrs {
                    addr.encode(out)?;
                }
            }
            ChanMsg::CreateFast { key_material } => out.extend_from_slice(key_material),
            ChanMsg::CreatedFast { key_material, kh } => {
                out.extend_from_slice(key_material);
                out.extend_from_slice(kh);
            }
            ChanMsg::Relay { body } => out.extend_from_slice(&body[..]),
            ChanMsg::Destroy { reason } => out.push(reason.code()),
        }
        Ok(())
    }
}

/// Tor cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    /// Circuit ID (2 bytes on the wire for VERSIONS, 4 otherwise)
    circ_id: u32,

    /// Decoded message
    msg: ChanMsg,
}

impl Cell {
    /// Create a new cell
    pub fn new(circ_id: u32, msg: ChanMsg) -> Self {
        Self { circ_id, msg }
    }

    /// Create a RELAY cell around an already encrypted body
    pub fn relay(circ_id: u32, body: RelayBody) -> Self {
        Self::new(
            circ_id,
            ChanMsg::Relay {
                body: Box::new(body),
            },
        )
    }

    /// Create a DESTROY cell
    pub fn destroy(circ_id: u32, reason: DestroyReason) -> Self {
        Self::new(circ_id, ChanMsg::Destroy { reason })
    }

    pub fn circ_id(&self) -> u32 {
        self.circ_id
    }

    pub fn msg(&self) -> &ChanMsg {
        &self.msg
    }

    pub fn into_msg(self) -> ChanMsg {
        self.msg
    }

    pub fn command(&self) -> CellCommand {
        self.msg.command()
    }

    /// Serialize cell to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let command = self.command();
        let mut body = Vec::with_capacity(CELL_BODY_LEN);
        self.msg.encode_body(&mut body)?;

        let mut buf = Vec::with_capacity(4 + 1 + 2 + body.len().max(CELL_BODY_LEN));

        if CellCommand::circ_id_len(command as u8) == 2 {
            let circ_id = u16::try_from(self.circ_id).map_err(|_| {
                TorError::Malformed(format!(
                    "circuit id {:#x} does not fit a {:?} cell",
                    self.circ_id, command
                ))
            })?;
            buf.extend_from_slice(&circ_id.to_be_bytes());
        } else {
            buf.extend_from_slice(&self.circ_id.to_be_bytes());
        }

        buf.push(command as u8);

        if command.is_var_len() {
            let len = u16::try_from(body.len())
                .map_err(|_| TorError::Malformed("variable-length body too long".into()))?;
            buf.extend_from_slice(&len.to_be_bytes());
            buf.extend_from_slice(&body);
        } else {
            if body.len() > CELL_BODY_LEN {
                return Err(TorError::Malformed(format!(
                    "{:?} body is {} bytes, limit is {}",
                    command,
                    body.len(),
                    CELL_BODY_LEN
                )));
            }
            buf.extend_from_slice(&body);
            // Pad to fixed size
            buf.resize(buf.len() + CELL_BODY_LEN - body.len(), 0);
        }

        Ok(buf)
    }

    /// Parse a cell body, dispatching on the command byte
    pub fn parse(circ_id: u32, command: u8, body: &[u8]) -> Result<Self> {
        let cmd = CellCommand::from_u8(command).ok_or(TorError::UnknownCommand(command))?;
        let mut r = BodyReader::new(body);

        let msg = match cmd {
            CellCommand::Versions => {
                let versions = body
                    .chunks_exact(2)
                    .map(|c| u16::from_be_bytes([c[0], c[1]]))
                    .collect();
                ChanMsg::Versions { versions }
            }
            CellCommand::Certs => {
                let n = r.u8()?;
                let mut certs = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    let cert_type = r.u8()?;
                    let len = r.u16()? as usize;
                    let body = r.take(len)?.to_vec();
                    certs.push(CertEntry { cert_type, body });
                }
                ChanMsg::Certs { certs }
            }
            CellCommand::AuthChallenge => ChanMsg::AuthChallenge,
            CellCommand::Netinfo => {
                let timestamp = r.u32()?;
                let other_addr = NetAddr::decode(&mut r)?;
                let n = r.u8()?;
                let mut my_addrs = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    my_addrs.push(NetAddr::decode(&mut r)?);
                }
                ChanMsg::Netinfo {
                    timestamp,
                    other_addr,
                    my_addrs,
                }
            }
            CellCommand::CreateFast => ChanMsg::CreateFast {
                key_material: r.array()?,
            },
            CellCommand::CreatedFast => ChanMsg::CreatedFast {
                key_material: r.array()?,
                kh: r.array()?,
            },
            CellCommand::Relay => ChanMsg::Relay {
                body: Box::new(r.array()?),
            },
            CellCommand::Destroy => ChanMsg::Destroy {
                reason: DestroyReason::from(r.u8()?),
            },
            _ => return Err(TorError::UnknownCommand(command)),
        };

        Ok(Self { circ_id, msg })
    }
}

/// Bounds-checked big-endian reader over a cell body
pub(crate) struct BodyReader<'a> {
    body: &'a [u8],
    pos: usize,
}

impl<'a> BodyReader<'a> {
    pub(crate) fn new(body: &'a [u8]) -> Self {
        Self { body, pos: 0 }
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.body.len())
            .ok_or_else(|| {
                TorError::Malformed(format!(
                    "body truncated: wanted {} bytes at offset {}, have {}",
                    n,
                    self.pos,
                    self.body.len()
                ))
            })?;
        let out = &self.body[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }
}
