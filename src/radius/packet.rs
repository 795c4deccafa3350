//! RADIUS Dynamic Authorization packet codec (RFC 5176).
//!
//! Only the handful of attributes the portal sends or inspects get their own
//! variant; everything else is carried through as raw octets.

use std::net::Ipv4Addr;

use anyhow::{bail, ensure, Result};
use bytes::{BufMut, Bytes, BytesMut};
use md5::{Digest, Md5};

pub const HEADER_LEN: usize = 20;
pub const MAX_PACKET_LEN: usize = 4096;
pub const AUTHENTICATOR_LEN: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Code {
    DisconnectRequest,
    DisconnectAck,
    DisconnectNak,
    CoaRequest,
    CoaAck,
    CoaNak,
}

impl Code {
    pub fn as_u8(self) -> u8 {
        match self {
            Code::DisconnectRequest => 40,
            Code::DisconnectAck => 41,
            Code::DisconnectNak => 42,
            Code::CoaRequest => 43,
            Code::CoaAck => 44,
            Code::CoaNak => 45,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            40 => Code::DisconnectRequest,
            41 => Code::DisconnectAck,
            42 => Code::DisconnectNak,
            43 => Code::CoaRequest,
            44 => Code::CoaAck,
            45 => Code::CoaNak,
            _ => return None,
        })
    }

    /// `(ack, nak)` codes that answer this request code.
    pub fn replies(self) -> Option<(Code, Code)> {
        match self {
            Code::DisconnectRequest => Some((Code::DisconnectAck, Code::DisconnectNak)),
            Code::CoaRequest => Some((Code::CoaAck, Code::CoaNak)),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Attribute {
    UserName(String),
    FramedIpAddress(Ipv4Addr),
    SessionTimeout(u32),
    CallingStationId(String),
    NasIdentifier(String),
    EventTimestamp(u32),
    ErrorCause(u32),
    Other { kind: u8, value: Bytes },
}

impl Attribute {
    pub fn kind(&self) -> u8 {
        match self {
            Attribute::UserName(_) => 1,
            Attribute::FramedIpAddress(_) => 8,
            Attribute::SessionTimeout(_) => 27,
            Attribute::CallingStationId(_) => 31,
            Attribute::NasIdentifier(_) => 32,
            Attribute::EventTimestamp(_) => 55,
            Attribute::ErrorCause(_) => 101,
            Attribute::Other { kind, .. } => *kind,
        }
    }

    fn value_bytes(&self) -> Vec<u8> {
        match self {
            Attribute::UserName(s) | Attribute::CallingStationId(s) | Attribute::NasIdentifier(s) => {
                s.as_bytes().to_vec()
            }
            Attribute::FramedIpAddress(ip) => ip.octets().to_vec(),
            Attribute::SessionTimeout(v) | Attribute::EventTimestamp(v) | Attribute::ErrorCause(v) => {
                v.to_be_bytes().to_vec()
            }
            Attribute::Other { value, .. } => value.to_vec(),
        }
    }

    fn decode(kind: u8, value: &[u8]) -> Result<Self> {
        let text = || String::from_utf8(value.to_vec());
        let int = || -> Result<u32> {
            ensure!(value.len() == 4, "attribute {} expects 4 octets, got {}", kind, value.len());
            Ok(u32::from_be_bytes([value[0], value[1], value[2], value[3]]))
        };
        Ok(match kind {
            1 => Attribute::UserName(text()?),
            8 => {
                ensure!(value.len() == 4, "Framed-IP-Address expects 4 octets");
                Attribute::FramedIpAddress(Ipv4Addr::new(value[0], value[1], value[2], value[3]))
            }
            27 => Attribute::SessionTimeout(int()?),
            31 => Attribute::CallingStationId(text()?),
            32 => Attribute::NasIdentifier(text()?),
            55 => Attribute::EventTimestamp(int()?),
            101 => Attribute::ErrorCause(int()?),
            _ => Attribute::Other {
                kind,
                value: Bytes::copy_from_slice(value),
            },
        })
    }
}

/// Human-readable text for the RFC 5176 Error-Cause values a NAS is likely to send.
pub fn error_cause_text(cause: u32) -> &'static str {
    match cause {
        201 => "Residual Session Context Removed",
        202 => "Invalid EAP Packet",
        401 => "Unsupported Attribute",
        402 => "Missing Attribute",
        403 => "NAS Identification Mismatch",
        404 => "Invalid Request",
        405 => "Unsupported Service",
        406 => "Unsupported Extension",
        407 => "Invalid Attribute Value",
        501 => "Administratively Prohibited",
        502 => "Request Not Routable (Proxy)",
        503 => "Session Context Not Found",
        504 => "Session Context Not Removable",
        505 => "Other Proxy Processing Error",
        506 => "Resources Unavailable",
        507 => "Request Initiated",
        508 => "Multiple Session Selection Unsupported",
        _ => "Unknown Error-Cause",
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub code: Code,
    pub identifier: u8,
    pub authenticator: [u8; AUTHENTICATOR_LEN],
    pub attributes: Vec<Attribute>,
}

impl Packet {
    pub fn new(code: Code, identifier: u8, attributes: Vec<Attribute>) -> Self {
        Self {
            code,
            identifier,
            authenticator: [0; AUTHENTICATOR_LEN],
            attributes,
        }
    }

    pub fn error_cause(&self) -> Option<u32> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::ErrorCause(c) => Some(*c),
            _ => None,
        })
    }

    /// Serialize with the authenticator computed over `seed` in the
    /// authenticator field: all zeros for a request, the request's
    /// authenticator for a response. Stores the result in `self.authenticator`.
    pub fn encode(&mut self, seed: &[u8; AUTHENTICATOR_LEN], secret: &[u8]) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + 64);
        buf.put_u8(self.code.as_u8());
        buf.put_u8(self.identifier);
        buf.put_u16(0); // patched below
        buf.put_slice(seed);

        for attr in &self.attributes {
            let value = attr.value_bytes();
            ensure!(value.len() <= 253, "attribute {} value too long", attr.kind());
            buf.put_u8(attr.kind());
            buf.put_u8((value.len() + 2) as u8);
            buf.put_slice(&value);
        }

        ensure!(buf.len() <= MAX_PACKET_LEN, "packet exceeds {} octets", MAX_PACKET_LEN);
        let len = buf.len() as u16;
        buf[2..4].copy_from_slice(&len.to_be_bytes());

        let auth = digest(&buf, secret);
        buf[4..HEADER_LEN].copy_from_slice(&auth);
        self.authenticator = auth;
        Ok(buf.freeze())
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        ensure!(raw.len() >= HEADER_LEN, "short packet ({} octets)", raw.len());
        let code = match Code::from_u8(raw[0]) {
            Some(c) => c,
            None => bail!("unsupported RADIUS code {}", raw[0]),
        };
        let declared = u16::from_be_bytes([raw[2], raw[3]]) as usize;
        ensure!(
            (HEADER_LEN..=MAX_PACKET_LEN).contains(&declared) && declared <= raw.len(),
            "bad length field {} for {} octets",
            declared,
            raw.len()
        );

        let mut authenticator = [0u8; AUTHENTICATOR_LEN];
        authenticator.copy_from_slice(&raw[4..HEADER_LEN]);

        let mut attributes = Vec::new();
        let mut pos = HEADER_LEN;
        while pos < declared {
            ensure!(pos + 2 <= declared, "truncated attribute header");
            let kind = raw[pos];
            let len = raw[pos + 1] as usize;
            ensure!(len >= 2 && pos + len <= declared, "bad attribute length {}", len);
            attributes.push(Attribute::decode(kind, &raw[pos + 2..pos + len])?);
            pos += len;
        }

        Ok(Self {
            code,
            identifier: raw[1],
            authenticator,
            attributes,
        })
    }
}

/// Check `raw`'s authenticator against one recomputed with `seed` in its place.
pub fn verify_authenticator(raw: &[u8], seed: &[u8; AUTHENTICATOR_LEN], secret: &[u8]) -> bool {
    if raw.len() < HEADER_LEN {
        return false;
    }
    let declared = u16::from_be_bytes([raw[2], raw[3]]) as usize;
    if declared < HEADER_LEN || declared > raw.len() {
        return false;
    }
    let mut copy = raw[..declared].to_vec();
    copy[4..HEADER_LEN].copy_from_slice(seed);
    digest(&copy, secret) == raw[4..HEADER_LEN]
}

fn digest(packet: &[u8], secret: &[u8]) -> [u8; AUTHENTICATOR_LEN] {
    let mut hasher = Md5::new();
    hasher.update(packet);
    hasher.update(secret);
    hasher.finalize().into()
}
