//! STUN binding codec (RFC 5389) — just enough to learn a server-reflexive
//! address from a discovery server.
//!
//! Message layout:
//!
//!   0                   1                   2                   3
//!   |0 0|  message type (14 bits)  |        message length         |
//!   |                  magic cookie (0x2112A442)                     |
//!   |                 transaction id (96 bits)                       |
//!   |  attributes, each TLV-encoded and padded to 4 bytes ...        |
//!
//! Headers are fixed-layout big-endian structs read with zerocopy, so there
//! is no manual offset arithmetic for the fixed parts.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

pub const MAGIC_COOKIE: u32 = 0x2112_A442;

pub const BINDING_REQUEST: u16 = 0x0001;
pub const BINDING_SUCCESS: u16 = 0x0101;
pub const BINDING_ERROR: u16 = 0x0111;

pub const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
pub const ATTR_ERROR_CODE: u16 = 0x0009;
pub const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

const FAMILY_V4: u8 = 0x01;
const FAMILY_V6: u8 = 0x02;

pub type TransactionId = [u8; 12];

/// Fixed 20-byte STUN header.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct StunHeader {
    pub msg_type: U16<BigEndian>,
    /// Attribute bytes following the header.
    pub length: U16<BigEndian>,
    pub cookie: U32<BigEndian>,
    pub transaction_id: TransactionId,
}

assert_eq_size!(StunHeader, [u8; 20]);

/// Type-length prefix of one attribute.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
struct AttrHeader {
    attr_type: U16<BigEndian>,
    length: U16<BigEndian>,
}

assert_eq_size!(AttrHeader, [u8; 4]);

pub const HEADER_LEN: usize = core::mem::size_of::<StunHeader>();

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StunError {
    #[error("message shorter than the {HEADER_LEN}-byte header")]
    Truncated,
    #[error("bad magic cookie {0:#010x}")]
    BadCookie(u32),
    #[error("transaction id does not match the request")]
    TransactionMismatch,
    #[error("unexpected message type {0:#06x}")]
    UnexpectedType(u16),
    #[error("declared length {declared} exceeds {available} available bytes")]
    BadLength { declared: usize, available: usize },
    #[error("success response carries no mapped address")]
    NoMappedAddress,
}

/// What a discovery server answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingResponse {
    /// Our address as the server saw it.
    Mapped(SocketAddr),
    /// Binding error with the STUN error code (e.g. 400, 420).
    Error { code: u16 },
}

pub fn new_transaction_id() -> TransactionId {
    rand::random()
}

fn header(msg_type: u16, length: usize, txid: &TransactionId) -> StunHeader {
    StunHeader {
        msg_type: U16::new(msg_type),
        length: U16::new(length as u16),
        cookie: U32::new(MAGIC_COOKIE),
        transaction_id: *txid,
    }
}

/// Encode a Binding Request with no attributes.
pub fn binding_request(txid: &TransactionId) -> Vec<u8> {
    header(BINDING_REQUEST, 0, txid).as_bytes().to_vec()
}

/// Encode a Binding Success response carrying XOR-MAPPED-ADDRESS.
/// Used by loopback discovery servers and tests.
pub fn binding_success(txid: &TransactionId, mapped: SocketAddr) -> Vec<u8> {
    let value = xor_address(mapped, txid);
    let attr = AttrHeader {
        attr_type: U16::new(ATTR_XOR_MAPPED_ADDRESS),
        length: U16::new(value.len() as u16),
    };
    let mut out = header(BINDING_SUCCESS, 4 + value.len(), txid).as_bytes().to_vec();
    out.extend_from_slice(attr.as_bytes());
    out.extend_from_slice(&value);
    out
}

/// Decode a response to the request identified by `txid`.
pub fn parse_binding_response(bytes: &[u8], txid: &TransactionId) -> Result<BindingResponse, StunError> {
    let hdr = StunHeader::read_from_prefix(bytes).ok_or(StunError::Truncated)?;
    if hdr.cookie.get() != MAGIC_COOKIE {
        return Err(StunError::BadCookie(hdr.cookie.get()));
    }
    if hdr.transaction_id != *txid {
        return Err(StunError::TransactionMismatch);
    }
    let declared = hdr.length.get() as usize;
    let body = &bytes[HEADER_LEN..];
    if declared > body.len() {
        return Err(StunError::BadLength {
            declared,
            available: body.len(),
        });
    }
    let attrs = attributes(&body[..declared]);

    match hdr.msg_type.get() {
        BINDING_SUCCESS => {
            let xor = attrs
                .iter()
                .find(|(t, _)| *t == ATTR_XOR_MAPPED_ADDRESS)
                .and_then(|(_, v)| decode_address(v, Some(txid)));
            let plain = || {
                attrs
                    .iter()
                    .find(|(t, _)| *t == ATTR_MAPPED_ADDRESS)
                    .and_then(|(_, v)| decode_address(v, None))
            };
            xor.or_else(plain)
                .map(BindingResponse::Mapped)
                .ok_or(StunError::NoMappedAddress)
        }
        BINDING_ERROR => {
            let code = attrs
                .iter()
                .find(|(t, _)| *t == ATTR_ERROR_CODE)
                .and_then(|(_, v)| {
                    let class = u16::from(*v.get(2)? & 0x07);
                    let number = u16::from(*v.get(3)?);
                    Some(class * 100 + number)
                })
                .unwrap_or(0);
            Ok(BindingResponse::Error { code })
        }
        other => Err(StunError::UnexpectedType(other)),
    }
}

/// Split the attribute section into (type, value) pairs. Stops at the first
/// truncated attribute.
fn attributes(mut body: &[u8]) -> Vec<(u16, &[u8])> {
    let mut out = Vec::new();
    while let Some(attr) = AttrHeader::read_from_prefix(body) {
        let len = attr.length.get() as usize;
        let Some(value) = body.get(4..4 + len) else {
            break;
        };
        out.push((attr.attr_type.get(), value));
        let padded = (len + 3) & !3;
        body = body.get(4 + padded..).unwrap_or(&[]);
    }
    out
}

fn xor_mask(txid: &TransactionId) -> [u8; 16] {
    let mut mask = [0u8; 16];
    mask[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    mask[4..].copy_from_slice(txid);
    mask
}

fn xor_address(addr: SocketAddr, txid: &TransactionId) -> Vec<u8> {
    let mask = xor_mask(txid);
    let port = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
    let mut out = vec![0u8];
    match addr.ip() {
        IpAddr::V4(v4) => {
            out.push(FAMILY_V4);
            out.extend_from_slice(&port.to_be_bytes());
            out.extend(v4.octets().iter().zip(&mask[..4]).map(|(a, m)| a ^ m));
        }
        IpAddr::V6(v6) => {
            out.push(FAMILY_V6);
            out.extend_from_slice(&port.to_be_bytes());
            out.extend(v6.octets().iter().zip(&mask).map(|(a, m)| a ^ m));
        }
    }
    out
}

/// Decode a (XOR-)MAPPED-ADDRESS value. `txid` is `Some` for the XOR form.
fn decode_address(value: &[u8], txid: Option<&TransactionId>) -> Option<SocketAddr> {
    let family = *value.get(1)?;
    let raw_port = u16::from_be_bytes([*value.get(2)?, *value.get(3)?]);
    let mask = txid.map(xor_mask).unwrap_or([0u8; 16]);
    let port = match txid {
        Some(_) => raw_port ^ (MAGIC_COOKIE >> 16) as u16,
        None => raw_port,
    };

    let ip = match family {
        FAMILY_V4 => {
            let raw = value.get(4..8)?;
            let mut octets = [0u8; 4];
            for (i, b) in raw.iter().enumerate() {
                octets[i] = b ^ mask[i];
            }
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        FAMILY_V6 => {
            let raw = value.get(4..20)?;
            let mut octets = [0u8; 16];
            for (i, b) in raw.iter().enumerate() {
                octets[i] = b ^ mask[i];
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return None,
    };
    Some(SocketAddr::new(ip, port))
}
