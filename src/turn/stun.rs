//! STUN/TURN message codec (RFC 5389 §6, RFC 5766 §2).
//!
//! Grounded in the attribute-framing style of the retrieved STUN codec
//! (`mycrl-turn-rs/src/stun/message.rs`: 20-byte header, magic cookie,
//! length-prefixed TLV attributes padded to 4 bytes) but implemented
//! locally — no retrieved example exposes a client-usable STUN/TURN crate,
//! only server-side internals, so this is a from-scratch minimal encoder/
//! decoder covering only the methods and attributes spec.md §4.B names.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crc32fast::Hasher as Crc32;
use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::error::TransportError;

pub const MAGIC_COOKIE: u32 = 0x2112_A442;
const HEADER_LEN: usize = 20;

const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const ATTR_XOR_RELAYED_ADDRESS: u16 = 0x0016;
const ATTR_XOR_PEER_ADDRESS: u16 = 0x0012;
const ATTR_LIFETIME: u16 = 0x000D;
const ATTR_DATA: u16 = 0x0013;
const ATTR_REQUESTED_TRANSPORT: u16 = 0x0019;
const ATTR_MESSAGE_INTEGRITY: u16 = 0x0008;
const ATTR_FINGERPRINT: u16 = 0x8028;

const FINGERPRINT_XOR: u32 = 0x5354_554e;

/// Method + class, packed the way RFC 5389 §6 packs them into the 14-bit
/// message-type field (the two class bits are interleaved; we only ever
/// need Request/SuccessResponse/ErrorResponse for the methods in scope).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Binding,
    Allocate,
    Refresh,
    CreatePermission,
    /// Client-to-server "Send" indication, carrying outbound relayed data.
    Send,
    /// Server-to-client "Data" indication, carrying inbound relayed data.
    Data,
}

impl Method {
    fn code(self) -> u16 {
        match self {
            Method::Binding => 0x0001,
            Method::Allocate => 0x0003,
            Method::Refresh => 0x0004,
            Method::Send => 0x0006,
            Method::Data => 0x0007,
            Method::CreatePermission => 0x0008,
        }
    }

    fn from_code(code: u16) -> Option<Self> {
        match code {
            0x0001 => Some(Method::Binding),
            0x0003 => Some(Method::Allocate),
            0x0004 => Some(Method::Refresh),
            0x0006 => Some(Method::Send),
            0x0007 => Some(Method::Data),
            0x0008 => Some(Method::CreatePermission),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Class {
    Request,
    Indication,
    SuccessResponse,
    ErrorResponse,
}

impl Class {
    fn bits(self) -> u16 {
        match self {
            Class::Request => 0b00,
            Class::Indication => 0b01,
            Class::SuccessResponse => 0b10,
            Class::ErrorResponse => 0b11,
        }
    }

    fn from_bits(bits: u16) -> Option<Self> {
        match bits {
            0b00 => Some(Class::Request),
            0b01 => Some(Class::Indication),
            0b10 => Some(Class::SuccessResponse),
            0b11 => Some(Class::ErrorResponse),
            _ => None,
        }
    }
}

fn message_type(method: Method, class: Class) -> u16 {
    let m = method.code();
    let c = class.bits();
    // Interleave the class bits at positions 4 and 8 per RFC 5389 §6.
    ((m & 0x0F80) << 2) | ((m & 0x0070) << 1) | (m & 0x000F) | (c & 0b01) << 4 | (c & 0b10) << 7
}

fn split_message_type(value: u16) -> Option<(Method, Class)> {
    let c = ((value >> 4) & 0b01) | ((value >> 7) & 0b10);
    let m = ((value >> 2) & 0x0F80) | ((value >> 1) & 0x0070) | (value & 0x000F);
    Some((Method::from_code(m)?, Class::from_bits(c)?))
}

#[derive(Debug, Clone)]
pub enum Attribute {
    XorMappedAddress(SocketAddr),
    XorRelayedAddress(SocketAddr),
    XorPeerAddress(SocketAddr),
    Lifetime(u32),
    RequestedTransportUdp,
    Data(Vec<u8>),
    Unknown { kind: u16, value: Vec<u8> },
}

#[derive(Debug, Clone)]
pub struct Message {
    pub method: Method,
    pub class: Class,
    pub transaction_id: [u8; 12],
    pub attributes: Vec<Attribute>,
}

fn encode_xor_address(addr: SocketAddr, transaction_id: &[u8; 12]) -> Vec<u8> {
    let port = addr.port() ^ ((MAGIC_COOKIE >> 16) as u16);
    let mut buf = Vec::new();
    buf.push(0);
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.push(0x01);
            buf.extend_from_slice(&port.to_be_bytes());
            let octets = u32::from_be_bytes(ip.octets()) ^ MAGIC_COOKIE;
            buf.extend_from_slice(&octets.to_be_bytes());
        }
        IpAddr::V6(ip) => {
            buf.push(0x02);
            buf.extend_from_slice(&port.to_be_bytes());
            let mut xor_key = [0u8; 16];
            xor_key[0..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            xor_key[4..16].copy_from_slice(transaction_id);
            let mut bytes = ip.octets();
            for (b, k) in bytes.iter_mut().zip(xor_key.iter()) {
                *b ^= k;
            }
            buf.extend_from_slice(&bytes);
        }
    }
    buf
}

fn decode_xor_address(value: &[u8], transaction_id: &[u8; 12]) -> Result<SocketAddr, TransportError> {
    if value.len() < 4 {
        return Err(TransportError::InvalidMessage("short XOR address attribute".into()));
    }
    let family = value[1];
    let port = u16::from_be_bytes([value[2], value[3]]) ^ ((MAGIC_COOKIE >> 16) as u16);
    match family {
        0x01 => {
            if value.len() < 8 {
                return Err(TransportError::InvalidMessage("short IPv4 XOR address".into()));
            }
            let raw = u32::from_be_bytes([value[4], value[5], value[6], value[7]]) ^ MAGIC_COOKIE;
            Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(raw)), port))
        }
        0x02 => {
            if value.len() < 20 {
                return Err(TransportError::InvalidMessage("short IPv6 XOR address".into()));
            }
            let mut xor_key = [0u8; 16];
            xor_key[0..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            xor_key[4..16].copy_from_slice(transaction_id);
            let mut bytes = [0u8; 16];
            bytes.copy_from_slice(&value[4..20]);
            for (b, k) in bytes.iter_mut().zip(xor_key.iter()) {
                *b ^= k;
            }
            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(bytes)), port))
        }
        other => Err(TransportError::InvalidMessage(format!("unknown address family {other}"))),
    }
}

fn pad4(len: usize) -> usize {
    (4 - (len % 4)) % 4
}

impl Message {
    pub fn new(method: Method, class: Class, transaction_id: [u8; 12]) -> Self {
        Self { method, class, transaction_id, attributes: vec![] }
    }

    pub fn with_attribute(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Encode, appending `MESSAGE-INTEGRITY` (HMAC-SHA1 over everything
    /// preceding it, with the length field provisionally set to include
    /// it) and `FINGERPRINT` (CRC32 of everything preceding it, XORed).
    pub fn encode(&self, integrity_key: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        for attribute in &self.attributes {
            encode_attribute(&mut body, attribute, &self.transaction_id);
        }

        // Reserve space for MESSAGE-INTEGRITY (4 header + 20 digest) so the
        // length field covers it before we compute the HMAC.
        let mut header = Vec::with_capacity(HEADER_LEN);
        header.extend_from_slice(&message_type(self.method, self.class).to_be_bytes());
        header.extend_from_slice(&((body.len() + 24) as u16).to_be_bytes());
        header.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        header.extend_from_slice(&self.transaction_id);

        let mut signed = header.clone();
        signed.extend_from_slice(&body);

        let mut mac = Hmac::<Sha1>::new_from_slice(integrity_key).expect("HMAC accepts any key length");
        mac.update(&signed);
        let digest = mac.finalize().into_bytes();

        body.extend_from_slice(&ATTR_MESSAGE_INTEGRITY.to_be_bytes());
        body.extend_from_slice(&20u16.to_be_bytes());
        body.extend_from_slice(&digest);

        // Re-stamp the length to include FINGERPRINT (8 bytes) and compute
        // the CRC over the header (with final length) + body so far.
        let mut final_header = Vec::with_capacity(HEADER_LEN);
        final_header.extend_from_slice(&message_type(self.method, self.class).to_be_bytes());
        final_header.extend_from_slice(&((body.len() + 8) as u16).to_be_bytes());
        final_header.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        final_header.extend_from_slice(&self.transaction_id);

        let mut for_crc = final_header.clone();
        for_crc.extend_from_slice(&body);
        let mut hasher = Crc32::new();
        hasher.update(&for_crc);
        let crc = hasher.finalize() ^ FINGERPRINT_XOR;

        let mut out = final_header;
        out.extend_from_slice(&body);
        out.extend_from_slice(&ATTR_FINGERPRINT.to_be_bytes());
        out.extend_from_slice(&4u16.to_be_bytes());
        out.extend_from_slice(&crc.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TransportError> {
        if bytes.len() < HEADER_LEN {
            return Err(TransportError::InvalidMessage("STUN message shorter than header".into()));
        }
        let type_field = u16::from_be_bytes([bytes[0], bytes[1]]);
        let (method, class) = split_message_type(type_field)
            .ok_or_else(|| TransportError::InvalidMessage("unrecognized STUN method/class".into()))?;
        let length = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        let cookie = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if cookie != MAGIC_COOKIE {
            return Err(TransportError::InvalidMessage("bad STUN magic cookie".into()));
        }
        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&bytes[8..20]);

        if bytes.len() < HEADER_LEN + length {
            return Err(TransportError::InvalidMessage("STUN message truncated".into()));
        }

        let mut attributes = Vec::new();
        let mut cursor = HEADER_LEN;
        let end = HEADER_LEN + length;
        while cursor + 4 <= end {
            let kind = u16::from_be_bytes([bytes[cursor], bytes[cursor + 1]]);
            let attr_len = u16::from_be_bytes([bytes[cursor + 2], bytes[cursor + 3]]) as usize;
            let value_start = cursor + 4;
            let value_end = value_start + attr_len;
            if value_end > end {
                return Err(TransportError::InvalidMessage("STUN attribute overruns message".into()));
            }
            let value = &bytes[value_start..value_end];
            attributes.push(decode_attribute(kind, value, &transaction_id)?);
            cursor = value_end + pad4(attr_len);
        }

        Ok(Self { method, class, transaction_id, attributes })
    }

    pub fn find_xor_mapped_address(&self) -> Option<SocketAddr> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::XorMappedAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    pub fn find_xor_relayed_address(&self) -> Option<SocketAddr> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::XorRelayedAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    pub fn find_lifetime(&self) -> Option<u32> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Lifetime(seconds) => Some(*seconds),
            _ => None,
        })
    }

    pub fn find_xor_peer_address(&self) -> Option<SocketAddr> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::XorPeerAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    pub fn find_data(&self) -> Option<&[u8]> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Data(bytes) => Some(bytes.as_slice()),
            _ => None,
        })
    }
}

fn encode_attribute(out: &mut Vec<u8>, attribute: &Attribute, transaction_id: &[u8; 12]) {
    let (kind, value) = match attribute {
        Attribute::XorMappedAddress(addr) => (ATTR_XOR_MAPPED_ADDRESS, encode_xor_address(*addr, transaction_id)),
        Attribute::XorRelayedAddress(addr) => (ATTR_XOR_RELAYED_ADDRESS, encode_xor_address(*addr, transaction_id)),
        Attribute::XorPeerAddress(addr) => (ATTR_XOR_PEER_ADDRESS, encode_xor_address(*addr, transaction_id)),
        Attribute::Lifetime(seconds) => (ATTR_LIFETIME, seconds.to_be_bytes().to_vec()),
        Attribute::RequestedTransportUdp => (ATTR_REQUESTED_TRANSPORT, vec![17, 0, 0, 0]),
        Attribute::Data(bytes) => (ATTR_DATA, bytes.clone()),
        Attribute::Unknown { kind, value } => (*kind, value.clone()),
    };
    out.extend_from_slice(&kind.to_be_bytes());
    out.extend_from_slice(&(value.len() as u16).to_be_bytes());
    out.extend_from_slice(&value);
    out.extend(std::iter::repeat(0).take(pad4(value.len())));
}

fn decode_attribute(kind: u16, value: &[u8], transaction_id: &[u8; 12]) -> Result<Attribute, TransportError> {
    Ok(match kind {
        ATTR_XOR_MAPPED_ADDRESS => Attribute::XorMappedAddress(decode_xor_address(value, transaction_id)?),
        ATTR_XOR_RELAYED_ADDRESS => Attribute::XorRelayedAddress(decode_xor_address(value, transaction_id)?),
        ATTR_XOR_PEER_ADDRESS => Attribute::XorPeerAddress(decode_xor_address(value, transaction_id)?),
        ATTR_LIFETIME if value.len() == 4 => {
            Attribute::Lifetime(u32::from_be_bytes([value[0], value[1], value[2], value[3]]))
        }
        ATTR_REQUESTED_TRANSPORT => Attribute::RequestedTransportUdp,
        ATTR_DATA => Attribute::Data(value.to_vec()),
        other => Attribute::Unknown { kind: other, value: value.to_vec() },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_request_round_trips_with_xor_mapped_address() {
        let txn = [7u8; 12];
        let addr: SocketAddr = "203.0.113.5:54321".parse().unwrap();
        let message = Message::new(Method::Binding, Class::SuccessResponse, txn)
            .with_attribute(Attribute::XorMappedAddress(addr));

        let encoded = message.encode(b"key");
        let decoded = Message::decode(&encoded).unwrap();

        assert_eq!(decoded.method, Method::Binding);
        assert_eq!(decoded.class, Class::SuccessResponse);
        assert_eq!(decoded.find_xor_mapped_address(), Some(addr));
    }

    #[test]
    fn allocate_request_round_trips_lifetime_and_transport() {
        let txn = [3u8; 12];
        let message = Message::new(Method::Allocate, Class::Request, txn)
            .with_attribute(Attribute::RequestedTransportUdp)
            .with_attribute(Attribute::Lifetime(600));

        let encoded = message.encode(b"key");
        let decoded = Message::decode(&encoded).unwrap();

        assert_eq!(decoded.method, Method::Allocate);
        assert_eq!(decoded.find_lifetime(), Some(600));
    }

    #[test]
    fn truncated_message_is_rejected() {
        let result = Message::decode(&[0u8; 10]);
        assert!(result.is_err());
    }

    use proptest::prelude::*;

    proptest! {
        /// XOR-MAPPED-ADDRESS must survive encode/decode for every IPv4
        /// address and port, not just the hand-picked ones above — the XOR
        /// mask is derived from the transaction id, so this also exercises
        /// every transaction id byte pattern.
        #[test]
        fn xor_mapped_address_round_trips_for_any_ipv4_endpoint(
            a in 0u8..=255, b in 0u8..=255, c in 0u8..=255, d in 0u8..=255,
            port in 1u16..=65535,
            txn in proptest::array::uniform12(0u8..=255u8),
        ) {
            let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(a, b, c, d)), port);
            let message = Message::new(Method::Binding, Class::SuccessResponse, txn)
                .with_attribute(Attribute::XorMappedAddress(addr));

            let encoded = message.encode(b"key");
            let decoded = Message::decode(&encoded).unwrap();

            prop_assert_eq!(decoded.find_xor_mapped_address(), Some(addr));
        }
    }
}
