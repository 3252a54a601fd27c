//! Envelope codec — stateless, deterministic encode/decode of the wire
//! message described in spec.md §3–§4.A.
//!
//! Frame layout, in order:
//! 1. identity frame (replies only)
//! 2. empty delimiter frame
//! 3. version frame (bincode `AppProtocolVersion`)
//! 4. type frame (one tag byte)
//! 5. sender peer frame (bincode `Peer`)
//! 6. zero or more body frames
//! 7. signature frame (Ed25519 signature over frames 3..=N-1 concatenated)

use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::identity::IdentityKeys;
use crate::peer::Peer;
use crate::wire::MAX_MESSAGE_SIZE;

/// One-byte message-kind tag (frame 4). `Ping` is the only kind exempt from
/// the version-compatibility gate at the router (spec.md §4.D step 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    Ping = 0,
    Pong = 1,
    FindNode = 2,
    Neighbors = 3,
    Application = 4,
}

impl MessageKind {
    pub fn from_u8(value: u8) -> Result<Self, TransportError> {
        match value {
            0 => Ok(Self::Ping),
            1 => Ok(Self::Pong),
            2 => Ok(Self::FindNode),
            3 => Ok(Self::Neighbors),
            4 => Ok(Self::Application),
            other => Err(TransportError::InvalidMessage(format!(
                "unknown message kind tag {other}"
            ))),
        }
    }
}

/// A decoded, signature-verified envelope.
#[derive(Debug, Clone)]
pub struct DecodedMessage {
    /// Present only when this envelope was a reply; the opaque
    /// router-assigned token to echo back via `ReplyMessage`.
    pub identity_frame: Option<Vec<u8>>,
    pub version: crate::peer::AppProtocolVersion,
    pub kind: MessageKind,
    pub sender: Peer,
    pub body: Vec<Vec<u8>>,
}

fn signed_region(
    version_bytes: &[u8],
    kind_byte: u8,
    sender_bytes: &[u8],
    body: &[Vec<u8>],
) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(version_bytes);
    buf.push(kind_byte);
    buf.extend_from_slice(sender_bytes);
    for frame in body {
        buf.extend_from_slice(frame);
    }
    buf
}

/// Encode a message into its wire frames and sign it with `private_key`.
///
/// `reply_identity` is `Some(token)` for replies (frame 1 present) and
/// `None` for initial requests (frame 1 absent), per spec.md §3.
pub fn encode(
    kind: MessageKind,
    body: Vec<Vec<u8>>,
    version: &crate::peer::AppProtocolVersion,
    sender: &Peer,
    private_key: &IdentityKeys,
    reply_identity: Option<Vec<u8>>,
) -> Result<Vec<Vec<u8>>, TransportError> {
    let version_bytes =
        bincode::serialize(version).map_err(|e| TransportError::Unexpected(e.to_string()))?;
    let sender_bytes =
        bincode::serialize(sender).map_err(|e| TransportError::Unexpected(e.to_string()))?;
    let kind_byte = kind as u8;

    let signed = signed_region(&version_bytes, kind_byte, &sender_bytes, &body);
    let signature = private_key.sign(&signed);

    let mut frames = Vec::with_capacity(5 + body.len());
    if let Some(identity) = reply_identity {
        frames.push(identity);
    }
    frames.push(Vec::new()); // empty delimiter
    frames.push(version_bytes);
    frames.push(vec![kind_byte]);
    frames.push(sender_bytes);
    frames.extend(body);
    frames.push(signature);

    let total: usize = frames.iter().map(Vec::len).sum();
    if total > MAX_MESSAGE_SIZE {
        return Err(TransportError::Unexpected(format!(
            "encoded envelope too large: {total} bytes"
        )));
    }

    Ok(frames)
}

/// Decode and verify a frame set. `is_reply` indicates whether frame 1
/// (the identity frame) is expected to be present.
pub fn decode(frames: Vec<Vec<u8>>, is_reply: bool) -> Result<DecodedMessage, TransportError> {
    let total: usize = frames.iter().map(Vec::len).sum();
    if total > MAX_MESSAGE_SIZE {
        return Err(TransportError::InvalidMessage("envelope too large".into()));
    }

    let min_frames = if is_reply { 5 } else { 4 };
    if frames.len() < min_frames {
        return Err(TransportError::InvalidMessage(format!(
            "expected at least {min_frames} frames, got {}",
            frames.len()
        )));
    }

    let mut iter = frames.into_iter();
    let identity_frame = if is_reply { iter.next() } else { None };

    let delimiter = iter.next().ok_or_else(|| {
        TransportError::InvalidMessage("missing delimiter frame".into())
    })?;
    if !delimiter.is_empty() {
        return Err(TransportError::InvalidMessage(
            "delimiter frame must be empty".into(),
        ));
    }

    let version_bytes = iter
        .next()
        .ok_or_else(|| TransportError::InvalidMessage("missing version frame".into()))?;
    let version: crate::peer::AppProtocolVersion = bincode::deserialize(&version_bytes)
        .map_err(|e| TransportError::InvalidMessage(format!("bad version frame: {e}")))?;

    let kind_frame = iter
        .next()
        .ok_or_else(|| TransportError::InvalidMessage("missing type frame".into()))?;
    if kind_frame.len() != 1 {
        return Err(TransportError::InvalidMessage(
            "type frame must be exactly one byte".into(),
        ));
    }
    let kind = MessageKind::from_u8(kind_frame[0])?;

    let sender_bytes = iter
        .next()
        .ok_or_else(|| TransportError::InvalidMessage("missing sender frame".into()))?;
    let sender: Peer = bincode::deserialize(&sender_bytes)
        .map_err(|e| TransportError::InvalidMessage(format!("bad sender frame: {e}")))?;

    let mut remaining: Vec<Vec<u8>> = iter.collect();
    let signature = remaining
        .pop()
        .ok_or_else(|| TransportError::InvalidMessage("missing signature frame".into()))?;
    let body = remaining;

    let signed = signed_region(&version_bytes, kind_frame[0], &sender_bytes, &body);
    let sender_identity = sender.identity()?;
    if !sender_identity.verify(&signed, &signature) {
        return Err(TransportError::InvalidMessage(
            "signature verification failed".into(),
        ));
    }

    Ok(DecodedMessage {
        identity_frame,
        version,
        kind,
        sender,
        body,
    })
}
