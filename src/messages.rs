//! # Wire Protocol Messages
//!
//! Every byte that crosses the socket is defined here.
//!
//! ## Two framings, on purpose
//!
//! | Layer | Encoding | Why |
//! |-------|----------|-----|
//! | Application envelope | JSON | compatibility with the deployed peers |
//! | DHT RPC payload | compact binary | fixed byte layout inside DATA envelopes |
//!
//! The envelope checksum and all signatures are computed over exact
//! pre-images; the two encodings must not be unified or both break.
//!
//! ## Envelope
//!
//! ```json
//! { "type": 0, "fromPeerId": "node1", "toPeerId": "node2",
//!   "payload": "<base64>", "checksum": "<hex sha256>",
//!   "sequenceNumber": 7, "timestamp": "2026-08-02T10:00:00.000Z" }
//! ```
//!
//! The checksum is SHA-256 over the canonical JSON with the checksum field
//! absent. Struct field order is the canonical key order.
//!
//! ## Payload demultiplexing
//!
//! A DATA envelope's decoded payload is one of: a sealed (encrypted) blob,
//! a binary DHT RPC frame, a typed JSON message (`gossip`, `auth-challenge`,
//! `auth-response`, `content-announcement`, `content-request`,
//! `content-data`), or opaque application bytes. Unknown typed messages are
//! surfaced to the application unchanged.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::crypto;
use crate::error::{Error, Result};
use crate::identity::{Cursor, NodeId, SignedPeerInfo, NODE_ID_LEN};

/// Upper bound on an encoded envelope. Anything larger than a UDP datagram
/// can carry is rejected before parsing.
pub const MAX_ENVELOPE_SIZE: usize = 64 * 1024;

/// Upper bound on entries in a FOUND_NODE reply.
pub const MAX_FOUND_NODES: usize = 32;

// ============================================================================
// Envelope
// ============================================================================

/// Envelope kind codes as they appear in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EnvelopeKind {
    Data = 0,
    Ack = 1,
    Nack = 2,
    Heartbeat = 3,
    RoutingTable = 4,
    Performance = 5,
    File = 6,
}

impl EnvelopeKind {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Data),
            1 => Some(Self::Ack),
            2 => Some(Self::Nack),
            3 => Some(Self::Heartbeat),
            4 => Some(Self::RoutingTable),
            5 => Some(Self::Performance),
            6 => Some(Self::File),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

/// The on-wire unit. Field declaration order is the canonical JSON key order
/// used for the checksum pre-image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: u8,
    #[serde(rename = "fromPeerId")]
    pub from_peer_id: String,
    #[serde(rename = "toPeerId", skip_serializing_if = "Option::is_none", default)]
    pub to_peer_id: Option<String>,
    /// Base64-encoded opaque payload.
    pub payload: String,
    /// Hex SHA-256 over the canonical pre-image (this struct with the
    /// checksum field absent).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub checksum: Option<String>,
    #[serde(rename = "sequenceNumber")]
    pub sequence_number: u32,
    /// ISO-8601 creation time.
    pub timestamp: String,
}

impl Envelope {
    /// Build a checksummed envelope around `payload`.
    pub fn new(
        kind: EnvelopeKind,
        from_peer_id: impl Into<String>,
        to_peer_id: Option<String>,
        payload: &[u8],
        sequence_number: u32,
    ) -> Self {
        let mut envelope = Self {
            kind: kind.code(),
            from_peer_id: from_peer_id.into(),
            to_peer_id,
            payload: BASE64.encode(payload),
            checksum: None,
            sequence_number,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };
        envelope.checksum = Some(envelope.compute_checksum());
        envelope
    }

    /// ACK for sequence `acked`. The payload is the low byte of the
    /// acknowledged sequence number; the envelope's own sequence number
    /// carries the full value.
    pub fn ack(from_peer_id: impl Into<String>, to_peer_id: impl Into<String>, acked: u32) -> Self {
        Self::new(
            EnvelopeKind::Ack,
            from_peer_id,
            Some(to_peer_id.into()),
            &[acked as u8],
            acked,
        )
    }

    /// NACK for sequence `seq`: the sequence byte followed by a UTF-8 reason.
    pub fn nack(
        from_peer_id: impl Into<String>,
        to_peer_id: impl Into<String>,
        seq: u32,
        reason: &str,
    ) -> Self {
        let mut payload = Vec::with_capacity(1 + reason.len());
        payload.push(seq as u8);
        payload.extend_from_slice(reason.as_bytes());
        Self::new(
            EnvelopeKind::Nack,
            from_peer_id,
            Some(to_peer_id.into()),
            &payload,
            seq,
        )
    }

    pub fn envelope_kind(&self) -> Option<EnvelopeKind> {
        EnvelopeKind::from_code(self.kind)
    }

    /// Decode the base64 payload.
    pub fn payload_bytes(&self) -> Result<Vec<u8>> {
        BASE64
            .decode(&self.payload)
            .map_err(|e| Error::MalformedEnvelope(format!("bad payload base64: {e}")))
    }

    /// SHA-256 over the canonical pre-image, hex-encoded.
    pub fn compute_checksum(&self) -> String {
        let mut preimage = self.clone();
        preimage.checksum = None;
        let bytes = serde_json::to_vec(&preimage)
            .expect("envelope serialization cannot fail for valid UTF-8 fields");
        hex::encode(Sha256::digest(&bytes))
    }

    /// Recompute the checksum and compare with the embedded one.
    pub fn verify_checksum(&self) -> bool {
        match &self.checksum {
            Some(embedded) => *embedded == self.compute_checksum(),
            None => false,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("envelope serialization cannot fail for valid UTF-8 fields")
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() > MAX_ENVELOPE_SIZE {
            return Err(Error::MalformedEnvelope(format!(
                "envelope exceeds {MAX_ENVELOPE_SIZE} bytes"
            )));
        }
        let envelope: Envelope = serde_json::from_slice(data)
            .map_err(|e| Error::MalformedEnvelope(e.to_string()))?;
        if envelope.envelope_kind().is_none() {
            return Err(Error::MalformedEnvelope(format!(
                "unknown envelope kind {}",
                envelope.kind
            )));
        }
        Ok(envelope)
    }
}

// ============================================================================
// Typed DATA payloads
// ============================================================================

/// A peer-table entry as carried inside gossip payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GossipPeer {
    pub device_id: String,
    pub ip: String,
    pub port: u16,
    /// Hex-encoded Ed25519 public key; empty until first authenticated contact.
    #[serde(default)]
    pub public_key: String,
    /// Last-seen time, milliseconds since the Unix epoch.
    pub last_seen: i64,
}

/// Typed messages carried inside DATA and ROUTING_TABLE envelopes.
///
/// The `type` tag mirrors the stringly-typed field the deployed peers emit;
/// unknown tags fall through to the application as opaque bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TypedPayload {
    #[serde(rename = "gossip", rename_all = "camelCase")]
    Gossip {
        peers: Vec<GossipPeer>,
        /// Sender's clock at snapshot time, milliseconds since the epoch.
        timestamp: i64,
    },

    #[serde(rename = "auth-challenge", rename_all = "camelCase")]
    AuthChallenge {
        /// 32 random bytes, hex-encoded.
        challenge: String,
        /// Initiator's X25519 public key, hex.
        agreement_key: String,
        /// Initiator's Ed25519 public key, hex.
        signing_key: String,
        /// Signature over `challenge || agreement_key || signing_key`, hex.
        signature: String,
    },

    #[serde(rename = "auth-response", rename_all = "camelCase")]
    AuthResponse {
        /// Echo of the challenge, hex.
        challenge: String,
        /// Responder's signature over the challenge bytes, hex.
        signature: String,
        /// Responder's Ed25519 public key, hex.
        signing_key: String,
        /// Responder's X25519 public key, hex.
        agreement_key: String,
    },

    #[serde(rename = "content-announcement", rename_all = "camelCase")]
    ContentAnnouncement { content_id: String },

    #[serde(rename = "content-request", rename_all = "camelCase")]
    ContentRequest { content_id: String },

    #[serde(rename = "content-data", rename_all = "camelCase")]
    ContentData {
        content_id: String,
        /// Base64-encoded content bytes.
        data: String,
    },
}

impl TypedPayload {
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("typed payload serialization cannot fail")
    }
}

/// Decoded DATA payload after demultiplexing.
#[derive(Debug, Clone)]
pub enum Payload {
    /// Encrypted blob; requires the sender's session key to open.
    Sealed(Vec<u8>),
    /// Binary DHT RPC frame.
    Rpc(RpcFrame),
    /// One of the known typed JSON messages.
    Typed(TypedPayload),
    /// Opaque application bytes (plain text or an unknown typed message).
    Plain(Vec<u8>),
}

/// Classify a decoded DATA payload.
///
/// Sealed blobs are detected by magic, RPC frames by their op byte (0x01–0x05,
/// which can never collide with JSON's `{`), typed messages by their JSON tag.
/// Everything else belongs to the application.
pub fn demux_payload(bytes: &[u8]) -> Payload {
    if crypto::is_sealed(bytes) {
        return Payload::Sealed(bytes.to_vec());
    }
    if let Some(frame) = RpcFrame::try_parse(bytes) {
        return Payload::Rpc(frame);
    }
    if bytes.first() == Some(&b'{') {
        if let Ok(typed) = serde_json::from_slice::<TypedPayload>(bytes) {
            return Payload::Typed(typed);
        }
    }
    Payload::Plain(bytes.to_vec())
}

// ============================================================================
// DHT RPC binary frames
// ============================================================================
//
// `op(1) | rpcId(u32 BE) | body`
//
//   0x01 PING        body = SignedPeerInfo
//   0x02 PONG        body = SignedPeerInfo
//   0x03 FIND_NODE   body = targetId (20 bytes)
//   0x04 FOUND_NODE  body = count(u8) | (len(u16 BE) | SignedPeerInfo){count}
//   0x05 STORE       body = SignedPeerInfo

pub const RPC_OP_PING: u8 = 0x01;
pub const RPC_OP_PONG: u8 = 0x02;
pub const RPC_OP_FIND_NODE: u8 = 0x03;
pub const RPC_OP_FOUND_NODE: u8 = 0x04;
pub const RPC_OP_STORE: u8 = 0x05;

/// A DHT RPC message carried inside a DATA envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcFrame {
    Ping { rpc_id: u32, info: SignedPeerInfo },
    Pong { rpc_id: u32, info: SignedPeerInfo },
    FindNode { rpc_id: u32, target: NodeId },
    FoundNode { rpc_id: u32, infos: Vec<SignedPeerInfo> },
    Store { rpc_id: u32, info: SignedPeerInfo },
}

impl RpcFrame {
    pub fn op(&self) -> u8 {
        match self {
            RpcFrame::Ping { .. } => RPC_OP_PING,
            RpcFrame::Pong { .. } => RPC_OP_PONG,
            RpcFrame::FindNode { .. } => RPC_OP_FIND_NODE,
            RpcFrame::FoundNode { .. } => RPC_OP_FOUND_NODE,
            RpcFrame::Store { .. } => RPC_OP_STORE,
        }
    }

    pub fn rpc_id(&self) -> u32 {
        match self {
            RpcFrame::Ping { rpc_id, .. }
            | RpcFrame::Pong { rpc_id, .. }
            | RpcFrame::FindNode { rpc_id, .. }
            | RpcFrame::FoundNode { rpc_id, .. }
            | RpcFrame::Store { rpc_id, .. } => *rpc_id,
        }
    }

    /// Whether this frame answers a pending request.
    pub fn is_response(&self) -> bool {
        matches!(self, RpcFrame::Pong { .. } | RpcFrame::FoundNode { .. })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.push(self.op());
        buf.extend_from_slice(&self.rpc_id().to_be_bytes());
        match self {
            RpcFrame::Ping { info, .. }
            | RpcFrame::Pong { info, .. }
            | RpcFrame::Store { info, .. } => {
                buf.extend_from_slice(&info.to_bytes());
            }
            RpcFrame::FindNode { target, .. } => {
                buf.extend_from_slice(target.as_bytes());
            }
            RpcFrame::FoundNode { infos, .. } => {
                buf.push(infos.len() as u8);
                for info in infos {
                    let bytes = info.to_bytes();
                    buf.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
                    buf.extend_from_slice(&bytes);
                }
            }
        }
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let op = cursor.take_u8()?;
        let rpc_id = cursor.take_u32()?;
        match op {
            RPC_OP_PING | RPC_OP_PONG | RPC_OP_STORE => {
                let info = SignedPeerInfo::from_bytes(cursor.remaining())?;
                Ok(match op {
                    RPC_OP_PING => RpcFrame::Ping { rpc_id, info },
                    RPC_OP_PONG => RpcFrame::Pong { rpc_id, info },
                    _ => RpcFrame::Store { rpc_id, info },
                })
            }
            RPC_OP_FIND_NODE => {
                let id_bytes = cursor.take(NODE_ID_LEN)?;
                let mut arr = [0u8; NODE_ID_LEN];
                arr.copy_from_slice(id_bytes);
                Ok(RpcFrame::FindNode {
                    rpc_id,
                    target: NodeId::from_bytes(arr),
                })
            }
            RPC_OP_FOUND_NODE => {
                let count = cursor.take_u8()? as usize;
                if count > MAX_FOUND_NODES {
                    return Err(Error::MalformedEnvelope(format!(
                        "found_node count {count} exceeds {MAX_FOUND_NODES}"
                    )));
                }
                let mut infos = Vec::with_capacity(count);
                for _ in 0..count {
                    let len = cursor.take_u16()? as usize;
                    let entry = cursor.take(len)?;
                    infos.push(SignedPeerInfo::from_bytes(entry)?);
                }
                Ok(RpcFrame::FoundNode { rpc_id, infos })
            }
            other => Err(Error::MalformedEnvelope(format!(
                "unknown rpc op {other:#04x}"
            ))),
        }
    }

    /// Parse only if the first byte is a known op code. Used by the payload
    /// demux so JSON payloads never reach the binary parser.
    pub fn try_parse(data: &[u8]) -> Option<Self> {
        match data.first() {
            Some(&op) if (RPC_OP_PING..=RPC_OP_STORE).contains(&op) => {
                Self::from_bytes(data).ok()
            }
            _ => None,
        }
    }
}
