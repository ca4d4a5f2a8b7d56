//! # Node Identity and Signed Peer Records
//!
//! This module defines the identity types used throughout the overlay:
//!
//! - [`NodeIdentity`]: per-process long-term signing keypair, ephemeral
//!   key-agreement keypair, and the derived [`NodeId`]
//! - [`NodeId`]: 160-bit Kademlia identifier, the SHA-1 of the device id
//! - [`SignedPeerInfo`]: signed endpoint record published into the DHT
//!
//! ## Identity Model
//!
//! A node is named by its operator-assigned device id (a UTF-8 string). The
//! DHT position is `SHA-1(device_id)`, which keeps NodeIDs stable across
//! restarts and key rotations. Possession of the Ed25519 private key proves
//! authorship of records and handshake messages; the X25519 keypair exists
//! only to agree on per-peer session keys.
//!
//! ## Security Invariants
//!
//! - The NodeID never changes for the lifetime of the process.
//! - A [`SignedPeerInfo`] accepted from the network must verify under its own
//!   embedded public key; anything else is discarded at the border.
//! - The signature covers the canonical encoding of every field except the
//!   signature itself, so endpoint, key, and timestamp are all bound.

use std::cmp::Ordering;
use std::net::{IpAddr, Ipv4Addr};

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use sha1::{Digest, Sha1};
use x25519_dalek::{PublicKey as AgreementPublic, StaticSecret};

use crate::crypto::{self, SessionKey, SignatureError, PEER_INFO_SIGNATURE_DOMAIN};
use crate::error::{Error, Result};

/// Length of a NodeID in bytes (SHA-1 output).
pub const NODE_ID_LEN: usize = 20;

/// Length of an Ed25519 public key on the wire.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Length of an Ed25519 signature on the wire.
pub const SIGNATURE_LEN: usize = 64;

/// Upper bound on device-id length accepted from the network.
pub const MAX_DEVICE_ID_LEN: usize = 255;

/// Milliseconds since the Unix epoch.
#[inline]
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ============================================================================
// NodeId (160-bit Kademlia identifier)
// ============================================================================

/// 160-bit node identifier: `SHA-1(device_id)`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    /// Derive the NodeID for a device id.
    pub fn from_device_id(device_id: &str) -> Self {
        let digest = Sha1::digest(device_id.as_bytes());
        let mut bytes = [0u8; NODE_ID_LEN];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    /// Byte-wise XOR distance to another id.
    #[inline]
    pub fn xor_distance(&self, other: &NodeId) -> [u8; NODE_ID_LEN] {
        let mut out = [0u8; NODE_ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| Error::MalformedEnvelope(format!("bad node id hex: {e}")))?;
        if bytes.len() != NODE_ID_LEN {
            return Err(Error::MalformedEnvelope("node id must be 20 bytes".into()));
        }
        let mut arr = [0u8; NODE_ID_LEN];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", &self.to_hex()[..12])
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Compare two XOR distances lexicographically.
///
/// Establishes the total order used by `find_closest` and the iterative
/// lookup: for distinct distances, exactly one of `Less`/`Greater` holds.
#[inline]
pub fn distance_cmp(a: &[u8; NODE_ID_LEN], b: &[u8; NODE_ID_LEN]) -> Ordering {
    for i in 0..NODE_ID_LEN {
        match a[i].cmp(&b[i]) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

// ============================================================================
// NodeIdentity (process-wide key material)
// ============================================================================

/// Process-wide identity: device id, derived NodeID, long-term signing
/// keypair, and ephemeral X25519 key-agreement keypair.
///
/// Created once at node start; key material never leaves the process.
pub struct NodeIdentity {
    device_id: String,
    node_id: NodeId,
    signing_key: SigningKey,
    agreement_secret: StaticSecret,
}

impl NodeIdentity {
    /// Generate fresh key material for the given device id.
    pub fn new(device_id: impl Into<String>) -> Self {
        let device_id = device_id.into();
        let node_id = NodeId::from_device_id(&device_id);
        let signing_key = SigningKey::generate(&mut OsRng);
        let agreement_secret = StaticSecret::random_from_rng(OsRng);
        Self {
            device_id,
            node_id,
            signing_key,
            agreement_secret,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Long-term public signing key.
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Ephemeral X25519 public key advertised during the handshake.
    pub fn agreement_public_bytes(&self) -> [u8; 32] {
        AgreementPublic::from(&self.agreement_secret).to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Derive the symmetric session key shared with a peer that advertised
    /// `remote_agreement_public` during the handshake.
    pub fn derive_session_key(&self, remote_agreement_public: &[u8; 32]) -> SessionKey {
        crypto::derive_session_key(&self.agreement_secret, remote_agreement_public)
    }

    /// Build a freshly-timestamped signed endpoint record for this node.
    pub fn signed_peer_info(&self, ip: IpAddr, port: u16) -> SignedPeerInfo {
        let timestamp = now_ms();
        let public_key = self.public_key_bytes().to_vec();
        let payload = SignedPeerInfo::build_signed_payload(
            &self.device_id,
            &ip,
            port,
            &public_key,
            timestamp,
        );
        let signature = crypto::sign_with_domain(self, PEER_INFO_SIGNATURE_DOMAIN, &payload);
        SignedPeerInfo {
            device_id: self.device_id.clone(),
            ip,
            port,
            public_key,
            timestamp,
            signature,
        }
    }
}

impl std::fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("device_id", &self.device_id)
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// SignedPeerInfo (DHT-visible endpoint record)
// ============================================================================

/// Self-signed statement of a peer's device id, endpoint, public key, and
/// creation time. This is the unit the DHT stores and returns.
#[derive(Clone, Debug)]
pub struct SignedPeerInfo {
    pub device_id: String,
    pub ip: IpAddr,
    pub port: u16,
    /// Ed25519 public key (32 bytes) of the record's author.
    pub public_key: Vec<u8>,
    /// Record creation time, milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Ed25519 signature (64 bytes) over the canonical payload.
    pub signature: Vec<u8>,
}

impl SignedPeerInfo {
    /// Canonical payload covered by the signature.
    ///
    /// Format: `dlen(u8) | device_id | ilen(u8) | ip | port(u16 BE)
    /// | klen(u16 BE) | key | ts(i64 BE)` — the wire layout minus the
    /// signature field. Length prefixes rule out concatenation ambiguity.
    pub fn build_signed_payload(
        device_id: &str,
        ip: &IpAddr,
        port: u16,
        public_key: &[u8],
        timestamp: i64,
    ) -> Vec<u8> {
        let ip_str = ip.to_string();
        let mut data = Vec::with_capacity(
            2 + device_id.len() + ip_str.len() + 2 + 2 + public_key.len() + 8,
        );
        data.push(device_id.len() as u8);
        data.extend_from_slice(device_id.as_bytes());
        data.push(ip_str.len() as u8);
        data.extend_from_slice(ip_str.as_bytes());
        data.extend_from_slice(&port.to_be_bytes());
        data.extend_from_slice(&(public_key.len() as u16).to_be_bytes());
        data.extend_from_slice(public_key);
        data.extend_from_slice(&timestamp.to_be_bytes());
        data
    }

    /// NodeID of the record's author.
    pub fn node_id(&self) -> NodeId {
        NodeId::from_device_id(&self.device_id)
    }

    pub fn addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.ip, self.port)
    }

    /// Verify the record under its own embedded public key.
    ///
    /// Records failing this are discarded before they reach the routing table.
    pub fn verify(&self) -> std::result::Result<(), SignatureError> {
        if self.signature.is_empty() {
            return Err(SignatureError::Missing);
        }
        let payload = Self::build_signed_payload(
            &self.device_id,
            &self.ip,
            self.port,
            &self.public_key,
            self.timestamp,
        );
        crypto::verify_with_domain(
            &self.public_key,
            PEER_INFO_SIGNATURE_DOMAIN,
            &payload,
            &self.signature,
        )
    }

    /// Bounds and format checks. Does NOT verify the signature.
    pub fn validate_structure(&self) -> bool {
        if self.device_id.is_empty() || self.device_id.len() > MAX_DEVICE_ID_LEN {
            return false;
        }
        if self.public_key.len() != PUBLIC_KEY_LEN {
            return false;
        }
        if self.signature.len() != SIGNATURE_LEN {
            return false;
        }
        true
    }

    /// Rewrite the endpoint to loopback. Used by `force_localhost` topologies.
    pub fn normalized_localhost(mut self) -> Self {
        self.ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        self
    }

    // ------------------------------------------------------------------------
    // Wire codec
    // ------------------------------------------------------------------------
    //
    // `dlen(u8) | d | ilen(u8) | i | port(u16 BE) | klen(u16 BE) | k
    //  | slen(u16 BE) | sig | ts(i64 BE)`

    pub fn to_bytes(&self) -> Vec<u8> {
        let ip_str = self.ip.to_string();
        let mut buf = Vec::with_capacity(
            2 + self.device_id.len()
                + ip_str.len()
                + 2
                + 2
                + self.public_key.len()
                + 2
                + self.signature.len()
                + 8,
        );
        buf.push(self.device_id.len() as u8);
        buf.extend_from_slice(self.device_id.as_bytes());
        buf.push(ip_str.len() as u8);
        buf.extend_from_slice(ip_str.as_bytes());
        buf.extend_from_slice(&self.port.to_be_bytes());
        buf.extend_from_slice(&(self.public_key.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.public_key);
        buf.extend_from_slice(&(self.signature.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.signature);
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let dlen = cursor.take_u8()? as usize;
        let device_id = String::from_utf8(cursor.take(dlen)?.to_vec())
            .map_err(|_| Error::MalformedEnvelope("peer info device id not utf-8".into()))?;
        let ilen = cursor.take_u8()? as usize;
        let ip_str = std::str::from_utf8(cursor.take(ilen)?)
            .map_err(|_| Error::MalformedEnvelope("peer info address not utf-8".into()))?;
        let ip: IpAddr = ip_str
            .parse()
            .map_err(|_| Error::MalformedEnvelope(format!("bad peer info address {ip_str}")))?;
        let port = cursor.take_u16()?;
        let klen = cursor.take_u16()? as usize;
        let public_key = cursor.take(klen)?.to_vec();
        let slen = cursor.take_u16()? as usize;
        let signature = cursor.take(slen)?.to_vec();
        let timestamp = cursor.take_i64()?;
        Ok(Self {
            device_id,
            ip,
            port,
            public_key,
            timestamp,
            signature,
        })
    }
}

impl PartialEq for SignedPeerInfo {
    fn eq(&self, other: &Self) -> bool {
        self.device_id == other.device_id
    }
}

impl Eq for SignedPeerInfo {}

/// Minimal bounds-checked reader for the binary wire formats.
pub(crate) struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(Error::MalformedEnvelope("truncated frame".into()));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn take_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn take_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn take_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn take_i64(&mut self) -> Result<i64> {
        let b = self.take(8)?;
        Ok(i64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }
}
