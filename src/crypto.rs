//! # Cryptographic Infrastructure
//!
//! Primitives shared by the handshake, the DHT, and the message path:
//!
//! - **Signatures**: domain-separated Ed25519 signing and verification
//! - **Key agreement**: X25519 ECDH with HKDF-SHA256 session-key derivation
//! - **Payload encryption**: AES-256-GCM with 96-bit nonces and 128-bit tags
//!
//! ## Domain Separation
//!
//! Each signed data type uses a unique prefix so a signature produced in one
//! context never verifies in another (peer records vs. handshake messages).
//!
//! ## Session Keys
//!
//! A session key is derived once per peer from the X25519 shared secret and
//! installed on both sides of a completed handshake. Sealed payloads carry a
//! fresh random nonce, so the same key may protect many messages.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{PublicKey as AgreementPublic, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::identity::NodeIdentity;

// ============================================================================
// Domain Separation Prefixes
// ============================================================================

/// Domain prefix for signed peer records.
pub const PEER_INFO_SIGNATURE_DOMAIN: &[u8] = b"placard-peerinfo-v1:";

/// Domain prefix for authentication handshake messages.
pub const AUTH_SIGNATURE_DOMAIN: &[u8] = b"placard-auth-v1:";

/// HKDF info string for session-key derivation.
const SESSION_KDF_INFO: &[u8] = b"placard-session-v1";

// ============================================================================
// Signature Helpers
// ============================================================================

/// Error type for signature verification failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SignatureError {
    /// Signature is missing (empty).
    #[error("signature is missing")]
    Missing,
    /// Signature has invalid length (expected 64 bytes for Ed25519).
    #[error("signature has invalid length")]
    InvalidLength,
    /// Cryptographic verification failed.
    #[error("signature verification failed")]
    VerificationFailed,
    /// The public key is not a valid Ed25519 point.
    #[error("invalid public key")]
    InvalidPublicKey,
}

/// Sign `data` with the domain prefix prepended.
pub fn sign_with_domain(identity: &NodeIdentity, domain: &[u8], data: &[u8]) -> Vec<u8> {
    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);
    identity.sign(&prefixed).to_bytes().to_vec()
}

/// Verify a domain-separated signature under `public_key` (32 bytes).
pub fn verify_with_domain(
    public_key: &[u8],
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    if signature.len() != 64 {
        return Err(SignatureError::InvalidLength);
    }

    let verifying_key = VerifyingKey::try_from(public_key)
        .map_err(|_| SignatureError::InvalidPublicKey)?;

    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;
    let sig = Signature::from_bytes(&sig_bytes);

    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);

    verifying_key
        .verify(&prefixed, &sig)
        .map_err(|_| SignatureError::VerificationFailed)
}

// ============================================================================
// Session Keys (X25519 + HKDF-SHA256)
// ============================================================================

/// Symmetric session key installed after a completed handshake.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; 32]);

impl SessionKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material
        f.write_str("SessionKey(..)")
    }
}

/// Derive the session key from our agreement secret and the peer's public key.
///
/// Both sides of the exchange arrive at the same key:
/// `HKDF-SHA256(X25519(secret_a, public_b)) == HKDF-SHA256(X25519(secret_b, public_a))`.
pub fn derive_session_key(secret: &StaticSecret, remote_public: &[u8; 32]) -> SessionKey {
    let remote = AgreementPublic::from(*remote_public);
    let shared = secret.diffie_hellman(&remote);

    let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut okm = [0u8; 32];
    hk.expand(SESSION_KDF_INFO, &mut okm)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    SessionKey(okm)
}

// ============================================================================
// Authenticated Encryption (AES-256-GCM)
// ============================================================================

/// Size of the AES-GCM nonce in bytes (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Size of the GCM authentication tag in bytes (128 bits).
pub const TAG_SIZE: usize = 16;

/// Magic prefix marking a sealed payload on the wire.
pub const SEALED_MAGIC: [u8; 4] = *b"SEC1";

/// Minimum valid sealed payload: magic + nonce + tag.
pub const MIN_SEALED_SIZE: usize = SEALED_MAGIC.len() + NONCE_SIZE + TAG_SIZE;

/// Errors from sealing or opening encrypted payloads.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Sealed data is too short to be valid.
    #[error("sealed payload too short: got {0} bytes, need at least {1}")]
    TooShort(usize, usize),

    /// Authentication tag verification failed.
    #[error("authentication failed: payload was tampered with or key mismatch")]
    AuthenticationFailed,

    /// The payload does not carry the sealed-payload magic.
    #[error("payload is not sealed")]
    NotSealed,
}

/// Whether a payload carries the sealed-payload marker.
#[inline]
pub fn is_sealed(data: &[u8]) -> bool {
    data.len() >= SEALED_MAGIC.len() && data[..SEALED_MAGIC.len()] == SEALED_MAGIC
}

/// Encrypt a payload under a session key.
///
/// Returns: `SEC1 | nonce (12 bytes) | ciphertext | tag (16 bytes)`.
/// A fresh random nonce is drawn per call.
pub fn seal(key: &SessionKey, plaintext: &[u8]) -> Vec<u8> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).expect("key is always 32 bytes");

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .expect("encryption does not fail with valid inputs");

    let mut output = Vec::with_capacity(MIN_SEALED_SIZE + plaintext.len());
    output.extend_from_slice(&SEALED_MAGIC);
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    output
}

/// Decrypt a sealed payload. Expects the `seal` output format.
pub fn open(key: &SessionKey, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if !is_sealed(sealed) {
        return Err(CryptoError::NotSealed);
    }
    if sealed.len() < MIN_SEALED_SIZE {
        return Err(CryptoError::TooShort(sealed.len(), MIN_SEALED_SIZE));
    }

    let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).expect("key is always 32 bytes");

    let body = &sealed[SEALED_MAGIC.len()..];
    let nonce = Nonce::from_slice(&body[..NONCE_SIZE]);
    let ciphertext = &body[NONCE_SIZE..];

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::AuthenticationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn random_key() -> SessionKey {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        SessionKey::from_bytes(bytes)
    }

    #[test]
    fn domain_signature_roundtrip() {
        let identity = NodeIdentity::new("node1");
        let data = b"endpoint record";

        let sig = sign_with_domain(&identity, PEER_INFO_SIGNATURE_DOMAIN, data);
        assert_eq!(sig.len(), 64);
        assert!(verify_with_domain(
            &identity.public_key_bytes(),
            PEER_INFO_SIGNATURE_DOMAIN,
            data,
            &sig
        )
        .is_ok());
    }

    #[test]
    fn signature_bound_to_domain() {
        let identity = NodeIdentity::new("node1");
        let data = b"challenge bytes";

        let sig = sign_with_domain(&identity, AUTH_SIGNATURE_DOMAIN, data);
        // Same data under a different domain must not verify
        assert_eq!(
            verify_with_domain(
                &identity.public_key_bytes(),
                PEER_INFO_SIGNATURE_DOMAIN,
                data,
                &sig
            ),
            Err(SignatureError::VerificationFailed)
        );
    }

    #[test]
    fn signature_rejects_wrong_key() {
        let signer = NodeIdentity::new("node1");
        let other = NodeIdentity::new("node2");
        let data = b"message";

        let sig = sign_with_domain(&signer, AUTH_SIGNATURE_DOMAIN, data);
        assert_eq!(
            verify_with_domain(&other.public_key_bytes(), AUTH_SIGNATURE_DOMAIN, data, &sig),
            Err(SignatureError::VerificationFailed)
        );
    }

    #[test]
    fn signature_length_checks() {
        let identity = NodeIdentity::new("node1");
        let pk = identity.public_key_bytes();

        assert_eq!(
            verify_with_domain(&pk, AUTH_SIGNATURE_DOMAIN, b"x", &[]),
            Err(SignatureError::Missing)
        );
        assert_eq!(
            verify_with_domain(&pk, AUTH_SIGNATURE_DOMAIN, b"x", &[0u8; 32]),
            Err(SignatureError::InvalidLength)
        );
    }

    #[test]
    fn ecdh_is_symmetric() {
        let a = StaticSecret::random_from_rng(OsRng);
        let b = StaticSecret::random_from_rng(OsRng);
        let a_pub = AgreementPublic::from(&a).to_bytes();
        let b_pub = AgreementPublic::from(&b).to_bytes();

        let k1 = derive_session_key(&a, &b_pub);
        let k2 = derive_session_key(&b, &a_pub);
        assert_eq!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn seal_open_roundtrip() {
        let key = random_key();
        let plaintext = b"update playlist: lobby loop v3";

        let sealed = seal(&key, plaintext);
        assert!(is_sealed(&sealed));
        assert!(sealed.len() >= MIN_SEALED_SIZE);

        let opened = open(&key, &sealed).expect("open failed");
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn wrong_key_fails_open() {
        let key = random_key();
        let wrong = random_key();

        let sealed = seal(&key, b"secret");
        assert!(matches!(
            open(&wrong, &sealed),
            Err(CryptoError::AuthenticationFailed)
        ));
    }

    #[test]
    fn tampered_ciphertext_fails_open() {
        let key = random_key();
        let mut sealed = seal(&key, b"secret content");

        let idx = SEALED_MAGIC.len() + NONCE_SIZE + 3;
        sealed[idx] ^= 0xFF;

        assert!(matches!(
            open(&key, &sealed),
            Err(CryptoError::AuthenticationFailed)
        ));
    }

    #[test]
    fn truncated_sealed_rejected() {
        let key = random_key();
        let sealed = seal(&key, b"secret");

        let truncated = &sealed[..MIN_SEALED_SIZE - 1];
        assert!(matches!(
            open(&key, truncated),
            Err(CryptoError::TooShort(_, _))
        ));
    }

    #[test]
    fn unsealed_payload_rejected() {
        let key = random_key();
        assert!(matches!(
            open(&key, b"plain application text"),
            Err(CryptoError::NotSealed)
        ));
    }

    #[test]
    fn nonce_unique_per_seal() {
        let key = random_key();
        let sealed1 = seal(&key, b"same payload");
        let sealed2 = seal(&key, b"same payload");

        let n1 = &sealed1[SEALED_MAGIC.len()..SEALED_MAGIC.len() + NONCE_SIZE];
        let n2 = &sealed2[SEALED_MAGIC.len()..SEALED_MAGIC.len() + NONCE_SIZE];
        assert_ne!(n1, n2);

        assert_eq!(open(&key, &sealed1).unwrap(), b"same payload");
        assert_eq!(open(&key, &sealed2).unwrap(), b"same payload");
    }

    #[test]
    fn empty_plaintext_roundtrip() {
        let key = random_key();
        let sealed = seal(&key, b"");
        assert_eq!(open(&key, &sealed).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn session_key_debug_hides_material() {
        let key = random_key();
        assert_eq!(format!("{key:?}"), "SessionKey(..)");
    }
}
