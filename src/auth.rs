//! # Authentication Handshake
//!
//! Two-step challenge/response bound to a concurrent X25519 exchange:
//!
//! 1. Initiator A sends `auth-challenge { challenge, x25519_pub_A,
//!    signing_pub_A, signature_A }` — unencrypted, signed under A's key.
//! 2. B verifies the signature, derives
//!    `session_key = HKDF(ECDH(x25519_priv_B, x25519_pub_A))`, installs it
//!    against A, and replies `auth-response { challenge,
//!    signature_B(challenge), signing_pub_B, x25519_pub_B }`.
//! 3. A verifies `signature_B` over the original challenge, derives the same
//!    session key, and marks B authenticated.
//!
//! Session keys are per-peer, not per-message. A peer that is listed but not
//! yet authenticated can be challenged again at any time; a completed
//! handshake simply replaces the session key on both sides.
//!
//! The node triggers an immediate gossip exchange with the newly
//! authenticated peer once step 3 completes; that wiring lives in the
//! dispatch loop, not here.

use rand::RngCore;

use crate::crypto::{self, AUTH_SIGNATURE_DOMAIN};
use crate::error::{Error, Result};
use crate::identity::NodeIdentity;
use crate::messages::TypedPayload;

/// Challenge length in bytes.
pub const CHALLENGE_LEN: usize = 32;

/// Material extracted from a valid `auth-challenge`.
#[derive(Debug, Clone)]
pub struct VerifiedChallenge {
    pub challenge: [u8; CHALLENGE_LEN],
    pub agreement_key: [u8; 32],
    pub signing_key: [u8; 32],
}

/// Material extracted from a valid `auth-response`.
#[derive(Debug, Clone)]
pub struct VerifiedResponse {
    pub agreement_key: [u8; 32],
    pub signing_key: [u8; 32],
}

/// The pre-image signed inside an `auth-challenge`:
/// `challenge || x25519_pub || signing_pub`.
fn challenge_preimage(
    challenge: &[u8; CHALLENGE_LEN],
    agreement_key: &[u8; 32],
    signing_key: &[u8; 32],
) -> Vec<u8> {
    let mut data = Vec::with_capacity(CHALLENGE_LEN + 64);
    data.extend_from_slice(challenge);
    data.extend_from_slice(agreement_key);
    data.extend_from_slice(signing_key);
    data
}

/// Build a fresh challenge payload. Returns the raw challenge (kept by the
/// initiator to verify the response) alongside the wire payload.
pub fn build_challenge(identity: &NodeIdentity) -> ([u8; CHALLENGE_LEN], TypedPayload) {
    let mut challenge = [0u8; CHALLENGE_LEN];
    rand::thread_rng().fill_bytes(&mut challenge);

    let agreement_key = identity.agreement_public_bytes();
    let signing_key = identity.public_key_bytes();
    let signature = crypto::sign_with_domain(
        identity,
        AUTH_SIGNATURE_DOMAIN,
        &challenge_preimage(&challenge, &agreement_key, &signing_key),
    );

    let payload = TypedPayload::AuthChallenge {
        challenge: hex::encode(challenge),
        agreement_key: hex::encode(agreement_key),
        signing_key: hex::encode(signing_key),
        signature: hex::encode(signature),
    };
    (challenge, payload)
}

/// Verify an inbound `auth-challenge` and extract the initiator's keys.
pub fn verify_challenge(
    challenge: &str,
    agreement_key: &str,
    signing_key: &str,
    signature: &str,
) -> Result<VerifiedChallenge> {
    let challenge = decode_array::<CHALLENGE_LEN>(challenge)?;
    let agreement_key = decode_array::<32>(agreement_key)?;
    let signing_key = decode_array::<32>(signing_key)?;
    let signature = hex::decode(signature).map_err(|_| Error::SignatureMismatch)?;

    crypto::verify_with_domain(
        &signing_key,
        AUTH_SIGNATURE_DOMAIN,
        &challenge_preimage(&challenge, &agreement_key, &signing_key),
        &signature,
    )
    .map_err(|_| Error::SignatureMismatch)?;

    Ok(VerifiedChallenge {
        challenge,
        agreement_key,
        signing_key,
    })
}

/// Build the response to a verified challenge.
pub fn build_response(identity: &NodeIdentity, challenge: &[u8; CHALLENGE_LEN]) -> TypedPayload {
    let signature = crypto::sign_with_domain(identity, AUTH_SIGNATURE_DOMAIN, challenge);
    TypedPayload::AuthResponse {
        challenge: hex::encode(challenge),
        signature: hex::encode(signature),
        signing_key: hex::encode(identity.public_key_bytes()),
        agreement_key: hex::encode(identity.agreement_public_bytes()),
    }
}

/// Verify an inbound `auth-response` against the challenge we issued.
pub fn verify_response(
    expected_challenge: &[u8; CHALLENGE_LEN],
    challenge: &str,
    signature: &str,
    signing_key: &str,
    agreement_key: &str,
) -> Result<VerifiedResponse> {
    let echoed = decode_array::<CHALLENGE_LEN>(challenge)?;
    if &echoed != expected_challenge {
        return Err(Error::SignatureMismatch);
    }

    let signing_key = decode_array::<32>(signing_key)?;
    let agreement_key = decode_array::<32>(agreement_key)?;
    let signature = hex::decode(signature).map_err(|_| Error::SignatureMismatch)?;

    crypto::verify_with_domain(
        &signing_key,
        AUTH_SIGNATURE_DOMAIN,
        expected_challenge,
        &signature,
    )
    .map_err(|_| Error::SignatureMismatch)?;

    Ok(VerifiedResponse {
        agreement_key,
        signing_key,
    })
}

fn decode_array<const N: usize>(hex_str: &str) -> Result<[u8; N]> {
    let bytes = hex::decode(hex_str).map_err(|_| Error::SignatureMismatch)?;
    bytes.try_into().map_err(|_| Error::SignatureMismatch)
}
