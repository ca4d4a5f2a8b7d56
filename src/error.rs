//! Error types surfaced by the overlay.
//!
//! Errors fall into three classes:
//!
//! - **Recovered locally** (never returned to callers): malformed datagrams,
//!   checksum mismatches (which trigger a NACK), rate-limited packets,
//!   duplicates, and STUN failures (which fall back to the local interface
//!   address). These appear only in logs and metrics.
//! - **Surfaced to callers**: ACK/RPC timeouts, exhausted retries, unknown
//!   peers, missing session keys, and a closed transport.
//! - **Fatal**: [`Error::Internal`] indicates a broken invariant; the node
//!   aborts rather than continue with corrupt state.

use thiserror::Error;

/// All error kinds produced by the overlay.
#[derive(Debug, Error)]
pub enum Error {
    /// Inbound bytes did not parse as an envelope.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Recomputed checksum differs from the embedded one.
    #[error("envelope checksum mismatch")]
    ChecksumMismatch,

    /// A signature failed verification under its declared key.
    #[error("signature mismatch")]
    SignatureMismatch,

    /// An encrypted send or receive was attempted without a session key.
    #[error("no session key installed for peer {0}")]
    NoSession(String),

    /// The recipient is not present in the peer table.
    #[error("unknown peer {0}")]
    PeerUnknown(String),

    /// A DHT RPC received no matching response within the deadline.
    #[error("rpc {0} timed out")]
    RpcTimeout(u32),

    /// An ACK-required send hit the per-message timeout.
    #[error("ack wait timed out")]
    AckTimeout,

    /// An ACK-required send exhausted its retransmission budget.
    #[error("max retries exceeded")]
    MaxRetriesExceeded,

    /// The node was stopped or the socket is gone.
    #[error("transport closed")]
    TransportClosed,

    /// The STUN binding probe failed; callers fall back to the local address.
    #[error("stun binding failed: {0}")]
    StunFailed(String),

    /// An inbound datagram was dropped by the per-source rate limiter.
    #[error("rate limited")]
    RateLimited,

    /// Invariant violation. The node aborts on this.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this kind is handled inside the node and never surfaced.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::MalformedEnvelope(_)
                | Error::ChecksumMismatch
                | Error::RateLimited
                | Error::StunFailed(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
