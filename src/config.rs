//! Node configuration.

use std::time::Duration;

/// Default STUN server used for public address discovery.
pub const DEFAULT_STUN_SERVER: &str = "stun.l.google.com:19302";

/// Runtime configuration for a [`Node`](crate::Node).
///
/// Only `username` is required; every other field has a production default.
/// Durations are taken as whole units of the wire contract (the 2 s
/// retransmission spacing and 500 ms reliability tick are protocol constants
/// and intentionally not configurable).
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Device identifier of this node. The 160-bit NodeID is derived from it.
    pub username: String,
    /// UDP port to bind. 0 lets the OS pick one.
    pub udp_port: u16,
    /// Interval between gossip rounds.
    pub gossip_interval: Duration,
    /// Number of random authenticated peers contacted per gossip round.
    pub gossip_peer_count: usize,
    /// Ceiling on how long an ACK-required send waits before failing.
    pub message_timeout: Duration,
    /// Interval between inactive-peer sweeps.
    pub peer_cleanup_interval: Duration,
    /// STUN server as `host:port`, or `None` to skip public address discovery.
    pub stun_server: Option<String>,
    /// Rewrite every peer address to 127.0.0.1. For same-host test topologies.
    pub force_localhost: bool,
}

impl NodeConfig {
    /// Configuration with production defaults for the given device id.
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            udp_port: 0,
            gossip_interval: Duration::from_secs(30),
            gossip_peer_count: 3,
            message_timeout: Duration::from_secs(30),
            peer_cleanup_interval: Duration::from_secs(60),
            stun_server: Some(DEFAULT_STUN_SERVER.to_string()),
            force_localhost: false,
        }
    }
}
