//! # Peer Table
//!
//! Tracks every known remote: endpoint, authentication state, session key,
//! and last-seen time. The table is owned by the node's dispatch task —
//! single writer, defensive copies out.
//!
//! ## Lifecycle
//!
//! - Inserted on first sighting (any inbound envelope) or as a donor seed.
//! - Refreshed on every inbound message from that peer.
//! - Evicted by the periodic sweep once authenticated AND inactive for more
//!   than `2 × message_timeout`. Unauthenticated peers are never evicted by
//!   inactivity; only k-bucket pressure can push them out of routing.
//!
//! ## Localhost override
//!
//! With `force_localhost` every address is normalized to 127.0.0.1 on both
//! read and write. Ports are untouched. This exists for same-host test
//! topologies where advertised interface addresses would be unreachable.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use rand::seq::SliceRandom;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::crypto::SessionKey;
use crate::identity::now_ms;
use crate::messages::GossipPeer;

/// Prefix marking a donor placeholder whose real device id is still unknown.
const PLACEHOLDER_PREFIX: &str = "donor@";

/// A known remote node.
#[derive(Clone)]
pub struct Peer {
    pub device_id: String,
    pub ip: IpAddr,
    pub port: u16,
    /// Ed25519 public key; empty until first authenticated contact.
    pub public_key: Vec<u8>,
    pub authenticated: bool,
    /// Last-seen as reported on the wire (epoch milliseconds).
    pub last_seen_ms: i64,
    /// Monotonic last direct observation; drives inactivity eviction.
    last_seen: Instant,
    session_key: Option<SessionKey>,
}

impl Peer {
    fn new(device_id: String, ip: IpAddr, port: u16) -> Self {
        Self {
            device_id,
            ip,
            port,
            public_key: Vec::new(),
            authenticated: false,
            last_seen_ms: now_ms(),
            last_seen: Instant::now(),
            session_key: None,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    pub fn session_key(&self) -> Option<&SessionKey> {
        self.session_key.as_ref()
    }

    pub fn is_placeholder(&self) -> bool {
        self.device_id.starts_with(PLACEHOLDER_PREFIX)
    }

    fn touch(&mut self) {
        self.last_seen = Instant::now();
        self.last_seen_ms = now_ms();
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("device_id", &self.device_id)
            .field("addr", &self.addr())
            .field("authenticated", &self.authenticated)
            .field("has_session", &self.session_key.is_some())
            .finish()
    }
}

/// Copy handed to external readers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSummary {
    pub device_id: String,
    pub ip: IpAddr,
    pub port: u16,
    pub authenticated: bool,
    pub last_seen_ms: i64,
}

/// Outcome of merging one gossiped entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Updated,
    Ignored,
}

/// Device-id keyed table of known peers. Single writer: the dispatch task.
pub struct PeerTable {
    peers: HashMap<String, Peer>,
    self_id: String,
    force_localhost: bool,
}

impl PeerTable {
    pub fn new(self_id: impl Into<String>, force_localhost: bool) -> Self {
        Self {
            peers: HashMap::new(),
            self_id: self_id.into(),
            force_localhost,
        }
    }

    fn normalize_ip(&self, ip: IpAddr) -> IpAddr {
        if self.force_localhost {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            ip
        }
    }

    /// Normalized destination address for a peer.
    pub fn addr_of(&self, device_id: &str) -> Option<SocketAddr> {
        self.peers
            .get(device_id)
            .map(|p| SocketAddr::new(self.normalize_ip(p.ip), p.port))
    }

    /// Insert this node itself, already authenticated.
    pub fn insert_self(&mut self, ip: IpAddr, port: u16) {
        let ip = self.normalize_ip(ip);
        let mut peer = Peer::new(self.self_id.clone(), ip, port);
        peer.authenticated = true;
        self.peers.insert(self.self_id.clone(), peer);
    }

    /// Record an inbound sighting. Creates an unauthenticated entry for
    /// unknown senders and refreshes the observed endpoint for known ones.
    /// Returns true when the peer was newly inserted.
    pub fn upsert_observed(&mut self, device_id: &str, observed: SocketAddr) -> bool {
        let ip = self.normalize_ip(observed.ip());
        match self.peers.get_mut(device_id) {
            Some(peer) => {
                if peer.ip != ip || peer.port != observed.port() {
                    trace!(
                        peer = device_id,
                        from = %peer.addr(),
                        to = %SocketAddr::new(ip, observed.port()),
                        "peer endpoint moved"
                    );
                    peer.ip = ip;
                    peer.port = observed.port();
                }
                peer.touch();
                false
            }
            None => {
                debug!(peer = device_id, addr = %observed, "new peer observed");
                self.peers
                    .insert(device_id.to_string(), Peer::new(device_id.to_string(), ip, observed.port()));
                true
            }
        }
    }

    /// Seed a donor whose device id is not yet known. The placeholder is
    /// replaced once a real peer authenticates from the same endpoint.
    pub fn insert_donor_placeholder(&mut self, addr: SocketAddr) -> String {
        let ip = self.normalize_ip(addr.ip());
        let device_id = format!("{PLACEHOLDER_PREFIX}{}:{}", ip, addr.port());
        self.peers
            .entry(device_id.clone())
            .or_insert_with(|| Peer::new(device_id.clone(), ip, addr.port()));
        device_id
    }

    /// Drop any donor placeholder for `addr`; its real identity is now known.
    pub fn resolve_placeholder(&mut self, addr: SocketAddr) {
        let ip = self.normalize_ip(addr.ip());
        let key = format!("{PLACEHOLDER_PREFIX}{}:{}", ip, addr.port());
        if self.peers.remove(&key).is_some() {
            debug!(addr = %addr, "donor placeholder resolved");
        }
    }

    /// Install a session key and mark the peer authenticated.
    pub fn install_session(&mut self, device_id: &str, public_key: Vec<u8>, key: SessionKey) {
        if let Some(peer) = self.peers.get_mut(device_id) {
            peer.public_key = public_key;
            peer.session_key = Some(key);
            peer.authenticated = true;
            peer.touch();
        }
    }

    pub fn get(&self, device_id: &str) -> Option<&Peer> {
        self.peers.get(device_id)
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.peers.contains_key(device_id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn session_key(&self, device_id: &str) -> Option<SessionKey> {
        self.peers
            .get(device_id)
            .and_then(|p| p.session_key.clone())
    }

    /// Authenticated remotes (self and placeholders excluded).
    pub fn authenticated_remotes(&self) -> Vec<&Peer> {
        self.peers
            .values()
            .filter(|p| p.authenticated && p.device_id != self.self_id && !p.is_placeholder())
            .collect()
    }

    /// Up to `count` random authenticated remotes, for gossip fan-out.
    pub fn random_authenticated(&self, count: usize) -> Vec<(String, SocketAddr)> {
        let mut candidates: Vec<&Peer> = self.authenticated_remotes();
        candidates.shuffle(&mut rand::thread_rng());
        candidates
            .into_iter()
            .take(count)
            .map(|p| {
                (
                    p.device_id.clone(),
                    SocketAddr::new(self.normalize_ip(p.ip), p.port),
                )
            })
            .collect()
    }

    /// Evict authenticated peers inactive for more than `2 × message_timeout`.
    /// Returns the evicted device ids.
    pub fn sweep(&mut self, message_timeout: Duration) -> Vec<String> {
        let cutoff = message_timeout * 2;
        let now = Instant::now();
        let self_id = self.self_id.clone();

        let expired: Vec<String> = self
            .peers
            .values()
            .filter(|p| {
                p.authenticated
                    && p.device_id != self_id
                    && now.duration_since(p.last_seen) > cutoff
            })
            .map(|p| p.device_id.clone())
            .collect();

        for id in &expired {
            debug!(peer = %id, "evicting inactive authenticated peer");
            self.peers.remove(id);
        }
        expired
    }

    /// Merge one gossiped entry. Unknown device ids are inserted
    /// unauthenticated; known entries are only overwritten when the gossiped
    /// last-seen is strictly newer. Authentication state never changes here.
    pub fn merge_gossiped(&mut self, entry: &GossipPeer) -> MergeOutcome {
        if entry.device_id == self.self_id || entry.device_id.starts_with(PLACEHOLDER_PREFIX) {
            return MergeOutcome::Ignored;
        }
        let ip: IpAddr = match entry.ip.parse() {
            Ok(ip) => self.normalize_ip(ip),
            Err(_) => return MergeOutcome::Ignored,
        };

        match self.peers.get_mut(&entry.device_id) {
            Some(peer) => {
                if entry.last_seen > peer.last_seen_ms {
                    peer.ip = ip;
                    peer.port = entry.port;
                    peer.last_seen_ms = entry.last_seen;
                    if peer.public_key.is_empty() && !entry.public_key.is_empty() {
                        if let Ok(key) = hex::decode(&entry.public_key) {
                            peer.public_key = key;
                        }
                    }
                    MergeOutcome::Updated
                } else {
                    MergeOutcome::Ignored
                }
            }
            None => {
                let mut peer = Peer::new(entry.device_id.clone(), ip, entry.port);
                peer.last_seen_ms = entry.last_seen;
                if let Ok(key) = hex::decode(&entry.public_key) {
                    peer.public_key = key;
                }
                debug!(peer = %entry.device_id, addr = %peer.addr(), "peer learned via gossip");
                self.peers.insert(entry.device_id.clone(), peer);
                MergeOutcome::Inserted
            }
        }
    }

    /// Wire snapshot of the table for a gossip round. Placeholders are
    /// omitted; the self entry carries a fresh last-seen.
    pub fn snapshot_for_gossip(&self) -> Vec<GossipPeer> {
        let now = now_ms();
        self.peers
            .values()
            .filter(|p| !p.is_placeholder())
            .map(|p| GossipPeer {
                device_id: p.device_id.clone(),
                ip: self.normalize_ip(p.ip).to_string(),
                port: p.port,
                public_key: hex::encode(&p.public_key),
                last_seen: if p.device_id == self.self_id {
                    now
                } else {
                    p.last_seen_ms
                },
            })
            .collect()
    }

    /// Defensive copies for external readers.
    pub fn summaries(&self) -> Vec<PeerSummary> {
        self.peers
            .values()
            .map(|p| PeerSummary {
                device_id: p.device_id.clone(),
                ip: self.normalize_ip(p.ip),
                port: p.port,
                authenticated: p.authenticated,
                last_seen_ms: p.last_seen_ms,
            })
            .collect()
    }
}
