//! # Kademlia Routing
//!
//! XOR-metric routing over 160-bit NodeIDs with the classic
//! PING / FIND_NODE / STORE RPC set.
//!
//! ## Routing Table
//!
//! 160 k-buckets indexed by the most significant differing bit of
//! `xor(local, other)`. Each bucket holds up to k = 20 [`SignedPeerInfo`]
//! entries in insertion order; on overflow the head (least recently added)
//! is evicted. Every entry admitted to the table has had its signature
//! verified.
//!
//! ## Iterative Lookup
//!
//! Each round queries every not-yet-queried candidate in parallel, merges
//! the union of their replies (deduplicated by device id), re-sorts by XOR
//! distance to the target, and truncates to k. The lookup terminates when a
//! full round yields no new entries.
//!
//! ## Actor Architecture
//!
//! - [`Dht`]: cloneable public handle
//! - `DhtActor`: private task owning the routing table
//! - [`DhtRpc`]: transport seam — production wires it to the node's RPC
//!   client; tests drive lookups against an in-memory network.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::Duration;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::identity::{distance_cmp, NodeId, SignedPeerInfo};

/// Bucket capacity and lookup return-set size.
pub const K: usize = 20;

/// One bucket per NodeID bit.
pub const BUCKET_COUNT: usize = 160;

/// Deadline for a single DHT RPC. No automatic retry.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Hard cap on lookup rounds; converged lookups stop well before this.
const MAX_LOOKUP_ROUNDS: usize = 20;

/// Index of the bucket that holds `other` in `local`'s routing table:
/// the 0-based position (from the high bit) of the most significant set bit
/// of `xor(local, other)`. `None` when the ids are equal.
pub fn bucket_index(local: &NodeId, other: &NodeId) -> Option<usize> {
    let dist = local.xor_distance(other);
    for (byte_idx, byte) in dist.iter().enumerate() {
        if *byte != 0 {
            return Some(byte_idx * 8 + byte.leading_zeros() as usize);
        }
    }
    None
}

// ============================================================================
// K-Buckets
// ============================================================================

/// Insertion-ordered list of at most [`K`] entries. Head = least recently
/// added, evicted first on overflow.
#[derive(Debug, Default)]
struct KBucket {
    entries: Vec<SignedPeerInfo>,
}

impl KBucket {
    fn touch(&mut self, info: SignedPeerInfo) {
        if let Some(pos) = self
            .entries
            .iter()
            .position(|e| e.device_id == info.device_id)
        {
            // Known entry: keep its slot, prefer the newer record
            if info.timestamp > self.entries[pos].timestamp {
                self.entries[pos] = info;
            }
            return;
        }

        if self.entries.len() >= K {
            let evicted = self.entries.remove(0);
            trace!(evicted = %evicted.device_id, "bucket full, evicting head");
        }
        self.entries.push(info);
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

// ============================================================================
// Routing Table
// ============================================================================

/// 160-bucket Kademlia routing table keyed by XOR distance from `local`.
pub struct RoutingTable {
    local: NodeId,
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    pub fn new(local: NodeId) -> Self {
        let mut buckets = Vec::with_capacity(BUCKET_COUNT);
        buckets.resize_with(BUCKET_COUNT, KBucket::default);
        Self { local, buckets }
    }

    /// Insert or refresh an entry. The caller has already verified the
    /// signature. Returns false for self-entries.
    pub fn insert(&mut self, info: SignedPeerInfo) -> bool {
        match bucket_index(&self.local, &info.node_id()) {
            Some(idx) => {
                self.buckets[idx].touch(info);
                true
            }
            None => false,
        }
    }

    /// The k entries closest to `target`, sorted ascending by XOR distance.
    pub fn find_closest(&self, target: &NodeId, k: usize) -> Vec<SignedPeerInfo> {
        let mut all: Vec<SignedPeerInfo> = self
            .buckets
            .iter()
            .flat_map(|b| b.entries.iter().cloned())
            .collect();
        all.sort_by(|a, b| {
            let da = a.node_id().xor_distance(target);
            let db = b.node_id().xor_distance(target);
            distance_cmp(&da, &db)
        });
        all.truncate(k);
        all
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.buckets
            .iter()
            .any(|b| b.entries.iter().any(|e| e.device_id == device_id))
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(KBucket::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn bucket_of(&self, device_id: &str) -> Option<usize> {
        self.buckets
            .iter()
            .position(|b| b.entries.iter().any(|e| e.device_id == device_id))
    }
}

// ============================================================================
// RPC seam
// ============================================================================

/// Outbound DHT RPCs. Implementations own addressing, framing, and the
/// 5-second response deadline.
#[async_trait]
pub trait DhtRpc: Send + Sync + 'static {
    /// PING a node; resolves with the responder's signed record.
    async fn ping(&self, to: SocketAddr) -> Result<SignedPeerInfo>;

    /// Ask a node for its k entries closest to `target`.
    async fn find_node(&self, to: SocketAddr, target: NodeId) -> Result<Vec<SignedPeerInfo>>;

    /// Hand a signed record to a node for storage. No reply.
    async fn store(&self, to: SocketAddr, info: SignedPeerInfo) -> Result<()>;
}

// ============================================================================
// DHT handle + actor
// ============================================================================

enum Command {
    Observe(SignedPeerInfo),
    Closest(NodeId, usize, oneshot::Sender<Vec<SignedPeerInfo>>),
    Contains(String, oneshot::Sender<bool>),
    Len(oneshot::Sender<usize>),
    Quit,
}

/// Public handle to the routing actor. Cheap to clone.
pub struct Dht<N: DhtRpc> {
    cmd_tx: mpsc::Sender<Command>,
    local: NodeId,
    network: Arc<N>,
}

impl<N: DhtRpc> Clone for Dht<N> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            local: self.local,
            network: self.network.clone(),
        }
    }
}

struct DhtActor {
    routing: RoutingTable,
    cmd_rx: mpsc::Receiver<Command>,
}

impl<N: DhtRpc> Dht<N> {
    pub fn new(local: NodeId, network: N) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(128);
        let actor = DhtActor {
            routing: RoutingTable::new(local),
            cmd_rx,
        };
        tokio::spawn(actor.run());
        Self {
            cmd_tx,
            local,
            network: Arc::new(network),
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local
    }

    /// Verify and admit a record to the routing table. Records that fail
    /// structural validation or signature verification are dropped here.
    pub async fn observe(&self, info: SignedPeerInfo) -> bool {
        if !info.validate_structure() {
            debug!(peer = %info.device_id, "peer record rejected: bad structure");
            return false;
        }
        if info.verify().is_err() {
            debug!(peer = %info.device_id, "peer record rejected: bad signature");
            return false;
        }
        let _ = self.cmd_tx.send(Command::Observe(info)).await;
        true
    }

    /// The k entries closest to `target` known locally.
    pub async fn find_closest(&self, target: NodeId, k: usize) -> Vec<SignedPeerInfo> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Closest(target, k, tx))
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn contains(&self, device_id: &str) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Contains(device_id.to_string(), tx))
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn len(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Len(tx)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Iterative lookup for `target`.
    ///
    /// Seeds the candidate set locally, then rounds of parallel FIND_NODE
    /// against every unqueried candidate until a round discovers nothing new.
    /// Returns the final candidate list, closest first (may be shorter than
    /// k in small networks).
    pub async fn iterative_find_node(&self, target: NodeId) -> Result<Vec<SignedPeerInfo>> {
        let mut shortlist = self.find_closest(target, K).await;
        let mut seen: HashSet<String> = shortlist.iter().map(|c| c.device_id.clone()).collect();
        let mut queried: HashSet<String> = HashSet::new();

        for round in 0.. {
            if round >= MAX_LOOKUP_ROUNDS {
                warn!(target = %target, rounds = round, "lookup exceeded max rounds");
                break;
            }

            let candidates: Vec<SignedPeerInfo> = shortlist
                .iter()
                .filter(|c| !queried.contains(&c.device_id))
                .cloned()
                .collect();
            if candidates.is_empty() {
                break;
            }
            for c in &candidates {
                queried.insert(c.device_id.clone());
            }

            let mut join_set = JoinSet::new();
            for contact in candidates {
                let network = self.network.clone();
                join_set.spawn(async move {
                    let result = network.find_node(contact.addr(), target).await;
                    (contact, result)
                });
            }

            let mut new_entries = false;
            while let Some(joined) = join_set.join_next().await {
                let Ok((contact, result)) = joined else {
                    continue;
                };
                match result {
                    Ok(nodes) => {
                        // The responder is alive; keep its record fresh
                        self.observe(contact).await;
                        for node in nodes {
                            if node.node_id() == self.local {
                                continue;
                            }
                            if !self.observe(node.clone()).await {
                                continue;
                            }
                            if seen.insert(node.device_id.clone()) {
                                shortlist.push(node);
                                new_entries = true;
                            }
                        }
                    }
                    Err(e) => {
                        trace!(peer = %contact.device_id, error = %e, "lookup query failed");
                    }
                }
            }

            shortlist.sort_by(|a, b| {
                let da = a.node_id().xor_distance(&target);
                let db = b.node_id().xor_distance(&target);
                distance_cmp(&da, &db)
            });
            shortlist.truncate(K);

            if !new_entries {
                break;
            }
        }

        debug!(
            target = %target,
            found = shortlist.len(),
            queried = queried.len(),
            "iterative lookup completed"
        );
        Ok(shortlist)
    }

    /// Join the overlay through a donor: PING it, look up our own id to
    /// populate the buckets, then publish `own_info` to the k closest nodes.
    pub async fn join(&self, donor: SocketAddr, own_info: SignedPeerInfo) -> Result<()> {
        let donor_info = self.network.ping(donor).await?;
        if !self.observe(donor_info).await {
            return Err(Error::SignatureMismatch);
        }

        self.iterative_find_node(self.local).await?;

        let closest = self.find_closest(self.local, K).await;
        for contact in closest {
            if let Err(e) = self.network.store(contact.addr(), own_info.clone()).await {
                trace!(peer = %contact.device_id, error = %e, "store during join failed");
            }
        }
        Ok(())
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

impl DhtActor {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::Observe(info) => {
                    self.routing.insert(info);
                }
                Command::Closest(target, k, reply) => {
                    let _ = reply.send(self.routing.find_closest(&target, k));
                }
                Command::Contains(device_id, reply) => {
                    let _ = reply.send(self.routing.contains(&device_id));
                }
                Command::Len(reply) => {
                    let _ = reply.send(self.routing.len());
                }
                Command::Quit => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeIdentity;
    use std::collections::HashMap;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Mutex;

    fn info_for(name: &str, port: u16) -> SignedPeerInfo {
        NodeIdentity::new(name).signed_peer_info(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[test]
    fn bucket_index_is_most_significant_differing_bit() {
        let local = NodeId::from_bytes([0u8; 20]);

        let mut high = [0u8; 20];
        high[0] = 0x80;
        assert_eq!(bucket_index(&local, &NodeId::from_bytes(high)), Some(0));

        let mut mid = [0u8; 20];
        mid[0] = 0x01;
        assert_eq!(bucket_index(&local, &NodeId::from_bytes(mid)), Some(7));

        let mut low = [0u8; 20];
        low[19] = 0x01;
        assert_eq!(bucket_index(&local, &NodeId::from_bytes(low)), Some(159));

        assert_eq!(bucket_index(&local, &local), None);
    }

    #[test]
    fn entries_land_in_their_computed_bucket() {
        let local = NodeId::from_device_id("local");
        let mut table = RoutingTable::new(local);

        for i in 0..50 {
            let info = info_for(&format!("peer-{i}"), 9000 + i as u16);
            let expected = bucket_index(&local, &info.node_id()).unwrap();
            assert!(table.insert(info.clone()));
            assert_eq!(
                table.bucket_of(&info.device_id),
                Some(expected),
                "peer-{i} in wrong bucket"
            );
        }
        assert_eq!(table.len(), 50);
    }

    #[test]
    fn self_entry_is_rejected() {
        let local = NodeId::from_device_id("local");
        let mut table = RoutingTable::new(local);
        assert!(!table.insert(info_for("local", 9000)));
        assert!(table.is_empty());
    }

    #[test]
    fn bucket_overflow_evicts_head() {
        let mut bucket = KBucket::default();
        for i in 0..K {
            bucket.touch(info_for(&format!("peer-{i}"), 9000 + i as u16));
        }
        assert_eq!(bucket.len(), K);
        let head = bucket.entries[0].device_id.clone();

        bucket.touch(info_for("newcomer", 9999));
        assert_eq!(bucket.len(), K);
        assert!(!bucket.entries.iter().any(|e| e.device_id == head));
        assert_eq!(bucket.entries.last().unwrap().device_id, "newcomer");
    }

    #[test]
    fn known_entry_refresh_prefers_newer_record() {
        let mut bucket = KBucket::default();
        let identity = NodeIdentity::new("peer");
        let older = identity.signed_peer_info("127.0.0.1".parse().unwrap(), 9000);
        let mut newer = identity.signed_peer_info("127.0.0.1".parse().unwrap(), 9001);
        newer.timestamp = older.timestamp + 10;

        bucket.touch(newer.clone());
        bucket.touch(older);
        assert_eq!(bucket.len(), 1);
        assert_eq!(bucket.entries[0].port, 9001);
    }

    #[test]
    fn find_closest_orders_by_distance() {
        let local = NodeId::from_device_id("local");
        let target = NodeId::from_device_id("target");
        let mut table = RoutingTable::new(local);

        for i in 0..30 {
            table.insert(info_for(&format!("peer-{i}"), 9000 + i as u16));
        }

        let closest = table.find_closest(&target, 10);
        assert_eq!(closest.len(), 10);
        for pair in closest.windows(2) {
            let da = pair[0].node_id().xor_distance(&target);
            let db = pair[1].node_id().xor_distance(&target);
            assert_ne!(distance_cmp(&da, &db), std::cmp::Ordering::Greater);
        }
    }

    #[tokio::test]
    async fn observe_rejects_tampered_records() {
        let dht = Dht::new(NodeId::from_device_id("local"), Arc::new(MockNetwork::default()));

        let mut tampered = info_for("peer", 9000);
        tampered.port = 9001;
        assert!(!dht.observe(tampered).await);

        let mut bad_structure = info_for("peer", 9000);
        bad_structure.signature = vec![0u8; 12];
        assert!(!dht.observe(bad_structure).await);

        assert_eq!(dht.len().await, 0);

        assert!(dht.observe(info_for("peer", 9000)).await);
        assert!(dht.contains("peer").await);
    }

    // ------------------------------------------------------------------------
    // In-memory network for lookup tests
    // ------------------------------------------------------------------------

    #[derive(Default)]
    struct MockNetwork {
        nodes: Mutex<HashMap<SocketAddr, MockNode>>,
    }

    struct MockNode {
        info: SignedPeerInfo,
        known: Vec<SignedPeerInfo>,
        stored: Vec<SignedPeerInfo>,
    }

    impl MockNetwork {
        fn add_node(&self, name: &str, port: u16, known: Vec<SignedPeerInfo>) -> SignedPeerInfo {
            let info = info_for(name, port);
            self.nodes.lock().unwrap().insert(
                info.addr(),
                MockNode {
                    info: info.clone(),
                    known,
                    stored: Vec::new(),
                },
            );
            info
        }

        fn stored_at(&self, addr: SocketAddr) -> Vec<String> {
            self.nodes
                .lock()
                .unwrap()
                .get(&addr)
                .map(|n| n.stored.iter().map(|i| i.device_id.clone()).collect())
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl DhtRpc for Arc<MockNetwork> {
        async fn ping(&self, to: SocketAddr) -> Result<SignedPeerInfo> {
            self.nodes
                .lock()
                .unwrap()
                .get(&to)
                .map(|n| n.info.clone())
                .ok_or(Error::RpcTimeout(0))
        }

        async fn find_node(
            &self,
            to: SocketAddr,
            target: NodeId,
        ) -> Result<Vec<SignedPeerInfo>> {
            let nodes = self.nodes.lock().unwrap();
            let node = nodes.get(&to).ok_or(Error::RpcTimeout(0))?;
            let mut known = node.known.clone();
            known.sort_by(|a, b| {
                let da = a.node_id().xor_distance(&target);
                let db = b.node_id().xor_distance(&target);
                distance_cmp(&da, &db)
            });
            known.truncate(K);
            Ok(known)
        }

        async fn store(&self, to: SocketAddr, info: SignedPeerInfo) -> Result<()> {
            let mut nodes = self.nodes.lock().unwrap();
            let node = nodes.get_mut(&to).ok_or(Error::RpcTimeout(0))?;
            node.stored.push(info);
            Ok(())
        }
    }

    #[tokio::test]
    async fn lookup_walks_the_network() {
        // A chain: seed knows hop, hop knows goal. A lookup seeded with only
        // the seed must still discover the goal.
        let network = Arc::new(MockNetwork::default());
        let goal = network.add_node("goal", 9003, vec![]);
        let hop = network.add_node("hop", 9002, vec![goal.clone()]);
        let seed = network.add_node("seed", 9001, vec![hop.clone()]);

        let dht = Dht::new(NodeId::from_device_id("local"), network.clone());
        dht.observe(seed).await;

        let found = dht.iterative_find_node(goal.node_id()).await.unwrap();
        let ids: Vec<&str> = found.iter().map(|i| i.device_id.as_str()).collect();
        assert!(ids.contains(&"goal"), "goal not found: {ids:?}");
        assert!(ids.contains(&"hop"));

        // Everything discovered is now in routing
        assert!(dht.contains("goal").await);
        assert!(dht.contains("hop").await);
    }

    #[tokio::test]
    async fn lookup_converges_when_nothing_new_appears() {
        let network = Arc::new(MockNetwork::default());
        let a = network.add_node("a", 9001, vec![]);
        let b = network.add_node("b", 9002, vec![a.clone()]);

        // a and b only know each other; the lookup must terminate
        {
            let mut nodes = network.nodes.lock().unwrap();
            nodes.get_mut(&a.addr()).unwrap().known = vec![b.clone()];
        }

        let dht = Dht::new(NodeId::from_device_id("local"), network.clone());
        dht.observe(a).await;

        let found = dht
            .iterative_find_node(NodeId::from_device_id("absent"))
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
    }

    #[tokio::test]
    async fn lookup_survives_dead_candidates() {
        let network = Arc::new(MockNetwork::default());
        let alive = network.add_node("alive", 9001, vec![]);
        // A record pointing at an address nobody answers
        let dead = info_for("dead", 9666);

        let dht = Dht::new(NodeId::from_device_id("local"), network.clone());
        dht.observe(alive.clone()).await;
        dht.observe(dead).await;

        let found = dht.iterative_find_node(alive.node_id()).await.unwrap();
        assert!(found.iter().any(|i| i.device_id == "alive"));
    }

    #[tokio::test]
    async fn join_pings_donor_and_publishes_own_record() {
        let network = Arc::new(MockNetwork::default());
        let peer = network.add_node("peer", 9002, vec![]);
        let donor = network.add_node("donor", 9001, vec![peer.clone()]);

        let own = info_for("local", 9000);
        let dht = Dht::new(NodeId::from_device_id("local"), network.clone());
        dht.join(donor.addr(), own).await.unwrap();

        // Donor and its peer are now known
        assert!(dht.contains("donor").await);
        assert!(dht.contains("peer").await);

        // Our record was stored on the closest nodes
        assert!(network.stored_at(donor.addr()).contains(&"local".to_string()));
        assert!(network.stored_at(peer.addr()).contains(&"local".to_string()));
    }

    #[tokio::test]
    async fn join_fails_when_donor_silent() {
        let network = Arc::new(MockNetwork::default());
        let dht = Dht::new(NodeId::from_device_id("local"), network.clone());

        let own = info_for("local", 9000);
        let silent: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        assert!(dht.join(silent, own).await.is_err());
    }
}
