//! # Node Core
//!
//! [`Node`] is the public face of the overlay: it composes the transport,
//! reliability layer, peer table, DHT, handshake, and gossip engine into one
//! running instance.
//!
//! ## Architecture
//!
//! Each node is a single cooperative-concurrency domain. A private
//! `NodeActor` task owns every piece of mutable state and runs the one
//! dispatch loop: inbound datagrams, API commands, and the three timers
//! (500 ms reliability tick, gossip interval, cleanup interval) all funnel
//! through its `select!`. The [`Node`] handle communicates with the actor
//! exclusively over typed channels; external readers get defensive copies.
//!
//! ## Inbound demultiplexing
//!
//! Decoded DATA payloads route to the handshake engine, the DHT RPC
//! handlers, the gossip merge, or application delivery. Unknown payload
//! types are surfaced to the application unchanged. Delivery to the
//! application is FIFO per source because one task does all dispatch.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::auth;
use crate::config::NodeConfig;
use crate::crypto;
use crate::dht::{Dht, DhtRpc, K, RPC_TIMEOUT};
use crate::error::{Error, Result};
use crate::gossip::GossipEngine;
use crate::identity::{NodeId, NodeIdentity, SignedPeerInfo};
use crate::messages::{
    demux_payload, Envelope, EnvelopeKind, Payload, RpcFrame, TypedPayload,
};
use crate::peers::{PeerSummary, PeerTable};
use crate::reliability::{ReliabilityLayer, RELIABILITY_TICK};
use crate::transport::{MetricsSnapshot, NetMetrics, UdpTransport};

/// Depth of the application delivery channel.
const APP_CHANNEL_CAPACITY: usize = 256;

/// Depth of the peer-event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A message delivered to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppMessage {
    /// Sender's device id.
    pub from: String,
    /// Decrypted payload bytes.
    pub bytes: Vec<u8>,
}

/// Peer lifecycle events, broadcast to every subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A previously unknown device id entered the peer table.
    Discovered { device_id: String },
    /// A handshake completed and a session key was installed.
    Authenticated { device_id: String },
    /// An authenticated peer was evicted by the inactivity sweep.
    Expired { device_id: String },
}

type TakeOnce<T> = StdMutex<Option<mpsc::Receiver<T>>>;

enum NodeCommand {
    Send {
        to: String,
        payload: Vec<u8>,
        require_ack: bool,
        encrypt: bool,
        done: oneshot::Sender<Result<bool>>,
    },
    AddDonor {
        addr: SocketAddr,
    },
    PublishContent {
        id: String,
        bytes: Vec<u8>,
    },
    GetContent {
        id: String,
        reply: oneshot::Sender<Option<Vec<u8>>>,
    },
    GetAnnounced {
        from: String,
        reply: oneshot::Sender<Vec<String>>,
    },
    RequestContent {
        from: String,
        id: String,
    },
    GetPeers {
        reply: oneshot::Sender<Vec<PeerSummary>>,
    },
    PendingCount {
        reply: oneshot::Sender<usize>,
    },
    Stop {
        done: oneshot::Sender<()>,
    },
}

// ============================================================================
// RPC client (DhtRpc over the envelope transport)
// ============================================================================

/// Outbound DHT RPC plumbing: allocates rpc-ids, frames requests into DATA
/// envelopes, and matches responses back to waiting callers.
pub(crate) struct RpcClient {
    inner: Arc<RpcClientInner>,
}

struct RpcClientInner {
    transport: Arc<UdpTransport>,
    identity: Arc<NodeIdentity>,
    advertised: SocketAddr,
    force_localhost: bool,
    next_rpc_id: AtomicU32,
    seq: Arc<AtomicU32>,
    pending: StdMutex<HashMap<u32, oneshot::Sender<RpcFrame>>>,
}

impl Clone for RpcClient {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl RpcClient {
    fn new(
        transport: Arc<UdpTransport>,
        identity: Arc<NodeIdentity>,
        advertised: SocketAddr,
        force_localhost: bool,
        seq: Arc<AtomicU32>,
    ) -> Self {
        Self {
            inner: Arc::new(RpcClientInner {
                transport,
                identity,
                advertised,
                force_localhost,
                next_rpc_id: AtomicU32::new(1),
                seq,
                pending: StdMutex::new(HashMap::new()),
            }),
        }
    }

    /// Normalize an outbound destination under `force_localhost`.
    fn target(&self, addr: SocketAddr) -> SocketAddr {
        if self.inner.force_localhost {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
        } else {
            addr
        }
    }

    /// Freshly-timestamped signed record for this node.
    fn own_info(&self) -> SignedPeerInfo {
        self.inner
            .identity
            .signed_peer_info(self.inner.advertised.ip(), self.inner.advertised.port())
    }

    fn next_rpc_id(&self) -> u32 {
        self.inner.next_rpc_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Resolve an inbound response frame against the pending map. Returns
    /// false for unmatched (late or unsolicited) responses.
    pub(crate) fn resolve(&self, frame: RpcFrame) -> bool {
        let waiter = self
            .inner
            .pending
            .lock()
            .expect("rpc pending lock poisoned")
            .remove(&frame.rpc_id());
        match waiter {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    async fn send_frame(&self, to: SocketAddr, frame: &RpcFrame) -> Result<()> {
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        let envelope = Envelope::new(
            EnvelopeKind::Data,
            self.inner.identity.device_id(),
            None,
            &frame.to_bytes(),
            seq,
        );
        self.inner
            .transport
            .send_to(self.target(to), &envelope.encode())
            .await
    }

    /// Send a request frame and wait up to [`RPC_TIMEOUT`] for its response.
    async fn request(&self, to: SocketAddr, frame: RpcFrame) -> Result<RpcFrame> {
        let rpc_id = frame.rpc_id();
        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .expect("rpc pending lock poisoned")
            .insert(rpc_id, tx);

        if let Err(e) = self.send_frame(to, &frame).await {
            self.inner
                .pending
                .lock()
                .expect("rpc pending lock poisoned")
                .remove(&rpc_id);
            return Err(e);
        }

        match timeout(RPC_TIMEOUT, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::TransportClosed),
            Err(_) => {
                self.inner
                    .pending
                    .lock()
                    .expect("rpc pending lock poisoned")
                    .remove(&rpc_id);
                Err(Error::RpcTimeout(rpc_id))
            }
        }
    }
}

#[async_trait]
impl DhtRpc for RpcClient {
    async fn ping(&self, to: SocketAddr) -> Result<SignedPeerInfo> {
        let rpc_id = self.next_rpc_id();
        let frame = RpcFrame::Ping {
            rpc_id,
            info: self.own_info(),
        };
        match self.request(to, frame).await? {
            RpcFrame::Pong { info, .. } => Ok(info),
            other => Err(Error::MalformedEnvelope(format!(
                "unexpected rpc response op {:#04x}",
                other.op()
            ))),
        }
    }

    async fn find_node(&self, to: SocketAddr, target: NodeId) -> Result<Vec<SignedPeerInfo>> {
        let rpc_id = self.next_rpc_id();
        let frame = RpcFrame::FindNode { rpc_id, target };
        match self.request(to, frame).await? {
            RpcFrame::FoundNode { infos, .. } => Ok(infos),
            other => Err(Error::MalformedEnvelope(format!(
                "unexpected rpc response op {:#04x}",
                other.op()
            ))),
        }
    }

    async fn store(&self, to: SocketAddr, info: SignedPeerInfo) -> Result<()> {
        let rpc_id = self.next_rpc_id();
        let frame = RpcFrame::Store { rpc_id, info };
        self.send_frame(to, &frame).await
    }
}

// ============================================================================
// Node handle
// ============================================================================

/// A running overlay node.
///
/// Dropping the handle does not stop the node; call [`Node::stop`].
pub struct Node {
    cmd_tx: mpsc::Sender<NodeCommand>,
    identity: Arc<NodeIdentity>,
    dht: Dht<RpcClient>,
    local_addr: SocketAddr,
    advertised: SocketAddr,
    messages_rx: TakeOnce<AppMessage>,
    events_tx: broadcast::Sender<PeerEvent>,
    metrics: NetMetrics,
}

impl Node {
    /// Initialize crypto, bind the socket, probe STUN (unless disabled or
    /// forced to localhost), seed the peer table with self, and start the
    /// dispatch loop. Fails atomically: no half-initialized node escapes.
    pub async fn start(config: NodeConfig) -> anyhow::Result<Self> {
        let identity = Arc::new(NodeIdentity::new(config.username.clone()));
        let metrics = NetMetrics::new();

        let (transport, inbound_rx) = UdpTransport::bind(config.udp_port, metrics.clone())
            .await
            .context("failed to bind UDP socket")?;
        let transport = Arc::new(transport);
        let local_addr = transport.local_addr();

        let advertised = if config.force_localhost {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), local_addr.port())
        } else {
            match &config.stun_server {
                Some(server) => match transport.discover_public_address(server).await {
                    Ok(mapped) => {
                        info!(%mapped, server = %server, "public address discovered via STUN");
                        mapped
                    }
                    Err(e) => {
                        warn!(error = %e, "STUN probe failed, using local interface address");
                        SocketAddr::new(local_interface_ip(), local_addr.port())
                    }
                },
                None => SocketAddr::new(local_interface_ip(), local_addr.port()),
            }
        };

        let seq = Arc::new(AtomicU32::new(1));
        let rpc = RpcClient::new(
            transport.clone(),
            identity.clone(),
            advertised,
            config.force_localhost,
            seq.clone(),
        );
        let dht = Dht::new(identity.node_id(), rpc.clone());

        let mut peers = PeerTable::new(identity.device_id(), config.force_localhost);
        peers.insert_self(advertised.ip(), advertised.port());

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (messages_tx, messages_rx) = mpsc::channel(APP_CHANNEL_CAPACITY);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let actor = NodeActor {
            identity: identity.clone(),
            config: config.clone(),
            transport,
            reliability: ReliabilityLayer::new(config.message_timeout),
            peers,
            dht: dht.clone(),
            gossip: GossipEngine::new(config.gossip_peer_count),
            rpc,
            seq,
            auth_pending: HashMap::new(),
            content: HashMap::new(),
            announced: HashMap::new(),
            inbound_rx,
            cmd_rx,
            messages_tx,
            events_tx: events_tx.clone(),
            metrics: metrics.clone(),
        };
        tokio::spawn(actor.run());

        info!(
            device = identity.device_id(),
            node_id = %identity.node_id(),
            %local_addr,
            %advertised,
            "node started"
        );

        Ok(Self {
            cmd_tx,
            identity,
            dht,
            local_addr,
            advertised,
            messages_rx: StdMutex::new(Some(messages_rx)),
            events_tx,
            metrics,
        })
    }

    pub fn device_id(&self) -> &str {
        self.identity.device_id()
    }

    pub fn node_id(&self) -> NodeId {
        self.identity.node_id()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The endpoint advertised in this node's signed records (STUN-derived
    /// when available).
    pub fn advertised_addr(&self) -> SocketAddr {
        self.advertised
    }

    /// Send `payload` to a peer.
    ///
    /// With `require_ack` the returned future resolves once the ACK arrives
    /// (true) or the retry budget / message timeout is exhausted (false).
    /// With `encrypt` the payload is sealed under the peer's session key;
    /// fails with [`Error::NoSession`] when no handshake has completed.
    pub async fn send(
        &self,
        to: &str,
        payload: Vec<u8>,
        require_ack: bool,
        encrypt: bool,
    ) -> Result<bool> {
        let (done, rx) = oneshot::channel();
        self.cmd_tx
            .send(NodeCommand::Send {
                to: to.to_string(),
                payload,
                require_ack,
                encrypt,
                done,
            })
            .await
            .map_err(|_| Error::TransportClosed)?;
        rx.await.map_err(|_| Error::TransportClosed)?
    }

    /// Seed a donor endpoint and trigger a handshake toward it. The real
    /// device id replaces the placeholder on first authenticated contact.
    pub async fn add_donor(&self, ip: IpAddr, port: u16) {
        let _ = self
            .cmd_tx
            .send(NodeCommand::AddDonor {
                addr: SocketAddr::new(ip, port),
            })
            .await;
    }

    /// Join the DHT through a donor: PING it, look up our own id, and
    /// publish our signed record to the closest nodes.
    pub async fn join(&self, ip: IpAddr, port: u16) -> Result<()> {
        let own_info = self
            .identity
            .signed_peer_info(self.advertised.ip(), self.advertised.port());
        self.dht.join(SocketAddr::new(ip, port), own_info).await
    }

    /// Kademlia iterative lookup for `target`.
    pub async fn find_node(&self, target: NodeId) -> Result<Vec<SignedPeerInfo>> {
        self.dht.iterative_find_node(target).await
    }

    /// Store content locally and announce its id to every authenticated
    /// peer (no ACK).
    pub async fn publish_content(&self, id: impl Into<String>, bytes: Vec<u8>) {
        let _ = self
            .cmd_tx
            .send(NodeCommand::PublishContent {
                id: id.into(),
                bytes,
            })
            .await;
    }

    /// Locally stored or previously fetched content.
    pub async fn content(&self, id: &str) -> Option<Vec<u8>> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(NodeCommand::GetContent {
                id: id.to_string(),
                reply,
            })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    /// Content ids a peer has announced so far.
    pub async fn announced_content(&self, from: &str) -> Vec<String> {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(NodeCommand::GetAnnounced {
                from: from.to_string(),
                reply,
            })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Ask `from` for content it announced earlier; the bytes land in
    /// [`Node::content`] once the reply arrives.
    pub async fn request_content(&self, from: &str, id: &str) {
        let _ = self
            .cmd_tx
            .send(NodeCommand::RequestContent {
                from: from.to_string(),
                id: id.to_string(),
            })
            .await;
    }

    /// Defensive copy of the peer table.
    pub async fn peers(&self) -> Vec<PeerSummary> {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(NodeCommand::GetPeers { reply })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Number of sends still waiting for an ACK.
    pub async fn pending_messages(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(NodeCommand::PendingCount { reply })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// The application message stream. Can be taken exactly once.
    pub fn messages(&self) -> Result<mpsc::Receiver<AppMessage>> {
        self.messages_rx
            .lock()
            .expect("messages lock poisoned")
            .take()
            .ok_or_else(|| Error::Internal("message receiver already taken".into()))
    }

    /// Subscribe to peer lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<PeerEvent> {
        self.events_tx.subscribe()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Cancel timers, complete every pending send with failure, and close
    /// the socket. No partial state is observable afterwards.
    pub async fn stop(&self) {
        let (done, rx) = oneshot::channel();
        if self.cmd_tx.send(NodeCommand::Stop { done }).await.is_ok() {
            let _ = rx.await;
        }
        self.dht.quit().await;
    }
}

/// Routable local interface address, probed without shelling out: connect a
/// throwaway UDP socket toward a public resolver and read the chosen source
/// address. Falls back to loopback.
fn local_interface_ip() -> IpAddr {
    for target in ["8.8.8.8:53", "1.1.1.1:53"] {
        if let Ok(socket) = std::net::UdpSocket::bind("0.0.0.0:0") {
            if socket.connect(target).is_ok() {
                if let Ok(local) = socket.local_addr() {
                    let ip = local.ip();
                    if !ip.is_unspecified() {
                        return ip;
                    }
                }
            }
        }
    }
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

// ============================================================================
// Node actor (the single dispatch task)
// ============================================================================

struct NodeActor {
    identity: Arc<NodeIdentity>,
    config: NodeConfig,
    transport: Arc<UdpTransport>,
    reliability: ReliabilityLayer,
    peers: PeerTable,
    dht: Dht<RpcClient>,
    gossip: GossipEngine,
    rpc: RpcClient,
    seq: Arc<AtomicU32>,
    /// Challenges we issued, keyed by destination address.
    auth_pending: HashMap<SocketAddr, [u8; auth::CHALLENGE_LEN]>,
    /// Locally published and fetched content.
    content: HashMap<String, Vec<u8>>,
    /// Content ids announced by each origin.
    announced: HashMap<String, HashSet<String>>,
    inbound_rx: mpsc::Receiver<(SocketAddr, Vec<u8>)>,
    cmd_rx: mpsc::Receiver<NodeCommand>,
    messages_tx: mpsc::Sender<AppMessage>,
    events_tx: broadcast::Sender<PeerEvent>,
    metrics: NetMetrics,
}

impl NodeActor {
    async fn run(mut self) {
        let mut tick = interval(RELIABILITY_TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut gossip_timer = interval(self.config.gossip_interval);
        gossip_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cleanup_timer = interval(self.config.peer_cleanup_interval);
        cleanup_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of an interval fires immediately; skip it so a
        // fresh node does not gossip into the void.
        gossip_timer.tick().await;
        cleanup_timer.tick().await;

        loop {
            tokio::select! {
                maybe_datagram = self.inbound_rx.recv() => {
                    match maybe_datagram {
                        Some((src, data)) => self.handle_datagram(src, &data).await,
                        None => {
                            warn!("transport receive loop ended");
                            break;
                        }
                    }
                }
                maybe_cmd = self.cmd_rx.recv() => {
                    match maybe_cmd {
                        Some(NodeCommand::Stop { done }) => {
                            self.shutdown();
                            let _ = done.send(());
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                        None => break,
                    }
                }
                _ = tick.tick() => {
                    for (addr, bytes) in self.reliability.tick() {
                        let _ = self.transport.send_to(addr, &bytes).await;
                    }
                }
                _ = gossip_timer.tick() => {
                    self.gossip_round().await;
                }
                _ = cleanup_timer.tick() => {
                    for device_id in self.peers.sweep(self.config.message_timeout) {
                        let _ = self.events_tx.send(PeerEvent::Expired { device_id });
                    }
                }
            }
        }
    }

    fn shutdown(&mut self) {
        self.reliability.fail_all();
        self.transport.shutdown();
        info!(device = self.identity.device_id(), "node stopped");
    }

    fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Build and emit an envelope. Fire-and-forget; reliability tracking is
    /// the caller's concern.
    async fn emit(
        &self,
        kind: EnvelopeKind,
        to_device: Option<String>,
        payload: &[u8],
        addr: SocketAddr,
    ) -> (u32, Vec<u8>) {
        let seq = self.next_seq();
        let envelope = Envelope::new(kind, self.identity.device_id(), to_device, payload, seq);
        let bytes = envelope.encode();
        if let Err(e) = self.transport.send_to(addr, &bytes).await {
            debug!(error = %e, %addr, "send failed");
        }
        (seq, bytes)
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    async fn handle_command(&mut self, cmd: NodeCommand) {
        match cmd {
            NodeCommand::Send {
                to,
                payload,
                require_ack,
                encrypt,
                done,
            } => {
                let result = self.handle_send(to, payload, require_ack, encrypt, done).await;
                // `done` was either consumed by reliability or answered inline
                if let Err((done, err)) = result {
                    let _ = done.send(Err(err));
                }
            }
            NodeCommand::AddDonor { addr } => self.handle_add_donor(addr).await,
            NodeCommand::PublishContent { id, bytes } => {
                self.handle_publish_content(id, bytes).await;
            }
            NodeCommand::GetContent { id, reply } => {
                let _ = reply.send(self.content.get(&id).cloned());
            }
            NodeCommand::GetAnnounced { from, reply } => {
                let ids = self
                    .announced
                    .get(&from)
                    .map(|set| set.iter().cloned().collect())
                    .unwrap_or_default();
                let _ = reply.send(ids);
            }
            NodeCommand::RequestContent { from, id } => {
                if let Some(addr) = self.peers.addr_of(&from) {
                    let payload = TypedPayload::ContentRequest { content_id: id };
                    self.emit(EnvelopeKind::Data, Some(from), &payload.to_bytes(), addr)
                        .await;
                }
            }
            NodeCommand::GetPeers { reply } => {
                let _ = reply.send(self.peers.summaries());
            }
            NodeCommand::PendingCount { reply } => {
                let _ = reply.send(self.reliability.pending_count());
            }
            NodeCommand::Stop { .. } => unreachable!("handled by the run loop"),
        }
    }

    async fn handle_send(
        &mut self,
        to: String,
        payload: Vec<u8>,
        require_ack: bool,
        encrypt: bool,
        done: oneshot::Sender<Result<bool>>,
    ) -> std::result::Result<(), (oneshot::Sender<Result<bool>>, Error)> {
        let Some(addr) = self.peers.addr_of(&to) else {
            return Err((done, Error::PeerUnknown(to)));
        };

        let wire_payload = if encrypt {
            match self.peers.session_key(&to) {
                Some(key) => crypto::seal(&key, &payload),
                None => return Err((done, Error::NoSession(to))),
            }
        } else {
            payload
        };

        let seq = self.next_seq();
        let envelope = Envelope::new(
            EnvelopeKind::Data,
            self.identity.device_id(),
            Some(to.clone()),
            &wire_payload,
            seq,
        );
        let bytes = envelope.encode();
        if let Err(e) = self.transport.send_to(addr, &bytes).await {
            return Err((done, e));
        }

        if require_ack {
            self.reliability.register(to, addr, seq, bytes, done);
        } else {
            let _ = done.send(Ok(true));
        }
        Ok(())
    }

    async fn handle_add_donor(&mut self, addr: SocketAddr) {
        let placeholder = self.peers.insert_donor_placeholder(addr);
        let Some(target) = self.peers.addr_of(&placeholder) else {
            return;
        };

        let (challenge, payload) = auth::build_challenge(&self.identity);
        self.auth_pending.insert(target, challenge);
        debug!(donor = %target, "challenging donor");
        self.emit(EnvelopeKind::Data, None, &payload.to_bytes(), target)
            .await;
    }

    async fn handle_publish_content(&mut self, id: String, bytes: Vec<u8>) {
        self.content.insert(id.clone(), bytes);
        let payload = TypedPayload::ContentAnnouncement {
            content_id: id.clone(),
        };
        let targets: Vec<(String, SocketAddr)> = self
            .peers
            .random_authenticated(usize::MAX)
            .into_iter()
            .collect();
        debug!(content = %id, peers = targets.len(), "announcing content");
        for (device_id, addr) in targets {
            self.emit(
                EnvelopeKind::Data,
                Some(device_id),
                &payload.to_bytes(),
                addr,
            )
            .await;
        }
    }

    // ------------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------------

    async fn gossip_round(&mut self) {
        let targets = self.gossip.select_targets(&self.peers);
        if targets.is_empty() {
            return;
        }
        let payload = self.gossip.build_payload(&self.peers).to_bytes();
        trace!(targets = targets.len(), "gossip round");
        for (device_id, addr) in targets {
            self.emit(EnvelopeKind::RoutingTable, Some(device_id), &payload, addr)
                .await;
        }
    }

    /// Push our peer table to one peer right now (post-handshake).
    async fn gossip_to(&mut self, device_id: String, addr: SocketAddr) {
        let payload = self.gossip.build_payload(&self.peers).to_bytes();
        self.emit(EnvelopeKind::RoutingTable, Some(device_id), &payload, addr)
            .await;
    }

    // ------------------------------------------------------------------------
    // Inbound dispatch
    // ------------------------------------------------------------------------

    async fn handle_datagram(&mut self, src: SocketAddr, data: &[u8]) {
        let envelope = match Envelope::decode(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.metrics.incr_malformed();
                debug!(%src, error = %e, "dropping malformed datagram");
                return;
            }
        };

        if !envelope.verify_checksum() {
            self.metrics.incr_checksum();
            let nack = Envelope::nack(
                self.identity.device_id(),
                &envelope.from_peer_id,
                envelope.sequence_number,
                "checksum mismatch",
            );
            let _ = self.transport.send_to(src, &nack.encode()).await;
            return;
        }

        let from = envelope.from_peer_id.clone();
        if from == self.identity.device_id() {
            return;
        }

        // Every inbound envelope refreshes (or creates) the sender's entry
        if self.peers.upsert_observed(&from, src) {
            let _ = self.events_tx.send(PeerEvent::Discovered {
                device_id: from.clone(),
            });
        }

        let kind = envelope
            .envelope_kind()
            .expect("decode validated the kind code");

        match kind {
            EnvelopeKind::Ack => {
                self.reliability
                    .acknowledge(&from, envelope.sequence_number);
                return;
            }
            EnvelopeKind::Nack => {
                let reason = envelope
                    .payload_bytes()
                    .ok()
                    .filter(|p| p.len() > 1)
                    .map(|p| String::from_utf8_lossy(&p[1..]).into_owned())
                    .unwrap_or_default();
                warn!(peer = %from, seq = envelope.sequence_number, %reason, "received NACK");
                return;
            }
            _ => {}
        }

        // Duplicates are ACKed again but never re-delivered
        let duplicate = self.reliability.record_seen(&from, envelope.sequence_number);
        let ack = Envelope::ack(self.identity.device_id(), &from, envelope.sequence_number);
        let _ = self.transport.send_to(src, &ack.encode()).await;
        if duplicate {
            trace!(peer = %from, seq = envelope.sequence_number, "duplicate suppressed");
            return;
        }

        let payload = match envelope.payload_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                self.metrics.incr_malformed();
                debug!(peer = %from, error = %e, "undecodable payload");
                return;
            }
        };

        match kind {
            EnvelopeKind::Heartbeat => {
                // Last-seen refresh already happened; nothing else to do
            }
            EnvelopeKind::RoutingTable => {
                if let Payload::Typed(TypedPayload::Gossip { peers, .. }) =
                    demux_payload(&payload)
                {
                    self.apply_gossip(&peers);
                } else {
                    debug!(peer = %from, "ROUTING_TABLE envelope without gossip payload");
                }
            }
            EnvelopeKind::Data => {
                let demuxed = demux_payload(&payload);
                self.handle_data_payload(&from, src, demuxed).await;
            }
            EnvelopeKind::Performance | EnvelopeKind::File => {
                self.deliver(AppMessage { from, bytes: payload });
            }
            EnvelopeKind::Ack | EnvelopeKind::Nack => unreachable!("handled above"),
        }
    }

    fn apply_gossip(&mut self, entries: &[crate::messages::GossipPeer]) {
        for device_id in self.gossip.apply(&mut self.peers, entries) {
            let _ = self.events_tx.send(PeerEvent::Discovered { device_id });
        }
    }

    /// Route one decoded DATA payload. Sealed payloads are opened and the
    /// plaintext routed through the same demux once.
    async fn handle_data_payload(&mut self, from: &str, src: SocketAddr, payload: Payload) {
        match payload {
            Payload::Sealed(sealed) => {
                let Some(key) = self.peers.session_key(from) else {
                    self.metrics.incr_no_session();
                    debug!(peer = %from, "encrypted message without session, dropping");
                    return;
                };
                match crypto::open(&key, &sealed) {
                    Ok(plaintext) => match demux_payload(&plaintext) {
                        // A sealed blob never nests another sealed blob
                        Payload::Sealed(_) => self.metrics.incr_malformed(),
                        Payload::Rpc(frame) => self.handle_rpc_frame(src, frame).await,
                        Payload::Typed(typed) => self.handle_typed(from, src, typed).await,
                        Payload::Plain(bytes) => self.deliver(AppMessage {
                            from: from.to_string(),
                            bytes,
                        }),
                    },
                    Err(e) => {
                        self.metrics.incr_signature();
                        debug!(peer = %from, error = %e, "failed to open sealed payload");
                    }
                }
            }
            Payload::Rpc(frame) => self.handle_rpc_frame(src, frame).await,
            Payload::Typed(typed) => self.handle_typed(from, src, typed).await,
            Payload::Plain(bytes) => {
                self.deliver(AppMessage {
                    from: from.to_string(),
                    bytes,
                });
            }
        }
    }

    async fn handle_rpc_frame(&mut self, src: SocketAddr, frame: RpcFrame) {
        if frame.is_response() {
            if let RpcFrame::Pong { ref info, .. } = frame {
                self.dht.observe(info.clone()).await;
            }
            if !self.rpc.resolve(frame) {
                trace!(%src, "unmatched rpc response");
            }
            return;
        }

        match frame {
            RpcFrame::Ping { rpc_id, info } => {
                if !self.dht.observe(info).await {
                    self.metrics.incr_signature();
                    return;
                }
                let pong = RpcFrame::Pong {
                    rpc_id,
                    info: self.rpc.own_info(),
                };
                self.emit(EnvelopeKind::Data, None, &pong.to_bytes(), src).await;
            }
            RpcFrame::FindNode { rpc_id, target } => {
                let infos = self.dht.find_closest(target, K).await;
                let found = RpcFrame::FoundNode { rpc_id, infos };
                self.emit(EnvelopeKind::Data, None, &found.to_bytes(), src).await;
            }
            RpcFrame::Store { info, .. } => {
                if !self.dht.observe(info).await {
                    self.metrics.incr_signature();
                }
            }
            RpcFrame::Pong { .. } | RpcFrame::FoundNode { .. } => {
                unreachable!("responses handled above")
            }
        }
    }

    async fn handle_typed(&mut self, from: &str, src: SocketAddr, typed: TypedPayload) {
        match typed {
            TypedPayload::Gossip { peers, .. } => self.apply_gossip(&peers),

            TypedPayload::AuthChallenge {
                challenge,
                agreement_key,
                signing_key,
                signature,
            } => {
                let verified =
                    match auth::verify_challenge(&challenge, &agreement_key, &signing_key, &signature)
                    {
                        Ok(v) => v,
                        Err(e) => {
                            self.metrics.incr_signature();
                            debug!(peer = %from, error = %e, "rejecting auth challenge");
                            return;
                        }
                    };

                let session = self.identity.derive_session_key(&verified.agreement_key);
                self.peers
                    .install_session(from, verified.signing_key.to_vec(), session);
                self.peers.resolve_placeholder(src);
                let _ = self.events_tx.send(PeerEvent::Authenticated {
                    device_id: from.to_string(),
                });
                info!(peer = %from, "peer authenticated (responder side)");

                let response = auth::build_response(&self.identity, &verified.challenge);
                self.emit(
                    EnvelopeKind::Data,
                    Some(from.to_string()),
                    &response.to_bytes(),
                    src,
                )
                .await;
            }

            TypedPayload::AuthResponse {
                challenge,
                signature,
                signing_key,
                agreement_key,
            } => {
                let Some(expected) = self.auth_pending.get(&src).copied() else {
                    debug!(peer = %from, %src, "auth response without pending challenge");
                    return;
                };
                let verified = match auth::verify_response(
                    &expected,
                    &challenge,
                    &signature,
                    &signing_key,
                    &agreement_key,
                ) {
                    Ok(v) => v,
                    Err(e) => {
                        self.metrics.incr_signature();
                        debug!(peer = %from, error = %e, "rejecting auth response");
                        return;
                    }
                };
                self.auth_pending.remove(&src);

                let session = self.identity.derive_session_key(&verified.agreement_key);
                self.peers
                    .install_session(from, verified.signing_key.to_vec(), session);
                self.peers.resolve_placeholder(src);
                let _ = self.events_tx.send(PeerEvent::Authenticated {
                    device_id: from.to_string(),
                });
                info!(peer = %from, "peer authenticated (initiator side)");

                // Share what we know immediately, then run an extra round
                self.gossip_to(from.to_string(), src).await;
                self.gossip_round().await;
            }

            TypedPayload::ContentAnnouncement { content_id } => {
                trace!(peer = %from, content = %content_id, "content announced");
                self.announced
                    .entry(from.to_string())
                    .or_default()
                    .insert(content_id);
            }

            TypedPayload::ContentRequest { content_id } => {
                let Some(bytes) = self.content.get(&content_id).cloned() else {
                    debug!(peer = %from, content = %content_id, "requested unknown content");
                    return;
                };
                let payload = TypedPayload::ContentData {
                    content_id,
                    data: base64_encode(&bytes),
                }
                .to_bytes();
                // Seal when a session exists; content may be operator data
                let wire = match self.peers.session_key(from) {
                    Some(key) => crypto::seal(&key, &payload),
                    None => payload,
                };

                let seq = self.next_seq();
                let envelope = Envelope::new(
                    EnvelopeKind::Data,
                    self.identity.device_id(),
                    Some(from.to_string()),
                    &wire,
                    seq,
                );
                let bytes = envelope.encode();
                if self.transport.send_to(src, &bytes).await.is_ok() {
                    let (done, _ignored) = oneshot::channel();
                    self.reliability
                        .register(from.to_string(), src, seq, bytes, done);
                }
            }

            TypedPayload::ContentData { content_id, data } => {
                match base64_decode(&data) {
                    Ok(bytes) => {
                        debug!(peer = %from, content = %content_id, len = bytes.len(), "content received");
                        self.content.insert(content_id, bytes);
                    }
                    Err(_) => self.metrics.incr_malformed(),
                }
            }
        }
    }

    fn deliver(&self, message: AppMessage) {
        if self.messages_tx.try_send(message).is_err() {
            warn!("application message channel full, dropping delivery");
        }
    }
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    STANDARD.encode(bytes)
}

fn base64_decode(data: &str) -> std::result::Result<Vec<u8>, base64::DecodeError> {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    STANDARD.decode(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use std::time::Duration;

    fn test_config(name: &str) -> NodeConfig {
        let mut config = NodeConfig::new(name);
        config.force_localhost = true;
        config.stun_server = None;
        config
    }

    #[tokio::test]
    async fn start_binds_and_seeds_self() {
        let node = Node::start(test_config("solo")).await.unwrap();

        assert_eq!(node.device_id(), "solo");
        assert!(node.local_addr().port() > 0);
        assert_eq!(
            node.advertised_addr().ip(),
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        );

        let peers = node.peers().await;
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].device_id, "solo");
        assert!(peers[0].authenticated);

        node.stop().await;
    }

    #[tokio::test]
    async fn send_to_unknown_peer_fails() {
        let node = Node::start(test_config("solo")).await.unwrap();

        let result = node.send("nobody", b"hi".to_vec(), true, false).await;
        assert!(matches!(result, Err(Error::PeerUnknown(_))));

        node.stop().await;
    }

    #[tokio::test]
    async fn encrypted_send_without_session_fails() {
        let a = Node::start(test_config("a")).await.unwrap();
        let b = Node::start(test_config("b")).await.unwrap();

        // Make b known to a without authenticating: plain unencrypted send
        // first creates the peer entry on b's side only; seed directly here.
        a.add_donor(b.local_addr().ip(), b.local_addr().port()).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        // The donor placeholder is not a session; encrypting to an
        // unauthenticated device id fails
        let result = a.send("missing-peer", b"secret".to_vec(), true, true).await;
        assert!(matches!(
            result,
            Err(Error::PeerUnknown(_)) | Err(Error::NoSession(_))
        ));

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn message_stream_can_be_taken_once() {
        let node = Node::start(test_config("solo")).await.unwrap();

        assert!(node.messages().is_ok());
        assert!(node.messages().is_err());

        node.stop().await;
    }

    #[tokio::test]
    async fn stop_completes_pending_sends() {
        let a = Node::start(test_config("a")).await.unwrap();
        let b = Node::start(test_config("b")).await.unwrap();

        // Authenticate the pair
        let mut events = a.events();
        a.add_donor(b.local_addr().ip(), b.local_addr().port()).await;
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(PeerEvent::Authenticated { .. }) = events.recv().await {
                    break;
                }
            }
        })
        .await
        .expect("handshake did not complete");

        // Kill b, then start an ACK-required send and stop a mid-flight
        b.stop().await;
        let send = a.send("b", b"doomed".to_vec(), true, false);
        let stop = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            a.stop().await;
        };
        let (result, ()) = tokio::join!(send, stop);
        assert!(matches!(result, Err(Error::TransportClosed)));
    }
}
