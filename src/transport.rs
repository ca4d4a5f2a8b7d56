//! # UDP Transport
//!
//! Owns the node's single IPv4 UDP socket. Everything else in the crate
//! reaches the network exclusively through [`UdpTransport::send_to`] and the
//! inbound datagram stream returned by [`UdpTransport::bind`].
//!
//! ## Inbound path
//!
//! ```text
//! socket ──► STUN response? ──► resolve pending probe
//!        └─► rate limiter  ──► (drop + count)
//!        └─► inbound channel ──► node dispatch
//! ```
//!
//! A per-source-IP token bucket (10 packets / 10 seconds) gates inbound
//! datagrams; overflow is dropped silently. Loopback sources bypass the
//! limiter so same-host topologies behave.
//!
//! ## STUN
//!
//! [`UdpTransport::discover_public_address`] issues an RFC 5389 Binding
//! Request on the node's own socket — the mapped address must describe the
//! port peers will actually reach. Responses are matched by transaction id,
//! never by source address.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use lru::LruCache;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Duration, Instant};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};

/// Largest datagram the transport will read.
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Inbound channel depth before backpressure drops.
const INBOUND_CHANNEL_CAPACITY: usize = 1024;

// ----------------------------------------------------------------------------
// Per-source rate limiting
// ----------------------------------------------------------------------------

/// Packets allowed per source IP per window.
pub const RATE_LIMIT_PACKETS: usize = 10;

/// Token refill window.
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(10);

/// Maximum source IPs tracked; least-recently-seen entries are evicted.
const MAX_TRACKED_SOURCES: usize = 4096;

#[derive(Debug, Clone, Copy)]
struct SourceBucket {
    tokens: f64,
    last_update: Instant,
}

impl SourceBucket {
    fn new() -> Self {
        Self {
            tokens: RATE_LIMIT_PACKETS as f64,
            last_update: Instant::now(),
        }
    }

    fn try_consume(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        let rate = RATE_LIMIT_PACKETS as f64 / RATE_LIMIT_WINDOW.as_secs_f64();

        self.tokens = (self.tokens + elapsed * rate).min(RATE_LIMIT_PACKETS as f64);
        self.last_update = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Token-bucket limiter keyed by source IP.
///
/// Loopback sources are exempt: same-host topologies multiplex many nodes
/// behind 127.0.0.1 and the limiter exists to bound remote abuse.
pub(crate) struct SourceRateLimiter {
    buckets: LruCache<IpAddr, SourceBucket>,
}

impl SourceRateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: LruCache::new(
                NonZeroUsize::new(MAX_TRACKED_SOURCES).expect("tracked sources bound is non-zero"),
            ),
        }
    }

    pub fn allow(&mut self, source: IpAddr) -> bool {
        if source.is_loopback() {
            return true;
        }
        let bucket = self.buckets.get_or_insert_mut(source, SourceBucket::new);
        bucket.try_consume()
    }
}

// ----------------------------------------------------------------------------
// Metrics
// ----------------------------------------------------------------------------

#[derive(Default)]
struct MetricsInner {
    datagrams_in: AtomicU64,
    datagrams_out: AtomicU64,
    dropped_rate_limited: AtomicU64,
    dropped_malformed: AtomicU64,
    dropped_checksum: AtomicU64,
    dropped_signature: AtomicU64,
    dropped_no_session: AtomicU64,
}

/// Shared drop/throughput counters. Cheap to clone; increments are relaxed.
#[derive(Clone, Default)]
pub struct NetMetrics(Arc<MetricsInner>);

impl NetMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr_in(&self) {
        self.0.datagrams_in.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_out(&self) {
        self.0.datagrams_out.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_rate_limited(&self) {
        self.0.dropped_rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_malformed(&self) {
        self.0.dropped_malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_checksum(&self) {
        self.0.dropped_checksum.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_signature(&self) {
        self.0.dropped_signature.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_no_session(&self) {
        self.0.dropped_no_session.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            datagrams_in: self.0.datagrams_in.load(Ordering::Relaxed),
            datagrams_out: self.0.datagrams_out.load(Ordering::Relaxed),
            dropped_rate_limited: self.0.dropped_rate_limited.load(Ordering::Relaxed),
            dropped_malformed: self.0.dropped_malformed.load(Ordering::Relaxed),
            dropped_checksum: self.0.dropped_checksum.load(Ordering::Relaxed),
            dropped_signature: self.0.dropped_signature.load(Ordering::Relaxed),
            dropped_no_session: self.0.dropped_no_session.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the transport counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub datagrams_in: u64,
    pub datagrams_out: u64,
    pub dropped_rate_limited: u64,
    pub dropped_malformed: u64,
    pub dropped_checksum: u64,
    pub dropped_signature: u64,
    pub dropped_no_session: u64,
}

// ----------------------------------------------------------------------------
// Transport
// ----------------------------------------------------------------------------

type StunPending = Arc<Mutex<HashMap<[u8; 12], oneshot::Sender<SocketAddr>>>>;

/// The node's UDP socket plus its receive loop.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    metrics: NetMetrics,
    stun_pending: StunPending,
    recv_task: tokio::task::JoinHandle<()>,
}

impl UdpTransport {
    /// Bind the socket (port 0 = OS-assigned) and start the receive loop.
    ///
    /// Returns the transport and the inbound datagram stream.
    pub async fn bind(
        port: u16,
        metrics: NetMetrics,
    ) -> Result<(Self, mpsc::Receiver<(SocketAddr, Vec<u8>)>)> {
        let socket = UdpSocket::bind(("0.0.0.0", port))
            .await
            .map_err(|e| Error::Internal(format!("udp bind failed: {e}")))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| Error::Internal(format!("local_addr failed: {e}")))?;
        let socket = Arc::new(socket);

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let stun_pending: StunPending = Arc::new(Mutex::new(HashMap::new()));

        let recv_task = {
            let socket = socket.clone();
            let metrics = metrics.clone();
            let stun_pending = stun_pending.clone();
            tokio::spawn(async move {
                let mut limiter = SourceRateLimiter::new();
                let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
                loop {
                    let (len, src) = match socket.recv_from(&mut buf).await {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "udp recv failed, stopping receive loop");
                            break;
                        }
                    };
                    let data = &buf[..len];
                    metrics.incr_in();

                    // STUN responses are matched by transaction id and never
                    // reach the dispatch path.
                    if stun::is_binding_response(data) {
                        if let Some(mapped) = stun::route_response(data, &stun_pending) {
                            trace!(%mapped, "stun binding response resolved");
                        }
                        continue;
                    }

                    if !limiter.allow(src.ip()) {
                        metrics.incr_rate_limited();
                        continue;
                    }

                    if inbound_tx.send((src, data.to_vec())).await.is_err() {
                        debug!("inbound channel closed, stopping receive loop");
                        break;
                    }
                }
            })
        };

        Ok((
            Self {
                socket,
                local_addr,
                metrics,
                stun_pending,
                recv_task,
            },
            inbound_rx,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Send one datagram.
    pub async fn send_to(&self, dest: SocketAddr, bytes: &[u8]) -> Result<()> {
        self.socket
            .send_to(bytes, dest)
            .await
            .map_err(|_| Error::TransportClosed)?;
        self.metrics.incr_out();
        Ok(())
    }

    /// Issue a STUN Binding Request and wait up to 5 seconds for the mapped
    /// address. The request is sent from the node's own socket so the mapping
    /// describes the advertised port.
    pub async fn discover_public_address(&self, server: &str) -> Result<SocketAddr> {
        let server_addr = resolve_stun_server(server)?;

        let transaction_id = stun::transaction_id();
        let request = stun::build_binding_request(&transaction_id);

        let (tx, rx) = oneshot::channel();
        self.stun_pending
            .lock()
            .expect("stun pending lock poisoned")
            .insert(transaction_id, tx);

        if let Err(e) = self.send_to(server_addr, &request).await {
            self.stun_pending
                .lock()
                .expect("stun pending lock poisoned")
                .remove(&transaction_id);
            return Err(Error::StunFailed(format!("send failed: {e}")));
        }

        match timeout(stun::RESPONSE_TIMEOUT, rx).await {
            Ok(Ok(mapped)) => Ok(mapped),
            Ok(Err(_)) => Err(Error::StunFailed("probe cancelled".into())),
            Err(_) => {
                self.stun_pending
                    .lock()
                    .expect("stun pending lock poisoned")
                    .remove(&transaction_id);
                Err(Error::StunFailed(format!(
                    "no response from {server} within {:?}",
                    stun::RESPONSE_TIMEOUT
                )))
            }
        }
    }

    pub fn metrics(&self) -> &NetMetrics {
        &self.metrics
    }

    /// Stop the receive loop. In-flight sends complete; the socket closes
    /// once the last reference drops.
    pub fn shutdown(&self) {
        self.recv_task.abort();
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.recv_task.abort();
    }
}

fn resolve_stun_server(server: &str) -> Result<SocketAddr> {
    server
        .to_socket_addrs()
        .map_err(|e| Error::StunFailed(format!("cannot resolve {server}: {e}")))?
        .find(|a| a.is_ipv4())
        .ok_or_else(|| Error::StunFailed(format!("no IPv4 address for {server}")))
}

// ============================================================================
// STUN (RFC 5389, Binding only)
// ============================================================================

pub(crate) mod stun {
    use super::*;

    /// STUN magic cookie.
    pub const MAGIC_COOKIE: u32 = 0x2112_A442;

    /// Binding Request message type.
    pub const BINDING_REQUEST: u16 = 0x0001;

    /// Binding Response message type.
    pub const BINDING_RESPONSE: u16 = 0x0101;

    /// XOR-MAPPED-ADDRESS attribute type.
    pub const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

    /// How long to wait for a Binding Response.
    pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

    /// Random 96-bit transaction id.
    pub fn transaction_id() -> [u8; 12] {
        let mut id = [0u8; 12];
        // Falls back to a time-derived id only if the OS RNG is unavailable
        if getrandom::getrandom(&mut id).is_err() {
            let nanos = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .subsec_nanos();
            id[..4].copy_from_slice(&nanos.to_be_bytes());
        }
        id
    }

    /// 20-byte Binding Request with no attributes.
    pub fn build_binding_request(transaction_id: &[u8; 12]) -> Vec<u8> {
        let mut msg = Vec::with_capacity(20);
        msg.extend_from_slice(&BINDING_REQUEST.to_be_bytes());
        msg.extend_from_slice(&0u16.to_be_bytes());
        msg.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        msg.extend_from_slice(transaction_id);
        msg
    }

    /// Cheap shape check: Binding Response header with the magic cookie.
    pub fn is_binding_response(data: &[u8]) -> bool {
        data.len() >= 20
            && u16::from_be_bytes([data[0], data[1]]) == BINDING_RESPONSE
            && u32::from_be_bytes([data[4], data[5], data[6], data[7]]) == MAGIC_COOKIE
    }

    /// Match a Binding Response against the pending-probe table and resolve
    /// the waiting caller. Returns the mapped address when one was delivered.
    pub fn route_response(data: &[u8], pending: &StunPending) -> Option<SocketAddr> {
        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&data[8..20]);

        let waiter = pending
            .lock()
            .expect("stun pending lock poisoned")
            .remove(&transaction_id)?;

        let mapped = parse_binding_response(data)?;
        let _ = waiter.send(mapped);
        Some(mapped)
    }

    /// Extract XOR-MAPPED-ADDRESS from a Binding Response. The caller has
    /// already validated the header and transaction id.
    pub fn parse_binding_response(data: &[u8]) -> Option<SocketAddr> {
        let msg_len = u16::from_be_bytes([data[2], data[3]]) as usize;
        if data.len() < 20 + msg_len {
            return None;
        }

        let mut pos = 20;
        while pos + 4 <= 20 + msg_len {
            let attr_type = u16::from_be_bytes([data[pos], data[pos + 1]]);
            let attr_len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
            if pos + 4 + attr_len > data.len() {
                return None;
            }

            if attr_type == ATTR_XOR_MAPPED_ADDRESS {
                return parse_xor_mapped_address(&data[pos + 4..pos + 4 + attr_len]);
            }

            // Attributes are padded to a 4-byte boundary
            pos += 4 + ((attr_len + 3) & !3);
        }
        None
    }

    fn parse_xor_mapped_address(data: &[u8]) -> Option<SocketAddr> {
        if data.len() < 8 {
            return None;
        }

        let family = data[1];
        let port = u16::from_be_bytes([data[2], data[3]]) ^ (MAGIC_COOKIE >> 16) as u16;

        match family {
            0x01 => {
                let cookie = MAGIC_COOKIE.to_be_bytes();
                let ip = [
                    data[4] ^ cookie[0],
                    data[5] ^ cookie[1],
                    data[6] ^ cookie[2],
                    data[7] ^ cookie[3],
                ];
                Some(SocketAddr::new(IpAddr::from(ip), port))
            }
            // IPv6 mappings XOR against the transaction id as well; the
            // overlay binds IPv4 sockets only.
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_request_layout() {
        let tx_id = [7u8; 12];
        let request = stun::build_binding_request(&tx_id);

        assert_eq!(request.len(), 20);
        assert_eq!(
            u16::from_be_bytes([request[0], request[1]]),
            stun::BINDING_REQUEST
        );
        assert_eq!(u16::from_be_bytes([request[2], request[3]]), 0);
        assert_eq!(
            u32::from_be_bytes([request[4], request[5], request[6], request[7]]),
            stun::MAGIC_COOKIE
        );
        assert_eq!(&request[8..20], &tx_id);
    }

    #[test]
    fn transaction_ids_are_random() {
        assert_ne!(stun::transaction_id(), stun::transaction_id());
    }

    fn binding_response(tx_id: &[u8; 12], ip: [u8; 4], port: u16) -> Vec<u8> {
        let cookie = stun::MAGIC_COOKIE.to_be_bytes();
        let xor_port = port ^ (stun::MAGIC_COOKIE >> 16) as u16;

        let mut attr = vec![0x00, 0x01];
        attr.extend_from_slice(&xor_port.to_be_bytes());
        for i in 0..4 {
            attr.push(ip[i] ^ cookie[i]);
        }

        let mut msg = Vec::new();
        msg.extend_from_slice(&stun::BINDING_RESPONSE.to_be_bytes());
        msg.extend_from_slice(&((4 + attr.len()) as u16).to_be_bytes());
        msg.extend_from_slice(&cookie);
        msg.extend_from_slice(tx_id);
        msg.extend_from_slice(&stun::ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
        msg.extend_from_slice(&(attr.len() as u16).to_be_bytes());
        msg.extend_from_slice(&attr);
        msg
    }

    #[test]
    fn parse_xor_mapped_address_roundtrip() {
        let tx_id = [3u8; 12];
        let response = binding_response(&tx_id, [203, 0, 113, 7], 32853);

        assert!(stun::is_binding_response(&response));
        let mapped = stun::parse_binding_response(&response).unwrap();
        assert_eq!(mapped.ip(), IpAddr::from([203, 0, 113, 7]));
        assert_eq!(mapped.port(), 32853);
    }

    #[test]
    fn response_shape_check_rejects_other_traffic() {
        assert!(!stun::is_binding_response(b"{\"type\":0}"));
        assert!(!stun::is_binding_response(&[0u8; 10]));

        // Right length, wrong cookie
        let mut msg = vec![0x01, 0x01, 0, 0];
        msg.extend_from_slice(&[0u8; 16]);
        assert!(!stun::is_binding_response(&msg));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_caps_per_source() {
        let mut limiter = SourceRateLimiter::new();
        let source: IpAddr = "203.0.113.50".parse().unwrap();

        for i in 0..RATE_LIMIT_PACKETS {
            assert!(limiter.allow(source), "packet {i} should pass");
        }
        assert!(!limiter.allow(source), "11th packet should be dropped");

        // One token refills after a tenth of the window
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.allow(source));
        assert!(!limiter.allow(source));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_is_per_source() {
        let mut limiter = SourceRateLimiter::new();
        let a: IpAddr = "203.0.113.50".parse().unwrap();
        let b: IpAddr = "203.0.113.51".parse().unwrap();

        for _ in 0..RATE_LIMIT_PACKETS {
            assert!(limiter.allow(a));
        }
        assert!(!limiter.allow(a));
        assert!(limiter.allow(b), "other sources keep their own budget");
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_exempts_loopback() {
        let mut limiter = SourceRateLimiter::new();
        let loopback: IpAddr = "127.0.0.1".parse().unwrap();

        for _ in 0..RATE_LIMIT_PACKETS * 10 {
            assert!(limiter.allow(loopback));
        }
    }

    #[tokio::test]
    async fn datagrams_flow_between_transports() {
        let (a, _a_rx) = UdpTransport::bind(0, NetMetrics::new()).await.unwrap();
        let (b, mut b_rx) = UdpTransport::bind(0, NetMetrics::new()).await.unwrap();

        let b_addr = SocketAddr::new("127.0.0.1".parse().unwrap(), b.local_addr().port());
        a.send_to(b_addr, b"ping over udp").await.unwrap();

        let (src, data) = timeout(Duration::from_secs(2), b_rx.recv())
            .await
            .expect("recv timed out")
            .expect("channel closed");
        assert_eq!(data, b"ping over udp");
        assert_eq!(src.port(), a.local_addr().port());
    }

    #[tokio::test]
    async fn metrics_count_traffic() {
        let metrics = NetMetrics::new();
        let (a, _a_rx) = UdpTransport::bind(0, metrics.clone()).await.unwrap();
        let (b, mut b_rx) = UdpTransport::bind(0, NetMetrics::new()).await.unwrap();

        let b_addr = SocketAddr::new("127.0.0.1".parse().unwrap(), b.local_addr().port());
        a.send_to(b_addr, b"one").await.unwrap();
        a.send_to(b_addr, b"two").await.unwrap();
        let _ = timeout(Duration::from_secs(2), b_rx.recv()).await;

        assert_eq!(metrics.snapshot().datagrams_out, 2);
    }

    #[tokio::test]
    async fn stun_probe_against_local_responder() {
        let (transport, _rx) = UdpTransport::bind(0, NetMetrics::new()).await.unwrap();

        // Minimal STUN responder on a second socket
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let responder_addr = responder.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            let (len, src) = responder.recv_from(&mut buf).await.unwrap();
            assert_eq!(len, 20);
            let mut tx_id = [0u8; 12];
            tx_id.copy_from_slice(&buf[8..20]);

            let response = tests_binding_response(&tx_id, src);
            responder.send_to(&response, src).await.unwrap();
        });

        let mapped = transport
            .discover_public_address(&responder_addr.to_string())
            .await
            .expect("stun probe failed");
        assert_eq!(mapped.port(), transport.local_addr().port());
    }

    fn tests_binding_response(tx_id: &[u8; 12], observed: SocketAddr) -> Vec<u8> {
        let ip = match observed.ip() {
            IpAddr::V4(v4) => v4.octets(),
            IpAddr::V6(_) => panic!("ipv4 only"),
        };
        binding_response(tx_id, ip, observed.port())
    }

    #[tokio::test]
    async fn stun_times_out_against_silent_server() {
        let (transport, _rx) = UdpTransport::bind(0, NetMetrics::new()).await.unwrap();

        // A bound socket that never answers
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let silent_addr = silent.local_addr().unwrap();

        let started = std::time::Instant::now();
        let result = transport
            .discover_public_address(&silent_addr.to_string())
            .await;
        assert!(matches!(result, Err(Error::StunFailed(_))));
        assert!(started.elapsed() >= Duration::from_secs(5));
    }
}
