//! # Reliability Layer
//!
//! ACK tracking, bounded retransmission, and duplicate suppression for
//! ACK-required sends.
//!
//! ## Contract
//!
//! A send marked ACK-required either completes with success once a matching
//! ACK arrives, or with failure after 3 retransmissions spaced 2 seconds
//! apart, or once the per-message timeout (default 30 s) elapses — whichever
//! comes first. On the wire that is exactly 4 copies of a message to a
//! silent peer: the initial send plus 3 retries, failing within
//! `min(message_timeout, 4 × 2 s)`.
//!
//! The owning dispatch task drives [`ReliabilityLayer::tick`] every 500 ms;
//! retransmission decisions all happen on that cadence. Inbound duplicates
//! (same sender × sequence number) are ACKed again but never re-delivered.
//! ACKs are never themselves acknowledged.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::num::NonZeroUsize;

use lru::LruCache;
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// Cadence at which the dispatch task drives the retransmission check.
pub const RELIABILITY_TICK: Duration = Duration::from_millis(500);

/// Spacing between retransmissions of the same message.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Retransmissions after the initial send.
pub const MAX_RETRIES: u8 = 3;

/// Bound on the (sender, sequence) duplicate-suppression cache.
const SEEN_CACHE_SIZE: usize = 4096;

/// An outbound envelope awaiting its ACK.
struct PendingMessage {
    addr: SocketAddr,
    bytes: Vec<u8>,
    first_sent: Instant,
    last_sent: Instant,
    retries: u8,
    done: oneshot::Sender<Result<bool>>,
}

/// Pending-ACK bookkeeping owned by the dispatch task.
pub struct ReliabilityLayer {
    pending: HashMap<(String, u32), PendingMessage>,
    seen: LruCache<(String, u32), ()>,
    message_timeout: Duration,
}

impl ReliabilityLayer {
    pub fn new(message_timeout: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            seen: LruCache::new(
                NonZeroUsize::new(SEEN_CACHE_SIZE).expect("seen cache bound is non-zero"),
            ),
            message_timeout,
        }
    }

    /// Track an ACK-required envelope that was just sent.
    pub fn register(
        &mut self,
        dest: String,
        addr: SocketAddr,
        seq: u32,
        bytes: Vec<u8>,
        done: oneshot::Sender<Result<bool>>,
    ) {
        let now = Instant::now();
        self.pending.insert(
            (dest, seq),
            PendingMessage {
                addr,
                bytes,
                first_sent: now,
                last_sent: now,
                retries: 0,
                done,
            },
        );
    }

    /// Complete a pending send on a matching ACK. Returns false when nothing
    /// was pending (stray or repeated ACK).
    pub fn acknowledge(&mut self, from: &str, seq: u32) -> bool {
        match self.pending.remove(&(from.to_string(), seq)) {
            Some(pending) => {
                trace!(peer = from, seq, "ack matched pending message");
                let _ = pending.done.send(Ok(true));
                true
            }
            None => false,
        }
    }

    /// One 500 ms cadence step. Returns the datagrams to retransmit; expired
    /// messages are completed with failure internally.
    pub fn tick(&mut self) -> Vec<(SocketAddr, Vec<u8>)> {
        let now = Instant::now();
        let mut resends = Vec::new();
        let mut failed = Vec::new();

        for (key, pending) in self.pending.iter_mut() {
            if now.duration_since(pending.first_sent) >= self.message_timeout {
                failed.push(key.clone());
                continue;
            }
            if now.duration_since(pending.last_sent) >= RETRY_INTERVAL {
                if pending.retries >= MAX_RETRIES {
                    failed.push(key.clone());
                    continue;
                }
                pending.retries += 1;
                pending.last_sent = now;
                trace!(
                    peer = %key.0,
                    seq = key.1,
                    retry = pending.retries,
                    "retransmitting"
                );
                resends.push((pending.addr, pending.bytes.clone()));
            }
        }

        for key in failed {
            if let Some(pending) = self.pending.remove(&key) {
                debug!(
                    peer = %key.0,
                    seq = key.1,
                    retries = pending.retries,
                    "send failed: retry budget or timeout exhausted"
                );
                let _ = pending.done.send(Ok(false));
            }
        }

        resends
    }

    /// Record an inbound (sender, sequence) pair. Returns true when it was
    /// already seen — the caller ACKs again but must not re-deliver.
    pub fn record_seen(&mut self, sender: &str, seq: u32) -> bool {
        let key = (sender.to_string(), seq);
        if self.seen.contains(&key) {
            return true;
        }
        self.seen.put(key, ());
        false
    }

    /// Complete every pending send with [`Error::TransportClosed`]. Called
    /// on node shutdown.
    pub fn fail_all(&mut self) {
        for (_, pending) in self.pending.drain() {
            let _ = pending.done.send(Err(Error::TransportClosed));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
