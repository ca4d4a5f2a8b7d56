//! # Gossip Engine
//!
//! Periodic anti-entropy for the peer table. Every `gossip_interval` the
//! node snapshots its peer table and sends it, inside a `ROUTING_TABLE`
//! envelope, to up to `gossip_peer_count` random authenticated peers.
//!
//! ## Merge rule
//!
//! Receivers insert unknown device ids as unauthenticated peers and
//! overwrite known entries only when the gossiped last-seen is strictly
//! newer. The gossip layer itself is signature-free — the carrying envelope
//! is integrity-checked — so entries learned here stay unauthenticated
//! until a direct handshake completes.

use std::net::SocketAddr;

use tracing::debug;

use crate::identity::now_ms;
use crate::messages::{GossipPeer, TypedPayload};
use crate::peers::{MergeOutcome, PeerTable};

/// Builds gossip rounds and applies received snapshots.
pub struct GossipEngine {
    fanout: usize,
}

impl GossipEngine {
    pub fn new(fanout: usize) -> Self {
        Self { fanout }
    }

    /// Snapshot payload for one round.
    pub fn build_payload(&self, table: &PeerTable) -> TypedPayload {
        TypedPayload::Gossip {
            peers: table.snapshot_for_gossip(),
            timestamp: now_ms(),
        }
    }

    /// Pick this round's targets: up to `fanout` random authenticated peers.
    pub fn select_targets(&self, table: &PeerTable) -> Vec<(String, SocketAddr)> {
        table.random_authenticated(self.fanout)
    }

    /// Merge a received snapshot. Returns the device ids newly discovered.
    pub fn apply(&self, table: &mut PeerTable, peers: &[GossipPeer]) -> Vec<String> {
        let mut discovered = Vec::new();
        for entry in peers {
            if table.merge_gossiped(entry) == MergeOutcome::Inserted {
                discovered.push(entry.device_id.clone());
            }
        }
        if !discovered.is_empty() {
            debug!(count = discovered.len(), "gossip discovered new peers");
        }
        discovered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SessionKey;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new("127.0.0.1".parse().unwrap(), port)
    }

    fn authed_table(self_id: &str, port: u16, peers: &[(&str, u16)]) -> PeerTable {
        let mut table = PeerTable::new(self_id, true);
        table.insert_self("127.0.0.1".parse().unwrap(), port);
        for (id, port) in peers {
            table.upsert_observed(id, addr(*port));
            table.install_session(id, vec![1u8; 32], SessionKey::from_bytes([1u8; 32]));
        }
        table
    }

    #[test]
    fn payload_contains_full_snapshot() {
        let engine = GossipEngine::new(3);
        let table = authed_table("a", 9000, &[("b", 9001), ("c", 9002)]);

        match engine.build_payload(&table) {
            TypedPayload::Gossip { peers, timestamp } => {
                assert_eq!(peers.len(), 3);
                assert!(timestamp > 0);
                assert!(peers.iter().any(|p| p.device_id == "a"));
            }
            other => panic!("wrong payload: {other:?}"),
        }
    }

    #[test]
    fn targets_capped_at_fanout() {
        let engine = GossipEngine::new(2);
        let table = authed_table(
            "a",
            9000,
            &[("b", 9001), ("c", 9002), ("d", 9003), ("e", 9004)],
        );

        let targets = engine.select_targets(&table);
        assert_eq!(targets.len(), 2);
        for (id, _) in &targets {
            assert_ne!(id, "a");
        }
    }

    #[test]
    fn apply_reports_only_new_peers() {
        let engine = GossipEngine::new(3);
        let mut table = authed_table("a", 9000, &[("b", 9001)]);

        let snapshot = vec![
            GossipPeer {
                device_id: "b".into(),
                ip: "127.0.0.1".into(),
                port: 9001,
                public_key: String::new(),
                last_seen: 0,
            },
            GossipPeer {
                device_id: "c".into(),
                ip: "127.0.0.1".into(),
                port: 9002,
                public_key: String::new(),
                last_seen: 100,
            },
        ];

        let discovered = engine.apply(&mut table, &snapshot);
        assert_eq!(discovered, vec!["c".to_string()]);

        // Second application discovers nothing
        assert!(engine.apply(&mut table, &snapshot).is_empty());
        // Gossip-learned peers stay unauthenticated
        assert!(!table.get("c").unwrap().authenticated);
    }

    #[test]
    fn line_topology_converges_to_full_mesh() {
        // Four nodes in a line, each authenticated only with its neighbors.
        // Exchanging snapshots along the links must reach full-mesh tables.
        let engine = GossipEngine::new(3);
        let names = ["n0", "n1", "n2", "n3"];
        let mut tables: Vec<PeerTable> = names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let mut neighbors = Vec::new();
                if i > 0 {
                    neighbors.push((names[i - 1], 9000 + (i as u16) - 1));
                }
                if i < 3 {
                    neighbors.push((names[i + 1], 9000 + (i as u16) + 1));
                }
                authed_table(name, 9000 + i as u16, &neighbors)
            })
            .collect();

        for _round in 0..3 {
            // Everyone snapshots, then pushes to its direct neighbors
            let snapshots: Vec<Vec<GossipPeer>> =
                tables.iter().map(|t| t.snapshot_for_gossip()).collect();
            for i in 0..4 {
                if i > 0 {
                    let snap = snapshots[i - 1].clone();
                    engine.apply(&mut tables[i], &snap);
                }
                if i < 3 {
                    let snap = snapshots[i + 1].clone();
                    engine.apply(&mut tables[i], &snap);
                }
            }
        }

        for (i, table) in tables.iter().enumerate() {
            for name in &names {
                assert!(
                    table.contains(name),
                    "node {i} missing {name} after convergence rounds"
                );
            }
        }
    }
}
