//! # Placard - Serverless P2P Overlay for Signage Content Distribution
//!
//! Placard provides the networking core of a serverless digital-signage
//! fleet: nodes find each other, authenticate, and exchange content with no
//! central server.
//!
//! - **Identity**: Ed25519 signing keys; 160-bit NodeIDs derived from
//!   operator-assigned device ids
//! - **Transport**: one UDP socket per node, STUN-derived public address,
//!   per-source rate limiting
//! - **Reliability**: ACK/NACK with bounded retransmission over a fixed
//!   500 ms cadence
//! - **DHT**: Kademlia-style routing with signed peer records and
//!   PING/FIND_NODE/STORE RPCs
//! - **Authentication**: challenge/response handshake with X25519 key
//!   agreement and per-peer AES-256-GCM session keys
//! - **Gossip**: periodic peer-table dissemination to a random
//!   authenticated subset
//!
//! ## Architecture
//!
//! Every component with mutable state follows the actor pattern: a public
//! cloneable handle and a private task owning the state, joined by typed
//! channels. Each [`Node`] is one isolated concurrency domain; multiple
//! nodes in a process share nothing but the sockets between them.
//!
//! ## Quick Start
//!
//! ```ignore
//! let mut config = NodeConfig::new("lobby-screen");
//! config.udp_port = 40100;
//! let node = Node::start(config).await?;
//!
//! // Bootstrap from a known peer and wait for the handshake
//! node.add_donor("192.0.2.10".parse()?, 40100).await;
//!
//! // Receive application messages
//! let mut messages = node.messages()?;
//! while let Some(msg) = messages.recv().await {
//!     println!("{}: {:?}", msg.from, msg.bytes);
//! }
//! ```
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `node` | High-level API combining all components |
//! | `identity` | Keypairs, NodeIDs, signed peer records |
//! | `crypto` | Signatures, key agreement, payload encryption |
//! | `messages` | JSON envelope + binary DHT RPC wire formats |
//! | `transport` | UDP socket, rate limiting, STUN |
//! | `reliability` | ACK tracking and retransmission |
//! | `peers` | Peer table with inactivity eviction |
//! | `dht` | Kademlia routing table and iterative lookup |
//! | `auth` | Challenge/response handshake |
//! | `gossip` | Peer-table dissemination and merge |

mod auth;
mod config;
mod crypto;
mod dht;
mod error;
mod gossip;
mod identity;
mod messages;
mod node;
mod peers;
mod reliability;
mod transport;

pub use config::{NodeConfig, DEFAULT_STUN_SERVER};
pub use crypto::{SessionKey, SignatureError};
pub use dht::{bucket_index, Dht, DhtRpc, BUCKET_COUNT, K, RPC_TIMEOUT};
pub use error::{Error, Result};
pub use identity::{distance_cmp, NodeId, NodeIdentity, SignedPeerInfo, NODE_ID_LEN};
pub use messages::{Envelope, EnvelopeKind, GossipPeer, RpcFrame, TypedPayload};
pub use node::{AppMessage, Node, PeerEvent};
pub use peers::PeerSummary;
pub use transport::MetricsSnapshot;
