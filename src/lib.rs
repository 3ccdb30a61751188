//! # Meshroute - Structured Overlay Routing Core
//!
//! Meshroute forwards messages across a peer-to-peer overlay by XOR proximity
//! instead of a global routing table:
//!
//! - **Address space**: 256-bit node ids, XOR distance, bucket classes
//! - **Peer table**: bucketed routing set of vaults plus a non-routing set of attached sessions
//! - **Envelope**: addressed, hop-limited header with a MurmurHash2 payload checksum
//! - **Connect**: signed request/response handshake with timed pruning
//! - **Forwarding**: local delivery, group fan-out and strictly-closer relaying
//!
//! ## Architecture
//!
//! The [`ForwardingEngine`] is synchronous and does no I/O. It turns each
//! inbound frame into a list of [`Action`]s. Two executors interpret them:
//!
//! - [`Node`] runs them on tokio against a [`Transport`], with cancellable timers
//! - [`SimNetwork`] runs many engines in one process on a virtual clock
//!
//! ## Node Kinds
//!
//! - **Vault**: relays, joins groups, id derived from its Ed25519 key
//! - **Client**: leaf with a small routing set; may share an id with other clients
//! - **Anonymous**: leaf with an ephemeral id, reachable only through its bootstrap
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `address` | Node ids, XOR metric, bucket index |
//! | `identity` | Ed25519 keypairs, key-bound vault ids, domain-separated signatures |
//! | `config` | Immutable routing tunables |
//! | `error` | Parse, seal, table and config errors |
//! | `messages` | Header, addresses, payloads, checksum, wire codec |
//! | `table` | `PeerTable` contract, `RoutingTable`, `RandomNodeHelper` |
//! | `connect` | Pending Connect exchange bookkeeping |
//! | `routing` | `ForwardingEngine` decisions and maintenance |
//! | `protocols` | `Transport` trait consumed by `Node` |
//! | `transport` | In-process channel transport |
//! | `node` | Async node host |
//! | `sim` | Deterministic multi-node harness |

pub mod address;
pub mod config;
mod connect;
pub mod error;
pub mod identity;
pub mod messages;
mod node;
mod protocols;
mod routing;
mod sim;
pub mod table;
mod transport;

pub use address::{NodeId, NodeKind};
pub use config::RoutingConfig;
pub use connect::{ConnectHandshake, ExchangeKey, HandshakeState, PendingConnect, Resolution};
pub use error::{ConfigError, ParseError, SealError, TableError};
pub use identity::{Keypair, PublicKey};
pub use messages::{Destination, EndpointPair, Source};
pub use node::Node;
pub use protocols::Transport;
pub use routing::{Action, Delivery, DropReason, ForwardingEngine, LocalNode};
pub use sim::SimNetwork;
pub use table::{NodeInfo, PeerTable, RandomNodeHelper, RoutingTable};
pub use transport::{MemoryNetwork, MemoryTransport};
