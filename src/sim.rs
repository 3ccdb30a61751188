//! # Simulated Network
//!
//! Deterministic multi-node harness over [`ForwardingEngine`]s. There are no
//! sockets, no tasks and no sleeps: frames sit in one FIFO queue that
//! [`SimNetwork::settle`] drains, and maintenance timers fire only when the
//! virtual clock is moved with [`SimNetwork::advance`].
//!
//! Every node listens on `127.0.0.1:20000 + index` and the first vault added
//! is the bootstrap for everyone joining after it. Nodes leave in one of two
//! ways, and keep their index either way:
//!
//! - [`SimNetwork::remove_node`] closes the node's sessions, so every peer
//!   drops it at once
//! - [`SimNetwork::crash_node`] goes silent; a peer only drops it when a send
//!   to it fails
//!
//! Frames addressed to an offline node are counted as undeliverable.
//!
//! ```ignore
//! let mut sim = SimNetwork::new(RoutingConfig::default())?;
//! for _ in 0..8 {
//!     sim.add_vault();
//! }
//! sim.send_group(0, pivot, b"hello".to_vec())?;
//! assert_eq!(sim.messages_size(), 4);
//! ```

use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::address::{NodeId, NodeKind, closeness_cmp};
use crate::config::RoutingConfig;
use crate::identity::Keypair;
use crate::messages::{Destination, EndpointPair};
use crate::routing::{Action, Delivery, DropReason, ForwardingEngine, LocalNode};
use crate::table::{NodeInfo, RoutingTable};

const BASE_PORT: u16 = 20_000;

/// Upper bound on frames drained by one `settle`; hitting it means a routing loop.
const MAX_SETTLE_FRAMES: usize = 1_000_000;

struct Timers {
    find_close: Instant,
    find_random: Instant,
    prune: Instant,
}

/// A frame in flight, with the sender and the table entry it addressed.
struct Frame {
    addr: SocketAddr,
    sender: Option<(usize, NodeInfo)>,
    bytes: Vec<u8>,
}

struct SimNode {
    engine: ForwardingEngine<RoutingTable>,
    deliveries: Vec<Delivery>,
    timers: Timers,
}

pub struct SimNetwork {
    config: Arc<RoutingConfig>,
    nodes: Vec<Option<SimNode>>,
    by_addr: HashMap<SocketAddr, usize>,
    queue: VecDeque<Frame>,
    bootstrap: Option<NodeInfo>,
    now: Instant,
    drops: Vec<(usize, DropReason)>,
    undeliverable: usize,
}

impl SimNetwork {
    pub fn new(config: RoutingConfig) -> Result<Self> {
        config.validate().context("invalid routing configuration")?;
        Ok(Self {
            config: Arc::new(config),
            nodes: Vec::new(),
            by_addr: HashMap::new(),
            queue: VecDeque::new(),
            bootstrap: None,
            now: Instant::now(),
            drops: Vec::new(),
            undeliverable: 0,
        })
    }

    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    /// Add a vault and let its join complete. The first vault becomes the
    /// network's bootstrap.
    pub fn add_vault(&mut self) -> usize {
        let endpoints = self.next_endpoints();
        let local = LocalNode::vault(Keypair::generate(), endpoints);
        if self.bootstrap.is_none() {
            self.bootstrap = Some(local.to_node_info());
        }
        self.add(local)
    }

    pub fn add_client(&mut self, id: Option<NodeId>) -> Result<usize> {
        self.require_bootstrap()?;
        let endpoints = self.next_endpoints();
        Ok(self.add(LocalNode::client(Keypair::generate(), id, endpoints)))
    }

    pub fn add_anonymous(&mut self) -> Result<usize> {
        self.require_bootstrap()?;
        let endpoints = self.next_endpoints();
        Ok(self.add(LocalNode::anonymous(Keypair::generate(), endpoints)))
    }

    fn require_bootstrap(&self) -> Result<()> {
        if self.bootstrap.is_none() {
            bail!("a vault must be added before other nodes can join");
        }
        Ok(())
    }

    fn next_endpoints(&self) -> EndpointPair {
        let port = BASE_PORT + self.nodes.len() as u16;
        EndpointPair::single(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
    }

    fn add(&mut self, local: LocalNode) -> usize {
        let idx = self.nodes.len();
        let id = local.id;
        let addr = local.endpoints.local;
        let table = Arc::new(RoutingTable::new(id, !local.kind.is_vault(), &self.config));
        let engine = ForwardingEngine::new(local, self.config.clone(), table);

        let bootstrap = self.bootstrap.clone().filter(|b| b.id != id);
        let join = bootstrap.map(|b| {
            engine.set_bootstrap(b);
            engine.join(self.now)
        });

        self.nodes.push(Some(SimNode {
            engine,
            deliveries: Vec::new(),
            timers: Timers {
                find_close: self.now + self.config.find_close_node_interval,
                find_random: self.now + self.config.find_node_interval,
                prune: self.now + self.config.connect_rpc_prune_timeout,
            },
        }));
        self.by_addr.insert(addr, idx);
        debug!(idx, id = %id.short(), "sim node added");

        if let Some(actions) = join {
            self.apply(idx, actions);
            self.settle();
        }
        idx
    }

    /// Take a node offline and close its sessions: every live peer drops it.
    pub fn remove_node(&mut self, idx: usize) -> bool {
        let Some(node) = self.take_offline(idx) else {
            return false;
        };
        let local = node.engine.local();
        let mut notified = 0;
        for (_, peer) in self.live() {
            if peer.engine.peer_lost(&local.id, &local.endpoints) {
                notified += 1;
            }
        }
        debug!(idx, id = %local.id.short(), notified, "sim node removed");
        true
    }

    /// Take a node offline silently. Peers keep their entries for it until a
    /// send to it fails.
    pub fn crash_node(&mut self, idx: usize) -> bool {
        let Some(node) = self.take_offline(idx) else {
            return false;
        };
        debug!(idx, id = %node.engine.local_id().short(), "sim node crashed");
        true
    }

    fn take_offline(&mut self, idx: usize) -> Option<SimNode> {
        let node = self.nodes.get_mut(idx).and_then(Option::take)?;
        self.by_addr.remove(&node.engine.local().endpoints.local);
        Some(node)
    }

    /// The session from `idx` to `peer` failed.
    fn report_lost(&self, idx: usize, peer: &NodeInfo) {
        if let Some(node) = self.node(idx) {
            node.engine.peer_lost(&peer.id, &peer.endpoints);
        }
    }

    pub fn engine(&self, idx: usize) -> Option<&ForwardingEngine<RoutingTable>> {
        self.node(idx).map(|n| &n.engine)
    }

    pub fn id(&self, idx: usize) -> Option<NodeId> {
        self.engine(idx).map(ForwardingEngine::local_id)
    }

    fn node(&self, idx: usize) -> Option<&SimNode> {
        self.nodes.get(idx).and_then(Option::as_ref)
    }

    fn live(&self) -> impl Iterator<Item = (usize, &SimNode)> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(idx, n)| n.as_ref().map(|n| (idx, n)))
    }

    pub fn len(&self) -> usize {
        self.live().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Indices of live vaults, in insertion order.
    pub fn vaults(&self) -> Vec<usize> {
        self.live()
            .filter(|(_, n)| n.engine.kind() == NodeKind::Vault)
            .map(|(idx, _)| idx)
            .collect()
    }

    /// Expected group for `pivot`, computed from the global view of live vaults.
    pub fn group_for(&self, pivot: &NodeId) -> Vec<usize> {
        let mut vaults: Vec<(usize, NodeId)> = self
            .live()
            .filter(|(_, n)| n.engine.kind() == NodeKind::Vault && n.engine.local_id() != *pivot)
            .map(|(idx, n)| (idx, n.engine.local_id()))
            .collect();
        vaults.sort_by(|a, b| closeness_cmp(pivot, &a.1, &b.1));
        vaults.truncate(self.config.node_group_size);
        vaults.into_iter().map(|(idx, _)| idx).collect()
    }

    // ========================================================================
    // Traffic
    // ========================================================================

    pub fn send_direct(&mut self, from: usize, target: NodeId, data: Vec<u8>) -> Result<()> {
        self.originate(from, Destination::Node(target), data)
    }

    pub fn send_group(&mut self, from: usize, pivot: NodeId, data: Vec<u8>) -> Result<()> {
        self.originate(from, Destination::Group(pivot), data)
    }

    fn originate(&mut self, from: usize, destination: Destination, data: Vec<u8>) -> Result<()> {
        let engine = self
            .engine(from)
            .with_context(|| format!("no live node at index {from}"))?;
        let actions = engine.send(destination, data, self.now);
        self.apply(from, actions);
        self.settle();
        Ok(())
    }

    /// Queue a raw frame for node `to` and drain the network.
    pub fn inject(&mut self, to: usize, bytes: Vec<u8>) -> Result<()> {
        let addr = self
            .engine(to)
            .with_context(|| format!("no live node at index {to}"))?
            .local()
            .endpoints
            .local;
        self.queue.push_back(Frame {
            addr,
            sender: None,
            bytes,
        });
        self.settle();
        Ok(())
    }

    /// Deliver queued frames until the network is quiet. Returns the number of
    /// frames processed.
    pub fn settle(&mut self) -> usize {
        let mut processed = 0;
        while let Some(frame) = self.queue.pop_front() {
            if processed == MAX_SETTLE_FRAMES {
                warn!(queued = self.queue.len() + 1, "sim network did not settle, discarding frames");
                self.queue.clear();
                break;
            }
            processed += 1;

            let online = self.by_addr.get(&frame.addr).copied();
            let Some((idx, node)) = online.and_then(|idx| self.node(idx).map(|n| (idx, n))) else {
                trace!(to = %frame.addr, "frame for an offline endpoint");
                self.undeliverable += 1;
                if let Some((from, peer)) = &frame.sender {
                    self.report_lost(*from, peer);
                }
                continue;
            };
            let actions = node.engine.process(&frame.bytes, self.now);
            self.apply(idx, actions);
        }
        processed
    }

    fn apply(&mut self, idx: usize, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Send { to, bytes } => self.queue.push_back(Frame {
                    addr: to.endpoints.local,
                    sender: Some((idx, to)),
                    bytes,
                }),
                Action::Connect { peer } => {
                    if !self.by_addr.contains_key(&peer.endpoints.local) {
                        trace!(idx, peer = %peer.id.short(), "session to an offline endpoint");
                        self.report_lost(idx, &peer);
                    }
                }
                Action::Deliver(delivery) => {
                    if let Some(Some(node)) = self.nodes.get_mut(idx) {
                        node.deliveries.push(delivery);
                    }
                }
                Action::Drop(reason) => self.drops.push((idx, reason)),
            }
        }
    }

    // ========================================================================
    // Virtual clock
    // ========================================================================

    /// Move the clock forward by `by`, firing every maintenance timer that
    /// falls due on the way in time order. Within one instant the ticks run
    /// before connect pruning.
    pub fn advance(&mut self, by: Duration) {
        let until = self.now + by;
        loop {
            let Some(next) = self
                .live()
                .flat_map(|(_, n)| [n.timers.find_close, n.timers.find_random, n.timers.prune])
                .min()
            else {
                break;
            };
            if next > until {
                break;
            }
            self.now = next;

            let due: Vec<usize> = self.live().map(|(idx, _)| idx).collect();
            for idx in due {
                self.fire_timers(idx);
            }
            self.settle();
        }
        self.now = until;
    }

    fn fire_timers(&mut self, idx: usize) {
        let now = self.now;
        let config = self.config.clone();
        let Some(Some(node)) = self.nodes.get_mut(idx) else {
            return;
        };

        let mut actions = Vec::new();
        if node.timers.find_close <= now {
            node.timers.find_close += config.find_close_node_interval;
            actions.extend(node.engine.find_close_nodes(now));
        }
        if node.timers.find_random <= now {
            node.timers.find_random += config.find_node_interval;
            actions.extend(node.engine.find_random_node(now));
        }
        if node.timers.prune <= now {
            node.timers.prune += config.connect_rpc_prune_timeout;
            let pruned = node.engine.prune_connects(now);
            if pruned > 0 {
                trace!(idx, pruned, "sim connect prune");
            }
        }
        self.apply(idx, actions);
    }

    // ========================================================================
    // Observations
    // ========================================================================

    pub fn deliveries(&self, idx: usize) -> &[Delivery] {
        self.node(idx).map(|n| n.deliveries.as_slice()).unwrap_or_default()
    }

    /// Application messages received across every live node.
    pub fn messages_size(&self) -> usize {
        self.live().map(|(_, n)| n.deliveries.len()).sum()
    }

    pub fn clear_messages(&mut self) {
        for node in self.nodes.iter_mut().flatten() {
            node.deliveries.clear();
        }
        self.drops.clear();
    }

    pub fn drops(&self) -> &[(usize, DropReason)] {
        &self.drops
    }

    pub fn count_drops(&self, reason: &DropReason) -> usize {
        self.drops.iter().filter(|(_, r)| r == reason).count()
    }

    /// Frames addressed to endpoints that were offline when they arrived.
    pub fn undeliverable(&self) -> usize {
        self.undeliverable
    }
}

impl std::fmt::Debug for SimNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimNetwork")
            .field("nodes", &self.len())
            .field("queued", &self.queue.len())
            .field("drops", &self.drops.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::PeerTable;

    #[test]
    fn clients_need_a_bootstrap_vault() {
        let mut sim = SimNetwork::new(RoutingConfig::default()).unwrap();
        assert!(sim.add_client(None).is_err());
        assert!(sim.add_anonymous().is_err());
        sim.add_vault();
        assert!(sim.add_client(None).is_ok());
    }

    #[test]
    fn vaults_form_a_full_mesh() {
        let mut sim = SimNetwork::new(RoutingConfig::default()).unwrap();
        for _ in 0..6 {
            sim.add_vault();
        }
        for idx in sim.vaults() {
            assert_eq!(sim.engine(idx).unwrap().table().routing_len(), 5);
            assert!(sim.engine(idx).unwrap().handshake().is_empty());
        }
    }

    #[test]
    fn advance_moves_the_clock_without_traffic_loss() {
        let mut sim = SimNetwork::new(RoutingConfig::default()).unwrap();
        for _ in 0..3 {
            sim.add_vault();
        }
        let start = sim.now();
        sim.advance(Duration::from_secs(31));
        assert_eq!(sim.now(), start + Duration::from_secs(31));
        for idx in sim.vaults() {
            assert_eq!(sim.engine(idx).unwrap().table().routing_len(), 2);
        }
    }

    #[test]
    fn crashed_nodes_are_dropped_on_the_first_failed_send() {
        let mut sim = SimNetwork::new(RoutingConfig::default()).unwrap();
        sim.add_vault();
        let b = sim.add_vault();
        let target = sim.id(b).unwrap();
        assert!(sim.crash_node(b));
        assert!(!sim.crash_node(b));
        assert!(sim.engine(0).unwrap().table().get(&target).is_some());

        sim.send_direct(0, target, b"gone".to_vec()).unwrap();
        assert_eq!(sim.messages_size(), 0);
        assert_eq!(sim.undeliverable(), 1);
        assert!(sim.engine(0).unwrap().table().get(&target).is_none());
    }

    #[test]
    fn removed_nodes_leave_every_table() {
        let mut sim = SimNetwork::new(RoutingConfig::default()).unwrap();
        for _ in 0..4 {
            sim.add_vault();
        }
        let gone = sim.id(2).unwrap();
        assert!(sim.remove_node(2));
        assert!(!sim.remove_node(2));

        for idx in sim.vaults() {
            let table = sim.engine(idx).unwrap().table();
            assert!(table.get(&gone).is_none());
            assert_eq!(table.routing_len(), 2);
        }
        assert_eq!(sim.undeliverable(), 0);
    }
}
