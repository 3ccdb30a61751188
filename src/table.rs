//! # Peer Table
//!
//! Bounded membership of a single node, split in two sets:
//!
//! | Set | Holds | Keyed by | Capacity |
//! |-----|-------|----------|----------|
//! | routing | validated vaults, bucketed by distance to self | id | `max_routing_table_size` (`max_client_routing_table_size` for clients) |
//! | non-routing | attached clients, anonymous nodes, bootstrap sessions | `(id, endpoints)` | `max_non_routing_table_size` |
//!
//! Several sessions may share an id in the non-routing set (clients that joined
//! with the same chosen id). An id never sits in both sets at once.
//!
//! ## Eviction
//!
//! When the routing set is full, the farthest bucket holding more than
//! `bucket_target_size` peers gives up its farthest member. If that member would
//! be the incoming node, the insert is refused with [`TableError::TableFull`].
//! This keeps the table biased towards nearby peers.
//!
//! ## Locking
//!
//! All state sits behind one `RwLock`: queries share it, mutations take it
//! exclusively. Handshake bookkeeping is guarded separately (see `connect`).

use std::collections::{BinaryHeap, VecDeque};

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tracing::{debug, trace};

use crate::address::{self, ID_BITS, NodeId, NodeKind};
use crate::config::RoutingConfig;
use crate::error::TableError;
use crate::identity::PublicKey;
use crate::messages::{EndpointPair, PeerRecord};

/// Capacity of the [`RandomNodeHelper`] sample.
pub const RANDOM_NODE_HELPER_CAPACITY: usize = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Reachable only as a bootstrap session; not yet proposed for routing.
    Bootstrapping,
    Connected,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    pub id: NodeId,
    /// Distance class relative to the owning table; set on insert.
    pub bucket_index: usize,
    pub connection_state: ConnectionState,
    pub public_key: PublicKey,
    pub endpoints: EndpointPair,
    pub kind: NodeKind,
}

impl NodeInfo {
    pub fn new(id: NodeId, public_key: PublicKey, endpoints: EndpointPair, kind: NodeKind) -> Self {
        Self {
            id,
            bucket_index: 0,
            connection_state: ConnectionState::Connected,
            public_key,
            endpoints,
            kind,
        }
    }

    pub fn with_state(mut self, state: ConnectionState) -> Self {
        self.connection_state = state;
        self
    }

    /// Entries of this shape land in the routing set.
    #[inline]
    pub fn is_routing_candidate(&self) -> bool {
        self.kind.is_vault() && self.connection_state != ConnectionState::Bootstrapping
    }

    pub fn to_record(&self) -> PeerRecord {
        PeerRecord {
            id: self.id,
            endpoints: self.endpoints,
            public_key: self.public_key,
        }
    }
}

/// Membership contract consumed by the forwarding engine.
///
/// Implementations serialize mutations against queries internally, so every
/// method takes `&self`.
pub trait PeerTable: Send + Sync + 'static {
    fn self_id(&self) -> NodeId;

    /// Insert `node`, returning the peer evicted to make room, if any.
    fn try_insert(&self, node: NodeInfo) -> Result<Option<NodeInfo>, TableError>;

    fn insert(&self, node: NodeInfo) -> bool {
        self.try_insert(node).is_ok()
    }

    /// Remove the routing entry for `id`, or every session with that id.
    /// Removing an absent id is a no-op.
    fn remove(&self, id: &NodeId) -> Option<NodeInfo>;

    fn remove_session(&self, id: &NodeId, endpoints: &EndpointPair) -> Option<NodeInfo>;

    /// Up to `k` routing peers, closest to `target` first.
    fn closest(&self, target: &NodeId, k: usize) -> Vec<NodeInfo>;

    /// Group members for `pivot`, never including this node.
    fn group_for(&self, pivot: &NodeId) -> Vec<NodeInfo>;

    /// Whether this node is itself one of the group members for `pivot`.
    fn is_group_member(&self, pivot: &NodeId) -> bool;

    /// Routing set entry for `id`.
    fn get(&self, id: &NodeId) -> Option<NodeInfo>;

    /// Non-routing sessions advertising `id`.
    fn sessions(&self, id: &NodeId) -> Vec<NodeInfo>;

    fn contains(&self, id: &NodeId) -> bool;

    fn routing_len(&self) -> usize;

    fn non_routing_len(&self) -> usize;

    /// Drop peers until both sets fit their capacity; returns the evicted peers.
    fn evict_if_over_capacity(&self) -> Vec<NodeInfo>;
}

/// Capacities copied out of the configuration snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TableLimits {
    pub max_routing_table_size: usize,
    pub routing_table_size_threshold: usize,
    pub max_client_routing_table_size: usize,
    pub max_non_routing_table_size: usize,
    pub bucket_target_size: usize,
    pub node_group_size: usize,
}

impl From<&RoutingConfig> for TableLimits {
    fn from(config: &RoutingConfig) -> Self {
        Self {
            max_routing_table_size: config.max_routing_table_size,
            routing_table_size_threshold: config.routing_table_size_threshold,
            max_client_routing_table_size: config.max_client_routing_table_size,
            max_non_routing_table_size: config.max_non_routing_table_size,
            bucket_target_size: config.bucket_target_size,
            node_group_size: config.node_group_size,
        }
    }
}

#[derive(Clone, Debug, Default)]
struct RoutingBucket {
    nodes: Vec<NodeInfo>,
}

impl RoutingBucket {
    fn position(&self, id: &NodeId) -> Option<usize> {
        self.nodes.iter().position(|n| n.id == *id)
    }

    fn remove(&mut self, id: &NodeId) -> Option<NodeInfo> {
        self.position(id).map(|pos| self.nodes.remove(pos))
    }

    /// Member with the greatest distance to `self_id`.
    fn farthest(&self, self_id: &NodeId) -> Option<&NodeInfo> {
        self.nodes
            .iter()
            .max_by(|a, b| address::closeness_cmp(self_id, &a.id, &b.id))
    }
}

#[derive(Debug)]
struct TableState {
    limits: TableLimits,
    buckets: Vec<RoutingBucket>,
    routing_len: usize,
    non_routing: Vec<NodeInfo>,
}

impl TableState {
    fn find(&self, id: &NodeId) -> Option<&NodeInfo> {
        self.buckets.iter().find_map(|b| b.nodes.iter().find(|n| n.id == *id))
    }

    fn routing_iter(&self) -> impl Iterator<Item = &NodeInfo> {
        self.buckets.iter().flat_map(|b| b.nodes.iter())
    }

    fn in_non_routing(&self, id: &NodeId) -> bool {
        self.non_routing.iter().any(|n| n.id == *id)
    }

    fn remove_routing(&mut self, bucket_idx: usize, id: &NodeId) -> Option<NodeInfo> {
        let removed = self.buckets.get_mut(bucket_idx)?.remove(id);
        if removed.is_some() {
            self.routing_len -= 1;
        }
        removed
    }

    /// Farthest member of the farthest bucket over `bucket_target_size`,
    /// counting `incoming` as if it were already placed.
    fn eviction_candidate(&self, self_id: &NodeId, incoming: Option<&NodeInfo>) -> Option<NodeInfo> {
        let target = self.limits.bucket_target_size;
        for idx in (0..ID_BITS).rev() {
            let bucket = &self.buckets[idx];
            let incoming_here = incoming.filter(|n| n.bucket_index == idx);
            let occupancy = bucket.nodes.len() + usize::from(incoming_here.is_some());
            if occupancy <= target {
                continue;
            }
            let farthest = bucket
                .nodes
                .iter()
                .chain(incoming_here)
                .max_by(|a, b| address::closeness_cmp(self_id, &a.id, &b.id));
            return farthest.cloned();
        }
        None
    }
}

/// The concrete XOR-bucketed peer table.
#[derive(Debug)]
pub struct RoutingTable {
    self_id: NodeId,
    client_mode: bool,
    state: RwLock<TableState>,
}

impl RoutingTable {
    pub fn new(self_id: NodeId, client_mode: bool, config: &RoutingConfig) -> Self {
        Self::with_limits(self_id, client_mode, TableLimits::from(config))
    }

    pub fn with_limits(self_id: NodeId, client_mode: bool, limits: TableLimits) -> Self {
        Self {
            self_id,
            client_mode,
            state: RwLock::new(TableState {
                limits,
                buckets: vec![RoutingBucket::default(); ID_BITS],
                routing_len: 0,
                non_routing: Vec::new(),
            }),
        }
    }

    pub fn client_mode(&self) -> bool {
        self.client_mode
    }

    /// Replace the capacities. Callers follow up with `evict_if_over_capacity`
    /// when shrinking.
    pub fn set_limits(&self, limits: TableLimits) {
        self.state.write().limits = limits;
    }

    pub fn limits(&self) -> TableLimits {
        self.state.read().limits
    }

    fn routing_capacity(&self, limits: &TableLimits) -> usize {
        if self.client_mode {
            limits.max_client_routing_table_size
        } else {
            limits.max_routing_table_size
        }
    }

    /// Peer to drop next once the routing set grows past its threshold.
    pub fn removable_node(&self) -> Option<NodeInfo> {
        let state = self.state.read();
        if state.routing_len <= state.limits.routing_table_size_threshold {
            return None;
        }
        state.eviction_candidate(&self.self_id, None)
    }

    pub fn routing_nodes(&self) -> Vec<NodeInfo> {
        self.state.read().routing_iter().cloned().collect()
    }

    pub fn non_routing_nodes(&self) -> Vec<NodeInfo> {
        self.state.read().non_routing.clone()
    }

    /// Vaults eligible for `pivot`'s group, closest first, with a flag for self.
    fn group_members(&self, state: &TableState, pivot: &NodeId) -> (Vec<NodeInfo>, bool) {
        let size = state.limits.node_group_size;
        let peers = closest_in(state, pivot, size + 1, |n| n.id != *pivot);

        let self_eligible = !self.client_mode && self.self_id != *pivot;
        if !self_eligible {
            return (peers.into_iter().take(size).collect(), false);
        }

        let self_dist = self.self_id.distance(pivot);
        let self_rank = peers
            .iter()
            .take_while(|n| n.id.distance(pivot) < self_dist)
            .count();
        if self_rank < size {
            (peers.into_iter().take(size - 1).collect(), true)
        } else {
            (peers.into_iter().take(size).collect(), false)
        }
    }

    fn insert_routing(&self, state: &mut TableState, mut node: NodeInfo) -> Result<Option<NodeInfo>, TableError> {
        if state.find(&node.id).is_some() || state.in_non_routing(&node.id) {
            return Err(TableError::DuplicateId);
        }
        node.bucket_index = address::bucket_index(&self.self_id, &node.id).ok_or(TableError::InvalidPeer)?;

        let capacity = self.routing_capacity(&state.limits);
        let mut evicted = None;
        if state.routing_len >= capacity {
            let victim = state
                .eviction_candidate(&self.self_id, Some(&node))
                .ok_or(TableError::TableFull)?;
            if victim.id == node.id {
                trace!(peer = %node.id.short(), "incoming peer is the farthest in its bucket");
                return Err(TableError::TableFull);
            }
            evicted = state.remove_routing(victim.bucket_index, &victim.id);
            if let Some(ref e) = evicted {
                debug!(peer = %e.id.short(), bucket = e.bucket_index, "evicted routing peer");
            }
        }

        trace!(peer = %node.id.short(), bucket = node.bucket_index, "routing peer added");
        state.buckets[node.bucket_index].nodes.push(node);
        state.routing_len += 1;
        Ok(evicted)
    }

    fn insert_non_routing(&self, state: &mut TableState, mut node: NodeInfo) -> Result<Option<NodeInfo>, TableError> {
        if self.client_mode {
            return Err(TableError::NotAccepting);
        }
        if state.find(&node.id).is_some() {
            return Err(TableError::DuplicateId);
        }
        if state
            .non_routing
            .iter()
            .any(|n| n.id == node.id && n.endpoints == node.endpoints)
        {
            return Err(TableError::DuplicateId);
        }
        if state.non_routing.len() >= state.limits.max_non_routing_table_size {
            return Err(TableError::TableFull);
        }
        node.bucket_index = address::bucket_index(&self.self_id, &node.id).ok_or(TableError::InvalidPeer)?;
        trace!(peer = %node.id.short(), kind = ?node.kind, "non-routing session added");
        state.non_routing.push(node);
        Ok(None)
    }
}

fn closest_in<F>(state: &TableState, target: &NodeId, k: usize, filter: F) -> Vec<NodeInfo>
where
    F: Fn(&NodeInfo) -> bool,
{
    if k == 0 {
        return Vec::new();
    }

    #[derive(Eq, PartialEq)]
    struct Ranked<'a> {
        dist: address::Distance,
        node: &'a NodeInfo,
    }

    impl Ord for Ranked<'_> {
        fn cmp(&self, other: &Self) -> std::cmp::Ordering {
            self.dist
                .cmp(&other.dist)
                .then_with(|| self.node.id.cmp(&other.node.id))
        }
    }

    impl PartialOrd for Ranked<'_> {
        fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
            Some(self.cmp(other))
        }
    }

    let mut heap: BinaryHeap<Ranked<'_>> = BinaryHeap::with_capacity(k + 1);
    for node in state.routing_iter().filter(|n| filter(n)) {
        heap.push(Ranked {
            dist: node.id.distance(target),
            node,
        });
        if heap.len() > k {
            heap.pop();
        }
    }

    heap.into_sorted_vec()
        .into_iter()
        .map(|r| r.node.clone())
        .collect()
}

impl PeerTable for RoutingTable {
    fn self_id(&self) -> NodeId {
        self.self_id
    }

    fn try_insert(&self, node: NodeInfo) -> Result<Option<NodeInfo>, TableError> {
        if !node.id.is_valid() || node.id == self.self_id {
            return Err(TableError::InvalidPeer);
        }
        let mut state = self.state.write();
        if node.is_routing_candidate() {
            self.insert_routing(&mut state, node)
        } else {
            self.insert_non_routing(&mut state, node)
        }
    }

    fn remove(&self, id: &NodeId) -> Option<NodeInfo> {
        let mut state = self.state.write();
        if let Some(idx) = address::bucket_index(&self.self_id, id)
            && let Some(removed) = state.remove_routing(idx, id)
        {
            return Some(removed);
        }
        let mut first = None;
        state.non_routing.retain(|n| {
            if n.id == *id {
                if first.is_none() {
                    first = Some(n.clone());
                }
                false
            } else {
                true
            }
        });
        first
    }

    fn remove_session(&self, id: &NodeId, endpoints: &EndpointPair) -> Option<NodeInfo> {
        let mut state = self.state.write();
        let pos = state
            .non_routing
            .iter()
            .position(|n| n.id == *id && n.endpoints == *endpoints)?;
        Some(state.non_routing.remove(pos))
    }

    fn closest(&self, target: &NodeId, k: usize) -> Vec<NodeInfo> {
        closest_in(&self.state.read(), target, k, |_| true)
    }

    fn group_for(&self, pivot: &NodeId) -> Vec<NodeInfo> {
        let state = self.state.read();
        self.group_members(&state, pivot).0
    }

    fn is_group_member(&self, pivot: &NodeId) -> bool {
        let state = self.state.read();
        self.group_members(&state, pivot).1
    }

    fn get(&self, id: &NodeId) -> Option<NodeInfo> {
        self.state.read().find(id).cloned()
    }

    fn sessions(&self, id: &NodeId) -> Vec<NodeInfo> {
        self.state
            .read()
            .non_routing
            .iter()
            .filter(|n| n.id == *id)
            .cloned()
            .collect()
    }

    fn contains(&self, id: &NodeId) -> bool {
        let state = self.state.read();
        state.find(id).is_some() || state.in_non_routing(id)
    }

    fn routing_len(&self) -> usize {
        self.state.read().routing_len
    }

    fn non_routing_len(&self) -> usize {
        self.state.read().non_routing.len()
    }

    fn evict_if_over_capacity(&self) -> Vec<NodeInfo> {
        let mut state = self.state.write();
        let capacity = self.routing_capacity(&state.limits);
        let mut evicted = Vec::new();

        while state.routing_len > capacity {
            let victim = match state.eviction_candidate(&self.self_id, None) {
                Some(v) => v,
                // every bucket is within target: fall back to the farthest peer overall
                None => match state
                    .buckets
                    .iter()
                    .rev()
                    .find_map(|b| b.farthest(&self.self_id))
                {
                    Some(v) => v.clone(),
                    None => break,
                },
            };
            if let Some(removed) = state.remove_routing(victim.bucket_index, &victim.id) {
                debug!(peer = %removed.id.short(), "evicted routing peer over capacity");
                evicted.push(removed);
            }
        }

        let self_id = self.self_id;
        while state.non_routing.len() > state.limits.max_non_routing_table_size {
            let farthest = state
                .non_routing
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| address::closeness_cmp(&self_id, &a.id, &b.id))
                .map(|(pos, _)| pos);
            match farthest {
                Some(pos) => evicted.push(state.non_routing.remove(pos)),
                None => break,
            }
        }

        evicted
    }
}

// ============================================================================
// RandomNodeHelper
// ============================================================================

/// Deduplicated sample of known ids for re-bootstrap and random bucket refresh.
///
/// Independent of table membership. Drawing an id removes it, so callers that
/// want a steady population re-add what they still know about.
#[derive(Debug, Default)]
pub struct RandomNodeHelper {
    nodes: Mutex<VecDeque<NodeId>>,
}

impl RandomNodeHelper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `id`; the oldest sample is dropped once the helper is full.
    pub fn add(&self, id: NodeId) {
        let mut nodes = self.nodes.lock();
        if nodes.contains(&id) {
            return;
        }
        if nodes.len() >= RANDOM_NODE_HELPER_CAPACITY {
            nodes.pop_front();
        }
        nodes.push_back(id);
    }

    pub fn remove(&self, id: &NodeId) {
        self.nodes.lock().retain(|n| n != id);
    }

    /// Draw and remove a uniformly chosen id.
    pub fn get_random(&self) -> Option<NodeId> {
        let mut nodes = self.nodes.lock();
        if nodes.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..nodes.len());
        nodes.remove(idx)
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.lock().is_empty()
    }
}
