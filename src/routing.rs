//! # Forwarding Engine
//!
//! Per-message routing decisions for one node. The engine is synchronous and
//! performs no I/O: [`ForwardingEngine::process`] turns an inbound frame into a
//! list of [`Action`]s that the caller executes (the async `Node` on tokio, the
//! deterministic `SimNetwork` in tests).
//!
//! ## Decisions
//!
//! | Destination | This node | Outcome |
//! |-------------|-----------|---------|
//! | `Node(self)` | any | deliver |
//! | `Node(x)` | holds sessions for `x` | one copy per session |
//! | `Node(x)` | `x` in routing set | send directly |
//! | `Node(x)` | vault | closest peer strictly closer to `x`, not in route history |
//! | `Group(p)` | member, knows a closer member | send to that member |
//! | `Group(p)` | closest member it knows of | deliver once, copy to every other member |
//! | `Group(p)` | vault, not member | send to closest member |
//! | `Relay{r, t}` | is `r` | send to the sessions for `t` |
//! | any | client / anonymous, not the target | drop, leaves never relay |
//!
//! Hop count, duplicate suppression and route history bound how far a single
//! message can travel. Failures are local drops with a diagnostic; nothing is
//! reported back to the sender.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::address::{self, NodeId, NodeKind};
use crate::config::RoutingConfig;
use crate::connect::{ConnectHandshake, ExchangeKey, Resolution};
use crate::error::{ParseError, SealError, TableError};
use crate::identity::{CONNECT_SIGNATURE_DOMAIN, Keypair, PublicKey};
use crate::messages::{
    self, Connect, ConnectResponse, Destination, EndpointPair, Envelope, FindGroup,
    FindGroupResponse, MessageHeader, MessageTypeTag, PeerRecord, Post, Source, WireMessage,
};
use crate::table::{ConnectionState, NodeInfo, PeerTable, RandomNodeHelper};

/// Identity and reachability of the node owning an engine.
#[derive(Clone, Debug)]
pub struct LocalNode {
    pub id: NodeId,
    pub kind: NodeKind,
    pub keypair: Keypair,
    pub endpoints: EndpointPair,
}

impl LocalNode {
    pub fn vault(keypair: Keypair, endpoints: EndpointPair) -> Self {
        Self {
            id: keypair.node_id(),
            kind: NodeKind::Vault,
            keypair,
            endpoints,
        }
    }

    /// A client may join under a chosen id; several clients may share it.
    pub fn client(keypair: Keypair, id: Option<NodeId>, endpoints: EndpointPair) -> Self {
        Self {
            id: id.unwrap_or_else(|| keypair.node_id()),
            kind: NodeKind::Client,
            keypair,
            endpoints,
        }
    }

    /// Anonymous nodes get a fresh random id per session.
    pub fn anonymous(keypair: Keypair, endpoints: EndpointPair) -> Self {
        Self {
            id: NodeId::random(),
            kind: NodeKind::Anonymous,
            keypair,
            endpoints,
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    pub fn to_node_info(&self) -> NodeInfo {
        NodeInfo::new(self.id, self.public_key(), self.endpoints, self.kind)
    }
}

/// Payload handed to the application boundary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub source: Source,
    pub destination: Destination,
    pub message_id: u32,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DropReason {
    Parse(ParseError),
    Seal(SealError),
    HopLimit,
    Duplicate,
    NoRoute,
    /// A leaf was asked to forward traffic that is not addressed to it.
    NotRelay,
    Rejected(&'static str),
}

/// Work produced by the engine for its executor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    Deliver(Delivery),
    Send { to: NodeInfo, bytes: Vec<u8> },
    /// A peer was admitted; the executor should open a session to it.
    Connect { peer: NodeInfo },
    Drop(DropReason),
}

type SeenKey = (NodeId, u32, Destination, MessageTypeTag);

#[derive(Debug, Default)]
struct Maintenance {
    empty_since: Option<Instant>,
    last_re_bootstrap: Option<Instant>,
    find_close_failures: usize,
}

pub struct ForwardingEngine<T: PeerTable> {
    local: LocalNode,
    config: Arc<RoutingConfig>,
    table: Arc<T>,
    handshake: ConnectHandshake,
    random_nodes: RandomNodeHelper,
    bootstrap: RwLock<Option<NodeInfo>>,
    seen: Mutex<LruCache<SeenKey, ()>>,
    maintenance: Mutex<Maintenance>,
}

impl<T: PeerTable> ForwardingEngine<T> {
    pub fn new(local: LocalNode, config: Arc<RoutingConfig>, table: Arc<T>) -> Self {
        let history = NonZeroUsize::new(config.message_history_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            handshake: ConnectHandshake::new(config.connect_rpc_prune_timeout),
            random_nodes: RandomNodeHelper::new(),
            bootstrap: RwLock::new(None),
            seen: Mutex::new(LruCache::new(history)),
            maintenance: Mutex::new(Maintenance::default()),
            local,
            config,
            table,
        }
    }

    pub fn local(&self) -> &LocalNode {
        &self.local
    }

    pub fn local_id(&self) -> NodeId {
        self.local.id
    }

    pub fn kind(&self) -> NodeKind {
        self.local.kind
    }

    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    pub fn table(&self) -> &Arc<T> {
        &self.table
    }

    pub fn handshake(&self) -> &ConnectHandshake {
        &self.handshake
    }

    pub fn random_nodes(&self) -> &RandomNodeHelper {
        &self.random_nodes
    }

    /// The vault this node attaches through while it has no routing peers.
    pub fn set_bootstrap(&self, peer: NodeInfo) {
        *self.bootstrap.write() = Some(peer);
    }

    pub fn bootstrap(&self) -> Option<NodeInfo> {
        self.bootstrap.read().clone()
    }

    /// Forget a peer whose session failed: its routing entry, or the single
    /// session at `endpoints`. Returns whether anything was removed.
    ///
    /// Once the last routing peer is gone, `find_close_nodes` re-bootstraps
    /// after `recovery_time_lag`.
    pub fn peer_lost(&self, id: &NodeId, endpoints: &EndpointPair) -> bool {
        let removed = match self.table.get(id) {
            Some(peer) if peer.endpoints == *endpoints => self.table.remove(id).is_some(),
            Some(_) => false,
            None => self.table.remove_session(id, endpoints).is_some(),
        };
        if !removed {
            return false;
        }
        if !self.table.contains(id) {
            self.random_nodes.remove(id);
        }
        debug!(
            node = %self.local.id.short(),
            peer = %id.short(),
            routing = self.table.routing_len(),
            "peer lost"
        );
        true
    }

    // ========================================================================
    // Origination
    // ========================================================================

    /// Ask the bootstrap vault for our group. Its session registration makes
    /// replies routable before any Connect has completed.
    pub fn join(&self, now: Instant) -> Vec<Action> {
        let Some(bootstrap) = self.bootstrap() else {
            debug!("join requested without a bootstrap peer");
            return vec![Action::Drop(DropReason::NoRoute)];
        };
        info!(node = %self.local.id.short(), bootstrap = %bootstrap.id.short(), kind = ?self.local.kind, "joining");
        let request = FindGroup {
            target: self.local.id,
            requester_endpoints: self.local.endpoints,
            requester_public_key: self.local.public_key(),
        };
        let mut out = Vec::new();
        self.originate(Destination::Node(bootstrap.id), &request, messages::new_message_id(), now, &mut out);
        out
    }

    /// Originate an application message.
    pub fn send(&self, destination: Destination, data: Vec<u8>, now: Instant) -> Vec<Action> {
        let mut out = Vec::new();
        self.originate(destination, &Post { data }, messages::new_message_id(), now, &mut out);
        out
    }

    fn source(&self) -> Source {
        Source::new(self.local.id, self.local.kind).with_relay(self.relay_id())
    }

    /// Leaves and isolated vaults are reached through their bootstrap.
    fn relay_id(&self) -> Option<NodeId> {
        if self.local.kind.is_vault() && self.table.routing_len() > 0 {
            return None;
        }
        self.bootstrap.read().as_ref().map(|b| b.id)
    }

    fn originate<M: WireMessage>(
        &self,
        destination: Destination,
        message: &M,
        message_id: u32,
        now: Instant,
        out: &mut Vec<Action>,
    ) {
        let payload = match messages::encode_payload(message) {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, "failed to encode outbound message");
                out.push(Action::Drop(DropReason::Seal(e)));
                return;
            }
        };
        let header = MessageHeader::build(destination, self.source(), message_id, self.config.hops_to_live);
        let envelope = Envelope {
            header,
            type_tag: M::TYPE_TAG,
            payload,
        };
        self.route(envelope, true, now, out);
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    pub fn process(&self, bytes: &[u8], now: Instant) -> Vec<Action> {
        let mut out = Vec::new();
        let mut envelope = match messages::open(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(error = %e, len = bytes.len(), "dropping unreadable message");
                out.push(Action::Drop(DropReason::Parse(e)));
                return out;
            }
        };

        let header = &mut envelope.header;
        if header.hops_remaining == 0 {
            debug!(
                message_id = header.message_id,
                source = %header.source.node.short(),
                target = %header.destination.target().short(),
                "hop limit reached"
            );
            out.push(Action::Drop(DropReason::HopLimit));
            return out;
        }
        header.hops_remaining -= 1;

        let key = (header.source.node, header.message_id, header.destination, envelope.type_tag);
        if self.seen.lock().put(key, ()).is_some() {
            trace!(message_id = key.1, "duplicate message");
            out.push(Action::Drop(DropReason::Duplicate));
            return out;
        }

        self.route(envelope, false, now, &mut out);
        out
    }

    fn route(&self, envelope: Envelope, originated: bool, now: Instant, out: &mut Vec<Action>) {
        match envelope.header.destination {
            Destination::Node(target) => self.route_to_node(target, envelope, originated, now, out),
            Destination::Group(pivot) => self.route_to_group(pivot, envelope, originated, now, out),
            Destination::Relay { relay, target } => {
                self.route_via_relay(relay, target, envelope, originated, now, out)
            }
        }
    }

    fn route_to_node(&self, target: NodeId, envelope: Envelope, originated: bool, now: Instant, out: &mut Vec<Action>) {
        if target == self.local.id {
            if self.local.kind.is_vault() || !originated {
                self.deliver_local(envelope, now, out);
                return;
            }
            // a leaf addressing its own id reaches every session sharing it, itself included
        } else if !originated && !self.local.kind.is_vault() {
            debug!(target = %target.short(), "leaf asked to relay");
            out.push(Action::Drop(DropReason::NotRelay));
            return;
        }

        if self.send_to_known(&target, &envelope, originated, out) {
            return;
        }

        match self.next_hop(&target, &envelope.header.route_history, originated) {
            Some(peer) => self.forward(envelope.header, envelope.type_tag, &envelope.payload, peer, originated, out),
            None => self.no_route(&target, &envelope.header, out),
        }
    }

    fn route_to_group(&self, pivot: NodeId, envelope: Envelope, originated: bool, now: Instant, out: &mut Vec<Action>) {
        let history = &envelope.header.route_history;

        if !self.local.kind.is_vault() || self.table.routing_len() == 0 {
            if !originated && !self.local.kind.is_vault() {
                out.push(Action::Drop(DropReason::NotRelay));
                return;
            }
            if let Some(peer) = self.next_hop(&pivot, history, true) {
                self.forward(envelope.header, envelope.type_tag, &envelope.payload, peer, originated, out);
                return;
            }
            if !self.local.kind.is_vault() {
                self.no_route(&pivot, &envelope.header, out);
                return;
            }
            // a lone vault with no bootstrap is its own group
        }

        let members = self.table.group_for(&pivot);
        if self.table.is_group_member(&pivot) {
            // fan-out happens at the closest member so every copy follows one view of the group
            let own = self.local.id.distance(&pivot);
            if let Some(closer) = members
                .iter()
                .find(|m| m.id.distance(&pivot) < own && !history.contains(&m.id))
            {
                let closer = closer.clone();
                self.forward(envelope.header, envelope.type_tag, &envelope.payload, closer, originated, out);
                return;
            }
            trace!(pivot = %pivot.short(), members = members.len(), "group member fan-out");
            for member in members {
                let copy = envelope
                    .header
                    .clone()
                    .with_destination(Destination::Node(member.id))
                    .with_source_group(Some(pivot));
                self.forward(copy, envelope.type_tag, &envelope.payload, member, originated, out);
            }
            self.deliver_local(envelope, now, out);
            return;
        }

        match members.into_iter().find(|m| !history.contains(&m.id)) {
            Some(member) => {
                self.forward(envelope.header, envelope.type_tag, &envelope.payload, member, originated, out)
            }
            None => self.no_route(&pivot, &envelope.header, out),
        }
    }

    fn route_via_relay(
        &self,
        relay: NodeId,
        target: NodeId,
        envelope: Envelope,
        originated: bool,
        now: Instant,
        out: &mut Vec<Action>,
    ) {
        if target == self.local.id {
            self.deliver_local(envelope, now, out);
            return;
        }
        if !originated && !self.local.kind.is_vault() {
            out.push(Action::Drop(DropReason::NotRelay));
            return;
        }
        if self.send_to_known(&target, &envelope, originated, out) {
            return;
        }
        if relay == self.local.id {
            debug!(target = %target.short(), "relay target no longer attached");
            self.no_route(&target, &envelope.header, out);
            return;
        }
        if self.send_to_known(&relay, &envelope, originated, out) {
            return;
        }
        match self.next_hop(&relay, &envelope.header.route_history, originated) {
            Some(peer) => self.forward(envelope.header, envelope.type_tag, &envelope.payload, peer, originated, out),
            None => self.no_route(&relay, &envelope.header, out),
        }
    }

    /// Send to every session advertising `id`, or to its routing entry.
    fn send_to_known(&self, id: &NodeId, envelope: &Envelope, originated: bool, out: &mut Vec<Action>) -> bool {
        let sessions = self.table.sessions(id);
        if !sessions.is_empty() {
            for session in sessions {
                self.forward(envelope.header.clone(), envelope.type_tag, &envelope.payload, session, originated, out);
            }
            return true;
        }
        if let Some(peer) = self.table.get(id) {
            self.forward(envelope.header.clone(), envelope.type_tag, &envelope.payload, peer, originated, out);
            return true;
        }
        false
    }

    /// Closest usable peer towards `target`. Relaying vaults only hand a message
    /// to a peer strictly closer than themselves.
    fn next_hop(&self, target: &NodeId, history: &[NodeId], originated: bool) -> Option<NodeInfo> {
        let best = self
            .table
            .closest(target, history.len() + 1)
            .into_iter()
            .find(|n| !history.contains(&n.id));

        match best {
            Some(peer) if originated || !self.local.kind.is_vault() => Some(peer),
            Some(peer) if peer.id.distance(target) < self.local.id.distance(target) => Some(peer),
            Some(_) => None,
            None if originated || self.table.routing_len() == 0 => {
                self.bootstrap().filter(|b| !history.contains(&b.id) && b.id != self.local.id)
            }
            None => None,
        }
    }

    fn forward(
        &self,
        header: MessageHeader,
        type_tag: MessageTypeTag,
        payload: &[u8],
        to: NodeInfo,
        originated: bool,
        out: &mut Vec<Action>,
    ) {
        let header = if originated {
            header
        } else {
            header.with_relayer(self.local.id, self.config.max_route_history)
        };
        match messages::seal(header, type_tag, payload, self.config.max_data_size) {
            Ok(bytes) => out.push(Action::Send { to, bytes }),
            Err(e) => {
                debug!(error = %e, "failed to seal forwarded message");
                out.push(Action::Drop(DropReason::Seal(e)));
            }
        }
    }

    fn no_route(&self, target: &NodeId, header: &MessageHeader, out: &mut Vec<Action>) {
        debug!(
            node = %self.local.id.short(),
            target = %target.short(),
            message_id = header.message_id,
            "no peer closer than self, dropping"
        );
        out.push(Action::Drop(DropReason::NoRoute));
    }

    fn reply_destination(&self, source: &Source) -> Destination {
        if self.table.contains(&source.node) {
            return Destination::Node(source.node);
        }
        match source.relay {
            Some(relay) => Destination::Relay {
                relay,
                target: source.node,
            },
            None => Destination::Node(source.node),
        }
    }

    // ========================================================================
    // Local delivery
    // ========================================================================

    fn deliver_local(&self, envelope: Envelope, now: Instant, out: &mut Vec<Action>) {
        let result = match envelope.type_tag {
            MessageTypeTag::Post => envelope.parse::<Post>().map(|post| {
                out.push(Action::Deliver(Delivery {
                    source: envelope.header.source,
                    destination: envelope.header.destination,
                    message_id: envelope.header.message_id,
                    data: post.data,
                }));
            }),
            MessageTypeTag::Connect => envelope
                .parse::<Connect>()
                .map(|m| self.handle_connect(&envelope.header, m, now, out)),
            MessageTypeTag::ConnectResponse => envelope
                .parse::<ConnectResponse>()
                .map(|m| self.handle_connect_response(&envelope.header, m, now, out)),
            MessageTypeTag::FindGroup => envelope
                .parse::<FindGroup>()
                .map(|m| self.handle_find_group(&envelope.header, m, now, out)),
            MessageTypeTag::FindGroupResponse => envelope
                .parse::<FindGroupResponse>()
                .map(|m| self.handle_find_group_response(m, now, out)),
        };
        if let Err(e) = result {
            debug!(error = %e, tag = ?envelope.type_tag, "dropping undecodable payload");
            out.push(Action::Drop(DropReason::Parse(e)));
        }
    }

    // ========================================================================
    // Connect
    // ========================================================================

    fn handle_connect(&self, header: &MessageHeader, connect: Connect, now: Instant, out: &mut Vec<Action>) {
        let source = header.source;
        if connect.receiver_id != self.local.id {
            out.push(Action::Drop(DropReason::Rejected("connect addressed to another node")));
            return;
        }

        let requester = NodeInfo::new(
            source.node,
            connect.requester_public_key,
            connect.requester_endpoints,
            source.kind,
        );
        let accepted = self.accept_connect(requester, out);
        debug!(peer = %source.node.short(), kind = ?source.kind, accepted, "connect request");

        let signed = ConnectResponse::signing_bytes(header.message_id, &source.node, &self.local.id, accepted);
        let response = ConnectResponse {
            requester_id: source.node,
            receiver_id: self.local.id,
            receiver_endpoints: self.local.endpoints,
            receiver_public_key: self.local.public_key(),
            accepted,
            signature: self.local.keypair.sign_with_domain(CONNECT_SIGNATURE_DOMAIN, &signed),
        };
        let destination = self.reply_destination(&source);
        self.originate(destination, &response, header.message_id, now, out);
    }

    fn accept_connect(&self, requester: NodeInfo, out: &mut Vec<Action>) -> bool {
        if !self.local.kind.is_vault() {
            return false;
        }
        match requester.kind {
            NodeKind::Anonymous => false,
            NodeKind::Vault => {
                if !requester.public_key.binds(&requester.id) {
                    debug!(peer = %requester.id.short(), "vault id does not match its key");
                    return false;
                }
                if self.table.get(&requester.id).is_some() {
                    return true;
                }
                self.admit_vault(requester, out)
            }
            NodeKind::Client => match self.table.try_insert(requester.clone()) {
                Ok(_) => {
                    out.push(Action::Connect { peer: requester });
                    true
                }
                Err(TableError::DuplicateId) => self
                    .table
                    .sessions(&requester.id)
                    .iter()
                    .any(|s| s.endpoints == requester.endpoints),
                Err(e) => {
                    debug!(peer = %requester.id.short(), error = %e, "client session refused");
                    false
                }
            },
        }
    }

    /// Place a vault in the routing set, promoting it out of the non-routing
    /// set if it was attached there. The sessions are restored on failure.
    fn admit_vault(&self, node: NodeInfo, out: &mut Vec<Action>) -> bool {
        let sessions = self.table.sessions(&node.id);
        for session in &sessions {
            self.table.remove_session(&session.id, &session.endpoints);
        }
        match self.table.try_insert(node.clone()) {
            Ok(evicted) => {
                if let Some(evicted) = evicted {
                    debug!(peer = %evicted.id.short(), "evicted to admit closer vault");
                }
                self.random_nodes.add(node.id);
                out.push(Action::Connect { peer: node });
                true
            }
            Err(e) => {
                for session in sessions {
                    let _ = self.table.try_insert(session);
                }
                debug!(peer = %node.id.short(), error = %e, "vault not admitted");
                false
            }
        }
    }

    fn handle_connect_response(
        &self,
        header: &MessageHeader,
        response: ConnectResponse,
        now: Instant,
        out: &mut Vec<Action>,
    ) {
        if response.requester_id != self.local.id {
            out.push(Action::Drop(DropReason::Rejected("connect response for another node")));
            return;
        }
        let key = ExchangeKey {
            message_id: header.message_id,
            receiver_id: response.receiver_id,
        };
        match self.handshake.resolve(&key, now) {
            Resolution::Accepted(_) => {}
            Resolution::Unknown => {
                trace!(message_id = key.message_id, "connect response without a pending exchange");
                out.push(Action::Drop(DropReason::Rejected("unknown connect exchange")));
                return;
            }
            Resolution::Expired => {
                out.push(Action::Drop(DropReason::Rejected("connect exchange expired")));
                return;
            }
        }

        let signed = ConnectResponse::signing_bytes(
            header.message_id,
            &self.local.id,
            &response.receiver_id,
            response.accepted,
        );
        if let Err(e) = response.receiver_public_key.verify_with_domain(
            CONNECT_SIGNATURE_DOMAIN,
            &signed,
            &response.signature,
        ) {
            debug!(peer = %response.receiver_id.short(), error = %e, "connect response signature rejected");
            out.push(Action::Drop(DropReason::Rejected("invalid connect response signature")));
            return;
        }
        if !response.receiver_public_key.binds(&response.receiver_id) {
            out.push(Action::Drop(DropReason::Rejected("vault id does not match its key")));
            return;
        }
        if !response.accepted {
            debug!(peer = %response.receiver_id.short(), "connect declined");
            return;
        }
        if self.table.get(&response.receiver_id).is_some() {
            return;
        }

        let peer = NodeInfo::new(
            response.receiver_id,
            response.receiver_public_key,
            response.receiver_endpoints,
            NodeKind::Vault,
        );
        self.admit_vault(peer, out);
    }

    fn propose_connect(&self, record: PeerRecord, now: Instant, out: &mut Vec<Action>) {
        let message_id = messages::new_message_id();
        let key = ExchangeKey {
            message_id,
            receiver_id: record.id,
        };
        if !self.handshake.propose(key, self.local.endpoints, now) {
            return;
        }
        let connect = Connect {
            requester_endpoints: self.local.endpoints,
            receiver_id: record.id,
            requester_public_key: self.local.public_key(),
        };

        let start = out.len();
        self.originate(Destination::Node(record.id), &connect, message_id, now, out);
        if out[start..].iter().any(|a| matches!(a, Action::Send { .. })) {
            self.handshake.mark_pending(&key, now);
        } else {
            self.handshake.abandon(&key);
        }
    }

    // ========================================================================
    // FindGroup
    // ========================================================================

    fn handle_find_group(&self, header: &MessageHeader, request: FindGroup, now: Instant, out: &mut Vec<Action>) {
        let source = header.source;
        if !self.local.kind.is_vault() {
            out.push(Action::Drop(DropReason::NotRelay));
            return;
        }
        if source.kind.is_vault() && !request.requester_public_key.binds(&source.node) {
            out.push(Action::Drop(DropReason::Rejected("vault id does not match its key")));
            return;
        }

        // sent straight to us as its relay: attach it so replies can reach it
        if header.route_history.is_empty() && source.relay == Some(self.local.id) {
            let state = if source.kind.is_vault() {
                ConnectionState::Bootstrapping
            } else {
                ConnectionState::Connected
            };
            let session = NodeInfo::new(
                source.node,
                request.requester_public_key,
                request.requester_endpoints,
                source.kind,
            )
            .with_state(state);
            match self.table.try_insert(session.clone()) {
                Ok(_) => {
                    debug!(peer = %source.node.short(), kind = ?source.kind, "bootstrap session attached");
                    out.push(Action::Connect { peer: session });
                }
                Err(e) => trace!(peer = %source.node.short(), error = %e, "bootstrap session not attached"),
            }
        }

        let mut group: Vec<PeerRecord> = self
            .table
            .closest(&request.target, self.config.closest_nodes_size)
            .iter()
            .filter(|n| n.id != source.node)
            .map(NodeInfo::to_record)
            .collect();
        group.push(PeerRecord {
            id: self.local.id,
            endpoints: self.local.endpoints,
            public_key: self.local.public_key(),
        });

        let response = FindGroupResponse {
            target: request.target,
            group,
        };
        let destination = self.reply_destination(&source);
        self.originate(destination, &response, messages::new_message_id(), now, out);
    }

    fn handle_find_group_response(&self, response: FindGroupResponse, now: Instant, out: &mut Vec<Action>) {
        self.maintenance.lock().find_close_failures = 0;
        if self.local.kind == NodeKind::Anonymous {
            return;
        }

        let mut budget = if self.local.kind.is_vault() {
            usize::MAX
        } else {
            self.config
                .max_client_routing_table_size
                .saturating_sub(self.table.routing_len() + self.handshake.len())
        };

        for record in response.group {
            if budget == 0 {
                break;
            }
            if record.id == self.local.id || !record.id.is_valid() {
                continue;
            }
            if !record.public_key.binds(&record.id) {
                debug!(peer = %record.id.short(), "ignoring group record with unbound id");
                continue;
            }
            self.random_nodes.add(record.id);
            if self.table.get(&record.id).is_some() || self.handshake.is_pending_for(&record.id) {
                continue;
            }
            self.propose_connect(record, now, out);
            budget -= 1;
        }
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Refresh the neighbourhood around our own id, or re-bootstrap once the
    /// routing set has stayed empty for `recovery_time_lag`.
    pub fn find_close_nodes(&self, now: Instant) -> Vec<Action> {
        if self.local.kind == NodeKind::Anonymous {
            return Vec::new();
        }

        let mut maintenance = self.maintenance.lock();
        if self.table.routing_len() == 0 {
            let since = *maintenance.empty_since.get_or_insert(now);
            if now.duration_since(since) < self.config.recovery_time_lag {
                return Vec::new();
            }
            if let Some(last) = maintenance.last_re_bootstrap
                && now.duration_since(last) < self.config.re_bootstrap_time_lag
            {
                return Vec::new();
            }
            maintenance.last_re_bootstrap = Some(now);
            drop(maintenance);
            info!(node = %self.local.id.short(), "routing table empty, re-bootstrapping");
            return self.join(now);
        }

        maintenance.empty_since = None;
        maintenance.find_close_failures += 1;
        if maintenance.find_close_failures >= self.config.maximum_find_close_node_failures {
            warn!(
                node = %self.local.id.short(),
                failures = maintenance.find_close_failures,
                "find-close-nodes requests are going unanswered"
            );
            maintenance.find_close_failures = 0;
        }
        drop(maintenance);

        let mut out = Vec::new();
        for peer in self.table.closest(&self.local.id, self.config.node_group_size) {
            out.extend(self.find_group_via(peer.id, self.local.id, now));
        }
        out
    }

    /// Refresh the bucket of a randomly sampled known id: ask the peer closest
    /// to a fresh id in that bucket for its view around it.
    pub fn find_random_node(&self, now: Instant) -> Vec<Action> {
        if self.local.kind == NodeKind::Anonymous || self.table.routing_len() == 0 {
            return Vec::new();
        }
        let sample = match self.random_nodes.get_random() {
            Some(id) => id,
            None => {
                for peer in self.table.closest(&self.local.id, self.table.routing_len()) {
                    self.random_nodes.add(peer.id);
                }
                match self.random_nodes.get_random() {
                    Some(id) => id,
                    None => return Vec::new(),
                }
            }
        };
        if self.table.get(&sample).is_some() {
            self.random_nodes.add(sample);
        }
        let Some(bucket) = address::bucket_index(&self.local.id, &sample) else {
            return Vec::new();
        };
        let target = address::random_id_in_bucket(&self.local.id, bucket);
        let Some(peer) = self.table.closest(&target, 1).into_iter().next() else {
            return Vec::new();
        };
        trace!(bucket, target = %target.short(), via = %peer.id.short(), "random bucket refresh");
        self.find_group_via(peer.id, target, now)
    }

    fn find_group_via(&self, destination: NodeId, target: NodeId, now: Instant) -> Vec<Action> {
        let request = FindGroup {
            target,
            requester_endpoints: self.local.endpoints,
            requester_public_key: self.local.public_key(),
        };
        let mut out = Vec::new();
        self.originate(Destination::Node(destination), &request, messages::new_message_id(), now, &mut out);
        out
    }

    /// Discard Connect exchanges whose timer has fired.
    pub fn prune_connects(&self, now: Instant) -> usize {
        self.handshake.prune(now).len()
    }
}

impl<T: PeerTable> std::fmt::Debug for ForwardingEngine<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardingEngine")
            .field("id", &self.local.id)
            .field("kind", &self.local.kind)
            .field("routing_len", &self.table.routing_len())
            .field("pending_connects", &self.handshake.len())
            .finish_non_exhaustive()
    }
}
