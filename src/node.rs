//! # Node
//!
//! Async host for a [`ForwardingEngine`]. A [`Node`] owns the engine, its peer
//! table and a [`Transport`], and executes the engine's actions on tokio:
//!
//! - inbound frames are processed on their own tasks, so independent messages
//!   run in parallel across the runtime's workers
//! - sends and session opens are fire-and-forget; a failure drops the peer
//!   from the table
//! - deliveries are pushed into a bounded channel taken once via [`Node::deliveries`]
//!
//! ## Timers
//!
//! Maintenance runs on three intervals (`find_close_node_interval`,
//! `find_node_interval`, `connect_rpc_prune_timeout`). Timer tasks hold only a
//! `Weak` handle to the node state and watch a shutdown signal, so they stop on
//! [`Node::shutdown`] or when the node is dropped and never outlive the table.
//!
//! ```ignore
//! let network = MemoryNetwork::new();
//! let (transport, inbound) = network.bind()?;
//! let node = Node::vault(Keypair::generate(), RoutingConfig::default(), transport, inbound).await?;
//! node.join(bootstrap_info).await?;
//! node.send_group(pivot, b"hello".to_vec()).await?;
//! ```

use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::address::{NodeId, NodeKind};
use crate::config::RoutingConfig;
use crate::identity::Keypair;
use crate::messages::{Destination, EndpointPair};
use crate::protocols::Transport;
use crate::routing::{Action, Delivery, ForwardingEngine, LocalNode};
use crate::table::{NodeInfo, PeerTable, RoutingTable};

/// Deliveries buffered for the application before new ones are dropped.
pub const DELIVERY_QUEUE_CAPACITY: usize = 1024;

/// A receiver that can be taken exactly once.
type TakeOnce<T> = tokio::sync::Mutex<Option<mpsc::Receiver<T>>>;

type Tick = fn(&ForwardingEngine<RoutingTable>, Instant) -> Vec<Action>;

struct NodeInner<T: Transport> {
    engine: ForwardingEngine<RoutingTable>,
    transport: T,
    delivery_tx: mpsc::Sender<Delivery>,
}

pub struct Node<T: Transport> {
    inner: Arc<NodeInner<T>>,
    deliveries: TakeOnce<Delivery>,
    shutdown: watch::Sender<bool>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Transport> Node<T> {
    /// Start a vault whose id is derived from `keypair`.
    pub async fn vault(
        keypair: Keypair,
        config: RoutingConfig,
        transport: T,
        inbound: mpsc::Receiver<Vec<u8>>,
    ) -> Result<Self> {
        let local = LocalNode::vault(keypair, transport.local_endpoints());
        Self::start(local, config, transport, inbound)
    }

    /// Start a client, optionally under a caller-chosen id.
    pub async fn client(
        keypair: Keypair,
        id: Option<NodeId>,
        config: RoutingConfig,
        transport: T,
        inbound: mpsc::Receiver<Vec<u8>>,
    ) -> Result<Self> {
        let local = LocalNode::client(keypair, id, transport.local_endpoints());
        Self::start(local, config, transport, inbound)
    }

    pub async fn anonymous(
        keypair: Keypair,
        config: RoutingConfig,
        transport: T,
        inbound: mpsc::Receiver<Vec<u8>>,
    ) -> Result<Self> {
        let local = LocalNode::anonymous(keypair, transport.local_endpoints());
        Self::start(local, config, transport, inbound)
    }

    fn start(
        local: LocalNode,
        config: RoutingConfig,
        transport: T,
        inbound: mpsc::Receiver<Vec<u8>>,
    ) -> Result<Self> {
        config.validate().context("invalid routing configuration")?;
        let config = Arc::new(config);

        let table = Arc::new(RoutingTable::new(local.id, !local.kind.is_vault(), &config));
        let (delivery_tx, delivery_rx) = mpsc::channel(DELIVERY_QUEUE_CAPACITY);
        let (shutdown, shutdown_rx) = watch::channel(false);

        info!(id = %local.id, kind = ?local.kind, endpoint = %local.endpoints.external, "node started");
        let inner = Arc::new(NodeInner {
            engine: ForwardingEngine::new(local, config.clone(), table),
            transport,
            delivery_tx,
        });

        let weak = Arc::downgrade(&inner);
        let tasks = vec![
            tokio::spawn(run_inbound(weak.clone(), inbound, shutdown_rx.clone())),
            spawn_periodic(
                weak.clone(),
                shutdown_rx.clone(),
                config.find_close_node_interval,
                ForwardingEngine::<RoutingTable>::find_close_nodes,
            ),
            spawn_periodic(
                weak.clone(),
                shutdown_rx.clone(),
                config.find_node_interval,
                ForwardingEngine::<RoutingTable>::find_random_node,
            ),
            spawn_periodic(weak, shutdown_rx, config.connect_rpc_prune_timeout, |engine, now| {
                let pruned = engine.prune_connects(now);
                if pruned > 0 {
                    debug!(pruned, "connect exchanges timed out");
                }
                Vec::new()
            }),
        ];

        Ok(Self {
            inner,
            deliveries: tokio::sync::Mutex::new(Some(delivery_rx)),
            shutdown,
            tasks: parking_lot::Mutex::new(tasks),
        })
    }

    pub fn id(&self) -> NodeId {
        self.inner.engine.local_id()
    }

    pub fn kind(&self) -> NodeKind {
        self.inner.engine.kind()
    }

    pub fn endpoints(&self) -> EndpointPair {
        self.inner.transport.local_endpoints()
    }

    /// Table entry other nodes use to bootstrap through this one.
    pub fn node_info(&self) -> NodeInfo {
        self.inner.engine.local().to_node_info()
    }

    pub fn table(&self) -> &Arc<RoutingTable> {
        self.inner.engine.table()
    }

    pub fn routing_len(&self) -> usize {
        self.inner.engine.table().routing_len()
    }

    /// Attach through `bootstrap` and request our group.
    pub async fn join(&self, bootstrap: NodeInfo) -> Result<()> {
        self.inner.engine.set_bootstrap(bootstrap);
        let actions = self.inner.engine.join(Instant::now());
        execute(&self.inner, actions).context("join failed")
    }

    pub async fn send(&self, target: NodeId, data: Vec<u8>) -> Result<()> {
        let actions = self.inner.engine.send(Destination::Node(target), data, Instant::now());
        execute(&self.inner, actions).context("send failed")
    }

    pub async fn send_group(&self, pivot: NodeId, data: Vec<u8>) -> Result<()> {
        let actions = self.inner.engine.send(Destination::Group(pivot), data, Instant::now());
        execute(&self.inner, actions).context("group send failed")
    }

    pub async fn deliveries(&self) -> Result<mpsc::Receiver<Delivery>> {
        let mut guard = self.deliveries.lock().await;
        guard.take().context("delivery receiver already taken")
    }

    /// Stop the inbound loop and every timer, then wait for them to exit.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                debug!(error = %e, "node task ended abnormally");
            }
        }
        info!(id = %self.id(), "node stopped");
    }
}

impl<T: Transport> Drop for Node<T> {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Run the engine's actions. Only a locally originated message that could not
/// leave this node is reported as an error.
fn execute<T: Transport>(inner: &Arc<NodeInner<T>>, actions: Vec<Action>) -> Result<()> {
    let mut result = Ok(());
    for action in actions {
        match action {
            Action::Send { to, bytes } => {
                let node = inner.clone();
                tokio::spawn(async move {
                    if let Err(e) = node.transport.send(&to.endpoints, bytes).await {
                        debug!(peer = %to.id.short(), error = %e, "send failed");
                        node.engine.peer_lost(&to.id, &to.endpoints);
                    }
                });
            }
            Action::Connect { peer } => {
                let node = inner.clone();
                tokio::spawn(async move {
                    if let Err(e) = node.transport.connect(&peer.endpoints).await {
                        debug!(peer = %peer.id.short(), error = %e, "session open failed");
                        node.engine.peer_lost(&peer.id, &peer.endpoints);
                    }
                });
            }
            Action::Deliver(delivery) => {
                if inner.delivery_tx.try_send(delivery).is_err() {
                    warn!("delivery queue full or closed, dropping message");
                }
            }
            Action::Drop(reason) => {
                trace!(reason = ?reason, "message dropped");
                result = Err(anyhow::anyhow!("message dropped: {reason:?}"));
            }
        }
    }
    result
}

async fn run_inbound<T: Transport>(
    node: Weak<NodeInner<T>>,
    mut inbound: mpsc::Receiver<Vec<u8>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            frame = inbound.recv() => {
                let Some(bytes) = frame else { break };
                let Some(inner) = node.upgrade() else { break };
                tokio::spawn(async move {
                    let actions = inner.engine.process(&bytes, Instant::now());
                    // inbound drops are diagnostics, not failures
                    let _ = execute(&inner, actions);
                });
            }
        }
    }
    trace!("inbound loop stopped");
}

fn spawn_periodic<T: Transport>(
    node: Weak<NodeInner<T>>,
    mut shutdown: watch::Receiver<bool>,
    period: Duration,
    tick: Tick,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {
                    let Some(inner) = node.upgrade() else { break };
                    let actions = tick(&inner.engine, Instant::now());
                    let _ = execute(&inner, actions);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryNetwork;

    #[tokio::test]
    async fn deliveries_can_only_be_taken_once() {
        let network = MemoryNetwork::new();
        let (transport, inbound) = network.bind().unwrap();
        let node = Node::vault(Keypair::generate(), RoutingConfig::default(), transport, inbound)
            .await
            .unwrap();
        assert!(node.deliveries().await.is_ok());
        assert!(node.deliveries().await.is_err());
        node.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let network = MemoryNetwork::new();
        let (transport, inbound) = network.bind().unwrap();
        let config = RoutingConfig {
            node_group_size: 0,
            ..RoutingConfig::default()
        };
        assert!(Node::vault(Keypair::generate(), config, transport, inbound).await.is_err());
    }

    #[tokio::test]
    async fn vault_delivers_its_own_direct_message() {
        let network = MemoryNetwork::new();
        let (transport, inbound) = network.bind().unwrap();
        let node = Node::vault(Keypair::generate(), RoutingConfig::default(), transport, inbound)
            .await
            .unwrap();
        let mut rx = node.deliveries().await.unwrap();
        node.send(node.id(), b"self".to_vec()).await.unwrap();
        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.data, b"self");
        assert_eq!(delivery.source.node, node.id());
        node.shutdown().await;
    }
}
