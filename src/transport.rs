//! # In-Process Transport
//!
//! [`MemoryNetwork`] is a registry of bounded mpsc channels keyed by socket
//! address. Each [`MemoryTransport`] bound on it implements [`Transport`] by
//! pushing framed bytes into the receiver registered for the peer's address.
//!
//! It backs the `meshroute` binary and the async node tests. Real deployments
//! plug a socket transport into the same trait.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::trace;

use crate::messages::EndpointPair;
use crate::protocols::Transport;

/// Frames buffered per endpoint before senders start waiting.
pub const INBOUND_QUEUE_CAPACITY: usize = 1024;

const FIRST_PORT: u16 = 20_000;

#[derive(Clone, Debug)]
pub struct MemoryNetwork {
    endpoints: Arc<RwLock<HashMap<SocketAddr, mpsc::Sender<Vec<u8>>>>>,
    next_port: Arc<AtomicU16>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self {
            endpoints: Arc::new(RwLock::new(HashMap::new())),
            next_port: Arc::new(AtomicU16::new(FIRST_PORT)),
        }
    }

    /// Bind the next free loopback address.
    pub fn bind(&self) -> Result<(MemoryTransport, mpsc::Receiver<Vec<u8>>)> {
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        self.bind_addr(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
    }

    pub fn bind_addr(&self, addr: SocketAddr) -> Result<(MemoryTransport, mpsc::Receiver<Vec<u8>>)> {
        let mut endpoints = self.endpoints.write();
        if endpoints.contains_key(&addr) {
            bail!("address {addr} already bound");
        }
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        endpoints.insert(addr, tx);
        let transport = MemoryTransport {
            network: self.clone(),
            endpoints: EndpointPair::single(addr),
        };
        Ok((transport, rx))
    }

    /// Remove `addr`; later sends to it fail.
    pub fn unbind(&self, addr: &SocketAddr) -> bool {
        self.endpoints.write().remove(addr).is_some()
    }

    pub fn len(&self) -> usize {
        self.endpoints.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.read().is_empty()
    }

    fn sender(&self, peer: &EndpointPair) -> Option<mpsc::Sender<Vec<u8>>> {
        let endpoints = self.endpoints.read();
        endpoints
            .get(&peer.local)
            .or_else(|| endpoints.get(&peer.external))
            .cloned()
    }
}

#[derive(Clone, Debug)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    endpoints: EndpointPair,
}

impl MemoryTransport {
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_endpoints(&self) -> EndpointPair {
        self.endpoints
    }

    async fn connect(&self, peer: &EndpointPair) -> Result<()> {
        if self.network.sender(peer).is_none() {
            bail!("no endpoint bound at {}", peer.external);
        }
        Ok(())
    }

    async fn send(&self, peer: &EndpointPair, bytes: Vec<u8>) -> Result<()> {
        let sender = self
            .network
            .sender(peer)
            .with_context(|| format!("no endpoint bound at {}", peer.external))?;
        trace!(from = %self.endpoints.external, to = %peer.external, len = bytes.len(), "memory send");
        sender
            .send(bytes)
            .await
            .with_context(|| format!("endpoint {} closed", peer.external))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_reach_the_bound_receiver() {
        let network = MemoryNetwork::new();
        let (a, _a_rx) = network.bind().unwrap();
        let (b, mut b_rx) = network.bind().unwrap();
        assert_ne!(a.local_endpoints(), b.local_endpoints());

        a.connect(&b.local_endpoints()).await.unwrap();
        a.send(&b.local_endpoints(), vec![1, 2, 3]).await.unwrap();
        assert_eq!(b_rx.recv().await, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn unbound_endpoints_fail() {
        let network = MemoryNetwork::new();
        let (a, _a_rx) = network.bind().unwrap();
        let (b, b_rx) = network.bind().unwrap();
        let target = b.local_endpoints();

        assert!(network.unbind(&target.local));
        drop(b_rx);
        assert!(a.connect(&target).await.is_err());
        assert!(a.send(&target, vec![0]).await.is_err());
        assert!(network.bind_addr(a.local_endpoints().local).is_err());
    }
}
