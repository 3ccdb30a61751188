//! Transport trait consumed by the routing core.
//!
//! The core never manages sockets. It needs exactly three things from the
//! layer below: its own endpoint pair, a way to open a session to a peer's
//! endpoints, and a fire-and-forget send of framed bytes.
//!
//! | Operation | Used for |
//! |-----------|----------|
//! | [`Transport::local_endpoints`] | advertised in Connect and FindGroup |
//! | [`Transport::connect`] | executing `Action::Connect` |
//! | [`Transport::send`] | executing `Action::Send` |
//!
//! Inbound frames are handed to the node as a stream of byte buffers; how they
//! arrive is the transport's business.

use anyhow::Result;
use async_trait::async_trait;

use crate::messages::EndpointPair;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Local and externally visible addresses of this node.
    fn local_endpoints(&self) -> EndpointPair;

    /// Open (or confirm) a session to `peer`.
    async fn connect(&self, peer: &EndpointPair) -> Result<()>;

    /// Send one framed message. Completion means the bytes were handed off,
    /// not that the peer processed them.
    async fn send(&self, peer: &EndpointPair, bytes: Vec<u8>) -> Result<()>;
}
