//! # Connect Handshake Bookkeeping
//!
//! Each outstanding proposal is keyed by `(message_id, receiver_id)` and moves
//! through:
//!
//! ```text
//! Proposed --sent--> Pending --response--> Accepted (record removed)
//!                       \----timeout-----> Pruned   (record removed)
//! ```
//!
//! No retry happens here: a caller that still wants the peer starts a new
//! `Proposed` cycle. The map has its own lock so handshake traffic never waits
//! on the peer table.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

use crate::address::NodeId;
use crate::messages::EndpointPair;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ExchangeKey {
    pub message_id: u32,
    pub receiver_id: NodeId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    Proposed,
    Pending { sent_at: Instant },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingConnect {
    pub state: HandshakeState,
    /// Endpoints advertised in the Connect.
    pub endpoints_sent: EndpointPair,
    pub proposed_at: Instant,
}

impl PendingConnect {
    fn deadline(&self, timeout: Duration) -> Instant {
        match self.state {
            HandshakeState::Proposed => self.proposed_at + timeout,
            HandshakeState::Pending { sent_at } => sent_at + timeout,
        }
    }
}

/// Outcome of matching a response against the pending map.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    Accepted(PendingConnect),
    /// No record: never proposed, already resolved, or already pruned.
    Unknown,
    /// The record existed but its timer had already fired.
    Expired,
}

#[derive(Debug)]
pub struct ConnectHandshake {
    prune_timeout: Duration,
    records: Mutex<HashMap<ExchangeKey, PendingConnect>>,
}

impl ConnectHandshake {
    pub fn new(prune_timeout: Duration) -> Self {
        Self {
            prune_timeout,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Record a new proposal. Returns `false` if the exchange already exists.
    pub fn propose(&self, key: ExchangeKey, endpoints_sent: EndpointPair, now: Instant) -> bool {
        let mut records = self.records.lock();
        if records.contains_key(&key) {
            return false;
        }
        records.insert(
            key,
            PendingConnect {
                state: HandshakeState::Proposed,
                endpoints_sent,
                proposed_at: now,
            },
        );
        true
    }

    /// The Connect left this node; the prune timer starts now.
    pub fn mark_pending(&self, key: &ExchangeKey, now: Instant) -> bool {
        match self.records.lock().get_mut(key) {
            Some(record) => {
                record.state = HandshakeState::Pending { sent_at: now };
                true
            }
            None => false,
        }
    }

    /// Drop a proposal that could not be sent.
    pub fn abandon(&self, key: &ExchangeKey) -> bool {
        self.records.lock().remove(key).is_some()
    }

    /// Match a response. The record is removed whatever the outcome.
    pub fn resolve(&self, key: &ExchangeKey, now: Instant) -> Resolution {
        let Some(record) = self.records.lock().remove(key) else {
            return Resolution::Unknown;
        };
        if now >= record.deadline(self.prune_timeout) {
            trace!(message_id = key.message_id, "connect response arrived after deadline");
            return Resolution::Expired;
        }
        Resolution::Accepted(record)
    }

    /// Remove every record whose timer has fired.
    pub fn prune(&self, now: Instant) -> Vec<ExchangeKey> {
        let timeout = self.prune_timeout;
        let mut pruned = Vec::new();
        self.records.lock().retain(|key, record| {
            if now >= record.deadline(timeout) {
                pruned.push(*key);
                false
            } else {
                true
            }
        });
        if !pruned.is_empty() {
            trace!(count = pruned.len(), "pruned unanswered connects");
        }
        pruned
    }

    /// Whether any exchange with `receiver_id` is outstanding.
    pub fn is_pending_for(&self, receiver_id: &NodeId) -> bool {
        self.records.lock().keys().any(|k| k.receiver_id == *receiver_id)
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}
