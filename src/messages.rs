//! # Message Envelope
//!
//! Every frame on the wire is the bincode encoding of
//! `(MessageHeader, MessageTypeTag, payload)`, where `payload` is itself the
//! bincode encoding of one of the message structs below.
//!
//! | Tag | Payload | Purpose |
//! |-----|---------|---------|
//! | `Connect` | [`Connect`] | propose a table entry to a peer |
//! | `ConnectResponse` | [`ConnectResponse`] | signed answer to a `Connect` |
//! | `FindGroup` | [`FindGroup`] | ask for the peers closest to a target |
//! | `FindGroupResponse` | [`FindGroupResponse`] | the closest peers known to the responder |
//! | `Post` | [`Post`] | opaque application data |
//!
//! ## Checksums
//!
//! Sealing is two pure steps: [`compute_checksum`] hashes the serialized payload
//! (MurmurHash2, integrity only), then [`MessageHeader::with_checksum`] writes the
//! hash into `checksums[checksum_index]`. [`open`] validates the source address
//! before reading anything else, then recomputes the hash.
//!
//! ## Limits
//!
//! Decoding is bounded by the frame length, so a forged length prefix cannot
//! force an allocation larger than the bytes actually received.

use std::net::SocketAddr;

use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::address::{NodeId, NodeKind};
use crate::error::{ParseError, SealError};
use crate::identity::PublicKey;

/// Slots in the header checksum array.
pub const CHECKSUM_SLOTS: usize = 4;

fn encode_options() -> impl Options {
    bincode::DefaultOptions::new().with_fixint_encoding()
}

fn bincode_options(limit: u64) -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(limit)
        .with_fixint_encoding()
}

/// Deserialize with the buffer length as the allocation bound.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options(bytes.len() as u64).deserialize(bytes)
}

// ============================================================================
// Addressing
// ============================================================================

/// Local and externally visible address of a peer, as reported by the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointPair {
    pub local: SocketAddr,
    pub external: SocketAddr,
}

impl EndpointPair {
    pub fn new(local: SocketAddr, external: SocketAddr) -> Self {
        Self { local, external }
    }

    /// Both halves set to the same address, for peers without NAT.
    pub fn single(addr: SocketAddr) -> Self {
        Self {
            local: addr,
            external: addr,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Destination {
    /// A single node id. Every session advertising the id gets a copy.
    Node(NodeId),
    /// The `node_group_size` vaults closest to the pivot.
    Group(NodeId),
    /// Reply path to a node that is reachable only through `relay`.
    Relay { relay: NodeId, target: NodeId },
}

impl Destination {
    /// The id the message is routed towards.
    pub fn target(&self) -> NodeId {
        match self {
            Destination::Node(id) | Destination::Group(id) => *id,
            Destination::Relay { target, .. } => *target,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Source {
    pub node: NodeId,
    pub kind: NodeKind,
    /// Pivot of the group this copy was fanned out for, if any.
    pub group: Option<NodeId>,
    /// Vault through which replies reach `node`.
    pub relay: Option<NodeId>,
}

impl Source {
    pub fn new(node: NodeId, kind: NodeKind) -> Self {
        Self {
            node,
            kind,
            group: None,
            relay: None,
        }
    }

    pub fn with_relay(mut self, relay: Option<NodeId>) -> Self {
        self.relay = relay;
        self
    }

    pub fn is_valid(&self) -> bool {
        self.node.is_valid()
            && self.relay.is_none_or(|r| r.is_valid())
            && self.group.is_none_or(|g| g.is_valid())
    }
}

// ============================================================================
// Header
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub destination: Destination,
    pub source: Source,
    pub message_id: u32,
    pub checksums: [u32; CHECKSUM_SLOTS],
    pub checksum_index: u8,
    pub hops_remaining: u16,
    /// Most recent relayers, oldest first.
    pub route_history: Vec<NodeId>,
}

impl MessageHeader {
    /// Header for a new logical message. `message_id` is chosen once per message,
    /// never per hop; see [`new_message_id`].
    pub fn build(
        destination: Destination,
        source: Source,
        message_id: u32,
        hops_to_live: u16,
    ) -> Self {
        Self {
            destination,
            source,
            message_id,
            checksums: [0; CHECKSUM_SLOTS],
            checksum_index: 0,
            hops_remaining: hops_to_live,
            route_history: Vec::new(),
        }
    }

    pub fn with_checksum(mut self, index: u8, checksum: u32) -> Self {
        if let Some(slot) = self.checksums.get_mut(index as usize) {
            *slot = checksum;
            self.checksum_index = index;
        }
        self
    }

    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.destination = destination;
        self
    }

    pub fn with_source_group(mut self, group: Option<NodeId>) -> Self {
        self.source.group = group;
        self
    }

    /// Append a relayer, keeping at most `cap` entries.
    pub fn with_relayer(mut self, relayer: NodeId, cap: usize) -> Self {
        if cap == 0 {
            return self;
        }
        self.route_history.retain(|id| *id != relayer);
        self.route_history.push(relayer);
        if self.route_history.len() > cap {
            let excess = self.route_history.len() - cap;
            self.route_history.drain(..excess);
        }
        self
    }

    pub fn expected_checksum(&self) -> Option<u32> {
        self.checksums.get(self.checksum_index as usize).copied()
    }
}

/// Fresh random 32-bit id for a logical message.
pub fn new_message_id() -> u32 {
    rand::random()
}

// ============================================================================
// Payloads
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageTypeTag {
    Connect,
    ConnectResponse,
    FindGroup,
    FindGroupResponse,
    Post,
}

/// A payload struct with a fixed type tag.
pub trait WireMessage: Serialize + DeserializeOwned {
    const TYPE_TAG: MessageTypeTag;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connect {
    pub requester_endpoints: EndpointPair,
    pub receiver_id: NodeId,
    pub requester_public_key: PublicKey,
}

impl WireMessage for Connect {
    const TYPE_TAG: MessageTypeTag = MessageTypeTag::Connect;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub requester_id: NodeId,
    pub receiver_id: NodeId,
    pub receiver_endpoints: EndpointPair,
    pub receiver_public_key: PublicKey,
    pub accepted: bool,
    /// Signature over [`ConnectResponse::signing_bytes`].
    pub signature: Vec<u8>,
}

impl ConnectResponse {
    /// Bytes covered by the responder's signature. Binding the exchange's
    /// message id stops a response from being replayed into another exchange.
    pub fn signing_bytes(
        message_id: u32,
        requester_id: &NodeId,
        receiver_id: &NodeId,
        accepted: bool,
    ) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + 32 + 32 + 1);
        out.extend_from_slice(&message_id.to_be_bytes());
        out.extend_from_slice(requester_id.as_bytes());
        out.extend_from_slice(receiver_id.as_bytes());
        out.push(accepted as u8);
        out
    }
}

impl WireMessage for ConnectResponse {
    const TYPE_TAG: MessageTypeTag = MessageTypeTag::ConnectResponse;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindGroup {
    pub target: NodeId,
    pub requester_endpoints: EndpointPair,
    pub requester_public_key: PublicKey,
}

impl WireMessage for FindGroup {
    const TYPE_TAG: MessageTypeTag = MessageTypeTag::FindGroup;
}

/// A peer as advertised in a FindGroup response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub id: NodeId,
    pub endpoints: EndpointPair,
    pub public_key: PublicKey,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindGroupResponse {
    pub target: NodeId,
    pub group: Vec<PeerRecord>,
}

impl WireMessage for FindGroupResponse {
    const TYPE_TAG: MessageTypeTag = MessageTypeTag::FindGroupResponse;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub data: Vec<u8>,
}

impl WireMessage for Post {
    const TYPE_TAG: MessageTypeTag = MessageTypeTag::Post;
}

// ============================================================================
// Checksum
// ============================================================================

/// 32-bit MurmurHash2 (Appleby), little-endian block reads.
pub fn murmur_hash2(data: &[u8], seed: u32) -> u32 {
    const M: u32 = 0x5bd1_e995;
    const R: u32 = 24;

    let mut h = seed ^ (data.len() as u32);

    let mut blocks = data.chunks_exact(4);
    for block in &mut blocks {
        let mut k = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);

        h = h.wrapping_mul(M);
        h ^= k;
    }

    let tail = blocks.remainder();
    if tail.len() >= 3 {
        h ^= (tail[2] as u32) << 16;
    }
    if tail.len() >= 2 {
        h ^= (tail[1] as u32) << 8;
    }
    if !tail.is_empty() {
        h ^= tail[0] as u32;
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h
}

#[inline]
pub fn compute_checksum(payload: &[u8]) -> u32 {
    murmur_hash2(payload, 0)
}

// ============================================================================
// Seal / open
// ============================================================================

pub fn encode_payload<M: WireMessage>(message: &M) -> Result<Vec<u8>, SealError> {
    encode_options()
        .serialize(message)
        .map_err(|e| SealError::Encode(e.to_string()))
}

/// Frame already-serialized payload bytes under `header`.
///
/// The header's checksum slot is rewritten from `payload`, so a relay can
/// re-seal a header it modified without touching the payload.
pub fn seal(
    header: MessageHeader,
    type_tag: MessageTypeTag,
    payload: &[u8],
    max_data_size: usize,
) -> Result<Vec<u8>, SealError> {
    if payload.len() > max_data_size {
        return Err(SealError::TooLarge {
            size: payload.len(),
            max: max_data_size,
        });
    }
    let index = header.checksum_index;
    let header = header.with_checksum(index, compute_checksum(payload));
    encode_options()
        .serialize(&(&header, type_tag, payload))
        .map_err(|e| SealError::Encode(e.to_string()))
}

pub fn seal_payload<M: WireMessage>(
    header: MessageHeader,
    message: &M,
    max_data_size: usize,
) -> Result<Vec<u8>, SealError> {
    let payload = encode_payload(message)?;
    seal(header, M::TYPE_TAG, &payload, max_data_size)
}

/// A frame whose header and checksum have been verified.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub header: MessageHeader,
    pub type_tag: MessageTypeTag,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn parse<M: WireMessage>(&self) -> Result<M, ParseError> {
        if self.type_tag != M::TYPE_TAG {
            return Err(ParseError::UnexpectedType {
                expected: M::TYPE_TAG,
                found: self.type_tag,
            });
        }
        deserialize_bounded(&self.payload).map_err(|e| ParseError::Malformed(e.to_string()))
    }
}

/// Parse and verify a frame.
///
/// The source address is validated before any other header field is trusted;
/// the checksum is verified before the payload is handed out.
pub fn open(bytes: &[u8]) -> Result<Envelope, ParseError> {
    let limit = bytes.len() as u64;
    let mut reader = bytes;

    let header: MessageHeader = bincode_options(limit)
        .deserialize_from(&mut reader)
        .map_err(|_| ParseError::InvalidHeader)?;
    if !header.source.is_valid() {
        return Err(ParseError::InvalidHeader);
    }
    let expected = header
        .expected_checksum()
        .ok_or(ParseError::InvalidHeader)?;

    let type_tag: MessageTypeTag = bincode_options(limit)
        .deserialize_from(&mut reader)
        .map_err(|e| ParseError::Malformed(e.to_string()))?;
    let payload: Vec<u8> = bincode_options(limit)
        .deserialize_from(&mut reader)
        .map_err(|e| ParseError::Malformed(e.to_string()))?;
    if !reader.is_empty() {
        return Err(ParseError::Malformed(format!(
            "{} trailing bytes",
            reader.len()
        )));
    }

    if compute_checksum(&payload) != expected {
        return Err(ParseError::ChecksumMismatch);
    }

    Ok(Envelope {
        header,
        type_tag,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints(port: u16) -> EndpointPair {
        EndpointPair::single(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    fn header() -> MessageHeader {
        MessageHeader::build(
            Destination::Group(NodeId::random()),
            Source::new(NodeId::random(), NodeKind::Vault),
            new_message_id(),
            20,
        )
    }

    #[test]
    fn murmur_hash2_basics() {
        assert_eq!(murmur_hash2(&[], 0), 0);
        assert_eq!(murmur_hash2(b"payload", 0), murmur_hash2(b"payload", 0));
        assert_ne!(murmur_hash2(b"payload", 0), murmur_hash2(b"payload", 1));
        assert_ne!(murmur_hash2(b"abc", 0), murmur_hash2(b"abd", 0));
        // every tail length goes through a distinct branch
        let hashes: Vec<u32> = (0..8).map(|n| murmur_hash2(&b"abcdefgh"[..n], 0)).collect();
        for i in 0..hashes.len() {
            for j in (i + 1)..hashes.len() {
                assert_ne!(hashes[i], hashes[j]);
            }
        }
    }

    #[test]
    fn with_checksum_is_pure() {
        let h = header();
        let patched = h.clone().with_checksum(2, 0xdead_beef);
        assert_eq!(h.checksums, [0; CHECKSUM_SLOTS]);
        assert_eq!(patched.checksums[2], 0xdead_beef);
        assert_eq!(patched.checksum_index, 2);
        assert_eq!(patched.expected_checksum(), Some(0xdead_beef));

        let ignored = h.clone().with_checksum(CHECKSUM_SLOTS as u8, 1);
        assert_eq!(ignored, h);
    }

    #[test]
    fn seal_then_open_restores_header_and_payload() {
        let h = header();
        let connect = Connect {
            requester_endpoints: endpoints(4000),
            receiver_id: NodeId::random(),
            requester_public_key: PublicKey::from_bytes([7; 32]),
        };
        let payload = encode_payload(&connect).unwrap();
        let bytes = seal(h.clone(), MessageTypeTag::Connect, &payload, 1 << 20).unwrap();

        let envelope = open(&bytes).unwrap();
        assert_eq!(envelope.header, h.with_checksum(0, compute_checksum(&payload)));
        assert_eq!(envelope.type_tag, MessageTypeTag::Connect);
        assert_eq!(envelope.payload, payload);
        assert_eq!(envelope.parse::<Connect>().unwrap(), connect);
    }

    #[test]
    fn parse_checks_type_tag() {
        let bytes = seal_payload(header(), &Post { data: vec![1, 2, 3] }, 1 << 20).unwrap();
        let envelope = open(&bytes).unwrap();
        assert!(matches!(
            envelope.parse::<Connect>(),
            Err(ParseError::UnexpectedType {
                expected: MessageTypeTag::Connect,
                found: MessageTypeTag::Post
            })
        ));
        assert_eq!(envelope.parse::<Post>().unwrap().data, vec![1, 2, 3]);
    }

    #[test]
    fn flipped_payload_bits_fail_checksum() {
        let data: Vec<u8> = (0..64).collect();
        let bytes = seal_payload(header(), &Post { data }, 1 << 20).unwrap();
        // the serialized Post is the tail of the frame: 8-byte length prefix + 64 data bytes
        let payload_start = bytes.len() - 72;
        for offset in payload_start..bytes.len() {
            for bit in [0u8, 3, 7] {
                let mut tampered = bytes.clone();
                tampered[offset] ^= 1 << bit;
                assert_eq!(open(&tampered), Err(ParseError::ChecksumMismatch));
            }
        }
    }

    #[test]
    fn invalid_source_is_rejected_first() {
        let mut h = header();
        h.source.node = NodeId::ZERO;
        let bytes = seal_payload(h, &Post { data: vec![0; 4] }, 1 << 20).unwrap();
        assert_eq!(open(&bytes), Err(ParseError::InvalidHeader));

        // a zero source wins over a broken checksum
        let mut corrupted = bytes.clone();
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0xff;
        assert_eq!(open(&corrupted), Err(ParseError::InvalidHeader));
    }

    #[test]
    fn truncated_and_padded_frames_are_rejected() {
        let bytes = seal_payload(header(), &Post { data: vec![9; 16] }, 1 << 20).unwrap();
        assert!(matches!(open(&bytes[..bytes.len() - 1]), Err(ParseError::Malformed(_))));
        assert_eq!(open(&bytes[..4]), Err(ParseError::InvalidHeader));

        let mut padded = bytes.clone();
        padded.push(0);
        assert!(matches!(open(&padded), Err(ParseError::Malformed(_))));
    }

    #[test]
    fn seal_enforces_max_data_size() {
        let err = seal_payload(header(), &Post { data: vec![0; 128] }, 64).unwrap_err();
        assert!(matches!(err, SealError::TooLarge { max: 64, .. }));
    }

    #[test]
    fn route_history_is_capped_and_deduplicated() {
        let ids: Vec<NodeId> = (0..7).map(|_| NodeId::random()).collect();
        let mut h = header();
        for id in &ids {
            h = h.with_relayer(*id, 5);
        }
        assert_eq!(h.route_history, ids[2..].to_vec());

        let h = h.with_relayer(ids[3], 5);
        assert_eq!(h.route_history.last(), Some(&ids[3]));
        assert_eq!(h.route_history.len(), 5);
        assert_eq!(h.route_history.iter().filter(|id| **id == ids[3]).count(), 1);
    }

    #[test]
    fn connect_response_signing_bytes_bind_the_exchange() {
        let a = NodeId::random();
        let b = NodeId::random();
        let base = ConnectResponse::signing_bytes(1, &a, &b, true);
        assert_ne!(base, ConnectResponse::signing_bytes(2, &a, &b, true));
        assert_ne!(base, ConnectResponse::signing_bytes(1, &b, &a, true));
        assert_ne!(base, ConnectResponse::signing_bytes(1, &a, &b, false));
    }
}
