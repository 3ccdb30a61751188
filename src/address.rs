//! # Overlay Address Space
//!
//! Fixed-width 256-bit node identifiers and the XOR metric over them.
//!
//! - [`NodeId`]: opaque identifier, totally ordered by raw value
//! - [`Distance`]: `a XOR b` read as a big-endian unsigned integer
//! - [`NodeKind`]: the role a node plays in the overlay
//!
//! ## Buckets
//!
//! Peers are classed by the position of the highest set bit of their distance to
//! the local id. Bucket `255` holds peers that differ in the very first bit (the
//! farther half of the keyspace), bucket `0` holds the single id that differs only
//! in the last bit. Higher index = farther.
//!
//! ## Invariants
//!
//! - `distance(a, b) == distance(b, a)` and `distance(a, a) == 0`
//! - For a fixed pivot, `x -> distance(pivot, x)` is a bijection, so distinct ids
//!   never tie; ordering still falls back to the raw id for determinism.

use std::cmp::Ordering;

use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// Width of a node identifier in bytes.
pub const ID_BYTES: usize = 32;

/// Width of a node identifier in bits, and the number of distance buckets.
pub const ID_BITS: usize = ID_BYTES * 8;

/// Role of a node in the overlay.
///
/// Only vaults relay traffic and count towards groups. Clients and anonymous
/// nodes are leaves attached to vaults.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Vault,
    Client,
    Anonymous,
}

impl NodeKind {
    #[inline]
    pub fn is_vault(self) -> bool {
        matches!(self, NodeKind::Vault)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct NodeId([u8; ID_BYTES]);

impl NodeId {
    /// The all-zero id. Never a valid node address.
    pub const ZERO: NodeId = NodeId([0u8; ID_BYTES]);

    #[inline]
    pub fn from_bytes(bytes: [u8; ID_BYTES]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }

    /// Generate a random id from the operating system CSPRNG.
    ///
    /// Callers that insert the result into a table must treat a collision with
    /// an existing id as an error rather than ignoring it.
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_BYTES];
        loop {
            OsRng.fill_bytes(&mut bytes);
            if bytes.iter().any(|b| *b != 0) {
                return Self(bytes);
            }
        }
    }

    /// A well-formed address is anything but the all-zero id.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.0.iter().any(|b| *b != 0)
    }

    #[inline]
    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut out = [0u8; ID_BYTES];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != ID_BYTES {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; ID_BYTES];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// First eight hex characters, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; ID_BYTES]> for NodeId {
    fn from(bytes: [u8; ID_BYTES]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// XOR distance between two ids. The derived ordering compares the bytes
/// lexicographically, which is numeric order for a big-endian integer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Distance([u8; ID_BYTES]);

impl Distance {
    #[inline]
    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Number of leading zero bits, i.e. the common prefix length of the two ids.
    pub fn leading_zeros(&self) -> u32 {
        let mut zeros = 0u32;
        for byte in &self.0 {
            if *byte == 0 {
                zeros += 8;
            } else {
                zeros += byte.leading_zeros();
                break;
            }
        }
        zeros
    }
}

#[inline]
pub fn distance(a: &NodeId, b: &NodeId) -> Distance {
    a.distance(b)
}

/// Order `a` and `b` by closeness to `pivot`, ties broken by raw id.
#[inline]
pub fn closeness_cmp(pivot: &NodeId, a: &NodeId, b: &NodeId) -> Ordering {
    pivot
        .distance(a)
        .cmp(&pivot.distance(b))
        .then_with(|| a.cmp(b))
}

/// Distance class of `other` relative to `self_id`; `None` for the id itself.
pub fn bucket_index(self_id: &NodeId, other: &NodeId) -> Option<usize> {
    let dist = self_id.distance(other);
    if dist.is_zero() {
        return None;
    }
    Some(ID_BITS - 1 - dist.leading_zeros() as usize)
}

/// Random id that lands in bucket `bucket_idx` relative to `self_id`.
pub fn random_id_in_bucket(self_id: &NodeId, bucket_idx: usize) -> NodeId {
    let bucket_idx = bucket_idx.min(ID_BITS - 1);
    let mut distance = [0u8; ID_BYTES];
    OsRng.fill_bytes(&mut distance);

    // The highest set bit sits at position `bucket_idx` counted from the right.
    let prefix_bits = ID_BITS - 1 - bucket_idx;
    let byte_idx = prefix_bits / 8;
    let bit_pos = prefix_bits % 8;

    for byte in distance.iter_mut().take(byte_idx) {
        *byte = 0;
    }
    let target_bit = 0x80u8 >> bit_pos;
    let random_mask = target_bit.wrapping_sub(1);
    distance[byte_idx] = target_bit | (distance[byte_idx] & random_mask);

    let self_bytes = self_id.as_bytes();
    let mut target = [0u8; ID_BYTES];
    for i in 0..ID_BYTES {
        target[i] = self_bytes[i] ^ distance[i];
    }
    NodeId(target)
}

/// Build an id from a short prefix, padding with zeros. Handy for tests and fixtures.
pub fn id_with_prefix(prefix: &[u8]) -> NodeId {
    let mut bytes = [0u8; ID_BYTES];
    let len = prefix.len().min(ID_BYTES);
    bytes[..len].copy_from_slice(&prefix[..len]);
    NodeId(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_is_symmetric_and_zero_on_self() {
        for _ in 0..32 {
            let a = NodeId::random();
            let b = NodeId::random();
            assert_eq!(distance(&a, &b), distance(&b, &a));
            assert!(distance(&a, &a).is_zero());
        }
    }

    #[test]
    fn distance_orders_numerically() {
        let pivot = NodeId::ZERO;
        let near = id_with_prefix(&[0x00, 0x01]);
        let far = id_with_prefix(&[0x01]);
        assert_eq!(closeness_cmp(&pivot, &near, &far), Ordering::Less);
        assert_eq!(closeness_cmp(&pivot, &far, &near), Ordering::Greater);
        assert_eq!(closeness_cmp(&pivot, &far, &far), Ordering::Equal);
    }

    #[test]
    fn bucket_index_tracks_highest_differing_bit() {
        let base = NodeId::ZERO;
        assert_eq!(bucket_index(&base, &base), None);
        assert_eq!(bucket_index(&base, &id_with_prefix(&[0x80])), Some(255));
        assert_eq!(bucket_index(&base, &id_with_prefix(&[0x40])), Some(254));
        assert_eq!(bucket_index(&base, &id_with_prefix(&[0x00, 0x01])), Some(240));

        let mut last = [0u8; ID_BYTES];
        last[ID_BYTES - 1] = 1;
        assert_eq!(bucket_index(&base, &NodeId::from_bytes(last)), Some(0));
    }

    #[test]
    fn random_id_in_bucket_lands_in_requested_bucket() {
        let self_id = NodeId::random();
        for bucket in [0usize, 7, 8, 100, 200, 254, 255] {
            let id = random_id_in_bucket(&self_id, bucket);
            assert_eq!(bucket_index(&self_id, &id), Some(bucket));
        }
    }

    #[test]
    fn random_ids_are_valid_and_distinct() {
        let a = NodeId::random();
        let b = NodeId::random();
        assert!(a.is_valid());
        assert_ne!(a, b);
        assert!(!NodeId::ZERO.is_valid());
    }

    #[test]
    fn hex_round_trip() {
        let id = NodeId::random();
        assert_eq!(NodeId::from_hex(&id.to_hex()).unwrap(), id);
        assert!(NodeId::from_hex("abcd").is_err());
    }
}
