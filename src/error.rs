//! Typed failures of the routing core.
//!
//! None of these are fatal. Parse failures are logged and dropped by the
//! forwarding engine; table and route outcomes are ordinary values.

use crate::messages::MessageTypeTag;

/// Why an inbound frame was rejected by `open`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid message header: source address is not well formed")]
    InvalidHeader,

    #[error("payload checksum mismatch")]
    ChecksumMismatch,

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("unexpected message type: expected {expected:?}, got {found:?}")]
    UnexpectedType {
        expected: MessageTypeTag,
        found: MessageTypeTag,
    },
}

/// Why an outbound message could not be framed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SealError {
    #[error("failed to encode message: {0}")]
    Encode(String),

    #[error("payload too large: {size} bytes exceeds {max}")]
    TooLarge { size: usize, max: usize },
}

/// Why a peer table insert was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TableError {
    #[error("node id already present")]
    DuplicateId,

    #[error("table full and no eviction candidate qualifies")]
    TableFull,

    #[error("peer id is not valid for this table")]
    InvalidPeer,

    #[error("table is not accepting this kind of peer")]
    NotAccepting,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid routing configuration: {0}")]
    Invalid(&'static str),

    #[error("{0} must be non-zero")]
    ZeroInterval(&'static str),
}
