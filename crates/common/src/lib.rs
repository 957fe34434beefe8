//! junta-common: shared types for the junta coordination daemon.
//!
//! Provides the 160-bit `NodeId` that names every cluster member (it is
//! also the path segment under `/junta/members/`), plus the transport
//! error shared by the consensus engine and the network layer.

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;
use std::str::FromStr;

/// Number of bits in a node identifier.
pub const ID_BITS: usize = 160;

/// Number of bytes in a node identifier.
pub const ID_BYTES: usize = ID_BITS / 8; // 20

// ---------------------------------------------------------------------------
// NodeId
// ---------------------------------------------------------------------------

/// A 160-bit node identifier, rendered as 40 lowercase hex digits.
///
/// Ordering is big-endian byte order; ballots break ties on it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId([u8; ID_BYTES]);

impl NodeId {
    /// The all-zeros identifier. Never assigned to a live node.
    pub const ZERO: Self = Self([0u8; ID_BYTES]);

    /// Create a `NodeId` from raw bytes.
    pub fn from_bytes(bytes: [u8; ID_BYTES]) -> Self {
        Self(bytes)
    }

    /// Create a `NodeId` from a byte slice of exactly [`ID_BYTES`] bytes.
    pub fn from_slice(raw: &[u8]) -> Result<Self, ParseNodeIdError> {
        if raw.len() != ID_BYTES {
            return Err(ParseNodeIdError::Length(raw.len()));
        }
        let mut bytes = [0u8; ID_BYTES];
        bytes.copy_from_slice(raw);
        Ok(Self(bytes))
    }

    /// Return the raw bytes.
    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }

    /// Generate a random `NodeId`.
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_BYTES];
        rand::thread_rng().fill(&mut bytes);
        Self(bytes)
    }

    /// Create a `NodeId` by SHA-1 hashing arbitrary data.
    pub fn from_sha1(data: &[u8]) -> Self {
        let hash = Sha1::digest(data);
        let mut bytes = [0u8; ID_BYTES];
        bytes.copy_from_slice(&hash);
        Self(bytes)
    }

    /// Full 40-digit hex form, as used in store paths.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse the 40-digit hex form.
    pub fn from_hex(s: &str) -> Result<Self, ParseNodeIdError> {
        let raw = hex::decode(s).map_err(|_| ParseNodeIdError::Hex(s.to_string()))?;
        Self::from_slice(&raw)
    }
}

impl FromStr for NodeId {
    type Err = ParseNodeIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Show first 4 bytes as hex for readability
        for byte in &self.0[..4] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "…")
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseNodeIdError {
    #[error("node id must be {ID_BYTES} bytes, got {0}")]
    Length(usize),
    #[error("node id is not valid hex: {0:?}")]
    Hex(String),
}

/// Failure to hand a message to the network. Delivery is best-effort, so
/// callers log these and rely on ballot retries rather than resending.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no address known for peer {0}")]
    UnknownPeer(NodeId),

    #[error("message to {0} dropped")]
    Dropped(NodeId),

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let id = NodeId::random();
        let hex = id.to_hex();
        assert_eq!(hex.len(), ID_BYTES * 2);
        assert_eq!(NodeId::from_hex(&hex).unwrap(), id);
        assert_eq!(hex.parse::<NodeId>().unwrap(), id);
    }

    #[test]
    fn test_from_hex_rejects_garbage() {
        assert!(matches!(
            NodeId::from_hex("zz"),
            Err(ParseNodeIdError::Hex(_))
        ));
        assert_eq!(
            NodeId::from_hex("abcd"),
            Err(ParseNodeIdError::Length(2))
        );
    }

    #[test]
    fn test_ordering_is_big_endian() {
        let mut lo = [0u8; ID_BYTES];
        lo[ID_BYTES - 1] = 0xFF;
        let mut hi = [0u8; ID_BYTES];
        hi[0] = 0x01;
        assert!(NodeId::from_bytes(lo) < NodeId::from_bytes(hi));
        assert!(NodeId::ZERO < NodeId::from_bytes(lo));
    }

    #[test]
    fn test_node_id_from_sha1() {
        let id = NodeId::from_sha1(b"hello");
        assert_ne!(id, NodeId::ZERO);
        assert_eq!(id, NodeId::from_sha1(b"hello"));
        assert_ne!(id, NodeId::from_sha1(b"world"));
    }

    #[test]
    fn test_node_id_random_uniqueness() {
        let ids: Vec<NodeId> = (0..1000).map(|_| NodeId::random()).collect();
        let unique: std::collections::HashSet<NodeId> = ids.iter().copied().collect();
        assert_eq!(unique.len(), 1000, "expected 1000 unique random IDs");
    }

    #[test]
    fn test_display_and_debug() {
        let mut bytes = [0u8; ID_BYTES];
        bytes[0] = 0xAB;
        bytes[1] = 0xCD;
        let id = NodeId::from_bytes(bytes);
        let s = format!("{}", id);
        assert!(s.starts_with("abcd"));
        assert!(s.contains("…"), "Display should truncate with …");

        let d = format!("{:?}", id);
        assert!(d.starts_with("NodeId("), "Debug should start with NodeId(");
    }

    #[test]
    fn test_serde_roundtrip() {
        let id = NodeId::random();
        let json = serde_json::to_string(&id).unwrap();
        let id2: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, id2);
    }
}
