//! Full-tree snapshots used to fast-start a joining node.

use crate::codec;
use crate::StoreError;

/// One stored path in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub path: String,
    pub body: Vec<u8>,
    pub version: u64,
}

/// The whole tree as of `seqn`, entries in path order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub seqn: u64,
    pub entries: Vec<SnapshotEntry>,
}

impl Snapshot {
    /// Encode as a proposal value; `Store::apply_encoded(1, blob)` restores it.
    pub fn encode(&self) -> Vec<u8> {
        codec::encode_snapshot(self)
    }

    pub fn decode(raw: &[u8]) -> Result<Self, StoreError> {
        codec::decode_snapshot(raw)
    }
}
