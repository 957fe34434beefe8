//! Events produced by applying a mutation at a seqn.

use crate::StoreError;

/// What a single applied seqn did to the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Set {
        path: String,
        body: Vec<u8>,
        version: u64,
    },
    /// `version` is the seqn of the delete.
    Delete { path: String, version: u64 },
    Nop,
    /// A decided mutation whose guard failed at apply time. The seqn is
    /// consumed but the tree is unchanged.
    Rejected { path: String, error: StoreError },
}

/// Result of applying the mutation decided for `seqn`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub seqn: u64,
    pub change: Change,
    pub request_id: Option<String>,
}

impl Event {
    /// The path touched, if any.
    pub fn path(&self) -> Option<&str> {
        match &self.change {
            Change::Set { path, .. } | Change::Delete { path, .. } => Some(path),
            Change::Rejected { path, .. } => Some(path),
            Change::Nop => None,
        }
    }

    /// Whether this event changed the tree (and so goes to watchers).
    pub fn is_change(&self) -> bool {
        matches!(self.change, Change::Set { .. } | Change::Delete { .. })
    }

    /// The error carried by a rejected mutation.
    pub fn error(&self) -> Option<&StoreError> {
        match &self.change {
            Change::Rejected { error, .. } => Some(error),
            _ => None,
        }
    }
}
