//! Replicated store for junta: a versioned hierarchical key/value tree.
//!
//! The store is a deterministic state machine. It consumes the ordered
//! stream of decided mutations (`apply`), enforces compare-and-swap on
//! version numbers, and fans every change out to glob-pattern watchers.
//! It knows nothing about consensus; it only ever sees values that were
//! already decided and ordered.

pub mod codec;
pub mod event;
pub mod glob;
pub mod mutation;
pub mod path;
pub mod snapshot;
pub mod store;
mod tree;
pub mod watch;

pub use event::{Change, Event};
pub use glob::Glob;
pub use mutation::{Cas, Command, Mutation, MutationKind};
pub use snapshot::{Snapshot, SnapshotEntry};
pub use store::{ApplyOutcome, Store, StoreOptions, Waiter};
pub use watch::{Fanout, Subscription, WatchPolicy};

/// Errors surfaced by the store. None of them are fatal to the process.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("cas mismatch on {path}: expected {expected}, found {found}")]
    CasMismatch {
        path: String,
        expected: Cas,
        found: Cas,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("malformed: {0}")]
    Malformed(String),

    #[error("{0} is already claimed")]
    Claimed(String),
}
