//! Founding a new cluster.
//!
//! The founder writes the first records straight into its own store,
//! without consensus: there is nobody to agree with yet. It then skips
//! `alpha` seqns with no-ops so the slot it claimed is already in force
//! when its engine opens the first instance.

use crate::paths;
use junta_common::NodeId;
use junta_store::{Cas, Command, Mutation, Store, StoreError};
use std::net::SocketAddr;

fn apply_local(store: &Store, command: impl Into<Command>) -> Result<u64, StoreError> {
    let seqn = store.seqn() + 1;
    let outcome = store.apply(seqn, command);
    if let Some(err) = outcome.events().iter().find_map(|e| e.error()) {
        return Err(err.clone());
    }
    Ok(seqn)
}

/// Seed `store` as the only member of a fresh cluster. Returns the last
/// seqn written; the engine starts right after it.
pub fn found(
    store: &Store,
    id: NodeId,
    addr: SocketAddr,
    slots: usize,
    alpha: u64,
) -> Result<u64, StoreError> {
    let me = id.to_hex();
    apply_local(store, Mutation::set(paths::public_addr(&id), addr.to_string(), Cas::Missing))?;
    apply_local(store, Mutation::set(paths::member(&id), addr.to_string(), Cas::Missing))?;
    apply_local(store, Mutation::set(paths::slot(1), me.clone(), Cas::Missing))?;
    apply_local(store, Mutation::set(paths::LEADER, me, Cas::Missing))?;
    for n in 2..=slots {
        apply_local(store, Mutation::set(paths::slot(n), Vec::new(), Cas::Missing))?;
    }

    let mut last = store.seqn();
    for _ in 0..alpha {
        last = apply_local(store, Mutation::nop())?;
    }
    tracing::info!("founded cluster as {}; first free seqn is {}", id, last + 1);
    Ok(last)
}
