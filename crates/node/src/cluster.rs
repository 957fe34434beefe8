//! Cluster state as recorded in the store: members, slots and the leader.

use crate::paths;
use junta_common::NodeId;
use junta_paxos::Membership;
use junta_store::{SnapshotEntry, Store};
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;

fn parse_id(body: &[u8]) -> Option<NodeId> {
    std::str::from_utf8(body).ok()?.parse().ok()
}

fn entries(store: &Store, pattern: &str) -> Vec<SnapshotEntry> {
    match store.walk(pattern) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("walk {} failed: {}", pattern, e);
            Vec::new()
        }
    }
}

/// Peer address of every member.
pub fn members(store: &Store) -> HashMap<NodeId, SocketAddr> {
    entries(store, paths::MEMBERS)
        .into_iter()
        .filter_map(|e| {
            let id = e.path.rsplit('/').next()?.parse().ok()?;
            let addr = std::str::from_utf8(&e.body).ok()?.parse().ok();
            if addr.is_none() {
                tracing::warn!("{} holds no usable address", e.path);
            }
            Some((id, addr?))
        })
        .collect()
}

/// Claimed slots with the seqn each claim was made at.
fn claims(store: &Store) -> Vec<(u64, NodeId)> {
    let mut out: Vec<(u64, NodeId)> = entries(store, paths::SLOTS)
        .into_iter()
        .filter(|e| !e.body.is_empty())
        .filter_map(|e| match parse_id(&e.body) {
            Some(id) => Some((e.version, id)),
            None => {
                tracing::warn!("{} holds an unreadable id", e.path);
                None
            }
        })
        .collect();
    out.sort();
    out
}

/// Holders of slots claimed at or before `seqn`.
pub fn slot_holders(store: &Store, seqn: u64) -> BTreeSet<NodeId> {
    claims(store)
        .into_iter()
        .filter(|&(v, _)| v <= seqn)
        .map(|(_, id)| id)
        .collect()
}

/// The acceptor schedule implied by the slots: a claim made at seqn `v`
/// counts for quorums from `v + alpha` on.
///
/// The store holds slot paths claim-once, so the version of each claimed
/// slot is the seqn of its claim.
pub fn membership(store: &Store, alpha: u64) -> Membership {
    let mut schedule = Membership::new(std::iter::empty());
    let mut acc = BTreeSet::new();
    for (v, id) in claims(store) {
        acc.insert(id);
        schedule.set(v + alpha, acc.clone());
    }
    schedule
}

/// Whether `path` currently holds a claim.
pub fn is_claimed(store: &Store, path: &str) -> bool {
    store.get(path).is_ok_and(|(body, _)| !body.is_empty())
}

/// The id recorded in `/junta/leader`, if any.
pub fn leader(store: &Store) -> Option<NodeId> {
    store.get(paths::LEADER).ok().and_then(|(body, _)| parse_id(&body))
}

/// The first unclaimed slot and its version.
pub fn free_slot(store: &Store) -> Option<(String, u64)> {
    entries(store, paths::SLOTS)
        .into_iter()
        .find(|e| e.body.is_empty())
        .map(|e| (e.path, e.version))
}
