//! Acceptor sets per seqn range and majority quorums.

use junta_common::NodeId;
use std::collections::{BTreeMap, BTreeSet};

static EMPTY: BTreeSet<NodeId> = BTreeSet::new();

/// floor(n/2) + 1.
pub fn quorum(n: usize) -> usize {
    n / 2 + 1
}

/// Which nodes are acceptors for which seqns.
///
/// Each entry `from -> set` applies to `from` and every later seqn until
/// the next entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Membership {
    configs: BTreeMap<u64, BTreeSet<NodeId>>,
}

impl Membership {
    pub fn new(initial: impl IntoIterator<Item = NodeId>) -> Self {
        let mut configs = BTreeMap::new();
        configs.insert(0, initial.into_iter().collect());
        Self { configs }
    }

    /// Install `members` for seqns `from..`, replacing any later entries.
    pub fn set(&mut self, from: u64, members: BTreeSet<NodeId>) {
        if self.at(from) == &members && self.configs.range(from + 1..).next().is_none() {
            return;
        }
        self.configs.split_off(&from);
        self.configs.insert(from, members);
    }

    /// Acceptors for `seqn`.
    pub fn at(&self, seqn: u64) -> &BTreeSet<NodeId> {
        self.configs
            .range(..=seqn)
            .next_back()
            .map(|(_, set)| set)
            .unwrap_or(&EMPTY)
    }

    /// Every node that is an acceptor for some seqn at or after `from`.
    pub fn union_from(&self, from: u64) -> BTreeSet<NodeId> {
        let mut all = self.at(from).clone();
        for (_, set) in self.configs.range(from + 1..) {
            all.extend(set.iter().copied());
        }
        all
    }

    /// Do `voters` form a majority of the acceptors for `seqn`?
    pub fn is_quorum(&self, seqn: u64, voters: &BTreeSet<NodeId>) -> bool {
        is_majority(self.at(seqn), voters)
    }

    /// Do `voters` form a majority of every acceptor set in effect at or
    /// after `from`?
    pub fn is_quorum_from(&self, from: u64, voters: &BTreeSet<NodeId>) -> bool {
        is_majority(self.at(from), voters)
            && self
                .configs
                .range(from + 1..)
                .all(|(_, set)| is_majority(set, voters))
    }

    /// Forget configurations that only cover seqns below `below`.
    pub fn prune(&mut self, below: u64) {
        let Some((&keep, _)) = self.configs.range(..=below).next_back() else {
            return;
        };
        self.configs = self.configs.split_off(&keep);
    }
}

fn is_majority(members: &BTreeSet<NodeId>, voters: &BTreeSet<NodeId>) -> bool {
    !members.is_empty() && members.intersection(voters).count() >= quorum(members.len())
}
