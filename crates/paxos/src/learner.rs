//! The learner role: tallies votes and releases decisions in seqn order.

use crate::ballot::Ballot;
use crate::membership::Membership;
use junta_common::NodeId;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug)]
pub struct Learner {
    /// Everything `..=decided_through` has been released.
    decided_through: u64,
    /// Decided values waiting for the gap before them to close.
    ready: BTreeMap<u64, Vec<u8>>,
    /// Recently released values, kept to answer `Fetch`.
    retained: BTreeMap<u64, Vec<u8>>,
    retain: usize,
    tallies: BTreeMap<u64, BTreeMap<Ballot, (Vec<u8>, BTreeSet<NodeId>)>>,
    /// Highest seqn any peer has reported as decided.
    reported: u64,
}

impl Learner {
    pub fn new(start: u64, retain: usize) -> Self {
        Self {
            decided_through: start,
            ready: BTreeMap::new(),
            retained: BTreeMap::new(),
            retain,
            tallies: BTreeMap::new(),
            reported: start,
        }
    }

    pub fn decided_through(&self) -> u64 {
        self.decided_through
    }

    pub fn is_decided(&self, seqn: u64) -> bool {
        seqn <= self.decided_through || self.ready.contains_key(&seqn)
    }

    /// The decided value at `seqn`, if this learner still has it.
    pub fn decided(&self, seqn: u64) -> Option<&[u8]> {
        self.retained
            .get(&seqn)
            .or_else(|| self.ready.get(&seqn))
            .map(Vec::as_slice)
    }

    /// Count a vote. Returns `true` when it completes a quorum.
    pub fn on_accepted(
        &mut self,
        seqn: u64,
        ballot: Ballot,
        from: NodeId,
        value: Vec<u8>,
        members: &Membership,
    ) -> bool {
        if self.is_decided(seqn) {
            return false;
        }
        let entry = self
            .tallies
            .entry(seqn)
            .or_default()
            .entry(ballot)
            .or_insert_with(|| (value, BTreeSet::new()));
        entry.1.insert(from);
        if members.is_quorum(seqn, &entry.1) {
            let value = entry.0.clone();
            self.decide(seqn, value)
        } else {
            false
        }
    }

    /// Record that `value` is decided at `seqn`. Returns `false` if the
    /// seqn was already known.
    pub fn decide(&mut self, seqn: u64, value: Vec<u8>) -> bool {
        if self.is_decided(seqn) {
            return false;
        }
        self.tallies.remove(&seqn);
        self.ready.insert(seqn, value);
        self.reported = self.reported.max(seqn);
        true
    }

    /// Hand out every decision that is now contiguous with the prefix.
    pub fn release(&mut self) -> Vec<(u64, Vec<u8>)> {
        let mut out = Vec::new();
        while let Some(value) = self.ready.remove(&(self.decided_through + 1)) {
            self.decided_through += 1;
            self.retained.insert(self.decided_through, value.clone());
            out.push((self.decided_through, value));
        }
        while self.retained.len() > self.retain {
            self.retained.pop_first();
        }
        if !out.is_empty() {
            self.tallies = self.tallies.split_off(&(self.decided_through + 1));
        }
        out
    }

    /// A peer says everything through `seqn` is decided.
    pub fn note_progress(&mut self, seqn: u64) {
        self.reported = self.reported.max(seqn);
    }

    /// Highest seqn known to be decided somewhere.
    pub fn highest_known(&self) -> u64 {
        let buffered = self.ready.keys().next_back().copied().unwrap_or(0);
        self.reported.max(buffered).max(self.decided_through)
    }

    /// Is some decided seqn missing below one we know about?
    pub fn has_gap(&self) -> bool {
        self.highest_known() > self.decided_through
    }
}
