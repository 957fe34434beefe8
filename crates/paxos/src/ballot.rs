//! Ballot numbers: `(round, proposer)` pairs ordered lexicographically.

use junta_common::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A totally ordered proposer round identifier.
///
/// Two proposers never share a ballot because the proposer id is part of
/// it. Field order matters: the derived `Ord` compares `round` first.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Ballot {
    pub round: u64,
    pub node: NodeId,
}

impl Ballot {
    /// Lower than every ballot a proposer can issue.
    pub const ZERO: Ballot = Ballot {
        round: 0,
        node: NodeId::ZERO,
    };

    pub fn new(round: u64, node: NodeId) -> Self {
        Self { round, node }
    }

    /// The smallest ballot owned by `node` that beats `self`.
    pub fn successor(self, node: NodeId) -> Self {
        Self {
            round: self.round + 1,
            node,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl fmt::Display for Ballot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.round, self.node)
    }
}

impl fmt::Debug for Ballot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ballot({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(b: u8) -> NodeId {
        NodeId::from_bytes([b; 20])
    }

    #[test]
    fn test_round_dominates_node() {
        assert!(Ballot::new(2, id(1)) > Ballot::new(1, id(9)));
        assert!(Ballot::new(1, id(2)) > Ballot::new(1, id(1)));
    }

    #[test]
    fn test_successor_beats_any_same_round() {
        let seen = Ballot::new(4, id(200));
        let mine = seen.successor(id(1));
        assert!(mine > seen);
        assert_eq!(mine.node, id(1));
    }

    #[test]
    fn test_zero_is_minimum() {
        assert!(Ballot::ZERO < Ballot::new(0, id(1)));
        assert!(Ballot::ZERO.is_zero());
    }
}
