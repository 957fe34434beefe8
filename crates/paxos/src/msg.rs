//! Peer messages exchanged by consensus engines.

use crate::ballot::Ballot;
use junta_common::NodeId;

/// An acceptor's vote for `value` at `seqn` under `ballot`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vote {
    pub seqn: u64,
    pub ballot: Ballot,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Msg {
    /// Phase 1a for `seqn` and every later seqn.
    Prepare { seqn: u64, ballot: Ballot },
    /// Phase 1b. `accepted` holds the votes at or after `seqn`; votes at or
    /// below `floor` were compacted away because those seqns are decided.
    Promise {
        seqn: u64,
        ballot: Ballot,
        floor: u64,
        accepted: Vec<Vote>,
    },
    /// The acceptor has promised `promised`, which outranks `ballot`.
    Reject {
        seqn: u64,
        ballot: Ballot,
        promised: Ballot,
    },
    /// Phase 2a.
    Accept {
        seqn: u64,
        ballot: Ballot,
        value: Vec<u8>,
    },
    /// Phase 2b, broadcast to every learner.
    Accepted {
        seqn: u64,
        ballot: Ballot,
        value: Vec<u8>,
    },
    /// `value` is decided for `seqn`.
    Learn { seqn: u64, value: Vec<u8> },
    /// A value forwarded to the leader for proposal.
    Propose { value: Vec<u8> },
    /// Request for the decided value at `seqn` (answered with `Learn`).
    Fetch { seqn: u64 },
    /// Leader liveness and progress beacon.
    Heartbeat { ballot: Ballot, decided_through: u64 },
}

impl Msg {
    /// Short lowercase name, used for logging and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Msg::Prepare { .. } => "prepare",
            Msg::Promise { .. } => "promise",
            Msg::Reject { .. } => "reject",
            Msg::Accept { .. } => "accept",
            Msg::Accepted { .. } => "accepted",
            Msg::Learn { .. } => "learn",
            Msg::Propose { .. } => "propose",
            Msg::Fetch { .. } => "fetch",
            Msg::Heartbeat { .. } => "heartbeat",
        }
    }
}

/// A message together with its sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub from: NodeId,
    pub msg: Msg,
}

impl Envelope {
    pub fn new(from: NodeId, msg: Msg) -> Self {
        Self { from, msg }
    }
}
