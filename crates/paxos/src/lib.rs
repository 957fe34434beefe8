//! Pipelined multi-instance Paxos.
//!
//! The protocol itself lives in [`consensus`] as a synchronous state
//! machine; [`engine`] drives it over any [`Sink`]/[`Source`] pair.

pub mod acceptor;
pub mod ballot;
pub mod chaos;
pub mod consensus;
pub mod engine;
pub mod learner;
pub mod membership;
pub mod msg;
pub mod transport;

pub use acceptor::Acceptor;
pub use ballot::Ballot;
pub use chaos::{ChaosConfig, ChaosSink};
pub use consensus::{Config, Consensus, Decision, Effects, Phase, Stats};
pub use engine::{Engine, EngineEvent, Status};
pub use membership::{quorum, Membership};
pub use msg::{Envelope, Msg, Vote};
pub use transport::{LocalNetwork, LocalSink, LocalSource, Sink, Source};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("consensus engine stopped")]
    Stopped,
}
