//! junta-node: the coordination daemon.
//!
//! Wires the replicated store to the consensus engine over the UDP peer
//! transport, founds or joins a cluster, and keeps the acceptor set in
//! step with the slot records under `/junta/slot`.

pub mod bootstrap;
pub mod cluster;
mod error;
pub mod identity;
pub mod node;
pub mod paths;

pub use error::NodeError;
pub use node::Node;
