//! Networking for junta.
//!
//! Provides:
//! - `udp`: the consensus engine's `Sink`/`Source` over a UDP socket, with a
//!   shared `PeerSet` of peer addresses
//! - `join`: the TCP join handshake, both the serving and the requesting side
//! - `convert`: proto <-> domain conversions for peer messages

pub mod convert;
pub mod join;
pub mod udp;

pub use join::{JoinError, JoinGrant, JoinHandler, JoinRequest};
pub use udp::{bind, PeerSet, UdpSink, UdpSource};
