//! Durable storage for junta: an append-only, CRC32-framed write-ahead log.
//!
//! The log is generic over its record type. The consensus acceptor keeps
//! its promise/accept history here so a restarted node never answers a
//! ballot it has already refused.

pub mod wal;

pub use wal::{FsyncPolicy, Wal, WalError};
