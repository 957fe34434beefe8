use junta_common::TransportError;
use junta_config::ConfigError;
use junta_net::JoinError;
use junta_paxos::EngineError;
use junta_storage::WalError;
use junta_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("join failed: {0}")]
    Join(#[from] JoinError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("acceptor log: {0}")]
    Wal(#[from] WalError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("undecodable snapshot: {0}")]
    Snapshot(StoreError),
    #[error("bad node id file {0}")]
    Identity(String),
    #[error("node stopped")]
    Stopped,
}
