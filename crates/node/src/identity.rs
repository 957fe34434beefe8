//! Which node id this process runs as.

use crate::NodeError;
use junta_common::NodeId;
use junta_config::NodeConfig;
use std::path::Path;

const ID_FILE: &str = "node-id";

/// The configured id if there is one, else the id stored in the data
/// directory, else a fresh random id which is then stored there.
///
/// A node whose acceptor state is memory-only gets a new id on every
/// start and never stores it: its old votes are gone, so it must rejoin
/// as a member the cluster has not heard from.
pub fn resolve(config: &NodeConfig) -> Result<NodeId, NodeError> {
    if let Some(id) = config.node_id()? {
        return Ok(id);
    }
    if !config.storage.durable_acceptor {
        let id = NodeId::random();
        tracing::info!("memory-only acceptor; running as fresh id {}", id);
        return Ok(id);
    }
    load_or_create(&config.storage.data_dir)
}

fn load_or_create(dir: &Path) -> Result<NodeId, NodeError> {
    let path = dir.join(ID_FILE);
    match std::fs::read_to_string(&path) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| NodeError::Identity(format!("{}: {}", path.display(), e))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            std::fs::create_dir_all(dir)?;
            let id = NodeId::random();
            std::fs::write(&path, format!("{}\n", id.to_hex()))?;
            tracing::info!("generated node id {} in {}", id, path.display());
            Ok(id)
        }
        Err(e) => Err(e.into()),
    }
}
