//! junta: entry point for a coordination daemon node.
//!
//! Loads config, resolves the node id, founds a new cluster or joins the
//! one at `attach`, then runs until Ctrl+C.

use junta_config::NodeConfig;
use junta_node::{identity, Node};
use std::net::SocketAddr;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    junta_metrics::init_tracing();

    // Load config: first CLI arg is the YAML config path
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "junta.yaml".to_string());

    let config =
        junta_config::load_from_file(std::path::Path::new(&config_path)).unwrap_or_else(|e| {
            tracing::warn!(
                "failed to load config from {}: {}, using defaults",
                config_path,
                e
            );
            NodeConfig::new(SocketAddr::from(([127, 0, 0, 1], 8046)))
        });

    let id = identity::resolve(&config)?;
    tracing::info!("node {} in cluster {:?}", id, config.cluster);

    // Spawn metrics HTTP server if configured
    if let Some(metrics_port) = config.metrics_port {
        let metrics_addr = SocketAddr::from(([0, 0, 0, 0], metrics_port));
        tokio::spawn(async move {
            if let Err(e) = junta_metrics::serve_metrics(metrics_addr).await {
                tracing::warn!("metrics server failed: {}", e);
            }
        });
    }

    // Binding, joining and snapshot decoding failures abort startup.
    let node = Node::start(id, &config).await?;
    tracing::info!(
        "serving peers on {}, joins on {}",
        node.addr(),
        node.join_addr()
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("received Ctrl+C, shutting down");
    node.shutdown().await?;

    Ok(())
}
