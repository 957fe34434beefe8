//! Configuration schema and loader for junta nodes.

use junta_common::NodeId;
use junta_storage::FsyncPolicy;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// UDP peer socket and TCP join endpoint.
    pub listen: SocketAddr,

    /// Address other members use to reach this node. Defaults to `listen`.
    #[serde(default)]
    pub publish: Option<SocketAddr>,

    /// A member of an existing cluster to join. Absent: found a new cluster.
    #[serde(default)]
    pub attach: Option<SocketAddr>,

    /// Cluster name. Joins naming another cluster are refused.
    #[serde(default = "default_cluster")]
    pub cluster: String,

    /// Fixed node id as 40 hex digits. Absent: read from (or created in)
    /// the data directory.
    #[serde(default)]
    pub id: Option<String>,

    /// Consensus settings.
    #[serde(default)]
    pub paxos: PaxosConfig,

    /// Replicated store settings.
    #[serde(default)]
    pub store: StoreConfig,

    /// Storage settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Optional Prometheus metrics HTTP port.
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaxosConfig {
    /// Pipeline depth: instances open at once, and the lag after which a
    /// slot change takes effect.
    #[serde(default = "default_alpha")]
    pub alpha: u64,

    /// Quorum timeout in milliseconds before retrying with a higher ballot.
    #[serde(default = "default_retry_timeout_ms")]
    pub retry_timeout_ms: u64,

    /// How long a known gap may persist before fetching it, in milliseconds.
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,

    /// Leader heartbeat period in milliseconds.
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,

    /// Decided values kept in memory to answer fetches.
    #[serde(default = "default_retain_decided")]
    pub retain_decided: usize,

    /// Number of acceptor slots under `/junta/slot/`.
    #[serde(default = "default_slots")]
    pub slots: usize,
}

impl Default for PaxosConfig {
    fn default() -> Self {
        Self {
            alpha: default_alpha(),
            retry_timeout_ms: default_retry_timeout_ms(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            heartbeat_ms: default_heartbeat_ms(),
            retain_decided: default_retain_decided(),
            slots: default_slots(),
        }
    }
}

impl PaxosConfig {
    pub fn retry_timeout(&self) -> Duration {
        Duration::from_millis(self.retry_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Applied events retained to answer duplicate applies.
    #[serde(default = "default_history")]
    pub history: usize,

    /// Per-watcher queue bound; 0 means unbounded.
    #[serde(default)]
    pub watch_queue: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            history: default_history(),
            watch_queue: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for the acceptor log and the node id file.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Fsync policy: "always", "batch", "none".
    #[serde(default)]
    pub fsync: FsyncPolicy,

    /// Persist promise/accept state so a restart keeps its promises.
    #[serde(default = "default_true")]
    pub durable_acceptor: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            fsync: FsyncPolicy::default(),
            durable_acceptor: true,
        }
    }
}

// --- Defaults ---

fn default_cluster() -> String {
    "local".to_string()
}
fn default_alpha() -> u64 {
    50
}
fn default_retry_timeout_ms() -> u64 {
    500
}
fn default_fetch_timeout_ms() -> u64 {
    200
}
fn default_heartbeat_ms() -> u64 {
    250
}
fn default_retain_decided() -> usize {
    1024
}
fn default_slots() -> usize {
    5
}
fn default_history() -> usize {
    1024
}
fn default_true() -> bool {
    true
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

// --- Loading ---

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl NodeConfig {
    /// A config for `listen` with every other field at its default.
    pub fn new(listen: SocketAddr) -> Self {
        Self {
            listen,
            publish: None,
            attach: None,
            cluster: default_cluster(),
            id: None,
            paxos: PaxosConfig::default(),
            store: StoreConfig::default(),
            storage: StorageConfig::default(),
            metrics_port: None,
        }
    }

    /// Validate that configuration values are consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster.is_empty() {
            return Err(ConfigError::Invalid("cluster must not be empty".into()));
        }
        if self.cluster.contains('/') {
            return Err(ConfigError::Invalid(format!(
                "cluster ({:?}) must not contain '/'",
                self.cluster
            )));
        }
        if self.paxos.alpha == 0 {
            return Err(ConfigError::Invalid("paxos.alpha must be > 0".into()));
        }
        if self.paxos.slots == 0 {
            return Err(ConfigError::Invalid("paxos.slots must be > 0".into()));
        }
        for (name, ms) in [
            ("paxos.retry_timeout_ms", self.paxos.retry_timeout_ms),
            ("paxos.fetch_timeout_ms", self.paxos.fetch_timeout_ms),
            ("paxos.heartbeat_ms", self.paxos.heartbeat_ms),
        ] {
            if ms == 0 {
                return Err(ConfigError::Invalid(format!("{} must be > 0", name)));
            }
        }
        if self.paxos.retain_decided == 0 {
            return Err(ConfigError::Invalid(
                "paxos.retain_decided must be > 0".into(),
            ));
        }
        if self.node_id()?.is_some() && !self.storage.durable_acceptor {
            return Err(ConfigError::Invalid(
                "a fixed id needs storage.durable_acceptor".into(),
            ));
        }
        Ok(())
    }

    /// Address advertised to other members.
    pub fn publish_addr(&self) -> SocketAddr {
        self.publish.unwrap_or(self.listen)
    }

    /// The configured node id, if one is set.
    pub fn node_id(&self) -> Result<Option<NodeId>, ConfigError> {
        self.id
            .as_deref()
            .map(|hex| {
                hex.parse::<NodeId>()
                    .map_err(|e| ConfigError::Invalid(format!("id: {}", e)))
            })
            .transpose()
    }
}

/// Load a `NodeConfig` from a YAML file path.
pub fn load_from_file(path: &std::path::Path) -> Result<NodeConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    load_from_str(&contents)
}

/// Load a `NodeConfig` from a YAML string.
pub fn load_from_str(yaml: &str) -> Result<NodeConfig, ConfigError> {
    let config: NodeConfig = serde_yaml::from_str(yaml)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r#"
listen: "127.0.0.1:8046"
"#;
        let config = load_from_str(yaml).unwrap();
        assert_eq!(config.listen.port(), 8046);
        assert_eq!(config.publish_addr(), config.listen);
        assert!(config.attach.is_none());
        assert_eq!(config.cluster, "local");
        assert_eq!(config.paxos.alpha, 50);
        assert_eq!(config.paxos.slots, 5);
        assert_eq!(config.store.watch_queue, 0);
        assert_eq!(config.storage.fsync, FsyncPolicy::Batch);
        assert!(config.storage.durable_acceptor);
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
listen: "0.0.0.0:8046"
publish: "10.0.0.5:8046"
attach: "10.0.0.1:8046"
cluster: prod
id: "00112233445566778899aabbccddeeff00112233"
paxos:
  alpha: 10
  retry_timeout_ms: 300
  fetch_timeout_ms: 100
  heartbeat_ms: 150
  retain_decided: 64
  slots: 3
store:
  history: 32
  watch_queue: 128
storage:
  data_dir: /tmp/junta-test
  fsync: always
metrics_port: 9100
"#;
        let config = load_from_str(yaml).unwrap();
        assert_eq!(config.publish_addr().to_string(), "10.0.0.5:8046");
        assert_eq!(config.attach.unwrap().port(), 8046);
        assert_eq!(config.cluster, "prod");
        assert!(config.node_id().unwrap().is_some());
        assert_eq!(config.paxos.alpha, 10);
        assert_eq!(config.paxos.retry_timeout(), Duration::from_millis(300));
        assert_eq!(config.paxos.slots, 3);
        assert_eq!(config.store.history, 32);
        assert_eq!(config.store.watch_queue, 128);
        assert_eq!(config.storage.fsync, FsyncPolicy::Always);
        assert!(config.storage.durable_acceptor);
        assert_eq!(config.metrics_port, Some(9100));
    }

    #[test]
    fn test_rejects_fixed_id_without_durable_acceptor() {
        let yaml = r#"
listen: "127.0.0.1:7000"
id: "00112233445566778899aabbccddeeff00112233"
storage:
  durable_acceptor: false
"#;
        let err = load_from_str(yaml).unwrap_err().to_string();
        assert!(err.contains("durable_acceptor"), "{}", err);
    }

    #[test]
    fn test_roundtrip_yaml() {
        let config = NodeConfig::new("127.0.0.1:9000".parse().unwrap());
        let serialized = serde_yaml::to_string(&config).unwrap();
        let config2 = load_from_str(&serialized).unwrap();
        assert_eq!(config.listen, config2.listen);
        assert_eq!(config.paxos.alpha, config2.paxos.alpha);
        assert_eq!(config.storage.fsync, config2.storage.fsync);
    }

    #[test]
    fn test_rejects_zero_alpha() {
        let yaml = r#"
listen: "127.0.0.1:7000"
paxos:
  alpha: 0
"#;
        let err = load_from_str(yaml).unwrap_err().to_string();
        assert!(err.contains("paxos.alpha"), "error should mention paxos.alpha: {}", err);
    }

    #[test]
    fn test_rejects_zero_slots() {
        let yaml = r#"
listen: "127.0.0.1:7000"
paxos:
  slots: 0
"#;
        let err = load_from_str(yaml).unwrap_err().to_string();
        assert!(err.contains("paxos.slots"), "error should mention paxos.slots: {}", err);
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let yaml = r#"
listen: "127.0.0.1:7000"
paxos:
  heartbeat_ms: 0
"#;
        let err = load_from_str(yaml).unwrap_err().to_string();
        assert!(err.contains("paxos.heartbeat_ms"), "{}", err);
    }

    #[test]
    fn test_rejects_empty_cluster() {
        let yaml = r#"
listen: "127.0.0.1:7000"
cluster: ""
"#;
        let err = load_from_str(yaml).unwrap_err().to_string();
        assert!(err.contains("cluster"), "{}", err);
    }

    #[test]
    fn test_rejects_bad_id() {
        let yaml = r#"
listen: "127.0.0.1:7000"
id: "not-hex"
"#;
        assert!(matches!(load_from_str(yaml), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_unknown_fsync() {
        let yaml = r#"
listen: "127.0.0.1:7000"
storage:
  fsync: sometimes
"#;
        assert!(matches!(load_from_str(yaml), Err(ConfigError::Yaml(_))));
    }
}
