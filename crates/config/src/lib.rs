//! Configuration schema and loader for keel nodes.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node identity and listen addresses.
    pub node: IdentityConfig,

    /// Storage settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Replication and quorum settings.
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Gossip and failure-detection settings.
    #[serde(default)]
    pub gossip: GossipConfig,

    /// Hinted-handoff settings.
    #[serde(default)]
    pub handoff: HandoffConfig,

    /// Initial peers to gossip with at startup, as `host:gossip_port`.
    #[serde(default)]
    pub seeds: Vec<String>,

    /// Optional Prometheus metrics HTTP port.
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Unique, stable node identifier.
    pub id: String,

    /// Host or IP to bind and advertise.
    #[serde(default = "default_address")]
    pub address: String,

    /// Replication RPC (HTTP) port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Gossip UDP port.
    #[serde(default = "default_gossip_port")]
    pub gossip_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for the data file.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// If true, flush and issue a durability barrier on every write.
    #[serde(default)]
    pub sync_writes: bool,

    /// Compaction scheduler interval in seconds; 0 disables the scheduler.
    #[serde(default = "default_compact_interval_secs")]
    pub compact_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            sync_writes: false,
            compact_interval_secs: default_compact_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Replication factor (N): length of the preference list.
    #[serde(default = "default_n")]
    pub replication_factor: usize,

    /// Read quorum (R).
    #[serde(default = "default_r")]
    pub read_quorum: usize,

    /// Write quorum (W).
    #[serde(default = "default_w")]
    pub write_quorum: usize,

    /// Virtual tokens per physical node on the ring.
    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes: u32,

    /// Per-operation deadline in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Whether reads trigger asynchronous repair of stale replicas.
    #[serde(default = "default_true")]
    pub read_repair: bool,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            replication_factor: default_n(),
            read_quorum: default_r(),
            write_quorum: default_w(),
            virtual_nodes: default_virtual_nodes(),
            request_timeout_ms: default_request_timeout_ms(),
            read_repair: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipConfig {
    /// Period of outbound gossip in milliseconds.
    #[serde(default = "default_gossip_interval_ms")]
    pub gossip_interval_ms: u64,

    /// Heartbeat silence before a peer is marked suspect, in milliseconds.
    #[serde(default = "default_suspect_timeout_ms")]
    pub suspect_timeout_ms: u64,

    /// Heartbeat silence before a peer is marked dead, in milliseconds.
    #[serde(default = "default_dead_timeout_ms")]
    pub dead_timeout_ms: u64,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            gossip_interval_ms: default_gossip_interval_ms(),
            suspect_timeout_ms: default_suspect_timeout_ms(),
            dead_timeout_ms: default_dead_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffConfig {
    /// Whether failed replica writes are queued for later delivery.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Replay loop period in seconds.
    #[serde(default = "default_handoff_interval_secs")]
    pub handoff_interval_secs: u64,

    /// Age at which queued hints are dropped, in seconds.
    #[serde(default = "default_hint_max_age_secs")]
    pub hint_max_age_secs: u64,

    /// Maximum hints queued per target before the oldest is evicted.
    #[serde(default = "default_hint_max_size")]
    pub hint_max_size: usize,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            handoff_interval_secs: default_handoff_interval_secs(),
            hint_max_age_secs: default_hint_max_age_secs(),
            hint_max_size: default_hint_max_size(),
        }
    }
}

// --- Duration accessors ---

impl NodeConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.replication.request_timeout_ms)
    }

    pub fn gossip_interval(&self) -> Duration {
        Duration::from_millis(self.gossip.gossip_interval_ms)
    }

    pub fn suspect_timeout(&self) -> Duration {
        Duration::from_millis(self.gossip.suspect_timeout_ms)
    }

    pub fn dead_timeout(&self) -> Duration {
        Duration::from_millis(self.gossip.dead_timeout_ms)
    }

    pub fn handoff_interval(&self) -> Duration {
        Duration::from_secs(self.handoff.handoff_interval_secs)
    }

    pub fn hint_max_age(&self) -> Duration {
        Duration::from_secs(self.handoff.hint_max_age_secs)
    }
}

// --- Defaults ---

fn default_address() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_gossip_port() -> u16 {
    7946
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_compact_interval_secs() -> u64 {
    300
}
fn default_n() -> usize {
    3
}
fn default_r() -> usize {
    2
}
fn default_w() -> usize {
    2
}
fn default_virtual_nodes() -> u32 {
    150
}
fn default_request_timeout_ms() -> u64 {
    5000
}
fn default_gossip_interval_ms() -> u64 {
    1000
}
fn default_suspect_timeout_ms() -> u64 {
    5000
}
fn default_dead_timeout_ms() -> u64 {
    30_000
}
fn default_handoff_interval_secs() -> u64 {
    30
}
fn default_hint_max_age_secs() -> u64 {
    24 * 60 * 60
}
fn default_hint_max_size() -> usize {
    1000
}
fn default_true() -> bool {
    true
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
    /// Validate that configuration values are consistent.
    ///
    /// `W + R <= N` is accepted with a warning: it trades read-your-writes
    /// for availability, which is a deliberate operator choice.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.id.is_empty() {
            return Err(ConfigError::Invalid("node.id is required".into()));
        }
        if self.node.port == 0 {
            return Err(ConfigError::Invalid("node.port must be non-zero".into()));
        }
        if self.node.gossip_port == 0 {
            return Err(ConfigError::Invalid(
                "node.gossip_port must be non-zero".into(),
            ));
        }
        if self.storage.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("storage.data_dir is required".into()));
        }

        let n = self.replication.replication_factor;
        let r = self.replication.read_quorum;
        let w = self.replication.write_quorum;
        if n < 1 {
            return Err(ConfigError::Invalid(
                "replication.replication_factor must be at least 1".into(),
            ));
        }
        if r < 1 || r > n {
            return Err(ConfigError::Invalid(format!(
                "replication.read_quorum ({}) must be between 1 and replication_factor ({})",
                r, n
            )));
        }
        if w < 1 || w > n {
            return Err(ConfigError::Invalid(format!(
                "replication.write_quorum ({}) must be between 1 and replication_factor ({})",
                w, n
            )));
        }
        if w + r <= n {
            tracing::warn!(
                "W ({}) + R ({}) <= N ({}): eventual consistency mode",
                w,
                r,
                n
            );
        }
        if self.replication.virtual_nodes < 1 {
            return Err(ConfigError::Invalid(
                "replication.virtual_nodes must be at least 1".into(),
            ));
        }
        Ok(())
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
node:
  id: node-1
seeds:
  - "127.0.0.1:7947"
  - "127.0.0.1:7948"
"#;
        let config = load_from_str(yaml).unwrap();
        assert_eq!(config.node.id, "node-1");
        assert_eq!(config.node.port, 8080);
        assert_eq!(config.node.gossip_port, 7946);
        assert_eq!(config.seeds.len(), 2);
        assert_eq!(config.replication.replication_factor, 3);
        assert_eq!(config.replication.read_quorum, 2);
        assert_eq!(config.replication.write_quorum, 2);
        assert_eq!(config.replication.virtual_nodes, 150);
        assert!(!config.storage.sync_writes);
        assert!(config.handoff.enabled);
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
node:
  id: node-2
  address: "0.0.0.0"
  port: 9000
  gossip_port: 9001
storage:
  data_dir: /tmp/keel-test
  sync_writes: true
  compact_interval_secs: 60
replication:
  replication_factor: 5
  read_quorum: 3
  write_quorum: 3
  virtual_nodes: 64
  request_timeout_ms: 2500
  read_repair: false
gossip:
  gossip_interval_ms: 500
  suspect_timeout_ms: 3000
  dead_timeout_ms: 10000
handoff:
  enabled: false
  hint_max_age_secs: 120
  hint_max_size: 50
seeds: []
metrics_port: 9100
"#;
        let config = load_from_str(yaml).unwrap();
        assert_eq!(config.replication.replication_factor, 5);
        assert!(!config.replication.read_repair);
        assert!(config.storage.sync_writes);
        assert_eq!(config.request_timeout(), Duration::from_millis(2500));
        assert_eq!(config.suspect_timeout(), Duration::from_secs(3));
        assert_eq!(config.hint_max_age(), Duration::from_secs(120));
        assert_eq!(config.metrics_port, Some(9100));
        assert!(!config.handoff.enabled);
    }

    #[test]
    fn test_roundtrip_yaml() {
        let yaml = r#"
node:
  id: node-3
"#;
        let config = load_from_str(yaml).unwrap();
        let serialized = serde_yaml::to_string(&config).unwrap();
        let config2 = load_from_str(&serialized).unwrap();
        assert_eq!(config.node.id, config2.node.id);
        assert_eq!(
            config.replication.virtual_nodes,
            config2.replication.virtual_nodes
        );
    }

    #[test]
    fn test_rejects_missing_node_id() {
        let yaml = r#"
node:
  id: ""
"#;
        let err = load_from_str(yaml).unwrap_err().to_string();
        assert!(err.contains("node.id"), "error should mention node.id: {}", err);
    }

    #[test]
    fn test_rejects_r_greater_than_n() {
        let yaml = r#"
node:
  id: node-1
replication:
  replication_factor: 3
  read_quorum: 5
"#;
        let err = load_from_str(yaml).unwrap_err().to_string();
        assert!(err.contains("read_quorum"), "{}", err);
    }

    #[test]
    fn test_rejects_w_greater_than_n() {
        let yaml = r#"
node:
  id: node-1
replication:
  replication_factor: 3
  write_quorum: 4
"#;
        let err = load_from_str(yaml).unwrap_err().to_string();
        assert!(err.contains("write_quorum"), "{}", err);
    }

    #[test]
    fn test_rejects_zero_quorums() {
        let yaml = r#"
node:
  id: node-1
replication:
  replication_factor: 3
  read_quorum: 0
"#;
        assert!(load_from_str(yaml).is_err());
    }

    #[test]
    fn test_rejects_zero_replication_factor() {
        let yaml = r#"
node:
  id: node-1
replication:
  replication_factor: 0
  read_quorum: 1
  write_quorum: 1
"#;
        let err = load_from_str(yaml).unwrap_err().to_string();
        assert!(err.contains("replication_factor"), "{}", err);
    }

    #[test]
    fn test_rejects_zero_virtual_nodes() {
        let yaml = r#"
node:
  id: node-1
replication:
  virtual_nodes: 0
"#;
        let err = load_from_str(yaml).unwrap_err().to_string();
        assert!(err.contains("virtual_nodes"), "{}", err);
    }

    #[test]
    fn test_accepts_sloppy_quorum() {
        // W + R <= N is warned about but not rejected.
        let yaml = r#"
node:
  id: node-1
replication:
  replication_factor: 3
  read_quorum: 1
  write_quorum: 1
"#;
        let config = load_from_str(yaml).unwrap();
        assert_eq!(config.replication.read_quorum, 1);
    }
}
