//! Configuration schema and loader for silo serving nodes.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's gRPC listen address (serves v1, v2 and internal lookup).
    pub listen: SocketAddr,

    /// Deployment environment label (e.g. "local", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Sharding settings.
    #[serde(default)]
    pub sharding: ShardingConfig,

    /// Data-loading settings.
    #[serde(default)]
    pub data: DataConfig,

    /// UDF settings.
    #[serde(default)]
    pub udf: UdfConfig,

    /// Optional Prometheus metrics HTTP port.
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardingConfig {
    /// Number of logical shards in the fleet.
    #[serde(default = "default_num_shards")]
    pub num_shards: u32,

    /// This node's shard number, in `[0, num_shards)`.
    #[serde(default)]
    pub shard_num: u32,

    /// Static replica sets, one list per logical shard, used by the local
    /// instance client. Cloud deployments discover replicas instead.
    #[serde(default)]
    pub cluster: Vec<Vec<String>>,

    /// Cluster mapping refresh interval in seconds.
    #[serde(default = "default_mapping_refresh_secs")]
    pub mapping_refresh_secs: u64,

    /// Remote lookup RPC timeout in milliseconds.
    #[serde(default = "default_remote_timeout_ms")]
    pub remote_timeout_ms: u64,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            num_shards: default_num_shards(),
            shard_num: 0,
            cluster: Vec::new(),
            mapping_refresh_secs: default_mapping_refresh_secs(),
            remote_timeout_ms: default_remote_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Directory (or bucket path) holding delta files.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Poll interval for new delta files, in seconds.
    #[serde(default = "default_watch_interval_secs")]
    pub watch_interval_secs: u64,

    /// Worker count for concurrent delta reading. 0 = hardware concurrency.
    #[serde(default)]
    pub num_worker_threads: usize,

    /// Minimum byte-range size per concurrent read shard.
    #[serde(default = "default_min_shard_size_bytes")]
    pub min_shard_size_bytes: u64,

    /// Tombstones older than `max_seen_lct - retention` are GC'd.
    #[serde(default = "default_tombstone_retention_lcts")]
    pub tombstone_retention_lcts: i64,

    /// Tombstone clean-up interval in seconds.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            watch_interval_secs: default_watch_interval_secs(),
            num_worker_threads: 0,
            min_shard_size_bytes: default_min_shard_size_bytes(),
            tombstone_retention_lcts: default_tombstone_retention_lcts(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdfConfig {
    /// When false, v1 requests bypass the UDF and read the cache directly.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Bound on one UDF invocation, in milliseconds.
    #[serde(default = "default_udf_timeout_ms")]
    pub timeout_ms: u64,

    /// Bound on loading a new code object, in milliseconds.
    #[serde(default = "default_udf_load_timeout_ms")]
    pub load_timeout_ms: u64,
}

impl Default for UdfConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: default_udf_timeout_ms(),
            load_timeout_ms: default_udf_load_timeout_ms(),
        }
    }
}

// --- Defaults ---

fn default_environment() -> String {
    "local".to_string()
}
fn default_num_shards() -> u32 {
    1
}
fn default_mapping_refresh_secs() -> u64 {
    30
}
fn default_remote_timeout_ms() -> u64 {
    5000
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("deltas")
}
fn default_watch_interval_secs() -> u64 {
    10
}
fn default_min_shard_size_bytes() -> u64 {
    8 * 1024 * 1024
}
fn default_tombstone_retention_lcts() -> i64 {
    1_000_000
}
fn default_cleanup_interval_secs() -> u64 {
    300
}
fn default_true() -> bool {
    true
}
fn default_udf_timeout_ms() -> u64 {
    60_000
}
fn default_udf_load_timeout_ms() -> u64 {
    1_000
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
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sharding.num_shards == 0 {
            return Err(ConfigError::Invalid(
                "sharding.num_shards must be > 0".into(),
            ));
        }
        if self.sharding.shard_num >= self.sharding.num_shards {
            return Err(ConfigError::Invalid(format!(
                "sharding.shard_num ({}) must be < sharding.num_shards ({})",
                self.sharding.shard_num, self.sharding.num_shards
            )));
        }
        if !self.sharding.cluster.is_empty()
            && self.sharding.cluster.len() != self.sharding.num_shards as usize
        {
            return Err(ConfigError::Invalid(format!(
                "sharding.cluster has {} replica sets, expected {}",
                self.sharding.cluster.len(),
                self.sharding.num_shards
            )));
        }
        if self.udf.timeout_ms == 0 {
            return Err(ConfigError::Invalid("udf.timeout_ms must be > 0".into()));
        }
        if self.udf.load_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "udf.load_timeout_ms must be > 0".into(),
            ));
        }
        if self.data.tombstone_retention_lcts < 0 {
            return Err(ConfigError::Invalid(
                "data.tombstone_retention_lcts must be >= 0".into(),
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
listen: "127.0.0.1:50051"
"#;
        let config = load_from_str(yaml).unwrap();
        assert_eq!(config.listen.port(), 50051);
        assert_eq!(config.environment, "local");
        assert_eq!(config.sharding.num_shards, 1);
        assert_eq!(config.sharding.shard_num, 0);
        assert!(config.udf.enabled);
        assert_eq!(config.udf.timeout_ms, 60_000);
        assert_eq!(config.udf.load_timeout_ms, 1_000);
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
listen: "0.0.0.0:50051"
environment: staging
metrics_port: 9090
sharding:
  num_shards: 3
  shard_num: 1
  cluster:
    - ["10.0.0.1:50051"]
    - ["10.0.0.2:50051"]
    - ["10.0.0.3:50051", "10.0.0.4:50051"]
  remote_timeout_ms: 2000
data:
  data_dir: /var/lib/silo/deltas
  watch_interval_secs: 5
  num_worker_threads: 8
  min_shard_size_bytes: 1048576
udf:
  enabled: false
  timeout_ms: 30000
"#;
        let config = load_from_str(yaml).unwrap();
        assert_eq!(config.environment, "staging");
        assert_eq!(config.metrics_port, Some(9090));
        assert_eq!(config.sharding.num_shards, 3);
        assert_eq!(config.sharding.cluster[2].len(), 2);
        assert_eq!(config.data.num_worker_threads, 8);
        assert!(!config.udf.enabled);
        assert_eq!(config.udf.timeout_ms, 30_000);
    }

    #[test]
    fn test_roundtrip_yaml() {
        let yaml = r#"
listen: "127.0.0.1:9000"
"#;
        let config = load_from_str(yaml).unwrap();
        let serialized = serde_yaml::to_string(&config).unwrap();
        let config2 = load_from_str(&serialized).unwrap();
        assert_eq!(config.listen, config2.listen);
        assert_eq!(config.sharding.num_shards, config2.sharding.num_shards);
    }

    #[test]
    fn test_rejects_zero_shards() {
        let yaml = r#"
listen: "127.0.0.1:50051"
sharding:
  num_shards: 0
"#;
        let err = load_from_str(yaml).unwrap_err().to_string();
        assert!(err.contains("num_shards"), "error should mention num_shards: {err}");
    }

    #[test]
    fn test_rejects_shard_num_out_of_range() {
        let yaml = r#"
listen: "127.0.0.1:50051"
sharding:
  num_shards: 2
  shard_num: 2
"#;
        let err = load_from_str(yaml).unwrap_err().to_string();
        assert!(err.contains("shard_num"), "error should mention shard_num: {err}");
    }

    #[test]
    fn test_rejects_cluster_size_mismatch() {
        let yaml = r#"
listen: "127.0.0.1:50051"
sharding:
  num_shards: 2
  cluster:
    - ["10.0.0.1:50051"]
"#;
        let err = load_from_str(yaml).unwrap_err().to_string();
        assert!(err.contains("replica sets"), "error should mention replica sets: {err}");
    }

    #[test]
    fn test_rejects_zero_udf_timeout() {
        let yaml = r#"
listen: "127.0.0.1:50051"
udf:
  timeout_ms: 0
"#;
        let err = load_from_str(yaml).unwrap_err().to_string();
        assert!(err.contains("timeout_ms"), "error should mention timeout_ms: {err}");
    }
}
