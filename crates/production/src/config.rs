//! Node configuration file.
//!
//! Example TOML:
//!
//! ```toml
//! [node]
//! key_path = "./node.key"
//! data_dir = "./data"
//!
//! [consensus]
//! base_timeout_ms = 3000
//! max_timeout_ms = 60000
//! water_mark_limit = 10
//!
//! [threads]
//! crypto_threads = 4
//! io_threads = 2
//!
//! [telemetry]
//! log_format = "json"
//! metrics_enabled = true
//! metrics_port = 9090
//!
//! [genesis]
//! block_tx_count_limit = 1000
//! leader_period = 1
//!
//! [[genesis.nodes]]
//! node_id = "3b6a27bcceb6a42d62a3a8d02a6f0d73653215771de243a63ac048a18b59da29"
//! weight = 1
//!
//! [[genesis.features]]
//! feature = "weighted_leader_rotation"
//! at = 100
//! ```

use crate::telemetry::{LogFormat, TelemetryConfig};
use crate::thread_pools::ThreadPoolConfig;
use pbft::PbftConfig;
use pbft_types::{
    BlockNumber, ConsensusNode, Feature, Features, KeyPair, LedgerConfig, NodeId,
    QuorumPolicyKind,
};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors from loading or interpreting the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid node id {value:?}: {reason}")]
    InvalidNodeId { value: String, reason: String },

    #[error("Invalid key file {path}: {reason}")]
    InvalidKey { path: PathBuf, reason: String },

    #[error("Genesis has no nodes")]
    EmptyGenesis,

    #[error("No key_path configured")]
    MissingKeyPath,
}

/// Top-level node configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,

    #[serde(default)]
    pub consensus: ConsensusSection,

    #[serde(default)]
    pub threads: ThreadsSection,

    #[serde(default)]
    pub telemetry: TelemetrySection,

    pub genesis: GenesisSection,
}

/// Node identity and local paths.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeSection {
    /// File holding the 32-byte signing seed, raw or hex-encoded.
    #[serde(default)]
    pub key_path: Option<PathBuf>,

    /// Directory for the persisted consensus state.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            key_path: None,
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

/// Consensus tuning. Omitted fields take the [`PbftConfig`] defaults.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ConsensusSection {
    pub base_timeout_ms: Option<u64>,
    pub max_timeout_ms: Option<u64>,
    pub water_mark_limit: Option<u64>,
    pub checkpoint_resend_interval_ms: Option<u64>,
    pub apply_retry_base_ms: Option<u64>,
    pub apply_retry_max_ms: Option<u64>,
    pub apply_alert_threshold: Option<u32>,
    pub recover_interval_ms: Option<u64>,
    pub max_recover_batch: Option<usize>,
    pub committed_log_retention: Option<usize>,
    pub max_future_messages: Option<usize>,
    pub view_change_window: Option<u64>,
    pub epoch_length: Option<u64>,
}

/// Thread pool sizes (0 = auto).
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ThreadsSection {
    #[serde(default)]
    pub crypto_threads: usize,

    #[serde(default)]
    pub apply_threads: usize,

    #[serde(default)]
    pub io_threads: usize,
}

/// Logging and metrics endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetrySection {
    #[serde(default = "default_service_name")]
    pub service_name: String,

    #[serde(default)]
    pub log_format: LogFormat,

    /// Used when `RUST_LOG` is not set.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    #[serde(default)]
    pub metrics_enabled: bool,

    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            log_format: LogFormat::default(),
            log_filter: default_log_filter(),
            metrics_enabled: false,
            metrics_port: default_metrics_port(),
        }
    }
}

fn default_service_name() -> String {
    "pbft-node".to_string()
}

fn default_log_filter() -> String {
    "info,pbft=debug".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

/// Ledger configuration in force at index 1.
#[derive(Debug, Clone, Deserialize)]
pub struct GenesisSection {
    pub nodes: Vec<GenesisNode>,

    #[serde(default)]
    pub quorum_policy: QuorumPolicyKind,

    #[serde(default = "default_block_tx_count_limit")]
    pub block_tx_count_limit: u64,

    #[serde(default = "default_leader_period")]
    pub leader_period: u64,

    #[serde(default)]
    pub features: Vec<FeatureActivation>,
}

fn default_block_tx_count_limit() -> u64 {
    1000
}

fn default_leader_period() -> u64 {
    1
}

/// A member of the genesis consensus set.
#[derive(Debug, Clone, Deserialize)]
pub struct GenesisNode {
    /// Hex-encoded ed25519 public key.
    pub node_id: String,

    /// Vote weight (default: 1). Ignored for observers.
    #[serde(default = "default_weight")]
    pub weight: u64,

    #[serde(default)]
    pub observer: bool,
}

fn default_weight() -> u64 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeatureActivation {
    pub feature: Feature,
    pub at: u64,
}

impl NodeConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn pbft_config(&self) -> PbftConfig {
        let c = &self.consensus;
        let d = PbftConfig::default();
        let ms = |v: Option<u64>, default: Duration| v.map(Duration::from_millis).unwrap_or(default);

        PbftConfig {
            base_timeout: ms(c.base_timeout_ms, d.base_timeout),
            max_timeout: ms(c.max_timeout_ms, d.max_timeout),
            water_mark_limit: c.water_mark_limit.unwrap_or(d.water_mark_limit),
            checkpoint_resend_interval: ms(
                c.checkpoint_resend_interval_ms,
                d.checkpoint_resend_interval,
            ),
            apply_retry_base: ms(c.apply_retry_base_ms, d.apply_retry_base),
            apply_retry_max: ms(c.apply_retry_max_ms, d.apply_retry_max),
            apply_alert_threshold: c.apply_alert_threshold.unwrap_or(d.apply_alert_threshold),
            recover_interval: ms(c.recover_interval_ms, d.recover_interval),
            max_recover_batch: c.max_recover_batch.unwrap_or(d.max_recover_batch),
            committed_log_retention: c
                .committed_log_retention
                .unwrap_or(d.committed_log_retention),
            max_future_messages: c.max_future_messages.unwrap_or(d.max_future_messages),
            view_change_window: c.view_change_window.unwrap_or(d.view_change_window),
            epoch_length: c.epoch_length.unwrap_or(d.epoch_length),
        }
    }

    pub fn thread_pool_config(&self) -> ThreadPoolConfig {
        let mut builder = ThreadPoolConfig::builder();
        if self.threads.crypto_threads > 0 {
            builder = builder.crypto_threads(self.threads.crypto_threads);
        }
        if self.threads.apply_threads > 0 {
            builder = builder.apply_threads(self.threads.apply_threads);
        }
        if self.threads.io_threads > 0 {
            builder = builder.io_threads(self.threads.io_threads);
        }
        builder.build_unchecked()
    }

    pub fn telemetry_config(&self) -> TelemetryConfig {
        let t = &self.telemetry;
        TelemetryConfig {
            service_name: t.service_name.clone(),
            log_format: t.log_format,
            log_filter: t.log_filter.clone(),
            prometheus_enabled: t.metrics_enabled,
            prometheus_port: t.metrics_port,
        }
    }

    /// Build the genesis ledger configuration.
    pub fn ledger_config(&self) -> Result<LedgerConfig, ConfigError> {
        let g = &self.genesis;
        if g.nodes.is_empty() {
            return Err(ConfigError::EmptyGenesis);
        }

        let membership = g
            .nodes
            .iter()
            .map(|n| {
                let node_id = parse_node_id(&n.node_id)?;
                Ok(if n.observer {
                    ConsensusNode::observer(node_id)
                } else {
                    ConsensusNode::sealer(node_id, n.weight)
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        let features = g.features.iter().fold(Features::new(), |f, a| {
            f.with(a.feature, BlockNumber(a.at))
        });

        Ok(LedgerConfig {
            membership,
            quorum_policy: g.quorum_policy,
            block_tx_count_limit: g.block_tx_count_limit,
            leader_period: g.leader_period,
            features,
            enable_index: BlockNumber(1),
        })
    }

    /// Path of the persisted consensus state inside `data_dir`.
    pub fn state_path(&self) -> PathBuf {
        self.node.data_dir.join("consensus.state")
    }

    /// Load the signing key named by `node.key_path`.
    pub fn load_keypair(&self) -> Result<KeyPair, ConfigError> {
        let path = self.node.key_path.as_ref().ok_or(ConfigError::MissingKeyPath)?;
        load_keypair(path)
    }
}

/// Parse a hex-encoded node id.
pub fn parse_node_id(value: &str) -> Result<NodeId, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidNodeId {
        value: value.to_string(),
        reason,
    };
    let bytes = hex::decode(value.trim()).map_err(|e| invalid(e.to_string()))?;
    let bytes: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| invalid(format!("expected 32 bytes, got {}", bytes.len())))?;
    Ok(NodeId(bytes))
}

/// Load a key file holding a 32-byte seed, either raw or as 64 hex characters.
pub fn load_keypair(path: &Path) -> Result<KeyPair, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidKey {
        path: path.to_path_buf(),
        reason,
    };
    let contents = fs::read(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let seed = if contents.len() == 32 {
        contents
    } else {
        let text = String::from_utf8_lossy(&contents);
        hex::decode(text.trim()).map_err(|e| {
            invalid(format!(
                "expected 32 raw bytes or 64 hex chars ({}, {} bytes)",
                e,
                contents.len()
            ))
        })?
    };
    let seed: [u8; 32] = seed
        .try_into()
        .map_err(|_| invalid("seed must be exactly 32 bytes".to_string()))?;

    KeyPair::from_seed(&seed).map_err(|e| invalid(e.to_string()))
}
