//! Configuration management for PBFT clusters
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. Environment variables (PBFT_* prefix, `__` between nesting levels)
//! 2. pbft.local.toml (gitignored, local overrides)
//! 3. pbft.toml (git-tracked, project config)
//! 4. ~/.config/pbft/config.toml (user defaults)
//! 5. Built-in defaults (lowest precedence)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::Paths;

/// Main PBFT configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PbftConfig {
    pub cluster: ClusterSection,
    pub consensus: ConsensusSection,
    pub network: NetworkSection,
    pub client: ClientSection,
    pub journal: JournalSection,
}

/// A replica or client endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    /// Replica endpoints. Replica `i` is `replicas[i]`.
    pub replicas: Vec<NodeAddress>,
    pub clients: Vec<NodeAddress>,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            replicas: (0..4)
                .map(|i| NodeAddress::new("127.0.0.1", 30000 + i))
                .collect(),
            clients: vec![NodeAddress::new("127.0.0.1", 20001)],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusSection {
    /// Slots between checkpoints.
    pub checkpoint_interval: u64,
    /// Minimum time between two locally initiated view advances.
    pub view_change_min_interval_ms: u64,
    /// Requests a leader queues while its slot window is full.
    pub max_pending_requests: usize,
}

impl Default for ConsensusSection {
    fn default() -> Self {
        Self {
            checkpoint_interval: 10,
            view_change_min_interval_ms: 10_000,
            max_pending_requests: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    /// Probability that the in-process network drops a message.
    pub loss_rate: f64,
    pub timeout_ms: u64,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            loss_rate: 0.0,
            timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    /// How long a client waits for `f + 1` matching replies.
    pub resend_interval_ms: u64,
    pub retry_times_before_view_change: u32,
    pub max_attempts: u32,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            resend_interval_ms: 1_000,
            retry_times_before_view_change: 3,
            max_attempts: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalSection {
    pub dir: PathBuf,
}

impl Default for JournalSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".pbft/journal"),
        }
    }
}

impl ConsensusSection {
    pub fn view_change_min_interval(&self) -> Duration {
        Duration::from_millis(self.view_change_min_interval_ms)
    }
}

impl NetworkSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl ClientSection {
    pub fn resend_interval(&self) -> Duration {
        Duration::from_millis(self.resend_interval_ms)
    }
}

impl PbftConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    /// Load configuration from specific project directory
    pub fn load_from_dir(project_dir: impl AsRef<Path>) -> Result<Self> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }

    /// Read a single TOML file, without layering.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::ParseError {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Create a configuration for fast local tests
    pub fn testing() -> Self {
        Self {
            consensus: ConsensusSection {
                checkpoint_interval: 4,
                view_change_min_interval_ms: 0,
                ..Default::default()
            },
            network: NetworkSection {
                loss_rate: 0.0,
                timeout_ms: 200,
            },
            client: ClientSection {
                resend_interval_ms: 150,
                retry_times_before_view_change: 2,
                max_attempts: 40,
            },
            ..Default::default()
        }
    }

    /// Returns the number of Byzantine faults the cluster tolerates.
    pub fn max_faults(&self) -> usize {
        self.cluster.replicas.len().saturating_sub(1) / 3
    }

    /// Checks invariants the consensus core relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let replicas = self.cluster.replicas.len();
        if replicas < 4 {
            return Err(ConfigError::ValidationError(format!(
                "at least 4 replicas are required to tolerate a fault, got {replicas}"
            )));
        }
        if replicas > usize::from(u8::MAX) {
            return Err(ConfigError::ValidationError(format!(
                "at most {} replicas are supported, got {replicas}",
                u8::MAX
            )));
        }
        if self.consensus.checkpoint_interval == 0 {
            return Err(ConfigError::ValidationError(
                "consensus.checkpoint_interval must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.network.loss_rate) {
            return Err(ConfigError::ValidationError(format!(
                "network.loss_rate must be within [0, 1], got {}",
                self.network.loss_rate
            )));
        }
        if self.client.retry_times_before_view_change == 0 || self.client.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "client retry counts must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve relative paths to absolute
    pub fn resolve_paths(&mut self, base_dir: impl AsRef<Path>) {
        let base = base_dir.as_ref();

        if self.journal.dir.is_relative() {
            self.journal.dir = base.join(&self.journal.dir);
        }
    }
}
