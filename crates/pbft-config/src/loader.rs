//! Configuration loader with multi-source merging

use crate::{Paths, PbftConfig};
use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};

/// Configuration loader with builder pattern
pub struct ConfigLoader {
    project_dir: PathBuf,
    env_prefix: String,
    include_user_config: bool,
}

impl ConfigLoader {
    /// Create a new config loader with default project directory (current dir)
    pub fn new() -> Self {
        Self {
            project_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env_prefix: "PBFT".to_string(),
            include_user_config: true,
        }
    }

    /// Set the project directory
    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Set the environment variable prefix (default: "PBFT")
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Skip ~/.config/pbft/config.toml
    pub fn without_user_config(mut self) -> Self {
        self.include_user_config = false;
        self
    }

    /// Load configuration from all sources with proper precedence
    pub fn load(self) -> Result<PbftConfig> {
        let mut builder = config::Config::builder();

        // 1. Start with built-in defaults
        let defaults = PbftConfig::default();
        builder = builder.add_source(config::Config::try_from(&defaults)?);

        // 2. User config (~/.config/pbft/config.toml)
        if self.include_user_config {
            if let Ok(user_config_file) = Paths::new().user_config_file() {
                builder = builder.add_source(
                    config::File::from(user_config_file)
                        .required(false)
                        .format(config::FileFormat::Toml),
                );
            }
        }

        // 3. Project config (pbft.toml)
        builder = builder.add_source(
            config::File::from(Paths::project_config_file(&self.project_dir))
                .required(false)
                .format(config::FileFormat::Toml),
        );

        // 4. Local config (pbft.local.toml, gitignored)
        builder = builder.add_source(
            config::File::from(Paths::local_config_file(&self.project_dir))
                .required(false)
                .format(config::FileFormat::Toml),
        );

        // 5. Environment variables (PBFT_CONSENSUS__CHECKPOINT_INTERVAL=20)
        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;

        let mut pbft_config: PbftConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        pbft_config.resolve_paths(&self.project_dir);
        pbft_config
            .validate()
            .context("Configuration failed validation")?;

        Ok(pbft_config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default(self) -> PbftConfig {
        self.load().unwrap_or_default()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn loader(dir: &Path) -> ConfigLoader {
        ConfigLoader::new()
            .with_project_dir(dir)
            .with_env_prefix("PBFT_LOADER_TEST")
            .without_user_config()
    }

    #[test]
    fn test_load_defaults() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let config = loader(temp_dir.path()).load().expect("Failed to load config");

        assert_eq!(config.cluster.replicas.len(), 4);
        assert_eq!(config.consensus.checkpoint_interval, 10);
        assert_eq!(config.client.resend_interval_ms, 1_000);
    }

    #[test]
    fn test_load_project_config() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        let config_content = r#"
[consensus]
checkpoint_interval = 20
view_change_min_interval_ms = 500

[network]
loss_rate = 0.05

[[cluster.replicas]]
host = "10.0.0.1"
port = 7000

[[cluster.replicas]]
host = "10.0.0.2"
port = 7000

[[cluster.replicas]]
host = "10.0.0.3"
port = 7000

[[cluster.replicas]]
host = "10.0.0.4"
port = 7000

[[cluster.replicas]]
host = "10.0.0.5"
port = 7000
"#;
        fs::write(project_dir.join("pbft.toml"), config_content)
            .expect("Failed to write config");

        let config = loader(project_dir).load().expect("Failed to load config");

        assert_eq!(config.consensus.checkpoint_interval, 20);
        assert_eq!(config.consensus.view_change_min_interval_ms, 500);
        assert!((config.network.loss_rate - 0.05).abs() < f64::EPSILON);
        assert_eq!(config.cluster.replicas.len(), 5);
        assert_eq!(config.cluster.replicas[4].host, "10.0.0.5");
        assert_eq!(config.max_faults(), 1);
    }

    #[test]
    fn test_local_overrides() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        fs::write(
            project_dir.join("pbft.toml"),
            r"
[client]
max_attempts = 5
",
        )
        .expect("Failed to write project config");

        fs::write(
            project_dir.join("pbft.local.toml"),
            r"
[client]
max_attempts = 9
",
        )
        .expect("Failed to write local config");

        let config = loader(project_dir).load().expect("Failed to load config");

        // Local config should override project config
        assert_eq!(config.client.max_attempts, 9);
    }

    #[test]
    fn test_invalid_file_fails_validation() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        fs::write(
            project_dir.join("pbft.toml"),
            r"
[consensus]
checkpoint_interval = 0
",
        )
        .expect("Failed to write config");

        assert!(loader(project_dir).load().is_err());
    }

    // Environment overrides are not exercised here: the process environment is
    // shared by every test thread. In actual usage:
    //
    // PBFT_CONSENSUS__CHECKPOINT_INTERVAL=50
    // PBFT_NETWORK__LOSS_RATE=0.1
    // PBFT_JOURNAL__DIR=/var/lib/pbft

    #[test]
    fn test_path_resolution() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let config = loader(temp_dir.path()).load().expect("Failed to load config");

        assert!(config.journal.dir.is_absolute());
        assert!(config.journal.dir.starts_with(temp_dir.path()));
    }
}
