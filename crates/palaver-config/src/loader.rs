//! Configuration loader with multi-source merging.

use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::PalaverConfig;

/// Configuration loader with builder pattern.
pub struct ConfigLoader {
    project_dir: PathBuf,
    config_file: Option<PathBuf>,
    env_prefix: String,
}

impl ConfigLoader {
    /// Create a new config loader rooted at the current directory.
    pub fn new() -> Self {
        Self {
            project_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            config_file: None,
            env_prefix: "PALAVER".to_string(),
        }
    }

    /// Set the directory searched for `palaver.toml`.
    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Use an explicit config file instead of the directory search.
    pub fn with_config_file(mut self, path: impl AsRef<Path>) -> Self {
        self.config_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set the environment variable prefix (default: "PALAVER").
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Load configuration from all sources with proper precedence, then
    /// validate the result.
    pub fn load(self) -> Result<PalaverConfig> {
        let mut builder = config::Config::builder();

        // 1. Built-in defaults.
        let defaults = PalaverConfig::default();
        builder = builder.add_source(config::Config::try_from(&defaults)?);

        // 2. Config file (explicit path, or palaver.toml in the project dir).
        let config_file = self
            .config_file
            .clone()
            .unwrap_or_else(|| self.project_dir.join("palaver.toml"));
        if config_file.exists() {
            builder = builder.add_source(
                config::File::from(config_file)
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        // 3. Environment variables (PALAVER_*), e.g.
        //    PALAVER_NODE_ID=2, PALAVER_RAFT_HEARTBEAT_INTERVAL_MS=100.
        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .separator("_")
                .try_parsing(true),
        );

        let merged = builder.build().context("failed to build configuration")?;
        let loaded: PalaverConfig = merged
            .try_deserialize()
            .context("failed to deserialize configuration")?;

        loaded.validate().context("configuration rejected")?;
        Ok(loaded)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
