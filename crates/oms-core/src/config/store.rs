//! Config store for loading and saving bootstrap-gcp.toml.

use std::path::{Path, PathBuf};

use anyhow::Context;

use super::BootstrapConfig;
use super::paths::{config_dir, config_path_in};

#[derive(Debug, Clone)]
pub struct ConfigStore {
    config_path: PathBuf,
}

impl ConfigStore {
    /// Store rooted at the user config directory.
    pub fn from_default_location() -> anyhow::Result<Self> {
        Ok(Self::from_dir(&config_dir()?))
    }

    pub fn from_dir(dir: &Path) -> Self {
        Self {
            config_path: config_path_in(dir),
        }
    }

    pub fn from_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Load the stored config, or defaults when no file exists yet.
    pub fn load(&self) -> anyhow::Result<BootstrapConfig> {
        if !self.config_path.exists() {
            return Ok(BootstrapConfig::default());
        }
        let content = std::fs::read_to_string(&self.config_path).with_context(|| {
            format!("Failed to read config file: {}", self.config_path.display())
        })?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML: {}", self.config_path.display()))
    }

    pub fn save(&self, config: &BootstrapConfig) -> anyhow::Result<()> {
        let content =
            toml::to_string_pretty(config).context("Failed to serialize config to TOML")?;
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }
        std::fs::write(&self.config_path, content).with_context(|| {
            format!(
                "Failed to write config file: {}",
                self.config_path.display()
            )
        })?;
        Ok(())
    }
}
