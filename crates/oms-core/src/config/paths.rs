//! Config and key path resolution helpers.

use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "bootstrap-gcp.toml";

/// `~/.config/oms` (or the platform equivalent).
pub fn config_dir() -> anyhow::Result<PathBuf> {
    let dir = dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?
        .join("oms");
    Ok(dir)
}

pub fn config_path_in(dir: &Path) -> PathBuf {
    dir.join(CONFIG_FILE_NAME)
}

pub fn default_ssh_private_key_path() -> anyhow::Result<PathBuf> {
    Ok(ssh_dir()?.join("id_ed25519"))
}

pub fn default_ssh_public_key_path() -> anyhow::Result<PathBuf> {
    Ok(ssh_dir()?.join("id_ed25519.pub"))
}

pub fn default_known_hosts_path() -> anyhow::Result<PathBuf> {
    Ok(ssh_dir()?.join("known_hosts"))
}

fn ssh_dir() -> anyhow::Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?;
    Ok(home.join(".ssh"))
}
