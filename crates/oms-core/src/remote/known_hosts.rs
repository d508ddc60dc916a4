//! Persistent host-key trust.
//!
//! Unknown hosts are recorded on first contact; a host presenting a key that
//! differs from the recorded one is rejected.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use russh_keys::key::PublicKey;
use tracing::{info, warn};

#[derive(Debug)]
pub struct KnownHosts {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl KnownHosts {
    /// Open the store at `path`, creating an empty file if needed.
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create directory: {}", parent.display())
                })?;
            }
            std::fs::write(&path, b"")
                .with_context(|| format!("Failed to create known hosts: {}", path.display()))?;
            info!(path = %path.display(), "created empty known_hosts file");
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the host may be trusted. Unknown hosts are learned.
    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> Result<bool, russh_keys::Error> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match russh_keys::check_known_hosts_path(host, port, key, &self.path) {
            Ok(true) => Ok(true),
            Ok(false) => {
                russh_keys::learn_known_hosts_path(host, port, key, &self.path)?;
                info!(host, port, "recorded new host key");
                Ok(true)
            }
            Err(russh_keys::Error::KeyChanged { line }) => {
                warn!(
                    host,
                    port,
                    line,
                    path = %self.path.display(),
                    "host key changed, refusing connection"
                );
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}
