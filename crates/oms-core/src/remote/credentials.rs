//! SSH credential resolution.
//!
//! A running SSH agent wins over a key file: it never hands key material to
//! this process and never needs a passphrase. Without an agent the configured
//! private key is decrypted once per run and kept in memory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use russh_keys::agent::client::AgentClient;
use russh_keys::key::KeyPair;
use tokio::sync::Mutex;
use tracing::{debug, info};
use zeroize::Zeroizing;

use super::SshError;

pub const AGENT_SOCKET_ENV: &str = "SSH_AUTH_SOCK";

/// Source of passphrases for encrypted private keys.
pub trait PassphraseProvider: Send + Sync {
    fn passphrase(&self, key_path: &Path) -> anyhow::Result<Zeroizing<String>>;
}

/// Refuses every passphrase request; used for non-interactive runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPassphrase;

impl PassphraseProvider for NoPassphrase {
    fn passphrase(&self, key_path: &Path) -> anyhow::Result<Zeroizing<String>> {
        anyhow::bail!(
            "{} is encrypted and no passphrase prompt is available",
            key_path.display()
        )
    }
}

/// A resolved way to authenticate.
#[derive(Clone)]
pub enum Credential {
    /// Agent socket that offered at least one identity
    Agent(PathBuf),
    Key(Arc<KeyPair>),
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Agent(socket) => f.debug_tuple("Agent").field(socket).finish(),
            Credential::Key(_) => f.write_str("Key(..)"),
        }
    }
}

pub struct CredentialResolver {
    agent_socket: Option<PathBuf>,
    key_path: Option<PathBuf>,
    passphrase: Arc<dyn PassphraseProvider>,
    cached_key: Mutex<Option<Arc<KeyPair>>>,
}

impl std::fmt::Debug for CredentialResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialResolver")
            .field("agent_socket", &self.agent_socket)
            .field("key_path", &self.key_path)
            .finish_non_exhaustive()
    }
}

impl CredentialResolver {
    pub fn new(
        agent_socket: Option<PathBuf>,
        key_path: Option<PathBuf>,
        passphrase: Arc<dyn PassphraseProvider>,
    ) -> Self {
        Self {
            agent_socket,
            key_path,
            passphrase,
            cached_key: Mutex::new(None),
        }
    }

    /// Resolver using the agent named by `SSH_AUTH_SOCK`, if any.
    pub fn from_env(key_path: Option<PathBuf>, passphrase: Arc<dyn PassphraseProvider>) -> Self {
        let agent_socket = std::env::var_os(AGENT_SOCKET_ENV)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from);
        Self::new(agent_socket, key_path, passphrase)
    }

    pub async fn resolve(&self) -> Result<Credential, SshError> {
        if let Some(socket) = &self.agent_socket {
            match agent_identity_count(socket).await {
                Ok(count) if count > 0 => {
                    debug!(socket = %socket.display(), identities = count, "using ssh agent");
                    return Ok(Credential::Agent(socket.clone()));
                }
                Ok(_) => debug!(socket = %socket.display(), "ssh agent has no identities"),
                Err(reason) => debug!(socket = %socket.display(), %reason, "ssh agent unreachable"),
            }
        }

        let key = self.load_key().await?;
        Ok(Credential::Key(key))
    }

    async fn load_key(&self) -> Result<Arc<KeyPair>, SshError> {
        let mut cached = self.cached_key.lock().await;
        if let Some(key) = cached.as_ref() {
            return Ok(Arc::clone(key));
        }

        let path = self.key_path.as_deref().ok_or_else(|| {
            SshError::NoCredentials("no ssh agent available and no private key configured".into())
        })?;
        let contents = Zeroizing::new(std::fs::read_to_string(path).map_err(|e| {
            SshError::NoCredentials(format!("cannot read private key {}: {e}", path.display()))
        })?);

        let key = match russh_keys::decode_secret_key(&contents, None) {
            Ok(key) => key,
            Err(russh_keys::Error::KeyIsEncrypted) => {
                let passphrase = self.passphrase.passphrase(path).map_err(|e| {
                    SshError::NoCredentials(format!("{}: {e:#}", path.display()))
                })?;
                russh_keys::decode_secret_key(&contents, Some(passphrase.as_str())).map_err(
                    |e| {
                        SshError::NoCredentials(format!(
                            "cannot decrypt private key {}: {e}",
                            path.display()
                        ))
                    },
                )?
            }
            Err(e) => {
                return Err(SshError::NoCredentials(format!(
                    "malformed private key {}: {e}",
                    path.display()
                )));
            }
        };

        info!(path = %path.display(), "loaded ssh private key");
        let key = Arc::new(key);
        *cached = Some(Arc::clone(&key));
        Ok(key)
    }
}

async fn agent_identity_count(socket: &Path) -> Result<usize, russh_keys::Error> {
    let mut agent = AgentClient::connect_uds(socket).await?;
    let identities = agent.request_identities().await?;
    Ok(identities.len())
}
