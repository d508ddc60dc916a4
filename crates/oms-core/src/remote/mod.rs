//! Remote command execution over SSH
//!
//! [`RemoteExecutor`] is the seam between the bootstrap pipeline and the
//! machines it configures. Every call names an optional jumpbox: when set, the
//! target is reached through a second SSH session tunneled over the jumpbox
//! connection. [`ssh::SshExecutor`] is the production implementation.

pub mod credentials;
pub mod known_hosts;
pub mod ssh;

use std::path::Path;

use async_trait::async_trait;

pub use credentials::{Credential, CredentialResolver, NoPassphrase, PassphraseProvider};
pub use known_hosts::KnownHosts;
pub use ssh::SshExecutor;

/// Environment variable forwarded into remote sessions for OMS commands.
pub const PORTAL_API_KEY_ENV: &str = "OMS_PORTAL_API_KEY";

#[derive(Debug, thiserror::Error)]
pub enum SshError {
    #[error("SSH authentication failed for {user}@{host}: {reason}")]
    Authentication {
        user: String,
        host: String,
        reason: String,
    },

    #[error("No usable SSH credentials: {0}")]
    NoCredentials(String),

    #[error("Host key for {host} does not match known_hosts")]
    HostKeyMismatch { host: String },

    #[error("Failed to connect to {host}: {reason}")]
    Connect { host: String, reason: String },

    #[error("Command `{command}` exited with status {exit_status}: {stderr}")]
    CommandFailed {
        command: String,
        exit_status: u32,
        stderr: String,
    },
}

impl SshError {
    /// Errors another attempt cannot fix: rejected or missing credentials and
    /// changed host keys.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            SshError::Authentication { .. }
                | SshError::NoCredentials(_)
                | SshError::HostKeyMismatch { .. }
        )
    }
}

/// Result of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_status: u32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}

/// Runs commands and copies files on remote hosts.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run `command` as `user` on `target_ip`, hopping through `jumpbox_ip`
    /// when given. A non-zero exit status is not an error here.
    async fn exec(
        &self,
        jumpbox_ip: Option<&str>,
        target_ip: &str,
        user: &str,
        command: &str,
        env: &[(&str, &str)],
    ) -> anyhow::Result<CommandOutput>;

    /// Copy a local file to `remote_path`, creating the parent directory.
    async fn copy_file(
        &self,
        jumpbox_ip: Option<&str>,
        target_ip: &str,
        user: &str,
        local_path: &Path,
        remote_path: &str,
    ) -> anyhow::Result<()>;

    /// Like [`exec`](Self::exec) but fails on a non-zero exit status.
    async fn run_command(
        &self,
        jumpbox_ip: Option<&str>,
        target_ip: &str,
        user: &str,
        command: &str,
    ) -> anyhow::Result<()> {
        let output = self.exec(jumpbox_ip, target_ip, user, command, &[]).await?;
        ensure_success(command, output).map(|_| ())
    }
}

pub(crate) fn ensure_success(command: &str, output: CommandOutput) -> anyhow::Result<CommandOutput> {
    if output.success() {
        return Ok(output);
    }
    Err(SshError::CommandFailed {
        command: command.to_string(),
        exit_status: output.exit_status,
        stderr: output.stderr.trim().to_string(),
    }
    .into())
}

/// Single-quote `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Parent directory of a remote path, if any.
pub fn remote_parent(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => Some("/"),
        Some(index) => Some(&trimmed[..index]),
        None => None,
    }
}
