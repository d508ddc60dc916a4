//! [`RemoteExecutor`] over russh.
//!
//! Each call opens a fresh session. With a jumpbox the target session runs
//! inside a `direct-tcpip` channel of the jumpbox session; both hops
//! authenticate with the same resolved credential.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_keys::agent::client::AgentClient;
use russh_keys::key::PublicKey;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::{
    CommandOutput, Credential, CredentialResolver, KnownHosts, RemoteExecutor, SshError,
    ensure_success, remote_parent, shell_quote,
};

pub const DEFAULT_PORT: u16 = 22;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const EXT_STDERR: u32 = 1;

struct ClientHandler {
    host: String,
    port: u16,
    known_hosts: Arc<KnownHosts>,
    rejected: Arc<AtomicBool>,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        match self
            .known_hosts
            .verify(&self.host, self.port, server_public_key)
        {
            Ok(true) => Ok(true),
            Ok(false) => {
                self.rejected.store(true, Ordering::SeqCst);
                Ok(false)
            }
            Err(e) => {
                warn!(host = %self.host, error = %e, "known_hosts check failed");
                self.rejected.store(true, Ordering::SeqCst);
                Ok(false)
            }
        }
    }
}

/// An authenticated session to the target, plus the jumpbox session carrying
/// it when tunneled. The jump handle must outlive the target handle.
struct Session {
    target: Handle<ClientHandler>,
    jump: Option<Handle<ClientHandler>>,
}

impl Session {
    async fn close(self) {
        let _ = self
            .target
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;
        if let Some(jump) = self.jump {
            let _ = jump.disconnect(Disconnect::ByApplication, "", "en").await;
        }
    }
}

pub struct SshExecutor {
    config: Arc<client::Config>,
    credentials: Arc<CredentialResolver>,
    known_hosts: Arc<KnownHosts>,
    port: u16,
    connect_timeout: Duration,
}

impl std::fmt::Debug for SshExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshExecutor")
            .field("credentials", &self.credentials)
            .field("known_hosts", &self.known_hosts)
            .field("port", &self.port)
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

impl SshExecutor {
    pub fn new(credentials: Arc<CredentialResolver>, known_hosts: Arc<KnownHosts>) -> Self {
        let config = client::Config {
            inactivity_timeout: Some(Duration::from_secs(600)),
            ..Default::default()
        };
        Self {
            config: Arc::new(config),
            credentials,
            known_hosts,
            port: DEFAULT_PORT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn handler(&self, host: &str) -> (ClientHandler, Arc<AtomicBool>) {
        let rejected = Arc::new(AtomicBool::new(false));
        let handler = ClientHandler {
            host: host.to_string(),
            port: self.port,
            known_hosts: Arc::clone(&self.known_hosts),
            rejected: Arc::clone(&rejected),
        };
        (handler, rejected)
    }

    async fn connect_direct(&self, host: &str) -> Result<Handle<ClientHandler>, SshError> {
        let (handler, rejected) = self.handler(host);
        let connecting = client::connect(
            Arc::clone(&self.config),
            (host.to_string(), self.port),
            handler,
        );
        let result = tokio::time::timeout(self.connect_timeout, connecting)
            .await
            .map_err(|_| SshError::Connect {
                host: host.to_string(),
                reason: format!("timed out after {:?}", self.connect_timeout),
            })?;
        result.map_err(|e| connect_error(host, &rejected, e))
    }

    async fn connect_through(
        &self,
        jump: &Handle<ClientHandler>,
        target: &str,
    ) -> Result<Handle<ClientHandler>, SshError> {
        let channel = jump
            .channel_open_direct_tcpip(target, u32::from(self.port), "127.0.0.1", 0)
            .await
            .map_err(|e| SshError::Connect {
                host: target.to_string(),
                reason: format!("direct-tcpip channel failed: {e}"),
            })?;
        let (handler, rejected) = self.handler(target);
        let connecting =
            client::connect_stream(Arc::clone(&self.config), channel.into_stream(), handler);
        let result = tokio::time::timeout(self.connect_timeout, connecting)
            .await
            .map_err(|_| SshError::Connect {
                host: target.to_string(),
                reason: format!("timed out after {:?}", self.connect_timeout),
            })?;
        result.map_err(|e| connect_error(target, &rejected, e))
    }

    async fn open(
        &self,
        jumpbox_ip: Option<&str>,
        target_ip: &str,
        user: &str,
    ) -> Result<Session, SshError> {
        let credential = self.credentials.resolve().await?;
        match jumpbox_ip {
            None => {
                let mut target = self.connect_direct(target_ip).await?;
                authenticate(&mut target, &credential, user, target_ip).await?;
                Ok(Session { target, jump: None })
            }
            Some(jump_ip) => {
                debug!(jumpbox = jump_ip, target = target_ip, "opening tunneled session");
                let mut jump = self.connect_direct(jump_ip).await?;
                authenticate(&mut jump, &credential, user, jump_ip).await?;
                let mut target = self.connect_through(&jump, target_ip).await?;
                authenticate(&mut target, &credential, user, target_ip).await?;
                Ok(Session {
                    target,
                    jump: Some(jump),
                })
            }
        }
    }
}

fn connect_error(host: &str, rejected: &AtomicBool, error: russh::Error) -> SshError {
    if rejected.load(Ordering::SeqCst) {
        return SshError::HostKeyMismatch {
            host: host.to_string(),
        };
    }
    SshError::Connect {
        host: host.to_string(),
        reason: error.to_string(),
    }
}

async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    credential: &Credential,
    user: &str,
    host: &str,
) -> Result<(), SshError> {
    let auth_error = |reason: String| SshError::Authentication {
        user: user.to_string(),
        host: host.to_string(),
        reason,
    };

    match credential {
        Credential::Key(key) => {
            let accepted = handle
                .authenticate_publickey(user, Arc::clone(key))
                .await
                .map_err(|e| auth_error(e.to_string()))?;
            if accepted {
                Ok(())
            } else {
                Err(auth_error("public key rejected".into()))
            }
        }
        Credential::Agent(socket) => {
            let mut agent = AgentClient::connect_uds(socket)
                .await
                .map_err(|e| auth_error(format!("ssh agent: {e}")))?;
            let identities = agent
                .request_identities()
                .await
                .map_err(|e| auth_error(format!("ssh agent: {e}")))?;
            for identity in identities {
                let (returned, result) = handle.authenticate_future(user, identity, agent).await;
                agent = returned;
                match result {
                    Ok(true) => return Ok(()),
                    Ok(false) => continue,
                    Err(e) => debug!(host, error = %e, "agent identity failed"),
                }
            }
            Err(auth_error("no agent identity accepted".into()))
        }
    }
}

async fn run_in_session(
    session: &Session,
    command: &str,
    env: &[(&str, &str)],
) -> anyhow::Result<CommandOutput> {
    let mut channel = session
        .target
        .channel_open_session()
        .await
        .context("Failed to open session channel")?;

    if let Err(e) = channel.agent_forward(false).await {
        warn!(error = %e, "agent forwarding request failed");
    }
    for (name, value) in env {
        channel
            .set_env(false, *name, *value)
            .await
            .with_context(|| format!("Failed to set remote environment variable {name}"))?;
    }
    channel
        .exec(true, command)
        .await
        .with_context(|| format!("Failed to start `{command}`"))?;

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut exit_status = None;
    while let Some(message) = channel.wait().await {
        match message {
            ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
            ChannelMsg::ExtendedData { ref data, ext } if ext == EXT_STDERR => {
                stderr.extend_from_slice(data)
            }
            ChannelMsg::ExitStatus {
                exit_status: status,
            } => exit_status = Some(status),
            _ => {}
        }
    }

    let exit_status = exit_status
        .with_context(|| format!("`{command}` terminated without an exit status"))?;
    Ok(CommandOutput {
        exit_status,
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    })
}

async fn upload(session: &Session, local_path: &Path, remote_path: &str) -> anyhow::Result<()> {
    let contents = tokio::fs::read(local_path)
        .await
        .with_context(|| format!("Failed to read {}", local_path.display()))?;

    let channel = session
        .target
        .channel_open_session()
        .await
        .context("Failed to open sftp channel")?;
    channel
        .request_subsystem(true, "sftp")
        .await
        .context("Failed to request sftp subsystem")?;
    let sftp = russh_sftp::client::SftpSession::new(channel.into_stream())
        .await
        .context("Failed to start sftp session")?;

    let mut file = sftp
        .create(remote_path)
        .await
        .with_context(|| format!("Failed to create remote file {remote_path}"))?;
    file.write_all(&contents)
        .await
        .with_context(|| format!("Failed to write remote file {remote_path}"))?;
    file.shutdown()
        .await
        .with_context(|| format!("Failed to close remote file {remote_path}"))?;
    let _ = sftp.close().await;
    Ok(())
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn exec(
        &self,
        jumpbox_ip: Option<&str>,
        target_ip: &str,
        user: &str,
        command: &str,
        env: &[(&str, &str)],
    ) -> anyhow::Result<CommandOutput> {
        debug!(target = target_ip, user, command, "remote exec");
        let session = self.open(jumpbox_ip, target_ip, user).await?;
        let result = run_in_session(&session, command, env).await;
        session.close().await;
        result.with_context(|| format!("{user}@{target_ip}"))
    }

    async fn copy_file(
        &self,
        jumpbox_ip: Option<&str>,
        target_ip: &str,
        user: &str,
        local_path: &Path,
        remote_path: &str,
    ) -> anyhow::Result<()> {
        debug!(
            target = target_ip,
            user,
            local = %local_path.display(),
            remote = remote_path,
            "remote copy"
        );
        let session = self.open(jumpbox_ip, target_ip, user).await?;
        let result = async {
            if let Some(parent) = remote_parent(remote_path) {
                let mkdir = format!("mkdir -p {}", shell_quote(parent));
                let output = run_in_session(&session, &mkdir, &[]).await?;
                ensure_success(&mkdir, output)?;
            }
            upload(&session, local_path, remote_path).await
        }
        .await;
        session.close().await;
        result.with_context(|| format!("copy {} to {user}@{target_ip}:{remote_path}", local_path.display()))
    }
}
