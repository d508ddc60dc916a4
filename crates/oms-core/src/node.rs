//! Cluster machines and their idempotent capabilities.
//!
//! A [`Node`] knows how to reach itself: directly through its external
//! address, or through its jumpbox. The `has_*` methods are side-effect free
//! checks; their `configure_*` / `install_*` counterparts perform the change.
//! Callers pair them so that re-running a step converges without repeating
//! work.

use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{Context, bail};
use tracing::{debug, info};

use crate::remote::{CommandOutput, PORTAL_API_KEY_ENV, RemoteExecutor, ensure_success, shell_quote};
use crate::retry;

pub const ROOT_USER: &str = "root";
/// Unprivileged login provisioned through instance metadata.
pub const DEFAULT_USER: &str = "ubuntu";

pub const INOTIFY_MAX_USER_WATCHES: u64 = 1_048_576;
pub const VM_MAX_MAP_COUNT: u64 = 262_144;
pub const OMS_CLI_PATH: &str = "/usr/local/bin/oms-cli";
pub const REGISTRY_CONTAINER: &str = "registry";
pub const REGISTRY_PORT: u16 = 5000;

pub struct Node {
    name: String,
    external_ip: Option<String>,
    internal_ip: String,
    jumpbox: Option<Weak<Node>>,
    executor: Arc<dyn RemoteExecutor>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let jumpbox = self
            .jumpbox
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|j| j.name.clone());
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("external_ip", &self.external_ip)
            .field("internal_ip", &self.internal_ip)
            .field("jumpbox", &jumpbox)
            .finish()
    }
}

impl Node {
    /// A node reachable on its own external address.
    pub fn new(
        name: impl Into<String>,
        external_ip: Option<String>,
        internal_ip: impl Into<String>,
        executor: Arc<dyn RemoteExecutor>,
    ) -> Self {
        Self {
            name: name.into(),
            external_ip,
            internal_ip: internal_ip.into(),
            jumpbox: None,
            executor,
        }
    }

    /// A node reached through `jumpbox`. Jumpbox chains are rejected.
    pub fn behind_jumpbox(
        name: impl Into<String>,
        external_ip: Option<String>,
        internal_ip: impl Into<String>,
        jumpbox: &Arc<Node>,
        executor: Arc<dyn RemoteExecutor>,
    ) -> anyhow::Result<Self> {
        let name = name.into();
        if jumpbox.jumpbox.is_some() {
            bail!(
                "{} cannot serve as jumpbox for {name}: it is itself behind a jumpbox",
                jumpbox.name
            );
        }
        if jumpbox.external_ip.is_none() {
            bail!(
                "{} cannot serve as jumpbox for {name}: it has no external IP",
                jumpbox.name
            );
        }
        Ok(Self {
            name,
            external_ip,
            internal_ip: internal_ip.into(),
            jumpbox: Some(Arc::downgrade(jumpbox)),
            executor,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn external_ip(&self) -> Option<&str> {
        self.external_ip.as_deref()
    }

    pub fn internal_ip(&self) -> &str {
        &self.internal_ip
    }

    /// The jumpbox, if this node is tunneled and the jumpbox is still alive.
    pub fn jumpbox(&self) -> Option<Arc<Node>> {
        self.jumpbox.as_ref().and_then(Weak::upgrade)
    }

    /// `(jumpbox_ip, target_ip)` for a remote call.
    pub fn route(&self) -> anyhow::Result<(Option<String>, String)> {
        match &self.jumpbox {
            Some(weak) => {
                let jumpbox = weak
                    .upgrade()
                    .with_context(|| format!("jumpbox of {} no longer exists", self.name))?;
                let jump_ip = jumpbox
                    .external_ip
                    .clone()
                    .with_context(|| format!("jumpbox {} has no external IP", jumpbox.name))?;
                Ok((Some(jump_ip), self.internal_ip.clone()))
            }
            None => {
                let ip = self
                    .external_ip
                    .clone()
                    .with_context(|| format!("{} has no external IP and no jumpbox", self.name))?;
                Ok((None, ip))
            }
        }
    }

    pub async fn exec(
        &self,
        user: &str,
        command: &str,
        env: &[(&str, &str)],
    ) -> anyhow::Result<CommandOutput> {
        let (jump_ip, target_ip) = self.route()?;
        self.executor
            .exec(jump_ip.as_deref(), &target_ip, user, command, env)
            .await
            .with_context(|| format!("on {}", self.name))
    }

    /// Run `command`, failing on a non-zero exit status.
    pub async fn run(&self, user: &str, command: &str) -> anyhow::Result<()> {
        let output = self.exec(user, command, &[]).await?;
        ensure_success(command, output)
            .map(|_| ())
            .with_context(|| format!("on {}", self.name))
    }

    /// Exit status zero means yes. Transport failures are errors.
    pub async fn check(&self, user: &str, command: &str) -> anyhow::Result<bool> {
        let output = self.exec(user, command, &[]).await?;
        debug!(node = %self.name, command, ok = output.success(), "check");
        Ok(output.success())
    }

    pub async fn copy_file(
        &self,
        user: &str,
        local_path: &Path,
        remote_path: &str,
    ) -> anyhow::Result<()> {
        let (jump_ip, target_ip) = self.route()?;
        self.executor
            .copy_file(jump_ip.as_deref(), &target_ip, user, local_path, remote_path)
            .await
            .with_context(|| format!("on {}", self.name))
    }

    /// Poll `true` every `interval` until it succeeds or `timeout` elapses.
    ///
    /// Connection failures are expected while the machine boots; errors
    /// retrying cannot fix (credentials, host keys) end the wait early.
    pub async fn wait_ready(
        &self,
        user: &str,
        timeout: Duration,
        interval: Duration,
    ) -> anyhow::Result<()> {
        let poll = async {
            loop {
                match self.exec(user, "true", &[]).await {
                    Ok(output) if output.success() => return Ok(()),
                    Ok(output) => debug!(node = %self.name, status = output.exit_status, "not ready"),
                    Err(err) if retry::is_permanent(&err) => return Err(err),
                    Err(err) => debug!(node = %self.name, error = %format!("{err:#}"), "not ready"),
                }
                tokio::time::sleep(interval).await;
            }
        };
        tokio::time::timeout(timeout, poll)
            .await
            .with_context(|| format!("{} not reachable over SSH after {timeout:?}", self.name))?
    }

    // Root login

    /// Whether root may log in with the provisioned key.
    pub async fn has_root_login(&self) -> anyhow::Result<bool> {
        self.check(
            DEFAULT_USER,
            "sudo grep -q '^PermitRootLogin yes' /etc/ssh/sshd_config \
             && ! sudo grep -q 'command=' /root/.ssh/authorized_keys",
        )
        .await
    }

    /// Permit root login and strip the forced command cloud images put in
    /// front of root's authorized keys.
    pub async fn configure_root_login(&self) -> anyhow::Result<()> {
        info!(node = %self.name, "enabling root login");
        self.run(
            DEFAULT_USER,
            "sudo sed -i -E 's/^#?PermitRootLogin.*/PermitRootLogin yes/' /etc/ssh/sshd_config \
             && (sudo grep -q '^PermitRootLogin yes' /etc/ssh/sshd_config \
                 || echo 'PermitRootLogin yes' | sudo tee -a /etc/ssh/sshd_config >/dev/null) \
             && sudo sed -i -E 's/^.*(ssh-(ed25519|rsa)|ecdsa-sha2-nistp[0-9]+) /\\1 /' /root/.ssh/authorized_keys \
             && sudo systemctl restart ssh",
        )
        .await
    }

    /// Log in as root and run a no-op.
    pub async fn verify_root_login(&self) -> anyhow::Result<()> {
        self.run(ROOT_USER, "true").await
    }

    // sshd

    pub async fn has_accept_env(&self) -> anyhow::Result<bool> {
        self.check(
            ROOT_USER,
            &format!("grep -q '^AcceptEnv {PORTAL_API_KEY_ENV}$' /etc/ssh/sshd_config"),
        )
        .await
    }

    pub async fn configure_accept_env(&self) -> anyhow::Result<()> {
        info!(node = %self.name, "accepting {PORTAL_API_KEY_ENV} over ssh");
        self.run(
            ROOT_USER,
            &format!(
                "echo 'AcceptEnv {PORTAL_API_KEY_ENV}' >> /etc/ssh/sshd_config && systemctl restart ssh"
            ),
        )
        .await
    }

    // Kernel parameters

    pub async fn has_inotify_watches(&self) -> anyhow::Result<bool> {
        self.has_sysctl_at_least("fs.inotify.max_user_watches", INOTIFY_MAX_USER_WATCHES)
            .await
    }

    pub async fn configure_inotify_watches(&self) -> anyhow::Result<()> {
        self.set_sysctl("fs.inotify.max_user_watches", INOTIFY_MAX_USER_WATCHES)
            .await
    }

    pub async fn has_max_map_count(&self) -> anyhow::Result<bool> {
        self.has_sysctl_at_least("vm.max_map_count", VM_MAX_MAP_COUNT)
            .await
    }

    pub async fn configure_max_map_count(&self) -> anyhow::Result<()> {
        self.set_sysctl("vm.max_map_count", VM_MAX_MAP_COUNT).await
    }

    async fn has_sysctl_at_least(&self, key: &str, value: u64) -> anyhow::Result<bool> {
        self.check(
            ROOT_USER,
            &format!("test \"$(sysctl -n {key})\" -ge {value}"),
        )
        .await
    }

    async fn set_sysctl(&self, key: &str, value: u64) -> anyhow::Result<()> {
        info!(node = %self.name, key, value, "setting kernel parameter");
        self.run(
            ROOT_USER,
            &format!(
                "sysctl -w {key}={value} && echo '{key}={value}' > /etc/sysctl.d/99-oms-{key}.conf"
            ),
        )
        .await
    }

    // Software

    pub async fn has_command(&self, command: &str) -> anyhow::Result<bool> {
        self.check(
            ROOT_USER,
            &format!("command -v {} >/dev/null 2>&1", shell_quote(command)),
        )
        .await
    }

    pub async fn has_file(&self, path: &str) -> anyhow::Result<bool> {
        self.check(ROOT_USER, &format!("test -f {}", shell_quote(path)))
            .await
    }

    pub async fn has_oms_cli(&self) -> anyhow::Result<bool> {
        self.has_command("oms-cli").await
    }

    /// Install `local_binary` as `oms-cli`.
    pub async fn install_oms_cli(&self, local_binary: &Path) -> anyhow::Result<()> {
        info!(node = %self.name, "installing oms-cli");
        self.copy_file(ROOT_USER, local_binary, OMS_CLI_PATH).await?;
        self.run(ROOT_USER, &format!("chmod +x {OMS_CLI_PATH}")).await
    }

    pub async fn has_docker(&self) -> anyhow::Result<bool> {
        self.has_command("docker").await
    }

    pub async fn install_docker(&self) -> anyhow::Result<()> {
        info!(node = %self.name, "installing docker");
        self.run(ROOT_USER, "curl -fsSL https://get.docker.com | sh")
            .await
    }

    pub async fn has_registry_container(&self) -> anyhow::Result<bool> {
        self.check(
            ROOT_USER,
            &format!(
                "docker ps --filter name=^{REGISTRY_CONTAINER}$ --filter status=running -q | grep -q ."
            ),
        )
        .await
    }

    /// Start the local image registry, reusing a stopped container.
    pub async fn run_registry_container(&self) -> anyhow::Result<()> {
        info!(node = %self.name, "starting registry container");
        self.run(
            ROOT_USER,
            &format!(
                "docker start {REGISTRY_CONTAINER} 2>/dev/null \
                 || docker run -d --restart=always -p {REGISTRY_PORT}:5000 --name {REGISTRY_CONTAINER} registry:2"
            ),
        )
        .await
    }

    // Secrets

    pub async fn has_age_key(&self, key_path: &str) -> anyhow::Result<bool> {
        self.has_file(key_path).await
    }

    pub async fn generate_age_key(&self, key_path: &str) -> anyhow::Result<()> {
        info!(node = %self.name, key_path, "generating age key");
        let quoted = shell_quote(key_path);
        self.run(
            ROOT_USER,
            &format!("mkdir -p \"$(dirname {quoted})\" && age-keygen -o {quoted}"),
        )
        .await
    }

    /// sops-encrypted documents carry a top-level `sops:` section.
    pub async fn is_vault_encrypted(&self, vault_path: &str) -> anyhow::Result<bool> {
        self.check(
            ROOT_USER,
            &format!("grep -q '^sops:' {}", shell_quote(vault_path)),
        )
        .await
    }

    pub async fn encrypt_vault(&self, vault_path: &str, age_key_path: &str) -> anyhow::Result<()> {
        info!(node = %self.name, vault_path, "encrypting vault");
        let key = shell_quote(age_key_path);
        self.run(
            ROOT_USER,
            &format!(
                "SOPS_AGE_KEY_FILE={key} sops --encrypt --in-place --age \"$(age-keygen -y {key})\" {}",
                shell_quote(vault_path)
            ),
        )
        .await
    }

    /// Run an OMS CLI command with the portal API key forwarded.
    pub async fn run_oms_cli(&self, args: &str, api_key: &str) -> anyhow::Result<()> {
        let command = format!("{OMS_CLI_PATH} {args}");
        let output = self
            .exec(ROOT_USER, &command, &[(PORTAL_API_KEY_ENV, api_key)])
            .await?;
        ensure_success(&command, output)
            .map(|_| ())
            .with_context(|| format!("on {}", self.name))
    }
}
