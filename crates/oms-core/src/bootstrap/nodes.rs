//! Steps that act on the machines.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use tracing::info;

use super::iam::{JSON_KEY_USER, REGISTRY_SECRET};
use super::network::{NETWORK, SUBNETWORK};
use super::{Bootstrapper, REMOTE_CONFIG_DIR, RegistryCredentials};
use crate::config::RegistryType;
use crate::fleet::{FleetProvisioner, FleetSettings, FleetTopology};
use crate::node::{DEFAULT_USER, REGISTRY_PORT};

pub const GHCR_SERVER: &str = "ghcr.io";
pub(super) const AGE_KEY_PATH: &str = "/etc/codesphere/secrets/age_key.txt";

impl Bootstrapper {
    /// Create the fleet, record its topology and wait until every node
    /// accepts SSH.
    pub(super) async fn ensure_compute_instances(&mut self) -> anyhow::Result<()> {
        let project_id = self.env.require_project()?.to_string();
        let key_path = self.env.config.ssh_public_key_path()?;
        let ssh_public_key = std::fs::read_to_string(&key_path)
            .with_context(|| format!("Failed to read SSH public key: {}", key_path.display()))?;

        let settings = FleetSettings {
            project_id: project_id.clone(),
            region: self.env.config.region().to_string(),
            zone: self.env.config.zone().to_string(),
            network: NETWORK.to_string(),
            subnetwork: SUBNETWORK.to_string(),
            preemptible: self.env.config.preemptible,
            ssh_public_key,
        };
        let provisioner = FleetProvisioner::new(
            Arc::clone(&self.client),
            Arc::clone(&self.executor),
            settings,
        );
        self.logger
            .substep(&format!("provisioning {} VMs", self.options.fleet.len()));
        let fleet = provisioner.provision_fleet(&self.options.fleet).await?;

        let topology_path = self.env.config.topology_path();
        FleetTopology::from_fleet(&project_id, &fleet).save(&topology_path)?;
        info!(path = %topology_path.display(), "wrote fleet topology");

        self.env.jumpbox = Some(fleet.jumpbox);
        self.env.postgres = Some(fleet.postgres);
        self.env.storage = fleet.storage;
        self.env.control_plane = fleet.control_plane;

        // Jumpbox first: the others are reached through it.
        for node in self.env.nodes() {
            self.logger
                .substep(&format!("waiting for SSH on {}", node.name()));
            node.wait_ready(
                DEFAULT_USER,
                self.options.ssh_ready_timeout,
                self.options.ssh_ready_poll,
            )
            .await?;
        }
        Ok(())
    }

    pub(super) async fn ensure_root_login(&mut self) -> anyhow::Result<()> {
        for node in self.env.nodes() {
            if node.has_root_login().await? {
                self.logger
                    .substep(&format!("{}: root login already enabled", node.name()));
            } else {
                self.logger
                    .substep(&format!("{}: enabling root login", node.name()));
                node.configure_root_login().await?;
            }
            self.options
                .root_login_retry
                .run(self.logger.as_ref(), || node.verify_root_login())
                .await
                .with_context(|| format!("root login on {} not working", node.name()))?;
        }
        Ok(())
    }

    pub(super) async fn configure_jumpbox(&mut self) -> anyhow::Result<()> {
        let jumpbox = Arc::clone(self.env.require_jumpbox()?);

        if !jumpbox.has_accept_env().await? {
            self.logger.substep("accepting portal API key over SSH");
            jumpbox.configure_accept_env().await?;
        }

        if jumpbox.has_oms_cli().await? {
            self.logger.substep("oms-cli already installed");
        } else {
            let binary = match &self.options.oms_cli_binary {
                Some(path) => path.clone(),
                None => current_executable()?,
            };
            self.logger.substep("installing oms-cli");
            jumpbox.install_oms_cli(&binary).await?;
        }
        Ok(())
    }

    pub(super) async fn tune_kernel(&mut self) -> anyhow::Result<()> {
        for node in self.env.nodes() {
            if !node.has_inotify_watches().await? {
                self.logger
                    .substep(&format!("{}: raising inotify watches", node.name()));
                node.configure_inotify_watches().await?;
            }
            if !node.has_max_map_count().await? {
                self.logger
                    .substep(&format!("{}: raising max map count", node.name()));
                node.configure_max_map_count().await?;
            }
        }
        Ok(())
    }

    pub(super) async fn finalize_registry(&mut self) -> anyhow::Result<()> {
        let credentials = match self.env.config.registry_type {
            RegistryType::LocalContainer => {
                let postgres = self
                    .env
                    .postgres
                    .clone()
                    .context("postgres node has not been provisioned yet")?;
                if !postgres.has_docker().await? {
                    self.logger.substep("installing docker on postgres");
                    postgres.install_docker().await?;
                }
                if !postgres.has_registry_container().await? {
                    self.logger.substep("starting registry container");
                    postgres.run_registry_container().await?;
                }
                RegistryCredentials {
                    server: format!("{}:{REGISTRY_PORT}", postgres.internal_ip()),
                    username: None,
                    password: None,
                }
            }
            RegistryType::ArtifactRegistry => {
                let project_id = self.env.require_project()?;
                let key = self
                    .env
                    .vault
                    .password(REGISTRY_SECRET)
                    .context("artifact registry writer key is missing from the vault")?;
                RegistryCredentials {
                    server: format!(
                        "{}-docker.pkg.dev/{project_id}/{}",
                        self.env.config.region(),
                        self.env.config.artifact_repository()
                    ),
                    username: Some(JSON_KEY_USER.to_string()),
                    password: Some(key.to_string()),
                }
            }
            RegistryType::GitHub => {
                let Some(token) = self
                    .env
                    .config
                    .github_pat
                    .clone()
                    .filter(|t| !t.is_empty())
                else {
                    bail!("GitHub registry selected but no personal access token configured");
                };
                let user = self.env.config.github_user.clone().unwrap_or_default();
                self.env
                    .vault
                    .set_credentials(REGISTRY_SECRET, user.clone(), token.clone());
                RegistryCredentials {
                    server: GHCR_SERVER.to_string(),
                    username: Some(user),
                    password: Some(token),
                }
            }
        };

        self.logger
            .substep(&format!("registry at {}", credentials.server));
        self.env.registry = Some(credentials);
        Ok(())
    }

    pub(super) async fn install_package(&mut self) -> anyhow::Result<()> {
        let version = self
            .env
            .config
            .install_version
            .clone()
            .context("no install version configured")?;
        let Some(api_key) = self.options.portal_api_key.clone().filter(|k| !k.is_empty()) else {
            bail!(
                "installing {version} requires the portal API key in {}",
                crate::remote::PORTAL_API_KEY_ENV
            );
        };
        let jumpbox = Arc::clone(self.env.require_jumpbox()?);

        let mut download = format!("download package {}", crate::remote::shell_quote(&version));
        if let Some(hash) = &self.env.config.install_hash {
            download.push_str(&format!(" --hash {}", crate::remote::shell_quote(hash)));
        }
        self.logger.substep(&format!("downloading {version}"));
        jumpbox.run_oms_cli(&download, &api_key).await?;

        let install = format!(
            "install codesphere --config {REMOTE_CONFIG_DIR}/config.yaml --priv-key {AGE_KEY_PATH} --package {}",
            crate::remote::shell_quote(&version)
        );
        self.logger.substep(&format!("installing {version}"));
        jumpbox.run_oms_cli(&install, &api_key).await
    }
}

fn current_executable() -> anyhow::Result<PathBuf> {
    std::env::current_exe().context("Failed to locate the running executable")
}
