//! Install configuration and vault handling.

use std::sync::Arc;

use anyhow::Context;

use super::network::SUBNET_CIDR;
use super::nodes::AGE_KEY_PATH;
use super::{Bootstrapper, Environment, REMOTE_CONFIG_DIR};
use crate::installconfig::{
    CephHost, InstallConfig, K8sNode, PostgresPrimary, RegistryConfig, Vault,
};
use crate::node::ROOT_USER;

const REMOTE_CONFIG_FILE: &str = "config.yaml";
const REMOTE_VAULT_FILE: &str = "prod.vault.yaml";
const GATEWAY_SERVICE_TYPE: &str = "LoadBalancer";

/// Fill the install config with what this run provisioned.
pub(super) fn populate_install_config(env: &mut Environment) -> anyhow::Result<()> {
    let postgres = env
        .postgres
        .clone()
        .context("postgres node has not been provisioned yet")?;
    let gateway_ip = env
        .gateway_ip
        .clone()
        .context("gateway IP has not been reserved")?;
    let public_gateway_ip = env
        .public_gateway_ip
        .clone()
        .context("public gateway IP has not been reserved")?;
    let base_domain = env.config.base_domain.trim_end_matches('.').to_string();

    let config: &mut InstallConfig = &mut env.install_config;

    config.postgres.primary = Some(PostgresPrimary {
        ip: postgres.internal_ip().to_string(),
        hostname: postgres.name().to_string(),
    });

    config.ceph.nodes_subnet = SUBNET_CIDR.to_string();
    config.ceph.hosts = env
        .storage
        .iter()
        .enumerate()
        .map(|(index, node)| CephHost {
            hostname: node.name().to_string(),
            ip_address: node.internal_ip().to_string(),
            is_master: index == 0,
        })
        .collect();

    let control_plane: Vec<K8sNode> = env
        .control_plane
        .iter()
        .map(|node| K8sNode {
            ip_address: node.internal_ip().to_string(),
        })
        .collect();
    config.kubernetes.managed_by_codesphere = true;
    config.kubernetes.api_server_host = control_plane
        .first()
        .map(|n| n.ip_address.clone())
        .unwrap_or_default();
    config.kubernetes.workers = control_plane.clone();
    config.kubernetes.control_planes = control_plane;

    config.cluster.gateway.service_type = GATEWAY_SERVICE_TYPE.to_string();
    config.cluster.gateway.ip_addresses = vec![gateway_ip];
    config.cluster.public_gateway.service_type = GATEWAY_SERVICE_TYPE.to_string();
    config.cluster.public_gateway.ip_addresses = vec![public_gateway_ip.clone()];

    config.codesphere.domain = base_domain.clone();
    config.codesphere.workspace_hosting_base_domain = format!("ws.{base_domain}");
    config.codesphere.public_ip = public_gateway_ip;

    if let Some(registry) = &env.registry {
        let mut section = config.registry.take().unwrap_or_default();
        section.server = registry.server.clone();
        config.registry = Some(RegistryConfig {
            replace_images_in_bom: true,
            load_container_images: true,
            ..section
        });
    }
    Ok(())
}

impl Bootstrapper {
    pub(super) fn load_install_config(&mut self) -> anyhow::Result<()> {
        let path = self.env.config.install_config_path();
        self.env.install_config = InstallConfig::load(&path)?;
        self.logger
            .substep(&format!("install config from {}", path.display()));
        Ok(())
    }

    pub(super) fn load_secrets(&mut self) -> anyhow::Result<()> {
        let path = self.env.config.secrets_file_path();
        self.env.vault = Vault::load(&path)?;
        self.logger.substep(&format!(
            "{} secrets from {}",
            self.env.vault.secrets.len(),
            path.display()
        ));
        Ok(())
    }

    /// Write both documents locally, ship them to the jumpbox and encrypt the
    /// vault there.
    pub(super) async fn write_config(&mut self) -> anyhow::Result<()> {
        populate_install_config(&mut self.env)?;

        let config_path = self.env.config.install_config_path();
        let vault_path = self.env.config.secrets_file_path();
        self.env.install_config.save(&config_path)?;
        self.env.vault.save(&vault_path)?;
        self.logger.substep(&format!(
            "wrote {} and {}",
            config_path.display(),
            vault_path.display()
        ));

        let jumpbox = Arc::clone(self.env.require_jumpbox()?);
        let remote_config = format!("{REMOTE_CONFIG_DIR}/{REMOTE_CONFIG_FILE}");
        let remote_vault = format!("{REMOTE_CONFIG_DIR}/{REMOTE_VAULT_FILE}");
        jumpbox
            .copy_file(ROOT_USER, &config_path, &remote_config)
            .await?;
        jumpbox
            .copy_file(ROOT_USER, &vault_path, &remote_vault)
            .await?;
        self.logger
            .substep(&format!("copied documents to {REMOTE_CONFIG_DIR}"));

        if !jumpbox.has_age_key(AGE_KEY_PATH).await? {
            self.logger.substep("generating age key");
            jumpbox.generate_age_key(AGE_KEY_PATH).await?;
        }
        if !jumpbox.is_vault_encrypted(&remote_vault).await? {
            self.logger.substep("encrypting vault");
            jumpbox.encrypt_vault(&remote_vault, AGE_KEY_PATH).await?;
        }
        Ok(())
    }
}
