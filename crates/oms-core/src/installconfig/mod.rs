//! Codesphere install configuration and secrets vault documents.
//!
//! Only the fields the bootstrap fills in are typed. Everything else in the
//! YAML is carried through untouched in the `extra` maps so that hand-edited
//! documents survive a bootstrap run.

pub mod vault;

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

pub use vault::{SecretEntry, SecretFields, SecretFile, Vault};

type Extra = BTreeMap<String, Value>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallConfig {
    #[serde(default)]
    pub datacenter: Datacenter,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<RegistryConfig>,
    #[serde(default)]
    pub postgres: PostgresConfig,
    #[serde(default)]
    pub ceph: CephConfig,
    #[serde(default)]
    pub kubernetes: KubernetesConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub codesphere: CodesphereConfig,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Datacenter {
    #[serde(default)]
    pub id: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub country_code: String,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfig {
    pub server: String,
    #[serde(default)]
    pub replace_images_in_bom: bool,
    #[serde(default)]
    pub load_container_images: bool,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostgresConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary: Option<PostgresPrimary>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostgresPrimary {
    pub ip: String,
    pub hostname: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CephConfig {
    #[serde(default)]
    pub nodes_subnet: String,
    #[serde(default)]
    pub hosts: Vec<CephHost>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CephHost {
    pub hostname: String,
    pub ip_address: String,
    #[serde(default)]
    pub is_master: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesConfig {
    #[serde(default)]
    pub managed_by_codesphere: bool,
    #[serde(default)]
    pub api_server_host: String,
    #[serde(default)]
    pub control_planes: Vec<K8sNode>,
    #[serde(default)]
    pub workers: Vec<K8sNode>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct K8sNode {
    pub ip_address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub public_gateway: GatewayConfig,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    #[serde(default)]
    pub service_type: String,
    #[serde(default)]
    pub ip_addresses: Vec<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodesphereConfig {
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub workspace_hosting_base_domain: String,
    #[serde(default)]
    pub public_ip: String,
    #[serde(flatten)]
    pub extra: Extra,
}

impl InstallConfig {
    /// Read the document, or start from an empty one when the file is absent.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read install config: {}", path.display()))?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse install config: {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize install config")?;
        write_document(path, &content)
    }
}

pub(crate) fn write_document(path: &Path, content: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    std::fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
}
