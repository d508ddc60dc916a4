//! Bootstrap run configuration
//!
//! A run is described by a single [`BootstrapConfig`]. Values come from an
//! optional `bootstrap-gcp.toml` in the user config directory, overlaid with
//! whatever the caller (usually the CLI) sets explicitly.

pub mod paths;
pub mod store;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use paths::{
    config_dir, default_known_hosts_path, default_ssh_private_key_path, default_ssh_public_key_path,
};
pub use store::ConfigStore;

pub const DEFAULT_REGION: &str = "europe-west4";
pub const DEFAULT_ZONE: &str = "europe-west4-a";
pub const DEFAULT_ARTIFACT_REPOSITORY: &str = "codesphere-registry";

/// Container registry backing the cluster images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RegistryType {
    /// Plain registry container on the database node
    #[default]
    LocalContainer,
    /// Google Artifact Registry repository in the cluster project
    ArtifactRegistry,
    /// GitHub container registry (ghcr.io)
    #[serde(rename = "github")]
    GitHub,
}

impl RegistryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistryType::LocalContainer => "local-container",
            RegistryType::ArtifactRegistry => "artifact-registry",
            RegistryType::GitHub => "github",
        }
    }
}

impl fmt::Display for RegistryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RegistryType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local-container" | "local" => Ok(RegistryType::LocalContainer),
            "artifact-registry" => Ok(RegistryType::ArtifactRegistry),
            "github" | "ghcr" => Ok(RegistryType::GitHub),
            other => anyhow::bail!(
                "Unknown registry type '{}'. Expected local-container, artifact-registry or github",
                other
            ),
        }
    }
}

/// Everything a bootstrap run needs to know up front.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Display name of the GCP project to find or create
    pub project_name: String,
    /// Folder the project lives in
    pub folder_id: String,
    /// Billing account id, with or without the `billingAccounts/` prefix
    pub billing_account: String,
    pub region: Option<String>,
    pub zone: Option<String>,

    /// Base domain the cluster is served under
    pub base_domain: String,
    pub dns_zone_name: String,
    /// Project owning the DNS zone; defaults to the cluster project
    pub dns_project_id: Option<String>,

    pub ssh_public_key_path: Option<PathBuf>,
    pub ssh_private_key_path: Option<PathBuf>,
    pub known_hosts_path: Option<PathBuf>,

    pub install_config_path: Option<PathBuf>,
    pub secrets_file_path: Option<PathBuf>,
    pub topology_path: Option<PathBuf>,

    pub write_config: bool,
    pub preemptible: bool,
    pub registry_type: RegistryType,
    pub artifact_repository: Option<String>,
    pub github_user: Option<String>,
    pub github_pat: Option<String>,

    /// OMS package version to install once the fleet is ready
    pub install_version: Option<String>,
    pub install_hash: Option<String>,
}

/// Values set explicitly for one run, layered over the stored config.
/// `None` keeps the stored value; `Some` replaces it, defaults included.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigOverride {
    pub project_name: Option<String>,
    pub folder_id: Option<String>,
    pub billing_account: Option<String>,
    pub region: Option<String>,
    pub zone: Option<String>,
    pub base_domain: Option<String>,
    pub dns_zone_name: Option<String>,
    pub dns_project_id: Option<String>,
    pub ssh_public_key_path: Option<PathBuf>,
    pub ssh_private_key_path: Option<PathBuf>,
    pub known_hosts_path: Option<PathBuf>,
    pub install_config_path: Option<PathBuf>,
    pub secrets_file_path: Option<PathBuf>,
    pub topology_path: Option<PathBuf>,
    pub write_config: Option<bool>,
    pub preemptible: Option<bool>,
    pub registry_type: Option<RegistryType>,
    pub artifact_repository: Option<String>,
    pub github_user: Option<String>,
    pub github_pat: Option<String>,
    pub install_version: Option<String>,
    pub install_hash: Option<String>,
}

impl BootstrapConfig {
    pub fn region(&self) -> &str {
        self.region.as_deref().unwrap_or(DEFAULT_REGION)
    }

    pub fn zone(&self) -> &str {
        self.zone.as_deref().unwrap_or(DEFAULT_ZONE)
    }

    pub fn artifact_repository(&self) -> &str {
        self.artifact_repository
            .as_deref()
            .unwrap_or(DEFAULT_ARTIFACT_REPOSITORY)
    }

    /// Billing account in `billingAccounts/<id>` form.
    pub fn billing_account_name(&self) -> String {
        if self.billing_account.starts_with("billingAccounts/") {
            self.billing_account.clone()
        } else {
            format!("billingAccounts/{}", self.billing_account)
        }
    }

    pub fn ssh_public_key_path(&self) -> anyhow::Result<PathBuf> {
        match &self.ssh_public_key_path {
            Some(path) => Ok(path.clone()),
            None => default_ssh_public_key_path(),
        }
    }

    pub fn ssh_private_key_path(&self) -> anyhow::Result<PathBuf> {
        match &self.ssh_private_key_path {
            Some(path) => Ok(path.clone()),
            None => default_ssh_private_key_path(),
        }
    }

    pub fn known_hosts_path(&self) -> anyhow::Result<PathBuf> {
        match &self.known_hosts_path {
            Some(path) => Ok(path.clone()),
            None => default_known_hosts_path(),
        }
    }

    /// Project holding the DNS zone.
    pub fn dns_project_id<'a>(&'a self, project_id: &'a str) -> &'a str {
        self.dns_project_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .unwrap_or(project_id)
    }

    pub fn install_config_path(&self) -> PathBuf {
        self.install_config_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("config.yaml"))
    }

    pub fn secrets_file_path(&self) -> PathBuf {
        self.secrets_file_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("prod.vault.yaml"))
    }

    pub fn topology_path(&self) -> PathBuf {
        self.topology_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("fleet-topology.json"))
    }

    /// Overlay explicitly set values on top of this config.
    pub fn merge(&mut self, other: ConfigOverride) {
        merge_value(&mut self.project_name, other.project_name);
        merge_value(&mut self.folder_id, other.folder_id);
        merge_value(&mut self.billing_account, other.billing_account);
        merge_value(&mut self.base_domain, other.base_domain);
        merge_value(&mut self.dns_zone_name, other.dns_zone_name);
        merge_option(&mut self.region, other.region);
        merge_option(&mut self.zone, other.zone);
        merge_option(&mut self.dns_project_id, other.dns_project_id);
        merge_option(&mut self.ssh_public_key_path, other.ssh_public_key_path);
        merge_option(&mut self.ssh_private_key_path, other.ssh_private_key_path);
        merge_option(&mut self.known_hosts_path, other.known_hosts_path);
        merge_option(&mut self.install_config_path, other.install_config_path);
        merge_option(&mut self.secrets_file_path, other.secrets_file_path);
        merge_option(&mut self.topology_path, other.topology_path);
        merge_option(&mut self.artifact_repository, other.artifact_repository);
        merge_option(&mut self.github_user, other.github_user);
        merge_option(&mut self.github_pat, other.github_pat);
        merge_option(&mut self.install_version, other.install_version);
        merge_option(&mut self.install_hash, other.install_hash);
        merge_value(&mut self.write_config, other.write_config);
        merge_value(&mut self.preemptible, other.preemptible);
        merge_value(&mut self.registry_type, other.registry_type);
    }

    /// Reject configurations that cannot possibly bootstrap.
    pub fn validate(&self) -> anyhow::Result<()> {
        let required = [
            ("project_name", &self.project_name),
            ("folder_id", &self.folder_id),
            ("billing_account", &self.billing_account),
            ("base_domain", &self.base_domain),
            ("dns_zone_name", &self.dns_zone_name),
        ];
        let missing: Vec<&str> = required
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| *name)
            .collect();
        if !missing.is_empty() {
            anyhow::bail!("Missing required settings: {}", missing.join(", "));
        }

        if self.registry_type == RegistryType::GitHub
            && self.github_pat.as_deref().is_none_or(str::is_empty)
        {
            anyhow::bail!("Registry type 'github' requires a GitHub personal access token");
        }

        if self.install_hash.is_some() && self.install_version.is_none() {
            anyhow::bail!("install_hash is only meaningful together with install_version");
        }
        Ok(())
    }
}

fn merge_value<T>(target: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *target = value;
    }
}

fn merge_option<T>(target: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *target = value;
    }
}
