//! Resource shapes exchanged with a [`ProvisioningClient`](super::ProvisioningClient).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectInfo {
    pub project_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub parent: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingInfo {
    #[serde(default)]
    pub billing_account_name: Option<String>,
    #[serde(default)]
    pub billing_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRepository {
    pub name: String,
    #[serde(default)]
    pub format: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAccount {
    pub email: String,
    #[serde(default)]
    pub display_name: String,
}

impl ServiceAccount {
    /// Principal string used in IAM bindings.
    pub fn member(&self) -> String {
        format!("serviceAccount:{}", self.email)
    }
}

/// Email of a user-managed service account.
pub fn service_account_email(project_id: &str, account_id: &str) -> String {
    format!("{account_id}@{project_id}.iam.gserviceaccount.com")
}

/// IAM policy as returned by `getIamPolicy`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IamPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i32>,
    #[serde(default)]
    pub bindings: Vec<IamBinding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IamBinding {
    pub role: String,
    #[serde(default)]
    pub members: Vec<String>,
}

impl IamPolicy {
    /// Add `member` to the binding for `role`, creating the binding if
    /// needed. Returns whether the policy changed.
    pub fn add_binding(&mut self, role: &str, member: &str) -> bool {
        match self.bindings.iter_mut().find(|b| b.role == role) {
            Some(binding) => {
                if binding.members.iter().any(|m| m == member) {
                    return false;
                }
                binding.members.push(member.to_string());
                true
            }
            None => {
                self.bindings.push(IamBinding {
                    role: role.to_string(),
                    members: vec![member.to_string()],
                });
                true
            }
        }
    }

    /// Remove `member` from the binding for `role`, dropping the binding once
    /// it has no members left. Returns whether the policy changed.
    pub fn remove_binding(&mut self, role: &str, member: &str) -> bool {
        let Some(index) = self.bindings.iter().position(|b| b.role == role) else {
            return false;
        };
        let binding = &mut self.bindings[index];
        let before = binding.members.len();
        binding.members.retain(|m| m != member);
        if binding.members.len() == before {
            return false;
        }
        if binding.members.is_empty() {
            self.bindings.remove(index);
        }
        true
    }

    pub fn has_binding(&self, role: &str, member: &str) -> bool {
        self.bindings
            .iter()
            .any(|b| b.role == role && b.members.iter().any(|m| m == member))
    }
}

/// VPC layout: one custom-mode network, one subnet, one NAT router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSpec {
    pub network: String,
    pub subnetwork: String,
    pub region: String,
    pub cidr: String,
    pub router: String,
    pub nat: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    pub name: String,
    pub network: String,
    pub source_ranges: Vec<String>,
    pub target_tags: Vec<String>,
    pub allowed: Vec<FirewallAllow>,
    pub priority: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallAllow {
    pub protocol: String,
    pub ports: Vec<String>,
}

impl FirewallAllow {
    pub fn tcp(ports: &[&str]) -> Self {
        Self {
            protocol: "tcp".to_string(),
            ports: ports.iter().map(|p| p.to_string()).collect(),
        }
    }

    pub fn all(protocol: &str) -> Self {
        Self {
            protocol: protocol.to_string(),
            ports: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRequest {
    pub name: String,
    pub zone: String,
    pub machine_type: String,
    pub tags: Vec<String>,
    pub image: String,
    pub boot_disk_size_gb: i64,
    pub additional_disk_sizes_gb: Vec<i64>,
    pub network: String,
    pub subnetwork: String,
    pub region: String,
    pub external_ip: bool,
    pub preemptible: bool,
    /// Metadata `ssh-keys` entries as `user:public-key` lines
    pub ssh_keys: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Instance {
    pub name: String,
    pub status: String,
    pub internal_ip: Option<String>,
    pub external_ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub name: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecordSet {
    pub name: String,
    #[serde(rename = "type")]
    pub record_type: String,
    pub ttl: u32,
    pub rrdatas: Vec<String>,
}

impl DnsRecordSet {
    pub fn a(name: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            record_type: "A".to_string(),
            ttl: 300,
            rrdatas: vec![ip.into()],
        }
    }
}
