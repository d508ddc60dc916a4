//! Concurrent VM provisioning and fleet assembly.
//!
//! [`FleetProvisioner::provision_fleet`] creates one task per [`VmSpec`]. Each
//! task creates its instance (tolerating an existing one), reads back its
//! addresses and returns a [`ProvisionedVm`]. Only after every task has
//! finished does [`assemble_fleet`] classify the results into a [`Fleet`].

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cloud::{InstanceRequest, ProvisionResultExt, ProvisioningClient};
use crate::fanout::{AggregateError, FanOut};
use crate::node::{DEFAULT_USER, Node, ROOT_USER};
use crate::remote::RemoteExecutor;

pub const BOOT_IMAGE: &str = "projects/ubuntu-os-cloud/global/images/family/ubuntu-2204-lts";
pub const BOOT_DISK_SIZE_GB: i64 = 200;
/// Network tag that opens SSH from anywhere.
pub const SSH_TAG: &str = "ssh";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    Jumpbox,
    Postgres,
    /// Ceph storage quorum
    Storage,
    /// k0s control plane
    ControlPlane,
}

impl NodeRole {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "jumpbox" => Some(NodeRole::Jumpbox),
            "postgres" => Some(NodeRole::Postgres),
            "ceph" => Some(NodeRole::Storage),
            "k0s" => Some(NodeRole::ControlPlane),
            _ => None,
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            NodeRole::Jumpbox => "jumpbox",
            NodeRole::Postgres => "postgres",
            NodeRole::Storage => "ceph",
            NodeRole::ControlPlane => "k0s",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Declarative VM description. The first tag names the role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSpec {
    pub name: String,
    pub machine_type: String,
    pub tags: Vec<String>,
    pub additional_disk_sizes_gb: Vec<i64>,
    pub has_external_ip: bool,
}

impl VmSpec {
    pub fn new(name: &str, machine_type: &str, tags: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            machine_type: machine_type.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            additional_disk_sizes_gb: Vec::new(),
            has_external_ip: false,
        }
    }

    pub fn with_disks(mut self, sizes_gb: &[i64]) -> Self {
        self.additional_disk_sizes_gb = sizes_gb.to_vec();
        self
    }

    pub fn with_external_ip(mut self) -> Self {
        self.has_external_ip = true;
        self
    }

    pub fn role(&self) -> Option<NodeRole> {
        self.tags.first().and_then(|tag| NodeRole::from_tag(tag))
    }
}

/// The standard cluster layout.
pub fn default_fleet() -> Vec<VmSpec> {
    let mut specs = vec![
        VmSpec::new("jumpbox", "e2-medium", &["jumpbox", SSH_TAG]).with_external_ip(),
        VmSpec::new("postgres", "e2-standard-8", &["postgres"])
            .with_disks(&[50])
            .with_external_ip(),
    ];
    for i in 1..=4 {
        specs.push(
            VmSpec::new(&format!("ceph-{i}"), "e2-standard-8", &["ceph"]).with_disks(&[20, 200]),
        );
    }
    for i in 1..=3 {
        specs.push(VmSpec::new(&format!("k0s-{i}"), "e2-standard-16", &["k0s"]));
    }
    specs
}

/// Per-run instance settings shared by every VM.
#[derive(Debug, Clone)]
pub struct FleetSettings {
    pub project_id: String,
    pub region: String,
    pub zone: String,
    pub network: String,
    pub subnetwork: String,
    pub preemptible: bool,
    /// Operator public key, injected for root and the default user
    pub ssh_public_key: String,
}

impl FleetSettings {
    fn instance_request(&self, spec: &VmSpec) -> InstanceRequest {
        let key = self.ssh_public_key.trim();
        InstanceRequest {
            name: spec.name.clone(),
            zone: self.zone.clone(),
            machine_type: spec.machine_type.clone(),
            tags: spec.tags.clone(),
            image: BOOT_IMAGE.to_string(),
            boot_disk_size_gb: BOOT_DISK_SIZE_GB,
            additional_disk_sizes_gb: spec.additional_disk_sizes_gb.clone(),
            network: self.network.clone(),
            subnetwork: self.subnetwork.clone(),
            region: self.region.clone(),
            external_ip: spec.has_external_ip,
            preemptible: self.preemptible,
            ssh_keys: vec![format!("{ROOT_USER}:{key}"), format!("{DEFAULT_USER}:{key}")],
        }
    }
}

/// What one provisioning task reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedVm {
    pub role: NodeRole,
    pub name: String,
    pub external_ip: Option<String>,
    pub internal_ip: String,
}

#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    #[error("fleet has no {0} VM")]
    MissingRole(NodeRole),

    #[error("fleet has more than one {0} VM")]
    DuplicateRole(NodeRole),

    #[error("VM {name} has no recognised role tag (first tag: {tag:?})")]
    UnknownRole { name: String, tag: Option<String> },

    #[error("jumpbox {0} has no external IP")]
    JumpboxWithoutExternalIp(String),
}

#[derive(Debug, Clone)]
pub struct Fleet {
    pub jumpbox: Arc<Node>,
    pub postgres: Arc<Node>,
    pub storage: Vec<Arc<Node>>,
    pub control_plane: Vec<Arc<Node>>,
}

impl Fleet {
    /// Every node, jumpbox first.
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        let mut nodes = vec![Arc::clone(&self.jumpbox), Arc::clone(&self.postgres)];
        nodes.extend(self.storage.iter().cloned());
        nodes.extend(self.control_plane.iter().cloned());
        nodes
    }
}

/// Reject spec lists that cannot form a fleet before creating anything.
pub fn validate_specs(specs: &[VmSpec]) -> Result<(), FleetError> {
    let mut counts: BTreeMap<NodeRole, usize> = BTreeMap::new();
    for spec in specs {
        let role = spec.role().ok_or_else(|| FleetError::UnknownRole {
            name: spec.name.clone(),
            tag: spec.tags.first().cloned(),
        })?;
        *counts.entry(role).or_default() += 1;
    }
    for role in [NodeRole::Jumpbox, NodeRole::Postgres] {
        match counts.get(&role).copied().unwrap_or(0) {
            0 => return Err(FleetError::MissingRole(role)),
            1 => {}
            _ => return Err(FleetError::DuplicateRole(role)),
        }
    }
    if let Some(jumpbox) = specs
        .iter()
        .find(|s| s.role() == Some(NodeRole::Jumpbox))
        && !jumpbox.has_external_ip
    {
        return Err(FleetError::JumpboxWithoutExternalIp(jumpbox.name.clone()));
    }
    Ok(())
}

/// Build the node hierarchy from task results. Storage and control plane
/// lists are sorted by name; every non-jumpbox node is reached through the
/// jumpbox.
pub fn assemble_fleet(
    vms: Vec<ProvisionedVm>,
    executor: Arc<dyn RemoteExecutor>,
) -> anyhow::Result<Fleet> {
    let mut jumpbox_vm = None;
    let mut others = Vec::new();
    for vm in vms {
        if vm.role == NodeRole::Jumpbox {
            if jumpbox_vm.is_some() {
                return Err(FleetError::DuplicateRole(NodeRole::Jumpbox).into());
            }
            jumpbox_vm = Some(vm);
        } else {
            others.push(vm);
        }
    }

    let jumpbox_vm = jumpbox_vm.ok_or(FleetError::MissingRole(NodeRole::Jumpbox))?;
    if jumpbox_vm.external_ip.is_none() {
        return Err(FleetError::JumpboxWithoutExternalIp(jumpbox_vm.name).into());
    }
    let jumpbox = Arc::new(Node::new(
        jumpbox_vm.name,
        jumpbox_vm.external_ip,
        jumpbox_vm.internal_ip,
        Arc::clone(&executor),
    ));

    let mut postgres = None;
    let mut storage = Vec::new();
    let mut control_plane = Vec::new();
    for vm in others {
        let node = Arc::new(Node::behind_jumpbox(
            vm.name,
            vm.external_ip,
            vm.internal_ip,
            &jumpbox,
            Arc::clone(&executor),
        )?);
        match vm.role {
            NodeRole::Postgres => {
                if postgres.replace(node).is_some() {
                    return Err(FleetError::DuplicateRole(NodeRole::Postgres).into());
                }
            }
            NodeRole::Storage => storage.push(node),
            NodeRole::ControlPlane => control_plane.push(node),
            NodeRole::Jumpbox => {
                return Err(FleetError::DuplicateRole(NodeRole::Jumpbox).into());
            }
        }
    }
    let postgres = postgres.ok_or(FleetError::MissingRole(NodeRole::Postgres))?;

    storage.sort_by(|a, b| a.name().cmp(b.name()));
    control_plane.sort_by(|a, b| a.name().cmp(b.name()));

    Ok(Fleet {
        jumpbox,
        postgres,
        storage,
        control_plane,
    })
}

pub struct FleetProvisioner {
    client: Arc<dyn ProvisioningClient>,
    executor: Arc<dyn RemoteExecutor>,
    settings: FleetSettings,
}

impl FleetProvisioner {
    pub fn new(
        client: Arc<dyn ProvisioningClient>,
        executor: Arc<dyn RemoteExecutor>,
        settings: FleetSettings,
    ) -> Self {
        Self {
            client,
            executor,
            settings,
        }
    }

    /// Create every VM in parallel and assemble the fleet.
    pub async fn provision_fleet(&self, specs: &[VmSpec]) -> anyhow::Result<Fleet> {
        validate_specs(specs)?;

        let mut tasks = FanOut::new("VM provisioning");
        for spec in specs {
            let client = Arc::clone(&self.client);
            let project_id = self.settings.project_id.clone();
            let request = self.settings.instance_request(spec);
            let spec = spec.clone();
            tasks.spawn(spec.name.clone(), async move {
                provision_vm(client.as_ref(), &project_id, &spec, &request).await
            });
        }
        let results = tasks.join().await.map_err(FleetError::from)?;
        let vms = results.into_iter().map(|(_, vm)| vm).collect();
        assemble_fleet(vms, Arc::clone(&self.executor))
    }
}

async fn provision_vm(
    client: &dyn ProvisioningClient,
    project_id: &str,
    spec: &VmSpec,
    request: &InstanceRequest,
) -> anyhow::Result<ProvisionedVm> {
    let role = spec
        .role()
        .with_context(|| format!("VM {} has no role tag", spec.name))?;

    let created = client
        .create_instance(project_id, request)
        .await
        .tolerate_already_exists()
        .with_context(|| format!("Failed to create instance {}", spec.name))?;
    if created.is_some() {
        info!(vm = %spec.name, "created instance");
    } else {
        debug!(vm = %spec.name, "instance already exists");
    }

    let instance = client
        .get_instance(project_id, &request.zone, &spec.name)
        .await
        .with_context(|| format!("Failed to read instance {}", spec.name))?;
    let internal_ip = instance
        .internal_ip
        .with_context(|| format!("instance {} has no internal IP", spec.name))?;
    let external_ip = if spec.has_external_ip {
        let ip = instance
            .external_ip
            .with_context(|| format!("instance {} has no external IP", spec.name))?;
        Some(ip)
    } else {
        None
    };

    Ok(ProvisionedVm {
        role,
        name: spec.name.clone(),
        external_ip,
        internal_ip,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyNode {
    pub name: String,
    pub external_ip: Option<String>,
    pub internal_ip: String,
}

impl TopologyNode {
    fn from_node(node: &Node) -> Self {
        Self {
            name: node.name().to_string(),
            external_ip: node.external_ip().map(str::to_string),
            internal_ip: node.internal_ip().to_string(),
        }
    }
}

/// JSON record of a provisioned fleet, keyed by role tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetTopology {
    pub project_id: String,
    pub provisioned_at: DateTime<Utc>,
    pub nodes: BTreeMap<String, Vec<TopologyNode>>,
}

impl FleetTopology {
    pub fn from_fleet(project_id: &str, fleet: &Fleet) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            NodeRole::Jumpbox.tag().to_string(),
            vec![TopologyNode::from_node(&fleet.jumpbox)],
        );
        nodes.insert(
            NodeRole::Postgres.tag().to_string(),
            vec![TopologyNode::from_node(&fleet.postgres)],
        );
        nodes.insert(
            NodeRole::Storage.tag().to_string(),
            fleet.storage.iter().map(|n| TopologyNode::from_node(n)).collect(),
        );
        nodes.insert(
            NodeRole::ControlPlane.tag().to_string(),
            fleet
                .control_plane
                .iter()
                .map(|n| TopologyNode::from_node(n))
                .collect(),
        );
        Self {
            project_id: project_id.to_string(),
            provisioned_at: Utc::now(),
            nodes,
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize fleet topology")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write fleet topology: {}", path.display()))?;
        Ok(())
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read fleet topology: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse fleet topology: {}", path.display()))
    }
}
