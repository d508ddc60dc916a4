//! Compute Engine: networks, firewalls, instances and addresses.

use serde::Deserialize;
use serde_json::{Value, json};

use super::operations::ComputeOperation;
use super::{GcpClient, api_url};
use crate::cloud::{
    Address, FirewallRule, Instance, InstanceRequest, NetworkSpec, ProvisionResult,
    ProvisionResultExt,
};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceResource {
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    network_interfaces: Vec<NetworkInterface>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkInterface {
    #[serde(rename = "networkIP", default)]
    network_ip: Option<String>,
    #[serde(default)]
    access_configs: Vec<AccessConfig>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccessConfig {
    #[serde(rename = "natIP", default)]
    nat_ip: Option<String>,
}

#[derive(Deserialize)]
struct AddressResource {
    name: String,
    #[serde(default)]
    address: String,
}

fn network_link(project_id: &str, network: &str) -> String {
    format!("projects/{project_id}/global/networks/{network}")
}

fn instance_body(project_id: &str, request: &InstanceRequest) -> Value {
    let zone = &request.zone;
    let disk_type = format!("projects/{project_id}/zones/{zone}/diskTypes/pd-ssd");

    let mut disks = vec![json!({
        "boot": true,
        "autoDelete": true,
        "initializeParams": {
            "sourceImage": request.image,
            "diskSizeGb": request.boot_disk_size_gb.to_string(),
            "diskType": disk_type,
        },
    })];
    for (index, size) in request.additional_disk_sizes_gb.iter().enumerate() {
        disks.push(json!({
            "autoDelete": true,
            "deviceName": format!("{}-data-{}", request.name, index + 1),
            "initializeParams": {
                "diskSizeGb": size.to_string(),
                "diskType": disk_type,
            },
        }));
    }

    let access_configs = if request.external_ip {
        json!([{ "name": "External NAT", "type": "ONE_TO_ONE_NAT" }])
    } else {
        json!([])
    };

    json!({
        "name": request.name,
        "machineType": format!("projects/{project_id}/zones/{zone}/machineTypes/{}", request.machine_type),
        "tags": { "items": request.tags },
        "scheduling": {
            "preemptible": request.preemptible,
            "automaticRestart": !request.preemptible,
            "onHostMaintenance": if request.preemptible { "TERMINATE" } else { "MIGRATE" },
        },
        "disks": disks,
        "networkInterfaces": [{
            "network": network_link(project_id, &request.network),
            "subnetwork": format!(
                "projects/{project_id}/regions/{}/subnetworks/{}",
                request.region, request.subnetwork
            ),
            "accessConfigs": access_configs,
        }],
        "metadata": {
            "items": [{ "key": "ssh-keys", "value": request.ssh_keys.join("\n") }],
        },
    })
}

impl GcpClient {
    async fn insert(&self, path: &str, body: &Value, what: &str) -> ProvisionResult<()> {
        let url = api_url(&self.endpoints.compute, path);
        let operation: ComputeOperation = self.post(&url, body, what).await?;
        self.wait_compute_operation(operation, what).await
    }

    pub(super) async fn insert_network(
        &self,
        project_id: &str,
        spec: &NetworkSpec,
    ) -> ProvisionResult<()> {
        let body = json!({
            "name": spec.network,
            "autoCreateSubnetworks": false,
        });
        self.insert(
            &format!("projects/{project_id}/global/networks"),
            &body,
            &format!("network {}", spec.network),
        )
        .await
    }

    pub(super) async fn insert_subnetwork(
        &self,
        project_id: &str,
        spec: &NetworkSpec,
    ) -> ProvisionResult<()> {
        let body = json!({
            "name": spec.subnetwork,
            "network": network_link(project_id, &spec.network),
            "ipCidrRange": spec.cidr,
            "region": spec.region,
            "privateIpGoogleAccess": true,
        });
        self.insert(
            &format!("projects/{project_id}/regions/{}/subnetworks", spec.region),
            &body,
            &format!("subnetwork {}", spec.subnetwork),
        )
        .await
    }

    pub(super) async fn insert_router(
        &self,
        project_id: &str,
        spec: &NetworkSpec,
    ) -> ProvisionResult<()> {
        let body = json!({
            "name": spec.router,
            "network": network_link(project_id, &spec.network),
            "nats": [{
                "name": spec.nat,
                "natIpAllocateOption": "AUTO_ONLY",
                "sourceSubnetworkIpRangesToNat": "ALL_SUBNETWORKS_ALL_IP_RANGES",
            }],
        });
        self.insert(
            &format!("projects/{project_id}/regions/{}/routers", spec.region),
            &body,
            &format!("router {}", spec.router),
        )
        .await
    }

    pub(super) async fn insert_firewall(
        &self,
        project_id: &str,
        rule: &FirewallRule,
    ) -> ProvisionResult<()> {
        let allowed: Vec<Value> = rule
            .allowed
            .iter()
            .map(|allow| {
                if allow.ports.is_empty() {
                    json!({ "IPProtocol": allow.protocol })
                } else {
                    json!({ "IPProtocol": allow.protocol, "ports": allow.ports })
                }
            })
            .collect();
        let mut body = json!({
            "name": rule.name,
            "network": network_link(project_id, &rule.network),
            "direction": "INGRESS",
            "priority": rule.priority,
            "sourceRanges": rule.source_ranges,
            "allowed": allowed,
        });
        if !rule.target_tags.is_empty() {
            body["targetTags"] = json!(rule.target_tags);
        }
        self.insert(
            &format!("projects/{project_id}/global/firewalls"),
            &body,
            &format!("firewall rule {}", rule.name),
        )
        .await
    }

    pub(super) async fn insert_instance(
        &self,
        project_id: &str,
        request: &InstanceRequest,
    ) -> ProvisionResult<()> {
        let body = instance_body(project_id, request);
        self.insert(
            &format!("projects/{project_id}/zones/{}/instances", request.zone),
            &body,
            &format!("instance {}", request.name),
        )
        .await
    }

    pub(super) async fn instance(
        &self,
        project_id: &str,
        zone: &str,
        name: &str,
    ) -> ProvisionResult<Instance> {
        let url = api_url(
            &self.endpoints.compute,
            &format!("projects/{project_id}/zones/{zone}/instances/{name}"),
        );
        let resource: InstanceResource = self.get(&url, &format!("instance {name}")).await?;
        let interface = resource.network_interfaces.into_iter().next();
        let internal_ip = interface.as_ref().and_then(|i| i.network_ip.clone());
        let external_ip = interface.and_then(|i| {
            i.access_configs
                .into_iter()
                .find_map(|config| config.nat_ip)
        });
        Ok(Instance {
            name: resource.name,
            status: resource.status,
            internal_ip,
            external_ip,
        })
    }

    pub(super) async fn insert_address(
        &self,
        project_id: &str,
        region: &str,
        name: &str,
    ) -> ProvisionResult<()> {
        self.insert(
            &format!("projects/{project_id}/regions/{region}/addresses"),
            &json!({ "name": name }),
            &format!("address {name}"),
        )
        .await
    }

    pub(super) async fn address(
        &self,
        project_id: &str,
        region: &str,
        name: &str,
    ) -> ProvisionResult<Option<Address>> {
        let url = api_url(
            &self.endpoints.compute,
            &format!("projects/{project_id}/regions/{region}/addresses/{name}"),
        );
        let resource: Option<AddressResource> = self
            .get(&url, &format!("address {name}"))
            .await
            .not_found_as_none()?;
        Ok(resource.map(|r| Address {
            name: r.name,
            address: r.address,
        }))
    }
}
