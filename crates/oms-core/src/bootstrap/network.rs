//! VPC, firewall and static address steps.

use anyhow::Context;

use super::Bootstrapper;
use crate::cloud::{FirewallAllow, FirewallRule, NetworkSpec, ProvisionResultExt};
use crate::fleet::SSH_TAG;

pub const NETWORK: &str = "codesphere-vpc";
pub const SUBNETWORK: &str = "codesphere-subnet";
pub const SUBNET_CIDR: &str = "10.10.0.0/20";
const ROUTER: &str = "codesphere-router";
const NAT: &str = "codesphere-nat";

pub const GATEWAY_ADDRESS: &str = "gateway";
pub const PUBLIC_GATEWAY_ADDRESS: &str = "public-gateway";

pub(super) fn network_spec(region: &str) -> NetworkSpec {
    NetworkSpec {
        network: NETWORK.to_string(),
        subnetwork: SUBNETWORK.to_string(),
        region: region.to_string(),
        cidr: SUBNET_CIDR.to_string(),
        router: ROUTER.to_string(),
        nat: NAT.to_string(),
    }
}

fn firewall_rules() -> Vec<FirewallRule> {
    vec![
        FirewallRule {
            name: "allow-ssh".to_string(),
            network: NETWORK.to_string(),
            source_ranges: vec!["0.0.0.0/0".to_string()],
            target_tags: vec![SSH_TAG.to_string()],
            allowed: vec![FirewallAllow::tcp(&["22"])],
            priority: 1000,
        },
        FirewallRule {
            name: "allow-internal".to_string(),
            network: NETWORK.to_string(),
            source_ranges: vec![SUBNET_CIDR.to_string()],
            target_tags: Vec::new(),
            allowed: vec![
                FirewallAllow::all("tcp"),
                FirewallAllow::all("udp"),
                FirewallAllow::all("icmp"),
            ],
            priority: 1000,
        },
        FirewallRule {
            name: "allow-http".to_string(),
            network: NETWORK.to_string(),
            source_ranges: vec!["0.0.0.0/0".to_string()],
            target_tags: Vec::new(),
            allowed: vec![FirewallAllow::tcp(&["80", "443"])],
            priority: 1000,
        },
    ]
}

impl Bootstrapper {
    pub(super) async fn ensure_vpc(&mut self) -> anyhow::Result<()> {
        let project_id = self.env.require_project()?.to_string();
        let spec = network_spec(self.env.config.region());

        self.logger.substep(&format!("network {}", spec.network));
        self.client
            .create_network(&project_id, &spec)
            .await
            .tolerate_already_exists()
            .with_context(|| format!("Failed to create network {}", spec.network))?;

        self.logger
            .substep(&format!("subnetwork {}", spec.subnetwork));
        self.client
            .create_subnetwork(&project_id, &spec)
            .await
            .tolerate_already_exists()
            .with_context(|| format!("Failed to create subnetwork {}", spec.subnetwork))?;

        self.logger.substep(&format!("router {}", spec.router));
        self.client
            .create_router(&project_id, &spec)
            .await
            .tolerate_already_exists()
            .with_context(|| format!("Failed to create router {}", spec.router))?;
        Ok(())
    }

    pub(super) async fn ensure_firewall_rules(&mut self) -> anyhow::Result<()> {
        let project_id = self.env.require_project()?.to_string();
        for rule in firewall_rules() {
            self.logger.substep(&format!("firewall rule {}", rule.name));
            self.client
                .create_firewall_rule(&project_id, &rule)
                .await
                .tolerate_already_exists()
                .with_context(|| format!("Failed to create firewall rule {}", rule.name))?;
        }
        Ok(())
    }

    pub(super) async fn ensure_gateway_ips(&mut self) -> anyhow::Result<()> {
        let gateway = self.ensure_address(GATEWAY_ADDRESS).await?;
        let public_gateway = self.ensure_address(PUBLIC_GATEWAY_ADDRESS).await?;
        self.env.gateway_ip = Some(gateway);
        self.env.public_gateway_ip = Some(public_gateway);
        Ok(())
    }

    /// Get, else reserve, a regional static address and return its IP.
    async fn ensure_address(&self, name: &str) -> anyhow::Result<String> {
        let project_id = self.env.require_project()?;
        let region = self.env.config.region();

        if let Some(address) = self
            .client
            .get_address(project_id, region, name)
            .await
            .with_context(|| format!("Failed to look up address {name}"))?
        {
            self.logger
                .substep(&format!("address {name} is {}", address.address));
            return Ok(address.address);
        }

        self.client
            .create_address(project_id, region, name)
            .await
            .tolerate_already_exists()
            .with_context(|| format!("Failed to reserve address {name}"))?;
        let address = self
            .client
            .get_address(project_id, region, name)
            .await
            .with_context(|| format!("Failed to look up address {name}"))?
            .with_context(|| format!("address {name} missing after reservation"))?;
        self.logger
            .substep(&format!("reserved {name} at {}", address.address));
        Ok(address.address)
    }
}
