//! DNS records for the cluster gateways.

use anyhow::Context;

use super::Bootstrapper;
use crate::cloud::{DnsRecordSet, ProvisioningClient};

/// A records for the base domain and the workspace subdomain, wildcard
/// included.
pub fn desired_records(base_domain: &str, gateway_ip: &str, public_gateway_ip: &str) -> Vec<DnsRecordSet> {
    let base = base_domain.trim_end_matches('.');
    vec![
        DnsRecordSet::a(format!("{base}."), gateway_ip),
        DnsRecordSet::a(format!("*.{base}."), gateway_ip),
        DnsRecordSet::a(format!("ws.{base}."), public_gateway_ip),
        DnsRecordSet::a(format!("*.ws.{base}."), public_gateway_ip),
    ]
}

/// Replace every desired record: delete any existing record of the same name
/// and type, then create all of them in one change.
pub async fn ensure_dns_record_sets(
    client: &dyn ProvisioningClient,
    project_id: &str,
    zone_name: &str,
    records: &[DnsRecordSet],
) -> anyhow::Result<()> {
    for record in records {
        let existing = client
            .get_dns_record_set(project_id, zone_name, &record.name, &record.record_type)
            .await
            .with_context(|| format!("Failed to read record {} {}", record.name, record.record_type))?;
        if let Some(existing) = existing {
            client
                .delete_dns_record_set(project_id, zone_name, &existing)
                .await
                .with_context(|| {
                    format!("Failed to delete record {} {}", existing.name, existing.record_type)
                })?;
        }
    }
    client
        .create_dns_record_sets(project_id, zone_name, records)
        .await
        .with_context(|| format!("Failed to create records in zone {zone_name}"))?;
    Ok(())
}

impl Bootstrapper {
    pub(super) async fn ensure_dns_records(&mut self) -> anyhow::Result<()> {
        let dns_project = self.env.dns_project_id.clone();
        let zone = self.env.config.dns_zone_name.clone();
        let base = self.env.config.base_domain.trim_end_matches('.').to_string();
        let gateway = self
            .env
            .gateway_ip
            .clone()
            .context("gateway IP has not been reserved")?;
        let public_gateway = self
            .env
            .public_gateway_ip
            .clone()
            .context("public gateway IP has not been reserved")?;

        self.client
            .ensure_dns_managed_zone(&dns_project, &zone, &format!("{base}."))
            .await
            .with_context(|| format!("Failed to ensure managed zone {zone}"))?;

        let records = desired_records(&base, &gateway, &public_gateway);
        self.logger
            .substep(&format!("{} records in {zone}", records.len()));
        ensure_dns_record_sets(self.client.as_ref(), &dns_project, &zone, &records).await
    }
}
