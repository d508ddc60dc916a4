//! Cloud DNS managed zones and record sets.

use reqwest::Method;
use serde_json::{Value, json};

use super::{GcpClient, api_url};
use crate::cloud::{DnsRecordSet, ProvisionResult, ProvisionResultExt};

impl GcpClient {
    pub(super) async fn ensure_managed_zone(
        &self,
        project_id: &str,
        zone_name: &str,
        dns_name: &str,
    ) -> ProvisionResult<()> {
        let zone_url = api_url(
            &self.endpoints.dns,
            &format!("projects/{project_id}/managedZones/{zone_name}"),
        );
        let existing: Option<Value> = self
            .get(&zone_url, &format!("managed zone {zone_name}"))
            .await
            .not_found_as_none()?;
        if existing.is_some() {
            return Ok(());
        }

        let url = api_url(
            &self.endpoints.dns,
            &format!("projects/{project_id}/managedZones"),
        );
        let body = json!({
            "name": zone_name,
            "dnsName": dns_name,
            "description": "Codesphere cluster zone",
            "visibility": "public",
        });
        let created: Option<Value> = self
            .post(&url, &body, &format!("managed zone {zone_name}"))
            .await
            .tolerate_already_exists()?;
        if created.is_some() {
            tracing::info!(zone = zone_name, dns_name, "created managed zone");
        }
        Ok(())
    }

    pub(super) async fn record_set(
        &self,
        project_id: &str,
        zone_name: &str,
        name: &str,
        record_type: &str,
    ) -> ProvisionResult<Option<DnsRecordSet>> {
        let url = api_url(
            &self.endpoints.dns,
            &format!("projects/{project_id}/managedZones/{zone_name}/rrsets/{name}/{record_type}"),
        );
        self.get(&url, &format!("record set {name} {record_type}"))
            .await
            .not_found_as_none()
    }

    pub(super) async fn remove_record_set(
        &self,
        project_id: &str,
        zone_name: &str,
        record: &DnsRecordSet,
    ) -> ProvisionResult<()> {
        let url = api_url(
            &self.endpoints.dns,
            &format!(
                "projects/{project_id}/managedZones/{zone_name}/rrsets/{}/{}",
                record.name, record.record_type
            ),
        );
        let _: Value = self
            .request(
                Method::DELETE,
                &url,
                None,
                &format!("record set {} {}", record.name, record.record_type),
            )
            .await?;
        Ok(())
    }

    pub(super) async fn add_record_sets(
        &self,
        project_id: &str,
        zone_name: &str,
        records: &[DnsRecordSet],
    ) -> ProvisionResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let url = api_url(
            &self.endpoints.dns,
            &format!("projects/{project_id}/managedZones/{zone_name}/changes"),
        );
        let body = json!({ "additions": records });
        let _: Value = self
            .post(&url, &body, &format!("record sets in {zone_name}"))
            .await?;
        Ok(())
    }
}
