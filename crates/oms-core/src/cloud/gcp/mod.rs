//! Google Cloud implementation of [`ProvisioningClient`] over the public REST
//! APIs.

mod auth;
mod compute;
mod dns;
mod iam;
mod operations;
mod resource_manager;

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;
use url::Url;

pub use auth::{CREDENTIALS_ENV, TokenSource};

use super::{
    Address, ArtifactRepository, BillingInfo, DnsRecordSet, FirewallRule, IamPolicy, Instance,
    InstanceRequest, NetworkSpec, ProjectInfo, ProvisionError, ProvisionResult,
    ProvisioningClient, ServiceAccount,
};

/// Base URLs of the REST APIs in use.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub resource_manager: Url,
    pub billing: Url,
    pub service_usage: Url,
    pub artifact_registry: Url,
    pub iam: Url,
    pub compute: Url,
    pub dns: Url,
}

impl Endpoints {
    pub fn google() -> anyhow::Result<Self> {
        Ok(Self {
            resource_manager: parse_base("https://cloudresourcemanager.googleapis.com/v3/")?,
            billing: parse_base("https://cloudbilling.googleapis.com/v1/")?,
            service_usage: parse_base("https://serviceusage.googleapis.com/v1/")?,
            artifact_registry: parse_base("https://artifactregistry.googleapis.com/v1/")?,
            iam: parse_base("https://iam.googleapis.com/v1/")?,
            compute: parse_base("https://compute.googleapis.com/compute/v1/")?,
            dns: parse_base("https://dns.googleapis.com/dns/v1/")?,
        })
    }

    /// Route every API to one base URL (emulators, recording proxies).
    pub fn single(base: &str) -> anyhow::Result<Self> {
        let url = parse_base(base)?;
        Ok(Self {
            resource_manager: url.clone(),
            billing: url.clone(),
            service_usage: url.clone(),
            artifact_registry: url.clone(),
            iam: url.clone(),
            compute: url.clone(),
            dns: url,
        })
    }
}

fn parse_base(base: &str) -> anyhow::Result<Url> {
    let url = Url::parse(base).with_context(|| format!("Invalid API base URL: {base}"))?;
    if !url.path().ends_with('/') {
        anyhow::bail!("API base URL must end with '/': {base}");
    }
    Ok(url)
}

/// Join a base URL and an API path.
///
/// Plain string concatenation on purpose: paths such as `projects:search`
/// would be read as a URL scheme by [`Url::join`].
fn api_url(base: &Url, path: &str) -> String {
    format!("{}{}", base.as_str(), path.trim_start_matches('/'))
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

pub struct GcpClient {
    http: reqwest::Client,
    tokens: TokenSource,
    endpoints: Endpoints,
    poll_interval: Duration,
    max_polls: u32,
}

impl GcpClient {
    pub fn new(tokens: TokenSource) -> anyhow::Result<Self> {
        Self::with_endpoints(tokens, Endpoints::google()?)
    }

    /// Client authenticated from `GOOGLE_APPLICATION_CREDENTIALS`.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::new(TokenSource::from_env()?)
    }

    pub fn with_endpoints(tokens: TokenSource, endpoints: Endpoints) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("oms/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            tokens,
            endpoints,
            poll_interval: Duration::from_secs(2),
            max_polls: 300,
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        what: &str,
    ) -> ProvisionResult<T> {
        let token = self.tokens.token(&self.http).await?;
        debug!(%method, url, "gcp request");
        let mut builder = self.http.request(method, url).bearer_auth(token);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| ProvisionError::Unavailable(format!("{what}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body, what));
        }

        let text = response
            .text()
            .await
            .map_err(|e| ProvisionError::Unavailable(format!("{what}: {e}")))?;
        let text = if text.trim().is_empty() { "{}" } else { &text };
        serde_json::from_str(text)
            .with_context(|| format!("Unexpected response for {what}"))
            .map_err(ProvisionError::Other)
    }

    async fn get<T: DeserializeOwned>(&self, url: &str, what: &str) -> ProvisionResult<T> {
        self.request(Method::GET, url, None, what).await
    }

    async fn post<T: DeserializeOwned>(
        &self,
        url: &str,
        body: &Value,
        what: &str,
    ) -> ProvisionResult<T> {
        self.request(Method::POST, url, Some(body), what).await
    }
}

fn classify_status(status: StatusCode, body: &str, what: &str) -> ProvisionError {
    let message = serde_json::from_str::<ErrorEnvelope>(body)
        .map(|envelope| envelope.error.message)
        .unwrap_or_else(|_| body.to_string());
    match status {
        StatusCode::CONFLICT => ProvisionError::AlreadyExists(what.to_string()),
        StatusCode::NOT_FOUND => ProvisionError::NotFound(what.to_string()),
        StatusCode::UNAUTHORIZED => ProvisionError::Auth(message),
        // 403 also covers freshly enabled APIs and IAM grants still propagating.
        StatusCode::TOO_MANY_REQUESTS => ProvisionError::Unavailable(message),
        s if s.is_server_error() => ProvisionError::Unavailable(message),
        s => ProvisionError::Api {
            status: s.as_u16(),
            message: format!("{what}: {message}"),
        },
    }
}

#[async_trait]
impl ProvisioningClient for GcpClient {
    async fn search_projects(
        &self,
        folder_id: &str,
        display_name: &str,
    ) -> ProvisionResult<Vec<ProjectInfo>> {
        self.search_projects_in_folder(folder_id, display_name).await
    }

    async fn create_project(
        &self,
        folder_id: &str,
        project_id: &str,
        display_name: &str,
    ) -> ProvisionResult<ProjectInfo> {
        self.create_project_in_folder(folder_id, project_id, display_name)
            .await
    }

    async fn get_billing_info(&self, project_id: &str) -> ProvisionResult<BillingInfo> {
        self.billing_info(project_id).await
    }

    async fn update_billing_info(
        &self,
        project_id: &str,
        billing_account_name: &str,
    ) -> ProvisionResult<()> {
        self.link_billing_account(project_id, billing_account_name)
            .await
    }

    async fn enable_api(&self, project_id: &str, api: &str) -> ProvisionResult<()> {
        self.enable_service(project_id, api).await
    }

    async fn get_artifact_repository(
        &self,
        project_id: &str,
        location: &str,
        repository: &str,
    ) -> ProvisionResult<Option<ArtifactRepository>> {
        self.artifact_repository(project_id, location, repository)
            .await
    }

    async fn create_artifact_repository(
        &self,
        project_id: &str,
        location: &str,
        repository: &str,
    ) -> ProvisionResult<ArtifactRepository> {
        self.insert_artifact_repository(project_id, location, repository)
            .await
    }

    async fn get_service_account(
        &self,
        project_id: &str,
        account_id: &str,
    ) -> ProvisionResult<Option<ServiceAccount>> {
        self.service_account(project_id, account_id).await
    }

    async fn create_service_account(
        &self,
        project_id: &str,
        account_id: &str,
        display_name: &str,
    ) -> ProvisionResult<ServiceAccount> {
        self.insert_service_account(project_id, account_id, display_name)
            .await
    }

    async fn create_service_account_key(
        &self,
        project_id: &str,
        email: &str,
    ) -> ProvisionResult<String> {
        self.insert_service_account_key(project_id, email).await
    }

    async fn get_project_iam_policy(&self, project_id: &str) -> ProvisionResult<IamPolicy> {
        self.project_iam_policy(project_id).await
    }

    async fn set_project_iam_policy(
        &self,
        project_id: &str,
        policy: &IamPolicy,
    ) -> ProvisionResult<()> {
        self.write_project_iam_policy(project_id, policy).await
    }

    async fn get_service_account_iam_policy(
        &self,
        project_id: &str,
        email: &str,
    ) -> ProvisionResult<IamPolicy> {
        self.service_account_iam_policy(project_id, email).await
    }

    async fn set_service_account_iam_policy(
        &self,
        project_id: &str,
        email: &str,
        policy: &IamPolicy,
    ) -> ProvisionResult<()> {
        self.write_service_account_iam_policy(project_id, email, policy)
            .await
    }

    async fn create_network(&self, project_id: &str, spec: &NetworkSpec) -> ProvisionResult<()> {
        self.insert_network(project_id, spec).await
    }

    async fn create_subnetwork(
        &self,
        project_id: &str,
        spec: &NetworkSpec,
    ) -> ProvisionResult<()> {
        self.insert_subnetwork(project_id, spec).await
    }

    async fn create_router(&self, project_id: &str, spec: &NetworkSpec) -> ProvisionResult<()> {
        self.insert_router(project_id, spec).await
    }

    async fn create_firewall_rule(
        &self,
        project_id: &str,
        rule: &FirewallRule,
    ) -> ProvisionResult<()> {
        self.insert_firewall(project_id, rule).await
    }

    async fn create_instance(
        &self,
        project_id: &str,
        request: &InstanceRequest,
    ) -> ProvisionResult<()> {
        self.insert_instance(project_id, request).await
    }

    async fn get_instance(
        &self,
        project_id: &str,
        zone: &str,
        name: &str,
    ) -> ProvisionResult<Instance> {
        self.instance(project_id, zone, name).await
    }

    async fn create_address(
        &self,
        project_id: &str,
        region: &str,
        name: &str,
    ) -> ProvisionResult<()> {
        self.insert_address(project_id, region, name).await
    }

    async fn get_address(
        &self,
        project_id: &str,
        region: &str,
        name: &str,
    ) -> ProvisionResult<Option<Address>> {
        self.address(project_id, region, name).await
    }

    async fn ensure_dns_managed_zone(
        &self,
        project_id: &str,
        zone_name: &str,
        dns_name: &str,
    ) -> ProvisionResult<()> {
        self.ensure_managed_zone(project_id, zone_name, dns_name)
            .await
    }

    async fn get_dns_record_set(
        &self,
        project_id: &str,
        zone_name: &str,
        name: &str,
        record_type: &str,
    ) -> ProvisionResult<Option<DnsRecordSet>> {
        self.record_set(project_id, zone_name, name, record_type)
            .await
    }

    async fn delete_dns_record_set(
        &self,
        project_id: &str,
        zone_name: &str,
        record: &DnsRecordSet,
    ) -> ProvisionResult<()> {
        self.remove_record_set(project_id, zone_name, record).await
    }

    async fn create_dns_record_sets(
        &self,
        project_id: &str,
        zone_name: &str,
        records: &[DnsRecordSet],
    ) -> ProvisionResult<()> {
        self.add_record_sets(project_id, zone_name, records).await
    }
}
