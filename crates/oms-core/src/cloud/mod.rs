//! Cloud provisioning abstraction
//!
//! The bootstrap pipeline talks to the cloud exclusively through
//! [`ProvisioningClient`]. Create calls report an existing resource as
//! [`ProvisionError::AlreadyExists`] so callers can layer "ensure" semantics
//! on top; [`ProvisionResultExt::tolerate_already_exists`] is the usual way
//! to do that.

pub mod gcp;
pub mod types;

use async_trait::async_trait;

pub use types::{
    Address, ArtifactRepository, BillingInfo, DnsRecordSet, FirewallAllow, FirewallRule,
    IamBinding, IamPolicy, Instance, InstanceRequest, NetworkSpec, ProjectInfo, ServiceAccount,
};

/// Classified provisioning failure.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("{0} not found")]
    NotFound(String),

    /// Throttling or a transient server-side failure.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProvisionError {
    pub fn is_already_exists(&self) -> bool {
        matches!(self, ProvisionError::AlreadyExists(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ProvisionError::NotFound(_))
    }

    /// Errors that retrying cannot fix.
    pub fn is_permanent(&self) -> bool {
        matches!(self, ProvisionError::Auth(_))
    }
}

pub type ProvisionResult<T> = Result<T, ProvisionError>;

pub trait ProvisionResultExt<T> {
    /// Map `AlreadyExists` to `Ok(None)`.
    fn tolerate_already_exists(self) -> ProvisionResult<Option<T>>;

    /// Map `NotFound` to `Ok(None)`.
    fn not_found_as_none(self) -> ProvisionResult<Option<T>>;
}

impl<T> ProvisionResultExt<T> for ProvisionResult<T> {
    fn tolerate_already_exists(self) -> ProvisionResult<Option<T>> {
        match self {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.is_already_exists() => {
                tracing::debug!("{err}, treating as success");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn not_found_as_none(self) -> ProvisionResult<Option<T>> {
        match self {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// Cloud resource operations consumed by the bootstrap pipeline.
///
/// Lookups return `Ok(None)` for absent resources; creates return
/// `AlreadyExists` when losing a race or re-running.
#[async_trait]
pub trait ProvisioningClient: Send + Sync {
    /// Projects under `folder_id` whose display name matches `display_name`.
    /// Matching is provider-defined and may be a prefix match.
    async fn search_projects(
        &self,
        folder_id: &str,
        display_name: &str,
    ) -> ProvisionResult<Vec<ProjectInfo>>;

    async fn create_project(
        &self,
        folder_id: &str,
        project_id: &str,
        display_name: &str,
    ) -> ProvisionResult<ProjectInfo>;

    async fn get_billing_info(&self, project_id: &str) -> ProvisionResult<BillingInfo>;

    async fn update_billing_info(
        &self,
        project_id: &str,
        billing_account_name: &str,
    ) -> ProvisionResult<()>;

    /// Enable a service API. Enabling an enabled API succeeds.
    async fn enable_api(&self, project_id: &str, api: &str) -> ProvisionResult<()>;

    async fn get_artifact_repository(
        &self,
        project_id: &str,
        location: &str,
        repository: &str,
    ) -> ProvisionResult<Option<ArtifactRepository>>;

    async fn create_artifact_repository(
        &self,
        project_id: &str,
        location: &str,
        repository: &str,
    ) -> ProvisionResult<ArtifactRepository>;

    async fn get_service_account(
        &self,
        project_id: &str,
        account_id: &str,
    ) -> ProvisionResult<Option<ServiceAccount>>;

    async fn create_service_account(
        &self,
        project_id: &str,
        account_id: &str,
        display_name: &str,
    ) -> ProvisionResult<ServiceAccount>;

    /// Create a JSON key; returns the base64-encoded key file.
    async fn create_service_account_key(
        &self,
        project_id: &str,
        email: &str,
    ) -> ProvisionResult<String>;

    async fn get_project_iam_policy(&self, project_id: &str) -> ProvisionResult<IamPolicy>;

    async fn set_project_iam_policy(
        &self,
        project_id: &str,
        policy: &IamPolicy,
    ) -> ProvisionResult<()>;

    async fn get_service_account_iam_policy(
        &self,
        project_id: &str,
        email: &str,
    ) -> ProvisionResult<IamPolicy>;

    async fn set_service_account_iam_policy(
        &self,
        project_id: &str,
        email: &str,
        policy: &IamPolicy,
    ) -> ProvisionResult<()>;

    async fn create_network(&self, project_id: &str, spec: &NetworkSpec) -> ProvisionResult<()>;

    async fn create_subnetwork(&self, project_id: &str, spec: &NetworkSpec)
    -> ProvisionResult<()>;

    /// Router with a Cloud NAT for instances without external addresses.
    async fn create_router(&self, project_id: &str, spec: &NetworkSpec) -> ProvisionResult<()>;

    async fn create_firewall_rule(
        &self,
        project_id: &str,
        rule: &FirewallRule,
    ) -> ProvisionResult<()>;

    async fn create_instance(
        &self,
        project_id: &str,
        request: &InstanceRequest,
    ) -> ProvisionResult<()>;

    async fn get_instance(
        &self,
        project_id: &str,
        zone: &str,
        name: &str,
    ) -> ProvisionResult<Instance>;

    async fn create_address(&self, project_id: &str, region: &str, name: &str)
    -> ProvisionResult<()>;

    async fn get_address(
        &self,
        project_id: &str,
        region: &str,
        name: &str,
    ) -> ProvisionResult<Option<Address>>;

    /// Get or create a public managed zone.
    async fn ensure_dns_managed_zone(
        &self,
        project_id: &str,
        zone_name: &str,
        dns_name: &str,
    ) -> ProvisionResult<()>;

    async fn get_dns_record_set(
        &self,
        project_id: &str,
        zone_name: &str,
        name: &str,
        record_type: &str,
    ) -> ProvisionResult<Option<DnsRecordSet>>;

    async fn delete_dns_record_set(
        &self,
        project_id: &str,
        zone_name: &str,
        record: &DnsRecordSet,
    ) -> ProvisionResult<()>;

    /// Create all records in a single change.
    async fn create_dns_record_sets(
        &self,
        project_id: &str,
        zone_name: &str,
        records: &[DnsRecordSet],
    ) -> ProvisionResult<()>;
}
