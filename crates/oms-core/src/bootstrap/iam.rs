//! Service accounts, keys and role bindings.

use anyhow::Context;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::{debug, info};

use super::Bootstrapper;
use crate::cloud::types::service_account_email;
use crate::cloud::{IamPolicy, ProvisionResultExt, ProvisioningClient, ServiceAccount};
use crate::config::RegistryType;
use crate::installconfig::Vault;
use crate::logger::StepLogger;
use crate::retry::RetryPolicy;

pub const CLOUD_CONTROLLER_ACCOUNT: &str = "cloud-controller";
pub const REGISTRY_WRITER_ACCOUNT: &str = "artifact-registry-writer";

pub const COMPUTE_ADMIN_ROLE: &str = "roles/compute.admin";
pub const REGISTRY_WRITER_ROLE: &str = "roles/artifactregistry.writer";
pub const DNS_ADMIN_ROLE: &str = "roles/dns.admin";
pub const TOKEN_CREATOR_ROLE: &str = "roles/iam.serviceAccountTokenCreator";

/// Vault entry holding the cloud controller's key file.
pub(super) const CLOUD_CONTROLLER_SECRET: &str = "cloudControllerServiceAccount";
/// Vault entry holding registry credentials.
pub(super) const REGISTRY_SECRET: &str = "registry";
/// Registry user name that makes the password a base64 key file.
pub(super) const JSON_KEY_USER: &str = "_json_key_base64";

/// Union-add `member` to `role`. Returns whether the policy changed.
pub fn add_role_binding(policy: &mut IamPolicy, role: &str, member: &str) -> bool {
    policy.add_binding(role, member)
}

/// Remove `member` from `role`; an emptied binding is dropped.
pub fn remove_role_binding(policy: &mut IamPolicy, role: &str, member: &str) -> bool {
    policy.remove_binding(role, member)
}

/// Let `principal` mint tokens for the service account `email`.
pub async fn grant_impersonation(
    client: &dyn ProvisioningClient,
    project_id: &str,
    email: &str,
    principal: &str,
) -> anyhow::Result<bool> {
    update_service_account_policy(client, project_id, email, |policy| {
        add_role_binding(policy, TOKEN_CREATOR_ROLE, principal)
    })
    .await
}

pub async fn revoke_impersonation(
    client: &dyn ProvisioningClient,
    project_id: &str,
    email: &str,
    principal: &str,
) -> anyhow::Result<bool> {
    update_service_account_policy(client, project_id, email, |policy| {
        remove_role_binding(policy, TOKEN_CREATOR_ROLE, principal)
    })
    .await
}

async fn update_service_account_policy(
    client: &dyn ProvisioningClient,
    project_id: &str,
    email: &str,
    change: impl FnOnce(&mut IamPolicy) -> bool,
) -> anyhow::Result<bool> {
    let mut policy = client
        .get_service_account_iam_policy(project_id, email)
        .await
        .with_context(|| format!("Failed to read IAM policy of {email}"))?;
    if !change(&mut policy) {
        return Ok(false);
    }
    client
        .set_service_account_iam_policy(project_id, email, &policy)
        .await
        .with_context(|| format!("Failed to update IAM policy of {email}"))?;
    Ok(true)
}

/// Apply all `(role, member)` bindings to a project policy in one
/// read-modify-write. Returns whether anything was written.
async fn apply_project_bindings(
    client: &dyn ProvisioningClient,
    project_id: &str,
    bindings: &[(String, String)],
) -> anyhow::Result<bool> {
    let mut policy = client
        .get_project_iam_policy(project_id)
        .await
        .with_context(|| format!("Failed to read IAM policy of project {project_id}"))?;
    let mut changed = false;
    for (role, member) in bindings {
        changed |= add_role_binding(&mut policy, role, member);
    }
    if !changed {
        debug!(project = project_id, "IAM policy already up to date");
        return Ok(false);
    }
    client
        .set_project_iam_policy(project_id, &policy)
        .await
        .with_context(|| format!("Failed to update IAM policy of project {project_id}"))?;
    Ok(true)
}

/// Returns the account and whether this call created it.
async fn ensure_service_account(
    client: &dyn ProvisioningClient,
    project_id: &str,
    account_id: &str,
    display_name: &str,
) -> anyhow::Result<(ServiceAccount, bool)> {
    if let Some(account) = client
        .get_service_account(project_id, account_id)
        .await
        .with_context(|| format!("Failed to look up service account {account_id}"))?
    {
        return Ok((account, false));
    }

    let created = client
        .create_service_account(project_id, account_id, display_name)
        .await
        .tolerate_already_exists()
        .with_context(|| format!("Failed to create service account {account_id}"))?;
    match created {
        Some(account) => {
            info!(account = %account.email, "created service account");
            Ok((account, true))
        }
        None => Ok((
            ServiceAccount {
                email: service_account_email(project_id, account_id),
                display_name: display_name.to_string(),
            },
            false,
        )),
    }
}

async fn create_key_with_retry(
    client: &dyn ProvisioningClient,
    logger: &dyn StepLogger,
    policy: RetryPolicy,
    project_id: &str,
    email: &str,
) -> anyhow::Result<String> {
    policy
        .run(logger, || async {
            client
                .create_service_account_key(project_id, email)
                .await
                .with_context(|| format!("Failed to create key for {email}"))
        })
        .await
}

impl Bootstrapper {
    pub(super) async fn ensure_service_accounts(&mut self) -> anyhow::Result<()> {
        let project_id = self.env.require_project()?.to_string();
        let client = self.client.as_ref();
        let logger = self.logger.as_ref();

        let (controller, created) = ensure_service_account(
            client,
            &project_id,
            CLOUD_CONTROLLER_ACCOUNT,
            "Kubernetes cloud controller",
        )
        .await?;
        logger.substep(&format!("service account {}", controller.email));
        if created || !self.env.vault.has(CLOUD_CONTROLLER_SECRET) {
            let key = create_key_with_retry(
                client,
                logger,
                self.options.cloud_retry,
                &project_id,
                &controller.email,
            )
            .await?;
            let key_json = decode_key(&key)?;
            self.env
                .vault
                .set_file(CLOUD_CONTROLLER_SECRET, "key.json", key_json);
            logger.substep(&format!("new key for {}", controller.email));
        }
        self.env.cloud_controller_email = Some(controller.email);

        if self.env.config.registry_type == RegistryType::ArtifactRegistry {
            let (writer, created) = ensure_service_account(
                client,
                &project_id,
                REGISTRY_WRITER_ACCOUNT,
                "Artifact Registry writer",
            )
            .await?;
            logger.substep(&format!("service account {}", writer.email));
            if created || !has_registry_key(&self.env.vault) {
                let key = create_key_with_retry(
                    client,
                    logger,
                    self.options.cloud_retry,
                    &project_id,
                    &writer.email,
                )
                .await?;
                self.env
                    .vault
                    .set_credentials(REGISTRY_SECRET, JSON_KEY_USER, key);
                logger.substep(&format!("new key for {}", writer.email));
            }
            self.env.registry_writer_email = Some(writer.email);
        }
        Ok(())
    }

    pub(super) async fn ensure_iam_roles(&mut self) -> anyhow::Result<()> {
        let project_id = self.env.require_project()?.to_string();
        let dns_project_id = self.env.dns_project_id.clone();
        let controller = self
            .env
            .cloud_controller_email
            .as_deref()
            .map(|email| format!("serviceAccount:{email}"))
            .context("cloud controller service account missing")?;

        let mut project_bindings = vec![(COMPUTE_ADMIN_ROLE.to_string(), controller.clone())];
        if let Some(writer) = &self.env.registry_writer_email {
            project_bindings.push((
                REGISTRY_WRITER_ROLE.to_string(),
                format!("serviceAccount:{writer}"),
            ));
        }

        let mut targets = vec![(project_id.clone(), project_bindings)];
        if !dns_project_id.is_empty() && dns_project_id != project_id {
            targets.push((dns_project_id, vec![(DNS_ADMIN_ROLE.to_string(), controller)]));
        }

        for (target, bindings) in targets {
            let client = self.client.as_ref();
            let changed = self
                .options
                .cloud_retry
                .run(self.logger.as_ref(), || {
                    apply_project_bindings(client, &target, &bindings)
                })
                .await?;
            if changed {
                self.logger
                    .substep(&format!("updated IAM policy of {target}"));
            }
        }
        Ok(())
    }
}

fn has_registry_key(vault: &Vault) -> bool {
    vault
        .get(REGISTRY_SECRET)
        .and_then(|entry| entry.fields.as_ref())
        .is_some_and(|fields| {
            fields.username.as_deref() == Some(JSON_KEY_USER)
                && fields.password.as_deref().is_some_and(|p| !p.is_empty())
        })
}

fn decode_key(encoded: &str) -> anyhow::Result<String> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .context("service account key is not valid base64")?;
    String::from_utf8(bytes).context("service account key is not UTF-8")
}
