//! Project, billing, API and artifact registry steps.

use std::sync::Arc;

use anyhow::Context;
use rand::Rng;
use tracing::{debug, info};

use super::Bootstrapper;
use crate::cloud::{ProvisionResultExt, ProvisioningClient};
use crate::fanout::FanOut;

/// Service APIs every cluster project needs.
pub const REQUIRED_APIS: &[&str] = &[
    "compute.googleapis.com",
    "iam.googleapis.com",
    "cloudresourcemanager.googleapis.com",
    "serviceusage.googleapis.com",
    "dns.googleapis.com",
    "artifactregistry.googleapis.com",
];

const PROJECT_ID_MAX_LEN: usize = 30;
const PROJECT_ID_SUFFIX_LEN: usize = 6;
const SUFFIX_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Lowercase `name`, replace anything outside `[a-z0-9-]` with `-` and make
/// sure it starts with a letter.
pub fn sanitize_project_name(name: &str) -> String {
    let mut sanitized = String::with_capacity(name.len());
    for c in name.trim().chars().flat_map(char::to_lowercase) {
        let c = if c.is_ascii_lowercase() || c.is_ascii_digit() {
            c
        } else {
            '-'
        };
        if c == '-' && sanitized.ends_with('-') {
            continue;
        }
        sanitized.push(c);
    }
    let sanitized = sanitized.trim_matches('-');
    if sanitized.starts_with(|c: char| c.is_ascii_lowercase()) {
        sanitized.to_string()
    } else {
        format!("p-{sanitized}").trim_end_matches('-').to_string()
    }
}

/// `<sanitised-name>-<6 random [a-z0-9]>`, at most 30 characters.
pub fn generate_project_id(name: &str) -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..PROJECT_ID_SUFFIX_LEN)
        .map(|_| SUFFIX_CHARSET[rng.random_range(0..SUFFIX_CHARSET.len())] as char)
        .collect();

    let base = sanitize_project_name(name);
    let max_base = PROJECT_ID_MAX_LEN - PROJECT_ID_SUFFIX_LEN - 1;
    let base = if base.len() > max_base {
        base[..max_base].trim_end_matches('-')
    } else {
        base.as_str()
    };
    format!("{base}-{suffix}")
}

impl Bootstrapper {
    /// Find the project by exact display name in the folder, or create it.
    pub(super) async fn ensure_project(&mut self) -> anyhow::Result<()> {
        let folder_id = self.env.folder_id.clone();
        let name = self.env.project_name.clone();

        let candidates = self
            .client
            .search_projects(&folder_id, &name)
            .await
            .with_context(|| format!("Failed to search projects in folder {folder_id}"))?;
        let existing = candidates.into_iter().find(|p| p.display_name == name);

        let project_id = match existing {
            Some(project) => {
                self.logger
                    .substep(&format!("using existing project {}", project.project_id));
                project.project_id
            }
            None => {
                let project_id = generate_project_id(&name);
                self.logger
                    .substep(&format!("creating project {project_id}"));
                let project = self
                    .client
                    .create_project(&folder_id, &project_id, &name)
                    .await
                    .with_context(|| format!("Failed to create project {project_id}"))?;
                info!(project = %project.project_id, "created project");
                project.project_id
            }
        };

        self.env.dns_project_id = self.env.config.dns_project_id(&project_id).to_string();
        self.env.project_id = project_id;
        Ok(())
    }

    pub(super) async fn ensure_billing(&mut self) -> anyhow::Result<()> {
        let project_id = self.env.require_project()?.to_string();
        let account = self.env.config.billing_account_name();

        let info = self
            .client
            .get_billing_info(&project_id)
            .await
            .context("Failed to read billing info")?;
        if info.billing_enabled && info.billing_account_name.as_deref() == Some(account.as_str()) {
            debug!(project = %project_id, "billing already linked");
            self.logger.substep("billing already enabled");
            return Ok(());
        }

        self.logger.substep(&format!("linking {account}"));
        self.client
            .update_billing_info(&project_id, &account)
            .await
            .with_context(|| format!("Failed to link billing account {account}"))?;
        Ok(())
    }

    /// Enable every required API in parallel.
    pub(super) async fn enable_apis(&mut self) -> anyhow::Result<()> {
        let project_id = self.env.require_project()?.to_string();

        let mut tasks = FanOut::new("API enablements");
        for api in REQUIRED_APIS {
            let client: Arc<dyn ProvisioningClient> = Arc::clone(&self.client);
            let project_id = project_id.clone();
            tasks.spawn(*api, async move {
                client
                    .enable_api(&project_id, api)
                    .await
                    .tolerate_already_exists()?;
                Ok(())
            });
        }
        let enabled = tasks.join().await?;
        self.logger
            .substep(&format!("{} APIs enabled", enabled.len()));
        Ok(())
    }

    pub(super) async fn ensure_artifact_registry(&mut self) -> anyhow::Result<()> {
        let project_id = self.env.require_project()?.to_string();
        let region = self.env.config.region().to_string();
        let repository = self.env.config.artifact_repository().to_string();

        let existing = self
            .client
            .get_artifact_repository(&project_id, &region, &repository)
            .await
            .context("Failed to look up artifact repository")?;
        if existing.is_some() {
            self.logger
                .substep(&format!("repository {repository} exists"));
            return Ok(());
        }

        self.logger
            .substep(&format!("creating repository {repository}"));
        self.client
            .create_artifact_repository(&project_id, &region, &repository)
            .await
            .tolerate_already_exists()
            .with_context(|| format!("Failed to create artifact repository {repository}"))?;
        Ok(())
    }
}
