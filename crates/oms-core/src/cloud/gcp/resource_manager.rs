//! Projects, billing, service enablement and Artifact Registry.

use reqwest::Method;
use serde::Deserialize;
use serde_json::{Value, json};
use url::Url;

use super::operations::Operation;
use super::{GcpClient, api_url};
use crate::cloud::{
    ArtifactRepository, BillingInfo, ProjectInfo, ProvisionError, ProvisionResult,
    ProvisionResultExt,
};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchProjectsResponse {
    #[serde(default)]
    projects: Vec<ProjectInfo>,
    #[serde(default)]
    next_page_token: Option<String>,
}

impl GcpClient {
    pub(super) async fn search_projects_in_folder(
        &self,
        folder_id: &str,
        display_name: &str,
    ) -> ProvisionResult<Vec<ProjectInfo>> {
        let query = format!("parent:folders/{folder_id} displayName:{display_name} state:ACTIVE");
        let base = api_url(&self.endpoints.resource_manager, "projects:search");
        let mut projects = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut url = Url::parse(&base)
                .map_err(|e| ProvisionError::Other(anyhow::anyhow!("invalid URL {base}: {e}")))?;
            url.query_pairs_mut().append_pair("query", &query);
            if let Some(token) = &page_token {
                url.query_pairs_mut().append_pair("pageToken", token);
            }
            let page: SearchProjectsResponse = self.get(url.as_str(), "project search").await?;
            projects.extend(page.projects);
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        Ok(projects)
    }

    pub(super) async fn create_project_in_folder(
        &self,
        folder_id: &str,
        project_id: &str,
        display_name: &str,
    ) -> ProvisionResult<ProjectInfo> {
        let what = format!("project {project_id}");
        let body = json!({
            "projectId": project_id,
            "displayName": display_name,
            "parent": format!("folders/{folder_id}"),
        });
        let url = api_url(&self.endpoints.resource_manager, "projects");
        let operation: Operation = self.post(&url, &body, &what).await?;
        let response = self
            .wait_operation(&self.endpoints.resource_manager, operation, &what)
            .await?;

        let created = response
            .and_then(|value| serde_json::from_value::<ProjectInfo>(value).ok())
            .unwrap_or_else(|| ProjectInfo {
                project_id: project_id.to_string(),
                display_name: display_name.to_string(),
                parent: Some(format!("folders/{folder_id}")),
            });
        Ok(created)
    }

    pub(super) async fn billing_info(&self, project_id: &str) -> ProvisionResult<BillingInfo> {
        let url = api_url(
            &self.endpoints.billing,
            &format!("projects/{project_id}/billingInfo"),
        );
        self.get(&url, &format!("billing info of {project_id}"))
            .await
    }

    pub(super) async fn link_billing_account(
        &self,
        project_id: &str,
        billing_account_name: &str,
    ) -> ProvisionResult<()> {
        let url = api_url(
            &self.endpoints.billing,
            &format!("projects/{project_id}/billingInfo"),
        );
        let body = json!({ "billingAccountName": billing_account_name });
        let _: Value = self
            .request(
                Method::PUT,
                &url,
                Some(&body),
                &format!("billing info of {project_id}"),
            )
            .await?;
        Ok(())
    }

    pub(super) async fn enable_service(&self, project_id: &str, api: &str) -> ProvisionResult<()> {
        let what = format!("API {api}");
        let url = api_url(
            &self.endpoints.service_usage,
            &format!("projects/{project_id}/services/{api}:enable"),
        );
        let operation: Operation = self.post(&url, &json!({}), &what).await?;
        self.wait_operation(&self.endpoints.service_usage, operation, &what)
            .await?;
        Ok(())
    }

    pub(super) async fn artifact_repository(
        &self,
        project_id: &str,
        location: &str,
        repository: &str,
    ) -> ProvisionResult<Option<ArtifactRepository>> {
        let url = api_url(
            &self.endpoints.artifact_registry,
            &format!("projects/{project_id}/locations/{location}/repositories/{repository}"),
        );
        self.get(&url, &format!("artifact repository {repository}"))
            .await
            .not_found_as_none()
    }

    pub(super) async fn insert_artifact_repository(
        &self,
        project_id: &str,
        location: &str,
        repository: &str,
    ) -> ProvisionResult<ArtifactRepository> {
        let what = format!("artifact repository {repository}");
        let url = api_url(
            &self.endpoints.artifact_registry,
            &format!(
                "projects/{project_id}/locations/{location}/repositories?repositoryId={repository}"
            ),
        );
        let body = json!({
            "format": "DOCKER",
            "description": "Codesphere container images",
        });
        let operation: Operation = self.post(&url, &body, &what).await?;
        self.wait_operation(&self.endpoints.artifact_registry, operation, &what)
            .await?;
        Ok(ArtifactRepository {
            name: format!("projects/{project_id}/locations/{location}/repositories/{repository}"),
            format: "DOCKER".to_string(),
        })
    }
}
