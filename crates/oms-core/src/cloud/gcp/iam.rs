//! Service accounts, keys and IAM policies.

use serde::Deserialize;
use serde_json::json;

use super::{GcpClient, api_url};
use crate::cloud::types::service_account_email;
use crate::cloud::{IamPolicy, ProvisionResult, ProvisionResultExt, ServiceAccount};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceAccountKey {
    private_key_data: String,
}

impl GcpClient {
    pub(super) async fn service_account(
        &self,
        project_id: &str,
        account_id: &str,
    ) -> ProvisionResult<Option<ServiceAccount>> {
        let email = service_account_email(project_id, account_id);
        let url = api_url(
            &self.endpoints.iam,
            &format!("projects/{project_id}/serviceAccounts/{email}"),
        );
        self.get(&url, &format!("service account {email}"))
            .await
            .not_found_as_none()
    }

    pub(super) async fn insert_service_account(
        &self,
        project_id: &str,
        account_id: &str,
        display_name: &str,
    ) -> ProvisionResult<ServiceAccount> {
        let url = api_url(
            &self.endpoints.iam,
            &format!("projects/{project_id}/serviceAccounts"),
        );
        let body = json!({
            "accountId": account_id,
            "serviceAccount": { "displayName": display_name },
        });
        self.post(&url, &body, &format!("service account {account_id}"))
            .await
    }

    pub(super) async fn insert_service_account_key(
        &self,
        project_id: &str,
        email: &str,
    ) -> ProvisionResult<String> {
        let url = api_url(
            &self.endpoints.iam,
            &format!("projects/{project_id}/serviceAccounts/{email}/keys"),
        );
        let key: ServiceAccountKey = self
            .post(&url, &json!({}), &format!("key for {email}"))
            .await?;
        Ok(key.private_key_data)
    }

    pub(super) async fn project_iam_policy(&self, project_id: &str) -> ProvisionResult<IamPolicy> {
        let url = api_url(
            &self.endpoints.resource_manager,
            &format!("projects/{project_id}:getIamPolicy"),
        );
        let body = json!({ "options": { "requestedPolicyVersion": 3 } });
        self.post(&url, &body, &format!("IAM policy of {project_id}"))
            .await
    }

    pub(super) async fn write_project_iam_policy(
        &self,
        project_id: &str,
        policy: &IamPolicy,
    ) -> ProvisionResult<()> {
        let url = api_url(
            &self.endpoints.resource_manager,
            &format!("projects/{project_id}:setIamPolicy"),
        );
        let body = json!({ "policy": policy });
        let _: IamPolicy = self
            .post(&url, &body, &format!("IAM policy of {project_id}"))
            .await?;
        Ok(())
    }

    pub(super) async fn service_account_iam_policy(
        &self,
        project_id: &str,
        email: &str,
    ) -> ProvisionResult<IamPolicy> {
        let url = api_url(
            &self.endpoints.iam,
            &format!("projects/{project_id}/serviceAccounts/{email}:getIamPolicy"),
        );
        self.post(&url, &json!({}), &format!("IAM policy of {email}"))
            .await
    }

    pub(super) async fn write_service_account_iam_policy(
        &self,
        project_id: &str,
        email: &str,
        policy: &IamPolicy,
    ) -> ProvisionResult<()> {
        let url = api_url(
            &self.endpoints.iam,
            &format!("projects/{project_id}/serviceAccounts/{email}:setIamPolicy"),
        );
        let body = json!({ "policy": policy });
        let _: IamPolicy = self
            .post(&url, &body, &format!("IAM policy of {email}"))
            .await?;
        Ok(())
    }
}
