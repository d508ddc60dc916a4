//! Long-running operation polling.
//!
//! Resource Manager, Service Usage and Artifact Registry return
//! `google.longrunning.Operation`s; Compute Engine has its own operation
//! resource with a `selfLink` and a `status` field.

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use url::Url;

use super::{GcpClient, api_url};
use crate::cloud::{ProvisionError, ProvisionResult};

#[derive(Debug, Deserialize)]
pub(super) struct Operation {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub error: Option<OperationStatus>,
    #[serde(default)]
    pub response: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub(super) struct OperationStatus {
    #[serde(default)]
    pub code: i32,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ComputeOperation {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub self_link: String,
    #[serde(default)]
    pub error: Option<ComputeOperationErrors>,
}

#[derive(Debug, Deserialize)]
pub(super) struct ComputeOperationErrors {
    #[serde(default)]
    pub errors: Vec<ComputeOperationError>,
}

#[derive(Debug, Deserialize)]
pub(super) struct ComputeOperationError {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

// google.rpc.Code values
const ALREADY_EXISTS: i32 = 6;
const NOT_FOUND: i32 = 5;
const UNAVAILABLE: i32 = 14;

impl GcpClient {
    /// Poll a long-running operation until it is done; returns its response.
    pub(super) async fn wait_operation(
        &self,
        base: &Url,
        mut operation: Operation,
        what: &str,
    ) -> ProvisionResult<Option<Value>> {
        let mut polls = 0;
        while !operation.done {
            if polls >= self.max_polls {
                return Err(ProvisionError::Unavailable(format!(
                    "{what}: operation {} did not finish",
                    operation.name
                )));
            }
            polls += 1;
            tokio::time::sleep(self.poll_interval).await;
            debug!(operation = %operation.name, "polling operation");
            operation = self.get(&api_url(base, &operation.name), what).await?;
        }

        if let Some(status) = operation.error {
            return Err(match status.code {
                ALREADY_EXISTS => ProvisionError::AlreadyExists(what.to_string()),
                NOT_FOUND => ProvisionError::NotFound(what.to_string()),
                UNAVAILABLE => ProvisionError::Unavailable(status.message),
                _ => ProvisionError::Api {
                    status: 0,
                    message: format!("{what}: {} (code {})", status.message, status.code),
                },
            });
        }
        Ok(operation.response)
    }

    pub(super) async fn wait_compute_operation(
        &self,
        mut operation: ComputeOperation,
        what: &str,
    ) -> ProvisionResult<()> {
        let mut polls = 0;
        while operation.status != "DONE" {
            if polls >= self.max_polls {
                return Err(ProvisionError::Unavailable(format!(
                    "{what}: compute operation did not finish"
                )));
            }
            if operation.self_link.is_empty() {
                return Err(ProvisionError::Other(anyhow::anyhow!(
                    "{what}: compute operation without selfLink"
                )));
            }
            polls += 1;
            tokio::time::sleep(self.poll_interval).await;
            operation = self.get(&operation.self_link, what).await?;
        }

        let Some(errors) = operation.error.filter(|e| !e.errors.is_empty()) else {
            return Ok(());
        };
        if errors
            .errors
            .iter()
            .any(|e| e.code == "RESOURCE_ALREADY_EXISTS" || e.code == "ALREADY_EXISTS")
        {
            return Err(ProvisionError::AlreadyExists(what.to_string()));
        }
        let messages: Vec<String> = errors
            .errors
            .iter()
            .map(|e| format!("{}: {}", e.code, e.message))
            .collect();
        Err(ProvisionError::Api {
            status: 0,
            message: format!("{what}: {}", messages.join("; ")),
        })
    }
}
