//! Cloud control-plane client for pausing and resuming GPU workspaces.
//!
//! The gateway never talks to the workspace API directly; everything goes
//! through the [`CloudControl`] trait so the lifecycle controller and the
//! tests depend on the contract rather than the HTTP shape.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::CloudApiConfig;

/// Cloud API related errors.
#[derive(Debug, Error)]
pub enum CloudError {
    /// The API answered with a non-success status.
    #[error("API request failed with status {status}: {body}")]
    RequestFailed {
        /// HTTP status returned by the control plane.
        status: u16,
        /// Response body, useful for operator diagnosis.
        body: String,
    },

    /// The request never completed.
    #[error("Network error: {0}")]
    Network(String),
}

/// Workspace status as reported by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceStatus {
    /// The workspace is provisioned and reachable.
    Running,
    /// The workspace is de-provisioned; no GPU cost.
    Paused,
    /// The workspace is being re-provisioned.
    Resuming,
    /// The workspace is being de-provisioned.
    Pausing,
    /// The control plane is applying an update.
    Updating,
    /// Any status this client does not recognize.
    #[serde(other)]
    Unknown,
}

impl fmt::Display for WorkspaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            WorkspaceStatus::Running => "running",
            WorkspaceStatus::Paused => "paused",
            WorkspaceStatus::Resuming => "resuming",
            WorkspaceStatus::Pausing => "pausing",
            WorkspaceStatus::Updating => "updating",
            WorkspaceStatus::Unknown => "unknown",
        };
        f.write_str(value)
    }
}

/// Resource metadata attached to a workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceMeta {
    /// Reachable IP address of the workspace.
    pub ip: String,
    /// Machine flavor, e.g. `gpu-a10-11core-88gb-50gb-2tb`.
    pub flavor_name: String,
}

/// Workspace record returned by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    /// Opaque workspace identifier.
    pub id: String,
    /// Human-readable workspace name.
    pub name: String,
    /// Current lifecycle status.
    pub status: WorkspaceStatus,
    /// Resource metadata (ip, flavor).
    pub resource_meta: ResourceMeta,
}

impl Workspace {
    /// Reachable IP address of the workspace.
    pub fn ip_address(&self) -> &str {
        &self.resource_meta.ip
    }
}

#[derive(Debug, Deserialize)]
struct WorkspaceListResponse {
    results: Vec<Workspace>,
}

/// Response to a pause/resume action; the control plane echoes the workspace.
#[derive(Debug, Clone, Deserialize)]
pub struct ActionResponse {
    /// Workspace the action was applied to.
    pub id: String,
    /// Status after the action was accepted.
    pub status: WorkspaceStatus,
}

/// Operations the scheduler needs from the cloud control plane.
#[async_trait]
pub trait CloudControl: Send + Sync {
    /// Lists all GPU workspaces eligible for management.
    async fn discover_gpu_workspaces(&self) -> Result<Vec<Workspace>, CloudError>;

    /// Fetches a single workspace by id.
    async fn get_workspace(&self, workspace_id: &str) -> Result<Workspace, CloudError>;

    /// Requests that a paused workspace be re-provisioned.
    async fn resume_workspace(&self, workspace_id: &str) -> Result<ActionResponse, CloudError>;

    /// Requests that a running workspace be de-provisioned.
    async fn pause_workspace(&self, workspace_id: &str) -> Result<ActionResponse, CloudError>;

    /// Polls until the workspace reaches `target` or `timeout_seconds` pass.
    async fn wait_for_workspace_status(
        &self,
        workspace_id: &str,
        target: WorkspaceStatus,
        timeout_seconds: u64,
        poll_interval_seconds: u64,
    ) -> Result<bool, CloudError>;
}

/// HTTP client for the workspace control plane.
#[derive(Debug, Clone)]
pub struct CloudClient {
    config: CloudApiConfig,
    base_url: String,
    http_client: Client,
}

impl CloudClient {
    /// Creates a new client from configuration.
    pub fn new(config: CloudApiConfig) -> Self {
        let base_url = config.base_url.trim_end_matches('/').to_string();
        Self {
            config,
            base_url,
            http_client: Client::new(),
        }
    }

    async fn request_json(
        &self,
        method: reqwest::Method,
        endpoint: &str,
        json_body: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, CloudError> {
        let url = format!("{}{}", self.base_url, endpoint);

        let mut builder = self
            .http_client
            .request(method, &url)
            .header("accept", "application/json;Compute")
            .header("authorization", &self.config.auth_token)
            .timeout(Duration::from_secs(30));

        if let Some(csrf) = &self.config.csrf_token {
            builder = builder.header("X-CSRFTOKEN", csrf);
        }

        if let Some(body) = json_body {
            builder = builder.json(&body);
        }

        let response = builder
            .send()
            .await
            .map_err(|err| CloudError::Network(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(url = %url, status = status.as_u16(), "Cloud API request failed");
            return Err(CloudError::RequestFailed {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json()
            .await
            .map_err(|err| CloudError::Network(err.to_string()))
    }

    async fn list_workspaces(&self) -> Result<Vec<Workspace>, CloudError> {
        let endpoint = format!(
            "/workspace/workspaces/?application_type=Compute&deleted=false&name={}",
            self.config.machine_name_filter
        );

        debug!(filter = %self.config.machine_name_filter, "Listing workspaces");

        let value = self.request_json(reqwest::Method::GET, &endpoint, None).await?;
        let list: WorkspaceListResponse =
            serde_json::from_value(value).map_err(|err| CloudError::Network(err.to_string()))?;

        Ok(list.results)
    }
}

#[async_trait]
impl CloudControl for CloudClient {
    async fn discover_gpu_workspaces(&self) -> Result<Vec<Workspace>, CloudError> {
        let workspaces = self.list_workspaces().await?;

        let gpu_workspaces: Vec<Workspace> = workspaces
            .into_iter()
            .filter(|ws| ws.resource_meta.flavor_name.to_lowercase().contains("gpu"))
            .collect();

        info!(count = gpu_workspaces.len(), "Discovered GPU workspaces");
        Ok(gpu_workspaces)
    }

    async fn get_workspace(&self, workspace_id: &str) -> Result<Workspace, CloudError> {
        let endpoint = format!("/workspace/workspaces/{workspace_id}/");
        let value = self.request_json(reqwest::Method::GET, &endpoint, None).await?;
        serde_json::from_value(value).map_err(|err| CloudError::Network(err.to_string()))
    }

    async fn resume_workspace(&self, workspace_id: &str) -> Result<ActionResponse, CloudError> {
        let endpoint = format!("/workspace/workspaces/{workspace_id}/actions/resume/");
        info!(workspace_id = %workspace_id, "Resuming workspace");

        let value = self
            .request_json(reqwest::Method::POST, &endpoint, Some(serde_json::json!({})))
            .await?;
        serde_json::from_value(value).map_err(|err| CloudError::Network(err.to_string()))
    }

    async fn pause_workspace(&self, workspace_id: &str) -> Result<ActionResponse, CloudError> {
        let endpoint = format!("/workspace/workspaces/{workspace_id}/actions/pause/");
        info!(workspace_id = %workspace_id, "Pausing workspace");

        let value = self
            .request_json(reqwest::Method::POST, &endpoint, Some(serde_json::json!({})))
            .await?;
        serde_json::from_value(value).map_err(|err| CloudError::Network(err.to_string()))
    }

    async fn wait_for_workspace_status(
        &self,
        workspace_id: &str,
        target: WorkspaceStatus,
        timeout_seconds: u64,
        poll_interval_seconds: u64,
    ) -> Result<bool, CloudError> {
        debug!(
            workspace_id = %workspace_id,
            target = %target,
            "Waiting for workspace status"
        );

        let mut elapsed = 0;
        while elapsed < timeout_seconds {
            let workspace = self.get_workspace(workspace_id).await?;

            if workspace.status == target {
                info!(workspace_id = %workspace_id, target = %target, "Workspace reached target status");
                return Ok(true);
            }

            if workspace.status == WorkspaceStatus::Unknown {
                warn!(workspace_id = %workspace_id, "Workspace in unknown status");
            }

            tokio::time::sleep(Duration::from_secs(poll_interval_seconds)).await;
            elapsed += poll_interval_seconds;

            debug!(
                workspace_id = %workspace_id,
                status = %workspace.status,
                elapsed_s = elapsed,
                "Still waiting for workspace status"
            );
        }

        warn!(workspace_id = %workspace_id, target = %target, "Timeout waiting for workspace status");
        Ok(false)
    }
}
