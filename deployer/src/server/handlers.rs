//! HTTP request handlers

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;
use veren_domain::{Artifacts, Commit, Deployment, DeploymentError, DeploymentStatus};

use crate::errors::PlatformError;
use crate::queue::jobs::Credential;
use crate::server::state::ServerState;
use crate::utils::version_info;

/// Error body returned by every handler
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Maps platform errors onto status codes
pub struct ApiError(PlatformError);

impl From<PlatformError> for ApiError {
    fn from(err: PlatformError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            PlatformError::NotFound(_) => StatusCode::NOT_FOUND,
            PlatformError::Forbidden(_) => StatusCode::FORBIDDEN,
            PlatformError::ValidationError(_) => StatusCode::BAD_REQUEST,
            PlatformError::Conflict(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {}", self.0);
            "Internal error".to_string()
        } else {
            self.0.to_string()
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "verend".to_string(),
        version: version.version,
    })
}

/// Version response
#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    let version = version_info();
    Json(VersionResponse {
        version: version.version,
        git_hash: version.git_hash,
        build_time: version.build_time,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest {
    pub owner_id: String,
    pub credential_token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployResponse {
    pub deployment_id: String,
    pub sequence_number: u64,
}

/// Start a deployment of a project
pub async fn request_deployment_handler(
    State(state): State<Arc<ServerState>>,
    Path(project_id): Path<String>,
    Json(request): Json<DeployRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let deployment = state
        .coordinator
        .request_deployment(
            &project_id,
            &request.owner_id,
            Credential::new(request.credential_token),
        )
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(DeployResponse {
            deployment_id: deployment.deployment_id,
            sequence_number: deployment.sequence_number,
        }),
    ))
}

/// Deployment record as shown to clients
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentView {
    pub deployment_id: String,
    pub project_id: String,
    pub owner_id: String,
    pub sequence_number: u64,
    pub status: DeploymentStatus,
    pub commit: Option<Commit>,
    pub artifacts: Artifacts,
    pub backend_revision_ref: Option<String>,
    pub error: Option<DeploymentError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<Deployment> for DeploymentView {
    fn from(d: Deployment) -> Self {
        Self {
            deployment_id: d.deployment_id,
            project_id: d.project_id,
            owner_id: d.owner_id,
            sequence_number: d.sequence_number,
            status: d.status,
            commit: d.commit,
            artifacts: d.artifacts,
            backend_revision_ref: d.backend_revision_ref,
            error: d.error,
            started_at: d.started_at,
            finished_at: d.finished_at,
        }
    }
}

pub async fn deployment_handler(
    State(state): State<Arc<ServerState>>,
    Path(deployment_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let deployment = state
        .deployments
        .get(&deployment_id)
        .await?
        .ok_or_else(|| PlatformError::NotFound(format!("Deployment {}", deployment_id)))?;
    Ok(Json(DeploymentView::from(deployment)))
}

pub async fn project_deployments_handler(
    State(state): State<Arc<ServerState>>,
    Path(project_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let deployments = state.deployments.list_for_project(&project_id).await?;
    let views: Vec<DeploymentView> = deployments.into_iter().map(DeploymentView::from).collect();
    Ok(Json(views))
}
