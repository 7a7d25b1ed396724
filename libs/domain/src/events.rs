//! Domain events
//!
//! Every stage outcome is published as a `DomainEvent` keyed by deployment id.
//! On the wire an event is a JSON envelope:
//!
//! ```json
//! { "type": "BACKEND_BUILD_SUCCESS", "deploymentId": "...", "projectId": "...",
//!   "payload": { "imageTag": "..." }, "timestamp": "..." }
//! ```
//!
//! Decoding never rejects an envelope because of its `type` or payload. Unknown
//! types and malformed payloads become [`EventKind::Unrecognized`] so the
//! consumer can fail the deployment instead of dropping the message.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::RepoConfig;
use crate::deployment::{Commit, DeploymentStatus, Leg};
use crate::failure::StageFailure;

/// Event type tag, used for dispatch and de-duplication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    RepoAnalysisSuccess,
    RepoAnalysisFailed,
    BuildQueued,
    FrontendBuildSuccess,
    FrontendBuildFailed,
    BackendBuildSuccess,
    BackendBuildFailed,
    BackendDeploySuccess,
    BackendDeployFailed,
}

impl EventType {
    /// The status a deployment is in while this event is expected
    pub fn stage(&self) -> DeploymentStatus {
        match self {
            EventType::RepoAnalysisSuccess | EventType::RepoAnalysisFailed => DeploymentStatus::Analyzing,
            EventType::BuildQueued
            | EventType::FrontendBuildSuccess
            | EventType::FrontendBuildFailed
            | EventType::BackendBuildSuccess
            | EventType::BackendBuildFailed => DeploymentStatus::Building,
            EventType::BackendDeploySuccess | EventType::BackendDeployFailed => DeploymentStatus::Deploying,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::RepoAnalysisSuccess => "REPO_ANALYSIS_SUCCESS",
            EventType::RepoAnalysisFailed => "REPO_ANALYSIS_FAILED",
            EventType::BuildQueued => "BUILD_QUEUED",
            EventType::FrontendBuildSuccess => "FRONTEND_BUILD_SUCCESS",
            EventType::FrontendBuildFailed => "FRONTEND_BUILD_FAILED",
            EventType::BackendBuildSuccess => "BACKEND_BUILD_SUCCESS",
            EventType::BackendBuildFailed => "BACKEND_BUILD_FAILED",
            EventType::BackendDeploySuccess => "BACKEND_DEPLOY_SUCCESS",
            EventType::BackendDeployFailed => "BACKEND_DEPLOY_FAILED",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "REPO_ANALYSIS_SUCCESS" => Ok(EventType::RepoAnalysisSuccess),
            "REPO_ANALYSIS_FAILED" => Ok(EventType::RepoAnalysisFailed),
            "BUILD_QUEUED" => Ok(EventType::BuildQueued),
            "FRONTEND_BUILD_SUCCESS" => Ok(EventType::FrontendBuildSuccess),
            "FRONTEND_BUILD_FAILED" => Ok(EventType::FrontendBuildFailed),
            "BACKEND_BUILD_SUCCESS" => Ok(EventType::BackendBuildSuccess),
            "BACKEND_BUILD_FAILED" => Ok(EventType::BackendBuildFailed),
            "BACKEND_DEPLOY_SUCCESS" => Ok(EventType::BackendDeploySuccess),
            "BACKEND_DEPLOY_FAILED" => Ok(EventType::BackendDeployFailed),
            _ => Err(format!("Unknown event type: {}", s)),
        }
    }
}

/// Event payload, one variant per event type
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    RepoAnalysisSuccess {
        config: RepoConfig,
        commit: Commit,
    },
    RepoAnalysisFailed(StageFailure),
    BuildQueued {
        frontend_task_ref: Option<String>,
        backend_task_ref: Option<String>,
    },
    FrontendBuildSuccess {
        artifact_ref: String,
        previous_artifact_ref: Option<String>,
    },
    FrontendBuildFailed(StageFailure),
    BackendBuildSuccess {
        image_tag: String,
    },
    BackendBuildFailed(StageFailure),
    BackendDeploySuccess {
        revision_ref: String,
    },
    BackendDeployFailed(StageFailure),
    /// A type this build does not know, or a known type with a bad payload
    Unrecognized {
        event_type: String,
        reason: String,
    },
}

impl EventKind {
    /// `None` for unrecognized events
    pub fn event_type(&self) -> Option<EventType> {
        match self {
            EventKind::RepoAnalysisSuccess { .. } => Some(EventType::RepoAnalysisSuccess),
            EventKind::RepoAnalysisFailed(_) => Some(EventType::RepoAnalysisFailed),
            EventKind::BuildQueued { .. } => Some(EventType::BuildQueued),
            EventKind::FrontendBuildSuccess { .. } => Some(EventType::FrontendBuildSuccess),
            EventKind::FrontendBuildFailed(_) => Some(EventType::FrontendBuildFailed),
            EventKind::BackendBuildSuccess { .. } => Some(EventType::BackendBuildSuccess),
            EventKind::BackendBuildFailed(_) => Some(EventType::BackendBuildFailed),
            EventKind::BackendDeploySuccess { .. } => Some(EventType::BackendDeploySuccess),
            EventKind::BackendDeployFailed(_) => Some(EventType::BackendDeployFailed),
            EventKind::Unrecognized { .. } => None,
        }
    }

    pub fn type_name(&self) -> &str {
        match self {
            EventKind::Unrecognized { event_type, .. } => event_type,
            other => other.event_type().map(|t| t.as_str()).unwrap_or("UNKNOWN"),
        }
    }

    /// Failure event for a build leg
    pub fn leg_failed(leg: Leg, failure: StageFailure) -> Self {
        match leg {
            Leg::Frontend => EventKind::FrontendBuildFailed(failure),
            Leg::Backend => EventKind::BackendBuildFailed(failure),
        }
    }
}

/// A stage outcome addressed to one deployment
#[derive(Debug, Clone, PartialEq)]
pub struct DomainEvent {
    pub deployment_id: String,
    pub project_id: String,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Malformed event envelope: {0}")]
    Envelope(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEvent {
    #[serde(rename = "type")]
    event_type: String,
    deployment_id: String,
    project_id: String,
    #[serde(default)]
    payload: Value,
    #[serde(default = "Utc::now")]
    timestamp: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalysisPayload {
    config: RepoConfig,
    commit_hash: String,
    commit_message: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BuildQueuedPayload {
    #[serde(default)]
    frontend_task_ref: Option<String>,
    #[serde(default)]
    backend_task_ref: Option<String>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArtifactPayload {
    artifact_ref: String,
    #[serde(default)]
    previous_artifact_ref: Option<String>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImagePayload {
    image_tag: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RevisionPayload {
    revision_ref: String,
}

impl DomainEvent {
    pub fn new(deployment_id: impl Into<String>, project_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            deployment_id: deployment_id.into(),
            project_id: project_id.into(),
            kind,
            timestamp: Utc::now(),
        }
    }

    /// Ordering key on the bus
    pub fn ordering_key(&self) -> &str {
        &self.deployment_id
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let payload = match &self.kind {
            EventKind::RepoAnalysisSuccess { config, commit } => serde_json::to_value(AnalysisPayload {
                config: config.clone(),
                commit_hash: commit.hash.clone(),
                commit_message: commit.message.clone(),
            })?,
            EventKind::BuildQueued {
                frontend_task_ref,
                backend_task_ref,
            } => serde_json::to_value(BuildQueuedPayload {
                frontend_task_ref: frontend_task_ref.clone(),
                backend_task_ref: backend_task_ref.clone(),
            })?,
            EventKind::FrontendBuildSuccess {
                artifact_ref,
                previous_artifact_ref,
            } => serde_json::to_value(ArtifactPayload {
                artifact_ref: artifact_ref.clone(),
                previous_artifact_ref: previous_artifact_ref.clone(),
            })?,
            EventKind::BackendBuildSuccess { image_tag } => serde_json::to_value(ImagePayload {
                image_tag: image_tag.clone(),
            })?,
            EventKind::BackendDeploySuccess { revision_ref } => serde_json::to_value(RevisionPayload {
                revision_ref: revision_ref.clone(),
            })?,
            EventKind::RepoAnalysisFailed(failure)
            | EventKind::FrontendBuildFailed(failure)
            | EventKind::BackendBuildFailed(failure)
            | EventKind::BackendDeployFailed(failure) => serde_json::to_value(failure)?,
            EventKind::Unrecognized { .. } => Value::Null,
        };

        serde_json::to_string(&RawEvent {
            event_type: self.kind.type_name().to_string(),
            deployment_id: self.deployment_id.clone(),
            project_id: self.project_id.clone(),
            payload,
            timestamp: self.timestamp,
        })
    }

    pub fn from_json(raw: &str) -> Result<Self, DecodeError> {
        let raw: RawEvent = serde_json::from_str(raw)?;
        let kind = match raw.event_type.parse::<EventType>() {
            Ok(event_type) => decode_payload(event_type, raw.payload).unwrap_or_else(|e| {
                EventKind::Unrecognized {
                    event_type: raw.event_type.clone(),
                    reason: format!("Malformed payload: {}", e),
                }
            }),
            Err(e) => EventKind::Unrecognized {
                event_type: raw.event_type.clone(),
                reason: e,
            },
        };

        Ok(Self {
            deployment_id: raw.deployment_id,
            project_id: raw.project_id,
            kind,
            timestamp: raw.timestamp,
        })
    }
}

fn decode_payload(event_type: EventType, payload: Value) -> Result<EventKind, serde_json::Error> {
    let kind = match event_type {
        EventType::RepoAnalysisSuccess => {
            let p: AnalysisPayload = serde_json::from_value(payload)?;
            EventKind::RepoAnalysisSuccess {
                config: p.config,
                commit: Commit {
                    hash: p.commit_hash,
                    message: p.commit_message,
                },
            }
        }
        EventType::RepoAnalysisFailed => EventKind::RepoAnalysisFailed(serde_json::from_value(payload)?),
        EventType::BuildQueued => {
            let p: BuildQueuedPayload = serde_json::from_value(payload)?;
            EventKind::BuildQueued {
                frontend_task_ref: p.frontend_task_ref,
                backend_task_ref: p.backend_task_ref,
            }
        }
        EventType::FrontendBuildSuccess => {
            let p: ArtifactPayload = serde_json::from_value(payload)?;
            EventKind::FrontendBuildSuccess {
                artifact_ref: p.artifact_ref,
                previous_artifact_ref: p.previous_artifact_ref,
            }
        }
        EventType::FrontendBuildFailed => EventKind::FrontendBuildFailed(serde_json::from_value(payload)?),
        EventType::BackendBuildSuccess => {
            let p: ImagePayload = serde_json::from_value(payload)?;
            EventKind::BackendBuildSuccess { image_tag: p.image_tag }
        }
        EventType::BackendBuildFailed => EventKind::BackendBuildFailed(serde_json::from_value(payload)?),
        EventType::BackendDeploySuccess => {
            let p: RevisionPayload = serde_json::from_value(payload)?;
            EventKind::BackendDeploySuccess {
                revision_ref: p.revision_ref,
            }
        }
        EventType::BackendDeployFailed => EventKind::BackendDeployFailed(serde_json::from_value(payload)?),
    };
    Ok(kind)
}
