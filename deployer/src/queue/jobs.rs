//! Job payloads

use std::fmt;
use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use veren_domain::{BuildHints, Commit, EnvVar, RepoConfig};

use crate::queue::Topic;

/// A source-control access token.
///
/// Held in memory only. `Debug` never prints the value.
#[derive(Clone)]
pub struct Credential(Arc<SecretString>);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Arc::new(SecretString::from(token.into())))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    pub fn is_empty(&self) -> bool {
        self.expose().trim().is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// Input of the analyze stage
#[derive(Debug, Clone)]
pub struct CloneJob {
    pub deployment_id: String,
    pub project_id: String,
    pub repo_url: String,
    pub branch: String,
    pub credential: Option<Credential>,
    pub frontend_dir_path: String,
    pub backend_dir_path: String,
    pub hints: BuildHints,
}

/// Input of the two-leg build stage
#[derive(Debug, Clone)]
pub struct BuildJob {
    pub deployment_id: String,
    pub project_id: String,
    pub repo_url: String,
    pub branch: String,
    pub credential: Option<Credential>,
    pub commit: Commit,
    pub config: RepoConfig,
    pub frontend_env: Vec<EnvVar>,
    pub backend_env: Vec<EnvVar>,
}

/// Input of the backend rollout stage
#[derive(Debug, Clone)]
pub struct BackendDeployJob {
    pub deployment_id: String,
    pub project_id: String,
    pub image_tag: String,
    pub env: Vec<EnvVar>,
    pub port: Option<u16>,
}

/// Undo action for a build leg that succeeded in a failed deployment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompensationAction {
    DeleteImage { image_tag: String },
    RevertArtifact { key: String, to: Option<String> },
    /// Roll the project's backend back to an image that was live before
    RestoreBackend {
        image_tag: String,
        env: Vec<EnvVar>,
        port: Option<u16>,
    },
}

impl CompensationAction {
    fn discriminator(&self) -> String {
        match self {
            CompensationAction::DeleteImage { image_tag } => format!("delete-image:{}", image_tag),
            CompensationAction::RevertArtifact { key, .. } => format!("revert-artifact:{}", key),
            CompensationAction::RestoreBackend { image_tag, .. } => format!("restore-backend:{}", image_tag),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompensationJob {
    pub deployment_id: String,
    pub project_id: String,
    pub action: CompensationAction,
}

/// Payload of a queued job. The variant decides the topic.
#[derive(Debug, Clone)]
pub enum JobPayload {
    Clone(CloneJob),
    Build(BuildJob),
    BackendDeploy(BackendDeployJob),
    Compensation(CompensationJob),
}

impl JobPayload {
    pub fn topic(&self) -> Topic {
        match self {
            JobPayload::Clone(_) => Topic::Clone,
            JobPayload::Build(_) => Topic::Build,
            JobPayload::BackendDeploy(_) => Topic::BackendDeploy,
            JobPayload::Compensation(_) => Topic::Compensation,
        }
    }

    pub fn deployment_id(&self) -> &str {
        match self {
            JobPayload::Clone(job) => &job.deployment_id,
            JobPayload::Build(job) => &job.deployment_id,
            JobPayload::BackendDeploy(job) => &job.deployment_id,
            JobPayload::Compensation(job) => &job.deployment_id,
        }
    }

    pub fn project_id(&self) -> &str {
        match self {
            JobPayload::Clone(job) => &job.project_id,
            JobPayload::Build(job) => &job.project_id,
            JobPayload::BackendDeploy(job) => &job.project_id,
            JobPayload::Compensation(job) => &job.project_id,
        }
    }

    /// At most one job per key is ever enqueued
    pub fn dedupe_key(&self) -> String {
        match self {
            JobPayload::Compensation(job) => format!(
                "{}:{}:{}",
                Topic::Compensation.as_str(),
                job.deployment_id,
                job.action.discriminator()
            ),
            other => format!("{}:{}", other.topic().as_str(), other.deployment_id()),
        }
    }

    /// Secret values that must never appear in a user-visible message
    pub fn secrets(&self) -> Vec<&str> {
        match self {
            JobPayload::Clone(CloneJob {
                credential: Some(credential),
                ..
            })
            | JobPayload::Build(BuildJob {
                credential: Some(credential),
                ..
            }) => vec![credential.expose()],
            _ => Vec::new(),
        }
    }
}
