//! Deployment record
//!
//! One record per deployment attempt. The record is written only by the saga
//! coordinator; workers report through events.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::RepoConfig;
use crate::events::EventType;
use crate::failure::FailureKind;

/// Deployment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Queued,
    Analyzing,
    Building,
    Deploying,
    Deployed,
    Failed,
}

impl DeploymentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeploymentStatus::Deployed | DeploymentStatus::Failed)
    }

    /// Position along the success path
    fn rank(&self) -> u8 {
        match self {
            DeploymentStatus::Queued => 0,
            DeploymentStatus::Analyzing => 1,
            DeploymentStatus::Building => 2,
            DeploymentStatus::Deploying => 3,
            DeploymentStatus::Deployed => 4,
            DeploymentStatus::Failed => 5,
        }
    }

    /// Whether this status comes before `other` on the success path
    pub fn precedes(&self, other: DeploymentStatus) -> bool {
        self.rank() < other.rank()
    }

    /// Whether `next` is a legal forward move from this status.
    ///
    /// The success path advances one step at a time. `failed` is reachable from
    /// any non-terminal status. Terminal statuses never move.
    pub fn can_advance_to(&self, next: DeploymentStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            DeploymentStatus::Failed => true,
            _ => next.rank() == self.rank() + 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Queued => "queued",
            DeploymentStatus::Analyzing => "analyzing",
            DeploymentStatus::Building => "building",
            DeploymentStatus::Deploying => "deploying",
            DeploymentStatus::Deployed => "deployed",
            DeploymentStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub hash: String,
    pub message: String,
}

/// Current and rollback pointers for the two build outputs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifacts {
    pub frontend_artifact_ref: Option<String>,
    pub backend_image_ref: Option<String>,
    pub previous_frontend_artifact_ref: Option<String>,
    pub previous_backend_image_ref: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildTasks {
    pub frontend_task_ref: Option<String>,
    pub backend_task_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentError {
    pub kind: FailureKind,
    pub message: String,
}

/// One of the two build legs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Leg {
    Frontend,
    Backend,
}

impl Leg {
    pub fn as_str(&self) -> &'static str {
        match self {
            Leg::Frontend => "frontend",
            Leg::Backend => "backend",
        }
    }
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LegState {
    #[default]
    Pending,
    Succeeded,
    Failed,
}

/// Reported outcome of each build leg
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Legs {
    pub frontend: LegState,
    pub backend: LegState,
}

impl Legs {
    pub fn get(&self, leg: Leg) -> LegState {
        match leg {
            Leg::Frontend => self.frontend,
            Leg::Backend => self.backend,
        }
    }

    pub fn set(&mut self, leg: Leg, state: LegState) {
        match leg {
            Leg::Frontend => self.frontend = state,
            Leg::Backend => self.backend = state,
        }
    }

    pub fn both_succeeded(&self) -> bool {
        self.frontend == LegState::Succeeded && self.backend == LegState::Succeeded
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid transition from {from} to {to}")]
pub struct TransitionError {
    pub from: DeploymentStatus,
    pub to: DeploymentStatus,
}

/// Deployment aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub deployment_id: String,
    pub project_id: String,
    pub owner_id: String,
    pub sequence_number: u64,
    pub status: DeploymentStatus,
    #[serde(default)]
    pub commit: Option<Commit>,
    #[serde(default)]
    pub config: Option<RepoConfig>,
    #[serde(default)]
    pub artifacts: Artifacts,
    #[serde(default)]
    pub build_tasks: BuildTasks,
    #[serde(default)]
    pub backend_revision_ref: Option<String>,
    #[serde(default)]
    pub legs: Legs,
    #[serde(default)]
    pub error: Option<DeploymentError>,
    #[serde(default)]
    pub applied_events: BTreeSet<EventType>,
    /// Incremented on every write; guards compare-and-set updates
    #[serde(default)]
    pub revision: u64,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Deployment {
    pub fn new(
        deployment_id: impl Into<String>,
        project_id: impl Into<String>,
        owner_id: impl Into<String>,
        sequence_number: u64,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            deployment_id: deployment_id.into(),
            project_id: project_id.into(),
            owner_id: owner_id.into(),
            sequence_number,
            status: DeploymentStatus::Queued,
            commit: None,
            config: None,
            artifacts: Artifacts::default(),
            build_tasks: BuildTasks::default(),
            backend_revision_ref: None,
            legs: Legs::default(),
            error: None,
            applied_events: BTreeSet::new(),
            revision: 0,
            started_at,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn has_applied(&self, event_type: EventType) -> bool {
        self.applied_events.contains(&event_type)
    }

    /// Move to `next`, stamping `finished_at` on terminal statuses.
    pub fn advance(&mut self, next: DeploymentStatus, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if !self.status.can_advance_to(next) {
            return Err(TransitionError {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        Ok(())
    }

    /// Move to `failed` with a user-visible error.
    pub fn fail(
        &mut self,
        kind: FailureKind,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.advance(DeploymentStatus::Failed, now)?;
        self.error = Some(DeploymentError {
            kind,
            message: message.into(),
        });
        Ok(())
    }

    /// Record the commit. Later calls keep the first value.
    pub fn set_commit(&mut self, commit: Commit) {
        if self.commit.is_none() {
            self.commit = Some(commit);
        }
    }
}
