//! Deployment and project persistence
//!
//! Deployment records are updated only through [`DeploymentStoreExt::compare_and_set`],
//! which refuses the write when the stored status or revision moved since the
//! caller read the record.

pub mod file;
pub mod memory;

use async_trait::async_trait;
use veren_domain::{Deployment, DeploymentStatus, Project};

use crate::errors::PlatformError;

#[async_trait]
pub trait DeploymentStoreExt: Send + Sync {
    /// Insert a new record, assigning the next sequence number for its project.
    async fn create(&self, deployment: Deployment) -> Result<Deployment, PlatformError>;

    async fn get(&self, deployment_id: &str) -> Result<Option<Deployment>, PlatformError>;

    /// Replace `current` with `next` if the stored record still has the status
    /// and revision of `current`. Returns the stored record, revision bumped.
    ///
    /// Fails with [`PlatformError::Conflict`] when the guard does not match.
    async fn compare_and_set(
        &self,
        current: &Deployment,
        next: Deployment,
    ) -> Result<Deployment, PlatformError>;

    /// All deployments of a project, by ascending sequence number
    async fn list_for_project(&self, project_id: &str) -> Result<Vec<Deployment>, PlatformError>;

    /// Most recent successful deployment of a project
    async fn latest_deployed(&self, project_id: &str) -> Result<Option<Deployment>, PlatformError> {
        let deployments = self.list_for_project(project_id).await?;
        Ok(deployments
            .into_iter()
            .filter(|d| d.status == DeploymentStatus::Deployed)
            .max_by_key(|d| d.sequence_number))
    }
}

#[async_trait]
pub trait ProjectStoreExt: Send + Sync {
    async fn get(&self, project_id: &str) -> Result<Option<Project>, PlatformError>;
}

/// Shared guard check for store implementations
fn check_guard(stored: &Deployment, current: &Deployment) -> Result<(), PlatformError> {
    if stored.status != current.status || stored.revision != current.revision {
        return Err(PlatformError::Conflict(current.deployment_id.clone()));
    }
    if stored.is_terminal() {
        return Err(PlatformError::StorageError(format!(
            "Deployment {} is terminal",
            current.deployment_id
        )));
    }
    Ok(())
}

fn next_sequence(existing: impl Iterator<Item = u64>) -> u64 {
    existing.max().unwrap_or(0) + 1
}
