//! In-memory stores, used in tests and single-process setups

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use veren_domain::{Deployment, Project};

use crate::errors::PlatformError;
use crate::store::{check_guard, next_sequence, DeploymentStoreExt, ProjectStoreExt};

#[derive(Default)]
pub struct MemoryDeploymentStore {
    deployments: RwLock<HashMap<String, Deployment>>,
}

impl MemoryDeploymentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeploymentStoreExt for MemoryDeploymentStore {
    async fn create(&self, mut deployment: Deployment) -> Result<Deployment, PlatformError> {
        let mut deployments = self.deployments.write().await;
        if deployments.contains_key(&deployment.deployment_id) {
            return Err(PlatformError::StorageError(format!(
                "Deployment {} already exists",
                deployment.deployment_id
            )));
        }

        deployment.sequence_number = next_sequence(
            deployments
                .values()
                .filter(|d| d.project_id == deployment.project_id)
                .map(|d| d.sequence_number),
        );
        deployments.insert(deployment.deployment_id.clone(), deployment.clone());
        Ok(deployment)
    }

    async fn get(&self, deployment_id: &str) -> Result<Option<Deployment>, PlatformError> {
        Ok(self.deployments.read().await.get(deployment_id).cloned())
    }

    async fn compare_and_set(
        &self,
        current: &Deployment,
        mut next: Deployment,
    ) -> Result<Deployment, PlatformError> {
        let mut deployments = self.deployments.write().await;
        let stored = deployments
            .get(&current.deployment_id)
            .ok_or_else(|| PlatformError::NotFound(current.deployment_id.clone()))?;
        check_guard(stored, current)?;

        next.revision = stored.revision + 1;
        deployments.insert(next.deployment_id.clone(), next.clone());
        Ok(next)
    }

    async fn list_for_project(&self, project_id: &str) -> Result<Vec<Deployment>, PlatformError> {
        let deployments = self.deployments.read().await;
        let mut list: Vec<Deployment> = deployments
            .values()
            .filter(|d| d.project_id == project_id)
            .cloned()
            .collect();
        list.sort_by_key(|d| d.sequence_number);
        Ok(list)
    }
}

#[derive(Default)]
pub struct MemoryProjectStore {
    projects: RwLock<HashMap<String, Project>>,
}

impl MemoryProjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, project: Project) {
        self.projects
            .write()
            .await
            .insert(project.project_id.clone(), project);
    }
}

#[async_trait]
impl ProjectStoreExt for MemoryProjectStore {
    async fn get(&self, project_id: &str) -> Result<Option<Project>, PlatformError> {
        Ok(self.projects.read().await.get(project_id).cloned())
    }
}
