//! File-backed stores
//!
//! One pretty-printed JSON document per record, replaced atomically on write.

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::warn;
use veren_domain::{Deployment, Project};

use crate::errors::PlatformError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::store::{check_guard, next_sequence, DeploymentStoreExt, ProjectStoreExt};

pub struct FileDeploymentStore {
    dir: Dir,
    /// Serializes read-compare-write cycles within this process
    write_lock: Mutex<()>,
}

impl FileDeploymentStore {
    pub fn new(dir: Dir) -> Self {
        Self {
            dir,
            write_lock: Mutex::new(()),
        }
    }

    fn document(&self, deployment_id: &str) -> Result<File, PlatformError> {
        validate_id(deployment_id)?;
        Ok(self.dir.file(&format!("{}.json", deployment_id)))
    }

    async fn load_all(&self) -> Result<Vec<Deployment>, PlatformError> {
        let mut deployments = Vec::new();
        for path in self.dir.list_files().await? {
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match File::new(&path).read_json::<Deployment>().await {
                Ok(deployment) => deployments.push(deployment),
                Err(e) => warn!(path = %path.display(), "Skipping unreadable deployment document: {}", e),
            }
        }
        Ok(deployments)
    }
}

#[async_trait]
impl DeploymentStoreExt for FileDeploymentStore {
    async fn create(&self, mut deployment: Deployment) -> Result<Deployment, PlatformError> {
        let _guard = self.write_lock.lock().await;
        let file = self.document(&deployment.deployment_id)?;
        if file.exists().await {
            return Err(PlatformError::StorageError(format!(
                "Deployment {} already exists",
                deployment.deployment_id
            )));
        }

        let existing = self.load_all().await?;
        deployment.sequence_number = next_sequence(
            existing
                .iter()
                .filter(|d| d.project_id == deployment.project_id)
                .map(|d| d.sequence_number),
        );
        file.write_json(&deployment).await?;
        Ok(deployment)
    }

    async fn get(&self, deployment_id: &str) -> Result<Option<Deployment>, PlatformError> {
        self.document(deployment_id)?.read_json_opt().await
    }

    async fn compare_and_set(
        &self,
        current: &Deployment,
        mut next: Deployment,
    ) -> Result<Deployment, PlatformError> {
        let _guard = self.write_lock.lock().await;
        let file = self.document(&current.deployment_id)?;
        let stored: Deployment = file
            .read_json_opt()
            .await?
            .ok_or_else(|| PlatformError::NotFound(current.deployment_id.clone()))?;
        check_guard(&stored, current)?;

        next.revision = stored.revision + 1;
        file.write_json(&next).await?;
        Ok(next)
    }

    async fn list_for_project(&self, project_id: &str) -> Result<Vec<Deployment>, PlatformError> {
        let mut list: Vec<Deployment> = self
            .load_all()
            .await?
            .into_iter()
            .filter(|d| d.project_id == project_id)
            .collect();
        list.sort_by_key(|d| d.sequence_number);
        Ok(list)
    }
}

/// Reads project documents dropped in by the control plane
pub struct FileProjectStore {
    dir: Dir,
}

impl FileProjectStore {
    pub fn new(dir: Dir) -> Self {
        Self { dir }
    }
}

#[async_trait]
impl ProjectStoreExt for FileProjectStore {
    async fn get(&self, project_id: &str) -> Result<Option<Project>, PlatformError> {
        validate_id(project_id)?;
        self.dir
            .file(&format!("{}.json", project_id))
            .read_json_opt()
            .await
    }
}

/// Ids become file names; keep them to a safe alphabet
fn validate_id(id: &str) -> Result<(), PlatformError> {
    let valid = !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(PlatformError::ValidationError(format!("Invalid id: {:?}", id)))
    }
}
