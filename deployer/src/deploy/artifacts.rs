//! Versioned artifact storage
//!
//! Objects are immutable versions under a key; each key has a `current`
//! pointer that is swapped on upload and moved back on revert. References have
//! the form `<key>@<version>`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::errors::PlatformError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::utils::sha256_hash;

/// Result of an upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOutcome {
    pub artifact_ref: String,
    /// The reference `current` pointed at before this upload
    pub previous: Option<String>,
}

#[async_trait]
pub trait ArtifactStoreExt: Send + Sync {
    /// Store a new version under `key` and make it current.
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<PutOutcome, PlatformError>;

    async fn get(&self, artifact_ref: &str) -> Result<Option<Vec<u8>>, PlatformError>;

    async fn current(&self, key: &str) -> Result<Option<String>, PlatformError>;

    /// Point `key` back at `to`, or clear it when `to` is `None`.
    async fn revert(&self, key: &str, to: Option<&str>) -> Result<(), PlatformError>;
}

/// Key under which a project's frontend bundles live
pub fn frontend_key(project_id: &str) -> String {
    format!("frontend/{}", project_id)
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Pointer {
    artifact_ref: String,
    content_type: String,
    /// sha256 of the object
    #[serde(default)]
    digest: String,
}

/// Artifact store on the local filesystem
pub struct FsArtifactStore {
    root: Dir,
    /// One lock per key keeps pointer swaps ordered
    locks: Mutex<HashMap<String, std::sync::Arc<Mutex<()>>>>,
}

impl FsArtifactStore {
    pub fn new(root: Dir) -> Self {
        Self {
            root,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn key_lock(&self, key: &str) -> std::sync::Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(key.to_string()).or_default().clone()
    }

    fn key_dir(&self, key: &str) -> Result<Dir, PlatformError> {
        validate_key(key)?;
        Ok(key
            .split('/')
            .fold(self.root.clone(), |dir, segment| dir.subdir(segment)))
    }

    fn pointer_file(&self, key: &str) -> Result<File, PlatformError> {
        Ok(self.key_dir(key)?.file("current.json"))
    }

    fn version_file(&self, key: &str, version: &str) -> Result<File, PlatformError> {
        validate_segment(version)?;
        Ok(self.key_dir(key)?.subdir("versions").file(version))
    }

    async fn read_pointer(&self, key: &str) -> Result<Option<Pointer>, PlatformError> {
        self.pointer_file(key)?.read_json_opt().await
    }
}

#[async_trait]
impl ArtifactStoreExt for FsArtifactStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<PutOutcome, PlatformError> {
        let version = format!(
            "{}-{}",
            Utc::now().format("%Y%m%dT%H%M%S%3f"),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let artifact_ref = format!("{}@{}", key, version);

        self.version_file(key, &version)?.write_atomic(&bytes).await?;

        let lock = self.key_lock(key).await;
        let _guard = lock.lock().await;
        let previous = self.read_pointer(key).await?.map(|p| p.artifact_ref);
        self.pointer_file(key)?
            .write_json(&Pointer {
                artifact_ref: artifact_ref.clone(),
                content_type: content_type.to_string(),
                digest: sha256_hash(&bytes),
            })
            .await?;

        info!(artifact_ref = %artifact_ref, size = bytes.len(), "Artifact uploaded");
        Ok(PutOutcome { artifact_ref, previous })
    }

    async fn get(&self, artifact_ref: &str) -> Result<Option<Vec<u8>>, PlatformError> {
        let (key, version) = split_ref(artifact_ref)?;
        let file = self.version_file(key, version)?;
        if !file.exists().await {
            return Ok(None);
        }
        Ok(Some(file.read_bytes().await?))
    }

    async fn current(&self, key: &str) -> Result<Option<String>, PlatformError> {
        Ok(self.read_pointer(key).await?.map(|p| p.artifact_ref))
    }

    async fn revert(&self, key: &str, to: Option<&str>) -> Result<(), PlatformError> {
        let lock = self.key_lock(key).await;
        let _guard = lock.lock().await;
        let pointer = self.pointer_file(key)?;

        match to {
            Some(target) => {
                let (target_key, version) = split_ref(target)?;
                if target_key != key {
                    return Err(PlatformError::ValidationError(format!(
                        "Artifact {} does not belong to {}",
                        target, key
                    )));
                }
                if !self.version_file(key, version)?.exists().await {
                    return Err(PlatformError::NotFound(target.to_string()));
                }
                let bytes = self.version_file(key, version)?.read_bytes().await?;
                let content_type = self
                    .read_pointer(key)
                    .await?
                    .map(|p| p.content_type)
                    .unwrap_or_default();
                pointer
                    .write_json(&Pointer {
                        artifact_ref: target.to_string(),
                        content_type,
                        digest: sha256_hash(&bytes),
                    })
                    .await?;
            }
            None => pointer.delete().await?,
        }

        debug!(key = %key, to = ?to, "Artifact pointer reverted");
        Ok(())
    }
}

fn split_ref(artifact_ref: &str) -> Result<(&str, &str), PlatformError> {
    artifact_ref
        .rsplit_once('@')
        .filter(|(k, v)| !k.is_empty() && !v.is_empty())
        .ok_or_else(|| PlatformError::ValidationError(format!("Invalid artifact reference: {}", artifact_ref)))
}

fn validate_key(key: &str) -> Result<(), PlatformError> {
    key.split('/').try_for_each(validate_segment)
}

fn validate_segment(segment: &str) -> Result<(), PlatformError> {
    let valid = !segment.is_empty()
        && segment != "."
        && segment != ".."
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(PlatformError::ValidationError(format!("Invalid artifact path segment: {:?}", segment)))
    }
}
