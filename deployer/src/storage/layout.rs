//! Storage layout configuration

use std::path::PathBuf;

use crate::errors::PlatformError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// On-disk layout of the daemon's state directory
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,
}

impl StorageLayout {
    /// Create a new storage layout
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Get the settings file path
    pub fn settings_file(&self) -> File {
        File::new(self.base_dir.join("settings.json"))
    }

    /// One JSON document per deployment
    pub fn deployments_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("deployments"))
    }

    /// One JSON document per project, written by the control plane
    pub fn projects_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("projects"))
    }

    /// Frontend artifact objects and pointers
    pub fn artifacts_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("artifacts"))
    }

    /// Registered container revisions
    pub fn revisions_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("revisions"))
    }

    /// Per-deployment clone workspaces and build sandboxes
    pub fn workspaces_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("workspaces"))
    }

    /// Get the logs directory
    pub fn logs_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("logs"))
    }

    /// Setup the storage layout (create directories)
    pub async fn setup(&self) -> Result<(), PlatformError> {
        self.deployments_dir().create().await?;
        self.projects_dir().create().await?;
        self.artifacts_dir().create().await?;
        self.revisions_dir().create().await?;
        self.workspaces_dir().create().await?;
        self.logs_dir().create().await?;
        Ok(())
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        #[cfg(target_os = "linux")]
        let base_dir = PathBuf::from("/var/lib/veren");

        #[cfg(not(target_os = "linux"))]
        let base_dir = std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".veren");

        Self::new(base_dir)
    }
}
