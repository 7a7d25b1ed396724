//! Per-deployment scratch directories

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::errors::PlatformError;
use crate::filesys::dir::Dir;
use crate::utils::generate_uuid;

/// Where dropped workspaces wait for removal
const TRASH_DIR: &str = ".trash";

/// A scratch directory for one stage run.
///
/// Named after the deployment and its purpose, so a rerun for the same
/// deployment wipes whatever an earlier attempt left behind. Call
/// [`Workspace::cleanup`] when done. A workspace dropped without cleanup (a
/// cancelled stage) is renamed out of the way and removed on the blocking pool.
#[derive(Debug)]
pub struct Workspace {
    dir: Dir,
    trash: Dir,
    cleaned: bool,
}

impl Workspace {
    pub async fn prepare(root: &Dir, deployment_id: &str, purpose: &str) -> Result<Self, PlatformError> {
        let dir = root.subdir(&format!("{}-{}", deployment_id, purpose));
        let trash = root.subdir(TRASH_DIR);
        trash.create().await?;
        dir.recreate().await?;
        debug!("Workspace ready at {}", dir.path().display());
        Ok(Self {
            dir,
            trash,
            cleaned: false,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Remove the directory
    pub async fn cleanup(mut self) {
        self.cleaned = true;
        if let Err(e) = self.dir.delete().await {
            warn!("Failed to remove workspace {}: {}", self.dir.path().display(), e);
        }
    }

    fn discard(&self) {
        let name = self
            .dir
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let target: PathBuf = self.trash.path().join(format!("{}-{}", name, generate_uuid()));

        // Frees the name for a retry before the contents are gone
        match std::fs::rename(self.dir.path(), &target) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!("Failed to discard workspace {}: {}", self.dir.path().display(), e);
                return;
            }
        }

        let remove = move || {
            if let Err(e) = std::fs::remove_dir_all(&target) {
                warn!("Failed to remove discarded workspace {}: {}", target.display(), e);
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(remove);
            }
            Err(_) => remove(),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if !self.cleaned {
            self.discard();
        }
    }
}
