//! Container image and runtime access

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use veren_domain::EnvVar;

use crate::deploy::command;
use crate::errors::PlatformError;
use crate::filesys::dir::Dir;
use crate::http::registry::RegistryClient;

#[async_trait]
pub trait ImageRegistryExt: Send + Sync {
    /// Build an image from `context`, passing `build_args` as `--build-arg`s.
    async fn build(&self, context: &Path, image_tag: &str, build_args: &[EnvVar]) -> Result<(), PlatformError>;

    async fn push(&self, image_tag: &str) -> Result<(), PlatformError>;

    /// Whether the registry can serve `image_tag`
    async fn exists(&self, image_tag: &str) -> Result<bool, PlatformError>;

    /// Remove `image_tag` from the registry. Absent images are not an error.
    async fn delete(&self, image_tag: &str) -> Result<(), PlatformError>;
}

/// A container that runs a command to completion
#[derive(Debug, Clone)]
pub struct OneOffTask {
    pub name: String,
    pub image: String,
    pub command: String,
    /// Working directory inside the container
    pub workdir: String,
    /// `(host, container)` bind mounts
    pub mounts: Vec<(PathBuf, String)>,
    pub env: Vec<EnvVar>,
}

#[async_trait]
pub trait ContainerRuntimeExt: Send + Sync {
    /// Run `task` and wait for it to exit. Returns the task reference.
    async fn run_one_off(&self, task: OneOffTask) -> Result<String, PlatformError>;

    /// Record a runnable revision of `service`. Registering the same image and
    /// environment as the latest revision returns that revision.
    async fn register_revision(
        &self,
        service: &str,
        image_tag: &str,
        env: &[EnvVar],
        port: Option<u16>,
    ) -> Result<String, PlatformError>;

    /// Replace the running containers of `service` with `revision_ref`.
    async fn rollout(&self, service: &str, revision_ref: &str) -> Result<(), PlatformError>;
}

/// Docker CLI for builds, the registry API for lookups
pub struct DockerRegistry {
    api: RegistryClient,
    username: Option<String>,
    password: Option<String>,
}

impl DockerRegistry {
    pub fn new(api: RegistryClient, username: Option<String>, password: Option<String>) -> Self {
        Self { api, username, password }
    }

    async fn login(&self, image_tag: &str) -> Result<(), PlatformError> {
        let (Some(username), Some(password)) = (&self.username, &self.password) else {
            return Ok(());
        };
        let Some(host) = registry_host(image_tag) else {
            return Ok(());
        };

        debug!("Authenticating with registry {}", host);
        let mut cmd = Command::new("docker");
        cmd.args(["login", host, "-u", username, "--password-stdin"]);
        command::run_with_input(&mut cmd, "docker login", Some(password))
            .await
            .map_err(|e| PlatformError::RegistryError(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl ImageRegistryExt for DockerRegistry {
    async fn build(&self, context: &Path, image_tag: &str, build_args: &[EnvVar]) -> Result<(), PlatformError> {
        info!("Building image {}", image_tag);
        let mut cmd = Command::new("docker");
        cmd.arg("build").arg("--tag").arg(image_tag);
        for arg in build_args {
            // Value comes from the CLI's environment, not argv
            cmd.arg("--build-arg").arg(&arg.key).env(&arg.key, &arg.value);
        }
        cmd.arg(context);
        command::run(&mut cmd, "docker build").await?;
        Ok(())
    }

    async fn push(&self, image_tag: &str) -> Result<(), PlatformError> {
        self.login(image_tag).await?;
        info!("Pushing image {}", image_tag);
        let mut cmd = Command::new("docker");
        cmd.args(["push", image_tag]);
        command::run(&mut cmd, "docker push")
            .await
            .map_err(|e| PlatformError::RegistryError(e.to_string()))?;
        Ok(())
    }

    async fn exists(&self, image_tag: &str) -> Result<bool, PlatformError> {
        Ok(self.api.manifest_digest(image_tag).await?.is_some())
    }

    async fn delete(&self, image_tag: &str) -> Result<(), PlatformError> {
        self.api.delete_manifest(image_tag).await?;
        info!("Deleted image {}", image_tag);
        Ok(())
    }
}

fn registry_host(image_tag: &str) -> Option<&str> {
    let (host, _) = image_tag.split_once('/')?;
    (host.contains('.') || host.contains(':') || host == "localhost").then_some(host)
}

/// A registered service revision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Revision {
    pub revision_ref: String,
    pub service: String,
    pub image_tag: String,
    pub env: Vec<EnvVar>,
    pub port: Option<u16>,
    pub created_at: DateTime<Utc>,
}

/// Docker engine on this host
pub struct DockerRuntime {
    revisions: Dir,
    write_lock: Mutex<()>,
}

impl DockerRuntime {
    pub fn new(revisions: Dir) -> Self {
        Self {
            revisions,
            write_lock: Mutex::new(()),
        }
    }

    async fn service_revisions(&self, service: &str) -> Result<Vec<Revision>, PlatformError> {
        let mut revisions = Vec::new();
        for path in self.revisions.subdir(service).list_files().await? {
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            revisions.push(crate::filesys::file::File::new(&path).read_json::<Revision>().await?);
        }
        revisions.sort_by_key(|r| revision_number(&r.revision_ref));
        Ok(revisions)
    }

    pub async fn load_revision(&self, revision_ref: &str) -> Result<Revision, PlatformError> {
        let (service, number) = revision_ref
            .rsplit_once(':')
            .filter(|(_, n)| n.parse::<u64>().is_ok())
            .ok_or_else(|| PlatformError::ValidationError(format!("Invalid revision: {}", revision_ref)))?;
        self.revisions
            .subdir(service)
            .file(&format!("{}.json", number))
            .read_json_opt()
            .await?
            .ok_or_else(|| PlatformError::NotFound(revision_ref.to_string()))
    }
}

fn revision_number(revision_ref: &str) -> u64 {
    revision_ref
        .rsplit_once(':')
        .and_then(|(_, n)| n.parse().ok())
        .unwrap_or(0)
}

#[async_trait]
impl ContainerRuntimeExt for DockerRuntime {
    async fn run_one_off(&self, task: OneOffTask) -> Result<String, PlatformError> {
        info!(task = %task.name, image = %task.image, "Starting one-off task");

        // Leftover from an earlier attempt
        let mut rm = Command::new("docker");
        rm.args(["rm", "-f", &task.name]);
        if let Err(e) = command::run(&mut rm, "docker rm").await {
            debug!("No previous container to remove: {}", e);
        }

        let mut cmd = Command::new("docker");
        cmd.args(["run", "--rm", "--name", &task.name, "-w", &task.workdir]);
        for (host, container) in &task.mounts {
            cmd.arg("-v").arg(format!("{}:{}", host.display(), container));
        }
        for var in &task.env {
            cmd.arg("-e").arg(&var.key).env(&var.key, &var.value);
        }
        cmd.arg(&task.image).args(["sh", "-c", &task.command]);

        command::run(&mut cmd, &format!("task {}", task.name)).await?;
        info!(task = %task.name, "One-off task finished");
        Ok(task.name)
    }

    async fn register_revision(
        &self,
        service: &str,
        image_tag: &str,
        env: &[EnvVar],
        port: Option<u16>,
    ) -> Result<String, PlatformError> {
        let _guard = self.write_lock.lock().await;
        let revisions = self.service_revisions(service).await?;

        if let Some(latest) = revisions.last() {
            if latest.image_tag == image_tag && latest.env == env && latest.port == port {
                debug!(revision = %latest.revision_ref, "Reusing registered revision");
                return Ok(latest.revision_ref.clone());
            }
        }

        let number = revisions.last().map(|r| revision_number(&r.revision_ref)).unwrap_or(0) + 1;
        let revision = Revision {
            revision_ref: format!("{}:{}", service, number),
            service: service.to_string(),
            image_tag: image_tag.to_string(),
            env: env.to_vec(),
            port,
            created_at: Utc::now(),
        };
        self.revisions
            .subdir(service)
            .file(&format!("{}.json", number))
            .write_json(&revision)
            .await?;

        info!(revision = %revision.revision_ref, "Revision registered");
        Ok(revision.revision_ref)
    }

    async fn rollout(&self, service: &str, revision_ref: &str) -> Result<(), PlatformError> {
        let revision = self.load_revision(revision_ref).await?;
        if revision.service != service {
            return Err(PlatformError::ValidationError(format!(
                "Revision {} does not belong to {}",
                revision_ref, service
            )));
        }

        let mut pull = Command::new("docker");
        pull.args(["pull", &revision.image_tag]);
        command::run(&mut pull, "docker pull")
            .await
            .map_err(|e| PlatformError::RegistryError(e.to_string()))?;

        let mut rm = Command::new("docker");
        rm.args(["rm", "-f", service]);
        if let Err(e) = command::run(&mut rm, "docker rm").await {
            warn!("Failed to remove previous container of {}: {}", service, e);
        }

        let mut run = Command::new("docker");
        run.args(["run", "-d", "--name", service, "--restart", "unless-stopped"])
            .arg("--label")
            .arg(format!("dev.veren.revision={}", revision.revision_ref));
        if let Some(port) = revision.port {
            run.arg("-p").arg(format!("{}:{}", port, port)).env("PORT", port.to_string()).args(["-e", "PORT"]);
        }
        for var in &revision.env {
            run.arg("-e").arg(&var.key).env(&var.key, &var.value);
        }
        run.arg(&revision.image_tag);
        command::run(&mut run, "docker run").await?;

        info!(service = %service, revision = %revision_ref, "Rollout complete");
        Ok(())
    }
}
