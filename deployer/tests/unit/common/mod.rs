//! Test doubles and a saga harness that runs stages one step at a time

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use veren_domain::{Commit, Deployment, EnvVar, Project};

use verend::bus::memory::{MemoryEventBus, Options as BusOptions};
use verend::bus::{EventBusExt, Publisher, DEPLOYMENT_EVENTS};
use verend::deploy::artifacts::{ArtifactStoreExt, FsArtifactStore};
use verend::deploy::docker::{ContainerRuntimeExt, ImageRegistryExt, OneOffTask};
use verend::deploy::git::SourceControlExt;
use verend::errors::PlatformError;
use verend::filesys::dir::Dir;
use verend::queue::jobs::Credential;
use verend::queue::memory::{MemoryJobQueue, Options as QueueOptions};
use verend::queue::{JobOptions, JobQueueExt, Topic};
use verend::saga::coordinator::{Coordinator, Options as CoordinatorOptions};
use verend::store::memory::{MemoryDeploymentStore, MemoryProjectStore};
use verend::store::DeploymentStoreExt;
use verend::utils::CooldownOptions;
use verend::workers::backend_deploy::BackendDeployWorker;
use verend::workers::build::{BuildWorker, BuildWorkerDeps};
use verend::workers::clone::CloneWorker;
use verend::workers::compensation::CompensationWorker;
use verend::workers::stage::{process_job, JobDisposition, StageDeps, StageWorker};

pub const TOKEN: &str = "ghp_test_token";
pub const REPOSITORY: &str = "registry.test/veren/backend";

// ================================ SOURCE CONTROL ================================= //

/// Checks out a small repository with the configured directories
pub struct FakeSource {
    pub dirs: Vec<&'static str>,
    pub on_remote: bool,
    pub clone_delay: Option<Duration>,
    pub clone_error: Option<String>,
}

impl Default for FakeSource {
    fn default() -> Self {
        Self {
            dirs: vec!["frontend", "backend"],
            on_remote: true,
            clone_delay: None,
            clone_error: None,
        }
    }
}

#[async_trait]
impl SourceControlExt for FakeSource {
    async fn clone_repo(
        &self,
        _repo_url: &str,
        _branch: &str,
        _credential: &Credential,
        dest: &Path,
    ) -> Result<(), PlatformError> {
        if let Some(delay) = self.clone_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = &self.clone_error {
            return Err(PlatformError::SourceControlError(message.clone()));
        }
        tokio::fs::create_dir_all(dest).await?;
        for dir in &self.dirs {
            let root = dest.join(dir);
            tokio::fs::create_dir_all(&root).await?;
            if *dir == "frontend" {
                tokio::fs::write(
                    root.join("package.json"),
                    r#"{"dependencies":{"vite":"5.0.0"},"scripts":{"build":"vite build"}}"#,
                )
                .await?;
                tokio::fs::create_dir_all(root.join("build")).await?;
                tokio::fs::write(root.join("build/index.html"), "<html></html>").await?;
            } else {
                tokio::fs::write(root.join("Dockerfile"), "FROM node:18-alpine\n").await?;
            }
        }
        Ok(())
    }

    async fn head_commit(&self, _dir: &Path) -> Result<Commit, PlatformError> {
        Ok(Commit {
            hash: "4f2c1e0".to_string(),
            message: "Initial commit".to_string(),
        })
    }

    async fn path_exists(
        &self,
        _repo_url: &str,
        _path: &str,
        _branch: &str,
        _credential: &Credential,
    ) -> Result<bool, PlatformError> {
        Ok(self.on_remote)
    }
}

// =================================== REGISTRY ==================================== //

#[derive(Default)]
pub struct FakeRegistry {
    /// Remaining builds that fail with a registry error
    pub failing_builds: AtomicUsize,
    /// Pushed images stay invisible while set
    pub hide_pushed: std::sync::atomic::AtomicBool,
    pub pushed: Mutex<HashSet<String>>,
    pub deleted: Mutex<Vec<String>>,
    pub builds: AtomicUsize,
    pub build_delay: Mutex<Option<Duration>>,
}

impl FakeRegistry {
    pub fn fail_builds(&self, count: usize) {
        self.failing_builds.store(count, Ordering::SeqCst);
    }

    pub fn delay_builds(&self, delay: Duration) {
        *self.build_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_hidden(&self, hidden: bool) {
        self.hide_pushed.store(hidden, Ordering::SeqCst);
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageRegistryExt for FakeRegistry {
    async fn build(&self, context: &Path, _image_tag: &str, _build_args: &[EnvVar]) -> Result<(), PlatformError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        let delay = *self.build_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let remaining = self.failing_builds.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_builds.store(remaining - 1, Ordering::SeqCst);
            return Err(PlatformError::RegistryError("build daemon unavailable".to_string()));
        }
        if !context.join("Dockerfile").exists() {
            return Err(PlatformError::CommandError("Dockerfile not found".to_string()));
        }
        Ok(())
    }

    async fn push(&self, image_tag: &str) -> Result<(), PlatformError> {
        self.pushed.lock().unwrap().insert(image_tag.to_string());
        Ok(())
    }

    async fn exists(&self, image_tag: &str) -> Result<bool, PlatformError> {
        if self.hide_pushed.load(Ordering::SeqCst) {
            return Ok(false);
        }
        Ok(self.pushed.lock().unwrap().contains(image_tag))
    }

    async fn delete(&self, image_tag: &str) -> Result<(), PlatformError> {
        self.pushed.lock().unwrap().remove(image_tag);
        self.deleted.lock().unwrap().push(image_tag.to_string());
        Ok(())
    }
}

// =================================== RUNTIME ===================================== //

#[derive(Default)]
pub struct FakeRuntime {
    pub one_offs: Mutex<Vec<OneOffTask>>,
    pub rollouts: Mutex<Vec<(String, String)>>,
    /// (service, image) of every registered revision
    pub revisions: Mutex<Vec<(String, String)>>,
    pub fail_one_off: std::sync::atomic::AtomicBool,
    pub fail_rollout: std::sync::atomic::AtomicBool,
}

impl FakeRuntime {
    pub fn one_off_count(&self) -> usize {
        self.one_offs.lock().unwrap().len()
    }

    pub fn rollouts(&self) -> Vec<(String, String)> {
        self.rollouts.lock().unwrap().clone()
    }

    pub fn revisions(&self) -> Vec<(String, String)> {
        self.revisions.lock().unwrap().clone()
    }

    pub fn set_rollout_failing(&self, failing: bool) {
        self.fail_rollout.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl ContainerRuntimeExt for FakeRuntime {
    async fn run_one_off(&self, task: OneOffTask) -> Result<String, PlatformError> {
        let name = task.name.clone();
        self.one_offs.lock().unwrap().push(task);
        if self.fail_one_off.load(Ordering::SeqCst) {
            return Err(PlatformError::ValidationError("npm ERR! missing script: build".to_string()));
        }
        Ok(name)
    }

    async fn register_revision(
        &self,
        service: &str,
        image_tag: &str,
        _env: &[EnvVar],
        _port: Option<u16>,
    ) -> Result<String, PlatformError> {
        self.revisions
            .lock()
            .unwrap()
            .push((service.to_string(), image_tag.to_string()));
        Ok(format!("{}:1", service))
    }

    async fn rollout(&self, service: &str, revision_ref: &str) -> Result<(), PlatformError> {
        if self.fail_rollout.load(Ordering::SeqCst) {
            return Err(PlatformError::CommandError("container exited with code 1".to_string()));
        }
        self.rollouts
            .lock()
            .unwrap()
            .push((service.to_string(), revision_ref.to_string()));
        Ok(())
    }
}

// =================================== HARNESS ===================================== //

pub fn project() -> Project {
    serde_json::from_value(serde_json::json!({
        "projectId": "p1",
        "name": "shop",
        "ownerId": "u1",
        "git": { "repoUrl": "https://github.com/acme/shop", "branch": "main" },
        "repoPath": { "frontendDirPath": "./frontend", "backendDirPath": "./backend" },
        "envs": {
            "frontendEnv": [{ "key": "VITE_API", "value": "https://api.shop.test" }],
            "backendEnv": [{ "key": "DATABASE_URL", "value": "postgres://db" }]
        },
        "runtime": { "backendPort": 3000 }
    }))
    .unwrap()
}

fn quick_jobs(attempts: u32) -> JobOptions {
    JobOptions {
        attempts,
        backoff: CooldownOptions {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
        },
    }
}

pub struct HarnessOptions {
    pub source: FakeSource,
    pub attempts: u32,
    pub stage_timeout: Duration,
    pub max_image_checks: u32,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            source: FakeSource::default(),
            attempts: 3,
            stage_timeout: Duration::from_secs(10),
            max_image_checks: 3,
        }
    }
}

pub struct Harness {
    _tmp: TempDir,
    pub deployments: Arc<MemoryDeploymentStore>,
    pub projects: Arc<MemoryProjectStore>,
    pub queue: Arc<MemoryJobQueue>,
    pub bus: Arc<MemoryEventBus>,
    pub registry: Arc<FakeRegistry>,
    pub runtime: Arc<FakeRuntime>,
    pub artifacts: Arc<FsArtifactStore>,
    pub coordinator: Arc<Coordinator>,
    pub clone_worker: Arc<CloneWorker>,
    pub build_worker: Arc<BuildWorker>,
    pub deploy_worker: Arc<BackendDeployWorker>,
    pub compensation_worker: Arc<CompensationWorker>,
    stage_timeout: Duration,
}

impl Harness {
    pub async fn new(options: HarnessOptions) -> Self {
        let tmp = TempDir::new().unwrap();
        let workspaces = Dir::new(tmp.path().join("workspaces"));
        let deployments = Arc::new(MemoryDeploymentStore::new());
        let projects = Arc::new(MemoryProjectStore::new());
        projects.put(project()).await;

        let queue = Arc::new(MemoryJobQueue::new(QueueOptions {
            lease_duration: Duration::from_secs(30),
            idle_poll_interval: Duration::from_millis(10),
            ..QueueOptions::default()
        }));
        let bus = Arc::new(MemoryEventBus::new(BusOptions {
            visibility_timeout: Duration::from_millis(20),
            max_receive_count: 20,
            idle_poll_interval: Duration::from_millis(10),
        }));
        let publisher = Publisher::new(bus.clone(), DEPLOYMENT_EVENTS);

        let source: Arc<dyn SourceControlExt> = Arc::new(options.source);
        let registry = Arc::new(FakeRegistry::default());
        let runtime = Arc::new(FakeRuntime::default());
        let artifacts = Arc::new(FsArtifactStore::new(Dir::new(tmp.path().join("artifacts"))));

        let coordinator = Arc::new(Coordinator::new(
            deployments.clone(),
            projects.clone(),
            queue.clone(),
            registry.clone(),
            CoordinatorOptions {
                stage_jobs: quick_jobs(options.attempts),
                compensation_jobs: quick_jobs(3),
                max_image_checks: options.max_image_checks,
                max_conflict_retries: 3,
            },
        ));

        let clone_worker = Arc::new(CloneWorker::new(source.clone(), workspaces.clone()));
        let build_worker = Arc::new(BuildWorker::new(
            BuildWorkerDeps {
                source: source.clone(),
                artifacts: artifacts.clone(),
                registry: registry.clone(),
                runtime: runtime.clone(),
                publisher: publisher.clone(),
            },
            workspaces,
            REPOSITORY,
        ));
        let deploy_worker = Arc::new(BackendDeployWorker::new(runtime.clone()));
        let compensation_worker = Arc::new(CompensationWorker::new(
            registry.clone(),
            artifacts.clone(),
            runtime.clone(),
        ));

        Self {
            _tmp: tmp,
            deployments,
            projects,
            queue,
            bus,
            registry,
            runtime,
            artifacts,
            coordinator,
            clone_worker,
            build_worker,
            deploy_worker,
            compensation_worker,
            stage_timeout: options.stage_timeout,
        }
    }

    pub async fn request(&self) -> Deployment {
        self.coordinator
            .request_deployment("p1", "u1", Credential::new(TOKEN))
            .await
            .unwrap()
    }

    pub async fn record(&self, deployment_id: &str) -> Deployment {
        self.deployments.get(deployment_id).await.unwrap().unwrap()
    }

    fn deps(&self) -> StageDeps {
        StageDeps {
            queue: self.queue.clone(),
            publisher: Publisher::new(self.bus.clone(), DEPLOYMENT_EVENTS),
            stage_timeout: self.stage_timeout,
        }
    }

    /// Run the next ready job of `worker`, if one shows up shortly.
    pub async fn step(&self, worker: &dyn StageWorker) -> Option<JobDisposition> {
        let lease = tokio::time::timeout(Duration::from_millis(100), self.queue.reserve(worker.topic()))
            .await
            .ok()?
            .unwrap();
        Some(process_job(worker, &self.deps(), &lease).await)
    }

    /// Run `worker` until its topic stays empty
    pub async fn drain_jobs(&self, worker: &dyn StageWorker) -> Vec<JobDisposition> {
        let mut dispositions = Vec::new();
        while let Some(disposition) = self.step(worker).await {
            dispositions.push(disposition);
        }
        dispositions
    }

    /// Feed every deliverable event to the coordinator
    pub async fn drain_events(&self) {
        let bus: Arc<dyn EventBusExt> = self.bus.clone();
        while let Ok(delivery) =
            tokio::time::timeout(Duration::from_millis(100), bus.receive(DEPLOYMENT_EVENTS)).await
        {
            let delivery = delivery.unwrap();
            self.coordinator.process_delivery(bus.as_ref(), &delivery).await;
        }
    }

    pub async fn enqueued(&self, topic: Topic) -> usize {
        self.queue.enqueued_count(topic).await
    }

    pub async fn current_frontend(&self) -> Option<String> {
        self.artifacts
            .current(&verend::deploy::artifacts::frontend_key("p1"))
            .await
            .unwrap()
    }
}

#[allow(dead_code)]
pub async fn dead_jobs(queue: &MemoryJobQueue) -> usize {
    queue.dead_letters().await.unwrap().len()
}
