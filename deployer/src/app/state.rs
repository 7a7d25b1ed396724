//! Application state management

use std::sync::Arc;

use tracing::{info, warn};

use crate::app::options::AppOptions;
use crate::bus::memory::MemoryEventBus;
use crate::bus::{EventBusExt, Publisher, DEPLOYMENT_EVENTS};
use crate::deploy::artifacts::{ArtifactStoreExt, FsArtifactStore};
use crate::deploy::docker::{ContainerRuntimeExt, DockerRegistry, DockerRuntime, ImageRegistryExt};
use crate::deploy::git::{GitSourceControl, SourceControlExt};
use crate::errors::PlatformError;
use crate::http::github::GithubClient;
use crate::http::registry::RegistryClient;
use crate::queue::memory::MemoryJobQueue;
use crate::queue::JobQueueExt;
use crate::saga::Coordinator;
use crate::store::file::{FileDeploymentStore, FileProjectStore};
use crate::store::{DeploymentStoreExt, ProjectStoreExt};

/// Capability handles shared by the coordinator, workers and server
pub struct AppState {
    pub deployments: Arc<dyn DeploymentStoreExt>,
    pub projects: Arc<dyn ProjectStoreExt>,
    pub queue: Arc<MemoryJobQueue>,
    pub bus: Arc<MemoryEventBus>,
    pub source: Arc<dyn SourceControlExt>,
    pub artifacts: Arc<dyn ArtifactStoreExt>,
    pub registry: Arc<dyn ImageRegistryExt>,
    pub runtime: Arc<dyn ContainerRuntimeExt>,
    pub coordinator: Arc<Coordinator>,
}

impl AppState {
    /// Open every capability against the configured state directory
    pub async fn init(options: &AppOptions) -> Result<Self, PlatformError> {
        info!("Initializing application state...");

        let layout = &options.layout;
        layout.setup().await?;

        let deployments: Arc<dyn DeploymentStoreExt> =
            Arc::new(FileDeploymentStore::new(layout.deployments_dir()));
        let projects: Arc<dyn ProjectStoreExt> = Arc::new(FileProjectStore::new(layout.projects_dir()));

        let queue = Arc::new(MemoryJobQueue::new(options.queue.clone()));
        let bus = Arc::new(MemoryEventBus::new(options.bus.clone()));

        let source: Arc<dyn SourceControlExt> = Arc::new(GitSourceControl::new(GithubClient::new(
            &options.source_control_api,
        )?));
        let artifacts: Arc<dyn ArtifactStoreExt> = Arc::new(FsArtifactStore::new(layout.artifacts_dir()));

        let registry_api = RegistryClient::new(
            &options.registry.api_base_url,
            options.registry.username.clone(),
            options.registry.password.clone(),
        )?;
        let registry: Arc<dyn ImageRegistryExt> = Arc::new(DockerRegistry::new(
            registry_api,
            options.registry.username.clone(),
            options.registry.password.clone(),
        ));
        let runtime: Arc<dyn ContainerRuntimeExt> = Arc::new(DockerRuntime::new(layout.revisions_dir()));

        let coordinator = Arc::new(Coordinator::new(
            deployments.clone(),
            projects.clone(),
            queue.clone(),
            registry.clone(),
            options.coordinator.clone(),
        ));

        Ok(Self {
            deployments,
            projects,
            queue,
            bus,
            source,
            artifacts,
            registry,
            runtime,
            coordinator,
        })
    }

    pub fn job_queue(&self) -> Arc<dyn JobQueueExt> {
        self.queue.clone()
    }

    pub fn event_bus(&self) -> Arc<dyn EventBusExt> {
        self.bus.clone()
    }

    /// Publisher on the deployment events topic
    pub fn publisher(&self) -> Publisher {
        Publisher::new(self.event_bus(), DEPLOYMENT_EVENTS)
    }

    /// Report anything left undelivered
    pub async fn shutdown(&self) -> Result<(), PlatformError> {
        info!("Shutting down application state...");

        let dead_jobs = self.queue.dead_letters().await?;
        for dead in &dead_jobs {
            warn!(
                job_id = %dead.job.id,
                topic = %dead.job.topic(),
                deployment_id = %dead.job.deployment_id(),
                "Dead-lettered job: {}",
                dead.reason
            );
        }

        let dead_events = self.bus.dead_letters(DEPLOYMENT_EVENTS).await;
        if !dead_events.is_empty() {
            warn!("{} dead-lettered events", dead_events.len());
        }
        Ok(())
    }
}
