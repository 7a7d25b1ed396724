//! Saga coordinator
//!
//! The only writer of deployment records. It starts deployments, consumes
//! stage events from the bus, decides transitions with [`machine::apply`] and
//! schedules the next stage or the compensations a failure calls for.
//!
//! Jobs are enqueued before the record is written. Job dedupe keys make that
//! safe to repeat, so a crash between the two steps only causes a redelivery.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tracing::{debug, error, info, warn};
use veren_domain::{Deployment, DeploymentStatus, DomainEvent, EventKind, EventType, FailureKind, Project};

use crate::bus::{self, Delivery, EventBusExt, DEPLOYMENT_EVENTS};
use crate::deploy::docker::ImageRegistryExt;
use crate::errors::PlatformError;
use crate::queue::jobs::{
    BackendDeployJob, BuildJob, CloneJob, CompensationAction, CompensationJob, Credential,
    JobPayload,
};
use crate::queue::{JobOptions, JobQueueExt};
use crate::saga::credentials::CredentialCache;
use crate::saga::machine::{self, Decision, Effect, Facts};
use crate::store::{DeploymentStoreExt, ProjectStoreExt};
use crate::utils::generate_uuid;

#[derive(Debug, Clone)]
pub struct Options {
    /// Delivery policy of clone, build and backend deploy jobs
    pub stage_jobs: JobOptions,
    /// Delivery policy of compensation jobs
    pub compensation_jobs: JobOptions,
    /// Deliveries of an unconfirmed image event before the deployment fails
    pub max_image_checks: u32,
    /// Re-reads after a concurrent update before giving the event back
    pub max_conflict_retries: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            stage_jobs: JobOptions::default(),
            compensation_jobs: JobOptions {
                attempts: 5,
                ..JobOptions::default()
            },
            max_image_checks: 5,
            max_conflict_retries: 3,
        }
    }
}

/// What to do with a delivery once it was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    Ack,
    Redeliver,
}

pub struct Coordinator {
    deployments: Arc<dyn DeploymentStoreExt>,
    projects: Arc<dyn ProjectStoreExt>,
    queue: Arc<dyn JobQueueExt>,
    registry: Arc<dyn ImageRegistryExt>,
    credentials: CredentialCache,
    options: Options,
}

impl Coordinator {
    pub fn new(
        deployments: Arc<dyn DeploymentStoreExt>,
        projects: Arc<dyn ProjectStoreExt>,
        queue: Arc<dyn JobQueueExt>,
        registry: Arc<dyn ImageRegistryExt>,
        options: Options,
    ) -> Self {
        Self {
            deployments,
            projects,
            queue,
            registry,
            credentials: CredentialCache::new(),
            options,
        }
    }

    pub fn deployments(&self) -> &Arc<dyn DeploymentStoreExt> {
        &self.deployments
    }

    /// Start a deployment of `project_id` on behalf of `owner_id`.
    ///
    /// The record is created `queued`, moved to `analyzing`, then the clone job
    /// is enqueued. If the job cannot be enqueued the record is failed.
    pub async fn request_deployment(
        &self,
        project_id: &str,
        owner_id: &str,
        credential: Credential,
    ) -> Result<Deployment, PlatformError> {
        let project = self
            .projects
            .get(project_id)
            .await?
            .ok_or_else(|| PlatformError::NotFound(format!("Project {}", project_id)))?;
        if project.owner_id != owner_id {
            return Err(PlatformError::Forbidden(format!(
                "Project {} is not owned by {}",
                project_id, owner_id
            )));
        }
        if credential.is_empty() {
            return Err(PlatformError::ValidationError(
                "A source control token is required".to_string(),
            ));
        }

        let queued = self
            .deployments
            .create(Deployment::new(generate_uuid(), project_id, owner_id, 0, Utc::now()))
            .await?;
        let deployment_id = queued.deployment_id.clone();

        let mut next = queued.clone();
        next.advance(DeploymentStatus::Analyzing, Utc::now())?;
        let analyzing = self.deployments.compare_and_set(&queued, next).await?;
        self.credentials.remember(&deployment_id, credential.clone());

        let clone_job = JobPayload::Clone(CloneJob {
            deployment_id: deployment_id.clone(),
            project_id: project.project_id.clone(),
            repo_url: project.git.repo_url.clone(),
            branch: project.git.branch.clone(),
            credential: Some(credential),
            frontend_dir_path: project.repo_path.frontend_dir_path.clone(),
            backend_dir_path: project.repo_path.backend_dir_path.clone(),
            hints: project.build.clone(),
        });
        if let Err(e) = self.queue.enqueue(clone_job, self.options.stage_jobs.clone()).await {
            error!(deployment_id = %deployment_id, "Failed to enqueue clone job: {}", e);
            self.credentials.forget(&deployment_id);
            let mut failed = analyzing.clone();
            failed.fail(FailureKind::Internal, "Could not schedule repository analysis", Utc::now())?;
            self.deployments.compare_and_set(&analyzing, failed).await?;
            return Err(e);
        }

        info!(
            deployment_id = %deployment_id,
            project_id = %project_id,
            sequence = analyzing.sequence_number,
            "Deployment requested"
        );
        Ok(analyzing)
    }

    /// Apply one event. `receive_count` is the number of times the bus has
    /// handed out this event.
    pub async fn handle_event(&self, event: &DomainEvent, receive_count: u32) -> Result<Handled, PlatformError> {
        for _ in 0..=self.options.max_conflict_retries {
            let Some(current) = self.deployments.get(&event.deployment_id).await? else {
                warn!(
                    deployment_id = %event.deployment_id,
                    event_type = %event.kind.type_name(),
                    "Event for unknown deployment dropped"
                );
                return Ok(Handled::Ack);
            };

            let now = Utc::now();
            let decision = if event.project_id != current.project_id && !current.is_terminal() {
                machine::fail_closed(
                    &current,
                    format!("Event {} names a different project", event.kind.type_name()),
                    now,
                )
            } else {
                let facts = self.facts(&current, event, receive_count).await?;
                machine::apply(&current, event, &facts, now)
            };

            let (next, effects) = match decision {
                Decision::Duplicate => {
                    debug!(
                        deployment_id = %current.deployment_id,
                        event_type = %event.kind.type_name(),
                        "Event already applied"
                    );
                    return Ok(Handled::Ack);
                }
                Decision::AwaitImage => {
                    warn!(
                        deployment_id = %current.deployment_id,
                        attempt = receive_count,
                        "Backend image not visible in the registry yet"
                    );
                    return Ok(Handled::Redeliver);
                }
                Decision::Apply { next, effects } => (next, effects),
            };

            let (next, effects, project) = self.with_project(&current, next, effects).await?;
            let target = next.as_ref().unwrap_or(&current);
            for effect in &effects {
                let payload = self.job_for(target, effect, project.as_ref())?;
                let options = if effect.is_compensation() {
                    self.options.compensation_jobs.clone()
                } else {
                    self.options.stage_jobs.clone()
                };
                self.queue.enqueue(payload, options).await?;
            }

            let Some(next) = next else {
                info!(
                    deployment_id = %current.deployment_id,
                    event_type = %event.kind.type_name(),
                    "Late event compensated"
                );
                return Ok(Handled::Ack);
            };

            match self.deployments.compare_and_set(&current, next).await {
                Ok(stored) => {
                    if stored.is_terminal() {
                        self.credentials.forget(&stored.deployment_id);
                        match &stored.error {
                            Some(err) => warn!(
                                deployment_id = %stored.deployment_id,
                                kind = %err.kind,
                                "Deployment failed: {}",
                                err.message
                            ),
                            None => info!(deployment_id = %stored.deployment_id, "Deployment deployed"),
                        }
                    } else if stored.status != current.status {
                        info!(
                            deployment_id = %stored.deployment_id,
                            "Deployment {} -> {}",
                            current.status,
                            stored.status
                        );
                    }
                    return Ok(Handled::Ack);
                }
                Err(PlatformError::Conflict(id)) => {
                    debug!(deployment_id = %id, "Concurrent update, re-reading");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(PlatformError::Conflict(event.deployment_id.clone()))
    }

    /// Decode and apply one delivery, acknowledging it when handled.
    pub async fn process_delivery(&self, bus: &dyn EventBusExt, delivery: &Delivery) {
        let event = match DomainEvent::from_json(&delivery.body) {
            Ok(event) => event,
            Err(e) => {
                error!(message_id = delivery.message_id, "Dropping undecodable event: {}", e);
                if let Err(e) = bus.ack(delivery).await {
                    error!("Failed to acknowledge event: {}", e);
                }
                return;
            }
        };

        match self.handle_event(&event, delivery.receive_count).await {
            Ok(Handled::Ack) => {
                if let Err(e) = bus.ack(delivery).await {
                    error!(deployment_id = %event.deployment_id, "Failed to acknowledge event: {}", e);
                }
            }
            Ok(Handled::Redeliver) => {}
            Err(e) => {
                error!(
                    deployment_id = %event.deployment_id,
                    event_type = %event.kind.type_name(),
                    "Failed to handle event: {}",
                    e
                );
            }
        }
    }

    async fn facts(&self, current: &Deployment, event: &DomainEvent, receive_count: u32) -> Result<Facts, PlatformError> {
        let EventKind::BackendBuildSuccess { image_tag } = &event.kind else {
            return Ok(Facts::default());
        };
        if current.status != DeploymentStatus::Building || current.has_applied(EventType::BackendBuildSuccess) {
            return Ok(Facts::default());
        }

        let visible = match self.registry.exists(image_tag).await {
            Ok(visible) => visible,
            Err(e) => {
                warn!(deployment_id = %current.deployment_id, "Registry lookup failed: {}", e);
                false
            }
        };
        let previous_backend_image = self
            .deployments
            .latest_deployed(&current.project_id)
            .await?
            .and_then(|d| d.artifacts.backend_image_ref);

        Ok(Facts {
            image_visible: Some(visible),
            image_checks_exhausted: receive_count >= self.options.max_image_checks,
            previous_backend_image,
        })
    }

    /// Load the project when a job has to be built from it. A project that
    /// disappeared fails the deployment; effects that need it are dropped.
    async fn with_project(
        &self,
        current: &Deployment,
        next: Option<Deployment>,
        effects: Vec<Effect>,
    ) -> Result<(Option<Deployment>, Vec<Effect>, Option<Project>), PlatformError> {
        if !effects.iter().any(Effect::needs_project) {
            return Ok((next, effects, None));
        }
        if let Some(project) = self.projects.get(&current.project_id).await? {
            return Ok((next, effects, Some(project)));
        }

        let message = format!("Project {} no longer exists", current.project_id);
        let (next, effects) = if effects.iter().all(Effect::is_compensation) {
            warn!(deployment_id = %current.deployment_id, "{}; skipping backend restore", message);
            (next, effects)
        } else {
            match machine::fail_closed(current, message, Utc::now()) {
                Decision::Apply { next, effects } => (next, effects),
                _ => (None, Vec::new()),
            }
        };
        let effects = effects.into_iter().filter(|e| !e.needs_project()).collect();
        Ok((next, effects, None))
    }

    fn job_for(&self, target: &Deployment, effect: &Effect, project: Option<&Project>) -> Result<JobPayload, PlatformError> {
        let missing = |what: &str| {
            PlatformError::Internal(format!("Deployment {} has no {}", target.deployment_id, what))
        };

        let payload = match effect {
            Effect::EnqueueBuild => {
                let project = project.ok_or_else(|| missing("project"))?;
                JobPayload::Build(BuildJob {
                    deployment_id: target.deployment_id.clone(),
                    project_id: target.project_id.clone(),
                    repo_url: project.git.repo_url.clone(),
                    branch: project.git.branch.clone(),
                    credential: self.credentials.get(&target.deployment_id),
                    commit: target.commit.clone().ok_or_else(|| missing("commit"))?,
                    config: target.config.clone().ok_or_else(|| missing("build configuration"))?,
                    frontend_env: project.envs.frontend_env.clone(),
                    backend_env: project.envs.backend_env.clone(),
                })
            }
            Effect::EnqueueBackendDeploy { image_tag } => {
                let project = project.ok_or_else(|| missing("project"))?;
                JobPayload::BackendDeploy(BackendDeployJob {
                    deployment_id: target.deployment_id.clone(),
                    project_id: target.project_id.clone(),
                    image_tag: image_tag.clone(),
                    env: project.envs.backend_env.clone(),
                    port: project.runtime.backend_port,
                })
            }
            Effect::DeleteImage { image_tag } => JobPayload::Compensation(CompensationJob {
                deployment_id: target.deployment_id.clone(),
                project_id: target.project_id.clone(),
                action: CompensationAction::DeleteImage {
                    image_tag: image_tag.clone(),
                },
            }),
            Effect::RevertArtifact { key, to } => JobPayload::Compensation(CompensationJob {
                deployment_id: target.deployment_id.clone(),
                project_id: target.project_id.clone(),
                action: CompensationAction::RevertArtifact {
                    key: key.clone(),
                    to: to.clone(),
                },
            }),
            Effect::RestoreBackend { image_tag } => {
                let project = project.ok_or_else(|| missing("project"))?;
                JobPayload::Compensation(CompensationJob {
                    deployment_id: target.deployment_id.clone(),
                    project_id: target.project_id.clone(),
                    action: CompensationAction::RestoreBackend {
                        image_tag: image_tag.clone(),
                        env: project.envs.backend_env.clone(),
                        port: project.runtime.backend_port,
                    },
                })
            }
        };
        Ok(payload)
    }
}

/// Consume deployment events until shutdown.
pub async fn run<S, F>(
    coordinator: Arc<Coordinator>,
    event_bus: Arc<dyn EventBusExt>,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Coordinator starting...");
    let mut deliveries = Box::pin(bus::subscribe(event_bus.clone(), DEPLOYMENT_EVENTS));

    loop {
        let delivery = tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Coordinator shutting down...");
                return;
            }
            delivery = deliveries.next() => delivery,
        };

        match delivery {
            Some(Ok(delivery)) => coordinator.process_delivery(event_bus.as_ref(), &delivery).await,
            Some(Err(e)) => {
                error!("Failed to receive event: {}", e);
                sleep_fn(Duration::from_secs(1)).await;
            }
            None => {
                warn!("Event subscription ended");
                return;
            }
        }
    }
}
