//! Undo actions for build outputs of failed deployments, and the rollback of
//! a backend whose rollout failed
//!
//! Compensation never reports on the bus. A job that runs out of attempts is
//! dead-lettered and logged at error level for an operator.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;
use veren_domain::{DomainEvent, StageFailure};

use crate::deploy::artifacts::ArtifactStoreExt;
use crate::deploy::docker::{ContainerRuntimeExt, ImageRegistryExt};
use crate::queue::jobs::{CompensationAction, JobPayload};
use crate::queue::{Job, Topic};
use crate::workers::backend_deploy::service_name;
use crate::workers::stage::{StageError, StageOutput, StageWorker};

pub struct CompensationWorker {
    registry: Arc<dyn ImageRegistryExt>,
    artifacts: Arc<dyn ArtifactStoreExt>,
    runtime: Arc<dyn ContainerRuntimeExt>,
}

impl CompensationWorker {
    pub fn new(
        registry: Arc<dyn ImageRegistryExt>,
        artifacts: Arc<dyn ArtifactStoreExt>,
        runtime: Arc<dyn ContainerRuntimeExt>,
    ) -> Self {
        Self {
            registry,
            artifacts,
            runtime,
        }
    }

    async fn compensate(
        &self,
        deployment_id: &str,
        project_id: &str,
        action: &CompensationAction,
    ) -> Result<StageOutput, StageError> {
        match action {
            CompensationAction::DeleteImage { image_tag } => {
                self.registry.delete(image_tag).await?;
                info!(deployment_id = %deployment_id, image_tag = %image_tag, "Compensated: image deleted");
            }
            CompensationAction::RevertArtifact { key, to } => {
                self.artifacts.revert(key, to.as_deref()).await?;
                info!(deployment_id = %deployment_id, key = %key, to = ?to, "Compensated: artifact reverted");
            }
            CompensationAction::RestoreBackend { image_tag, env, port } => {
                let service = service_name(project_id);
                let revision = self.runtime.register_revision(&service, image_tag, env, *port).await?;
                self.runtime.rollout(&service, &revision).await?;
                info!(
                    deployment_id = %deployment_id,
                    service = %service,
                    image_tag = %image_tag,
                    "Compensated: previous backend restored"
                );
            }
        }
        Ok(StageOutput::default())
    }
}

#[async_trait]
impl StageWorker for CompensationWorker {
    fn name(&self) -> &'static str {
        "compensation"
    }

    fn topic(&self) -> Topic {
        Topic::Compensation
    }

    async fn execute(&self, job: &Job) -> Result<StageOutput, StageError> {
        match &job.payload {
            JobPayload::Compensation(input) => {
                self.compensate(&input.deployment_id, &input.project_id, &input.action)
                    .await
            }
            _ => Err(StageFailure::internal("Compensation worker received a foreign job").into()),
        }
    }

    fn failure_events(&self, _job: &Job, _failure: StageFailure) -> Vec<DomainEvent> {
        Vec::new()
    }

    fn dead_letter_on_failure(&self) -> bool {
        true
    }
}
