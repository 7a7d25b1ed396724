//! Backend rollout stage

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;
use veren_domain::{DomainEvent, EventKind, StageFailure};

use crate::deploy::docker::ContainerRuntimeExt;
use crate::queue::jobs::{BackendDeployJob, JobPayload};
use crate::queue::{Job, Topic};
use crate::workers::stage::{StageError, StageOutput, StageWorker};

/// Name of a project's backend service
pub fn service_name(project_id: &str) -> String {
    format!("backend-{}", project_id)
}

pub struct BackendDeployWorker {
    runtime: Arc<dyn ContainerRuntimeExt>,
}

impl BackendDeployWorker {
    pub fn new(runtime: Arc<dyn ContainerRuntimeExt>) -> Self {
        Self { runtime }
    }

    async fn deploy(&self, input: &BackendDeployJob) -> Result<StageOutput, StageError> {
        if input.image_tag.trim().is_empty() {
            return Err(StageFailure::validation("Missing backend image").into());
        }

        let service = service_name(&input.project_id);
        let revision_ref = self
            .runtime
            .register_revision(&service, &input.image_tag, &input.env, input.port)
            .await?;
        self.runtime.rollout(&service, &revision_ref).await?;

        info!(deployment_id = %input.deployment_id, revision = %revision_ref, "Backend deployed");
        Ok(StageOutput::events(vec![DomainEvent::new(
            &input.deployment_id,
            &input.project_id,
            EventKind::BackendDeploySuccess { revision_ref },
        )]))
    }
}

#[async_trait]
impl StageWorker for BackendDeployWorker {
    fn name(&self) -> &'static str {
        "backend-deploy"
    }

    fn topic(&self) -> Topic {
        Topic::BackendDeploy
    }

    async fn execute(&self, job: &Job) -> Result<StageOutput, StageError> {
        match &job.payload {
            JobPayload::BackendDeploy(input) => self.deploy(input).await,
            _ => Err(StageFailure::internal("Backend deploy worker received a foreign job").into()),
        }
    }

    fn failure_events(&self, job: &Job, failure: StageFailure) -> Vec<DomainEvent> {
        vec![DomainEvent::new(
            job.deployment_id(),
            job.payload.project_id(),
            EventKind::BackendDeployFailed(failure),
        )]
    }
}
