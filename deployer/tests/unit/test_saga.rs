//! End-to-end saga scenarios over in-memory queue, bus and store

use std::sync::Arc;

use veren_domain::{DeploymentStatus, DomainEvent, EventKind, FailureKind, Framework, StageFailure};
use verend::bus::{EventBusExt, DEPLOYMENT_EVENTS};
use verend::deploy::artifacts::ArtifactStoreExt;
use verend::deploy::docker::ImageRegistryExt;
use verend::queue::jobs::{CompensationAction, JobPayload};
use verend::queue::Topic;
use verend::saga::Handled;
use verend::workers::build::image_tag;
use verend::workers::stage::JobDisposition;

use crate::common::{FakeSource, Harness, HarnessOptions, REPOSITORY};

/// Request a deployment and run it through analysis
async fn building(h: &Harness) -> String {
    let deployment = h.request().await;
    assert_eq!(h.step(h.clone_worker.as_ref()).await, Some(JobDisposition::Completed));
    h.drain_events().await;
    let record = h.record(&deployment.deployment_id).await;
    assert_eq!(record.status, DeploymentStatus::Building);
    deployment.deployment_id
}

async fn compensation_actions(h: &Harness) -> Vec<CompensationAction> {
    h.queue
        .snapshot(Topic::Compensation)
        .await
        .into_iter()
        .filter_map(|job| match job.payload {
            JobPayload::Compensation(c) => Some(c.action),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_successful_deployment() {
    let h = Harness::new(HarnessOptions::default()).await;
    let deployment = h.request().await;
    let id = deployment.deployment_id.clone();
    assert_eq!(deployment.status, DeploymentStatus::Analyzing);
    assert_eq!(deployment.sequence_number, 1);

    // Analyze
    assert_eq!(h.step(h.clone_worker.as_ref()).await, Some(JobDisposition::Completed));
    h.drain_events().await;
    let record = h.record(&id).await;
    assert_eq!(record.status, DeploymentStatus::Building);
    assert_eq!(record.commit.as_ref().unwrap().hash, "4f2c1e0");
    let config = record.config.unwrap();
    assert_eq!(config.frontend.framework, Framework::Vite);
    assert_eq!(config.frontend.build_command, "vite build");
    assert_eq!(config.frontend.out_dir, "build");

    // Build
    assert_eq!(h.step(h.build_worker.as_ref()).await, Some(JobDisposition::Completed));
    h.drain_events().await;
    let record = h.record(&id).await;
    assert_eq!(record.status, DeploymentStatus::Deploying);
    assert_eq!(record.build_tasks.frontend_task_ref, Some(format!("build-fe-{}", id)));
    assert_eq!(record.build_tasks.backend_task_ref, Some(format!("build-be-{}", id)));
    assert_eq!(h.enqueued(Topic::BackendDeploy).await, 1);

    let one_offs = h.runtime.one_offs.lock().unwrap().clone();
    assert_eq!(one_offs.len(), 1);
    assert_eq!(one_offs[0].image, "node:18-alpine");
    assert_eq!(one_offs[0].env.len(), 1);
    assert_eq!(one_offs[0].env[0].key, "VITE_API");

    // Deploy
    assert_eq!(h.step(h.deploy_worker.as_ref()).await, Some(JobDisposition::Completed));
    h.drain_events().await;
    let record = h.record(&id).await;
    assert_eq!(record.status, DeploymentStatus::Deployed);
    assert!(record.finished_at.is_some());
    assert!(record.error.is_none());
    assert_eq!(record.artifacts.backend_image_ref, Some(image_tag(REPOSITORY, "p1", &id)));
    assert_eq!(record.backend_revision_ref.as_deref(), Some("backend-p1:1"));
    assert_eq!(h.current_frontend().await, record.artifacts.frontend_artifact_ref);
    assert_eq!(
        h.runtime.rollouts(),
        vec![("backend-p1".to_string(), "backend-p1:1".to_string())]
    );
    assert_eq!(h.enqueued(Topic::Compensation).await, 0);
}

#[tokio::test]
async fn test_missing_directory_fails_without_build() {
    let h = Harness::new(HarnessOptions {
        source: FakeSource {
            dirs: vec!["frontend"],
            on_remote: false,
            ..FakeSource::default()
        },
        ..HarnessOptions::default()
    })
    .await;
    let deployment = h.request().await;

    assert_eq!(
        h.step(h.clone_worker.as_ref()).await,
        Some(JobDisposition::Failed(FailureKind::Internal))
    );
    h.drain_events().await;

    let record = h.record(&deployment.deployment_id).await;
    assert_eq!(record.status, DeploymentStatus::Failed);
    let error = record.error.unwrap();
    assert_eq!(error.kind, FailureKind::Internal);
    assert!(error.message.contains("./backend"));
    assert_eq!(h.enqueued(Topic::Build).await, 0);
}

#[tokio::test]
async fn test_backend_failure_reverts_frontend() {
    let h = Harness::new(HarnessOptions {
        attempts: 1,
        ..HarnessOptions::default()
    })
    .await;
    let id = building(&h).await;
    h.registry.fail_builds(1);

    assert_eq!(h.step(h.build_worker.as_ref()).await, Some(JobDisposition::Completed));
    h.drain_events().await;

    let record = h.record(&id).await;
    assert_eq!(record.status, DeploymentStatus::Failed);
    assert_eq!(record.error.as_ref().unwrap().kind, FailureKind::Upstream);
    assert!(record.artifacts.frontend_artifact_ref.is_some());
    assert!(record.artifacts.previous_frontend_artifact_ref.is_none());
    assert_eq!(h.enqueued(Topic::BackendDeploy).await, 0);
    assert_eq!(
        compensation_actions(&h).await,
        vec![CompensationAction::RevertArtifact {
            key: "frontend/p1".to_string(),
            to: None
        }]
    );

    assert!(h.current_frontend().await.is_some());
    assert_eq!(
        h.drain_jobs(h.compensation_worker.as_ref()).await,
        vec![JobDisposition::Completed]
    );
    assert!(h.current_frontend().await.is_none());
}

#[tokio::test]
async fn test_backend_failure_restores_previous_release() {
    let h = Harness::new(HarnessOptions {
        attempts: 1,
        ..HarnessOptions::default()
    })
    .await;

    // First release goes out
    let first = building(&h).await;
    h.drain_jobs(h.build_worker.as_ref()).await;
    h.drain_events().await;
    h.drain_jobs(h.deploy_worker.as_ref()).await;
    h.drain_events().await;
    let released = h.record(&first).await;
    assert_eq!(released.status, DeploymentStatus::Deployed);

    // Second one fails on the backend
    let second = building(&h).await;
    assert_eq!(h.record(&second).await.sequence_number, 2);
    h.registry.fail_builds(1);
    h.drain_jobs(h.build_worker.as_ref()).await;
    h.drain_events().await;

    let record = h.record(&second).await;
    assert_eq!(record.status, DeploymentStatus::Failed);
    assert_eq!(
        record.artifacts.previous_frontend_artifact_ref,
        released.artifacts.frontend_artifact_ref
    );

    h.drain_jobs(h.compensation_worker.as_ref()).await;
    assert_eq!(h.current_frontend().await, released.artifacts.frontend_artifact_ref);
}

#[tokio::test]
async fn test_deploy_failure_rolls_previous_backend_back_out() {
    let h = Harness::new(HarnessOptions {
        attempts: 1,
        ..HarnessOptions::default()
    })
    .await;

    let first = building(&h).await;
    h.drain_jobs(h.build_worker.as_ref()).await;
    h.drain_events().await;
    h.drain_jobs(h.deploy_worker.as_ref()).await;
    h.drain_events().await;
    assert_eq!(h.record(&first).await.status, DeploymentStatus::Deployed);
    let live_image = image_tag(REPOSITORY, "p1", &first);

    let second = building(&h).await;
    h.drain_jobs(h.build_worker.as_ref()).await;
    h.drain_events().await;
    assert_eq!(h.record(&second).await.status, DeploymentStatus::Deploying);

    h.runtime.set_rollout_failing(true);
    assert_eq!(
        h.drain_jobs(h.deploy_worker.as_ref()).await,
        vec![JobDisposition::Failed(FailureKind::Upstream)]
    );
    h.drain_events().await;

    let record = h.record(&second).await;
    assert_eq!(record.status, DeploymentStatus::Failed);
    assert_eq!(record.artifacts.previous_backend_image_ref.as_deref(), Some(live_image.as_str()));
    assert!(compensation_actions(&h)
        .await
        .contains(&CompensationAction::RestoreBackend {
            image_tag: live_image.clone(),
            env: backend_env(),
            port: Some(3000),
        }));

    h.runtime.set_rollout_failing(false);
    let dispositions = h.drain_jobs(h.compensation_worker.as_ref()).await;
    assert!(dispositions.iter().all(|d| *d == JobDisposition::Completed));

    let restored = h.runtime.revisions();
    assert_eq!(restored.last(), Some(&("backend-p1".to_string(), live_image)));
    assert_eq!(h.runtime.rollouts().len(), 2);
    assert_eq!(
        h.runtime.rollouts().last(),
        Some(&("backend-p1".to_string(), "backend-p1:1".to_string()))
    );
}

fn backend_env() -> Vec<veren_domain::EnvVar> {
    crate::common::project().envs.backend_env
}

#[tokio::test]
async fn test_repeated_analysis_event_enqueues_one_build() {
    let h = Harness::new(HarnessOptions::default()).await;
    let deployment = h.request().await;
    h.step(h.clone_worker.as_ref()).await;

    let bus: Arc<dyn EventBusExt> = h.bus.clone();
    let delivery = bus.receive(DEPLOYMENT_EVENTS).await.unwrap();
    let event = DomainEvent::from_json(&delivery.body).unwrap();
    assert!(matches!(event.kind, EventKind::RepoAnalysisSuccess { .. }));

    assert_eq!(h.coordinator.handle_event(&event, 1).await.unwrap(), Handled::Ack);
    let after_first = h.record(&deployment.deployment_id).await;
    assert_eq!(h.coordinator.handle_event(&event, 2).await.unwrap(), Handled::Ack);
    let after_second = h.record(&deployment.deployment_id).await;

    assert_eq!(h.enqueued(Topic::Build).await, 1);
    assert_eq!(after_first, after_second);
}

#[tokio::test]
async fn test_backend_success_then_frontend_failure_deletes_image() {
    let h = Harness::new(HarnessOptions::default()).await;
    let id = building(&h).await;
    let tag = image_tag(REPOSITORY, "p1", &id);
    h.registry.push(&tag).await.unwrap();

    let backend = DomainEvent::new(&id, "p1", EventKind::BackendBuildSuccess { image_tag: tag.clone() });
    assert_eq!(h.coordinator.handle_event(&backend, 1).await.unwrap(), Handled::Ack);
    let frontend = DomainEvent::new(
        &id,
        "p1",
        EventKind::FrontendBuildFailed(StageFailure::validation("npm ERR! missing script: build")),
    );
    assert_eq!(h.coordinator.handle_event(&frontend, 1).await.unwrap(), Handled::Ack);

    let record = h.record(&id).await;
    assert_eq!(record.status, DeploymentStatus::Failed);
    assert_eq!(record.error.unwrap().kind, FailureKind::Validation);
    assert_eq!(
        compensation_actions(&h).await,
        vec![CompensationAction::DeleteImage { image_tag: tag.clone() }]
    );

    h.drain_jobs(h.compensation_worker.as_ref()).await;
    assert_eq!(h.registry.deleted(), vec![tag]);
}

#[tokio::test]
async fn test_frontend_failure_then_late_backend_success_deletes_image() {
    let h = Harness::new(HarnessOptions::default()).await;
    let id = building(&h).await;
    let tag = image_tag(REPOSITORY, "p1", &id);
    h.registry.push(&tag).await.unwrap();

    let frontend = DomainEvent::new(
        &id,
        "p1",
        EventKind::FrontendBuildFailed(StageFailure::validation("npm ERR! missing script: build")),
    );
    h.coordinator.handle_event(&frontend, 1).await.unwrap();
    assert_eq!(h.record(&id).await.status, DeploymentStatus::Failed);
    assert_eq!(h.enqueued(Topic::Compensation).await, 0);

    let backend = DomainEvent::new(&id, "p1", EventKind::BackendBuildSuccess { image_tag: tag.clone() });
    assert_eq!(h.coordinator.handle_event(&backend, 1).await.unwrap(), Handled::Ack);

    let record = h.record(&id).await;
    assert_eq!(record.status, DeploymentStatus::Failed);
    assert!(record.artifacts.backend_image_ref.is_none());
    assert_eq!(
        compensation_actions(&h).await,
        vec![CompensationAction::DeleteImage { image_tag: tag }]
    );
}

#[tokio::test]
async fn test_deploy_waits_for_registry_confirmation() {
    let h = Harness::new(HarnessOptions::default()).await;
    let id = building(&h).await;
    let tag = image_tag(REPOSITORY, "p1", &id);
    h.registry.push(&tag).await.unwrap();
    h.registry.set_hidden(true);

    let frontend = DomainEvent::new(
        &id,
        "p1",
        EventKind::FrontendBuildSuccess {
            artifact_ref: "frontend/p1@v1".to_string(),
            previous_artifact_ref: None,
        },
    );
    h.coordinator.handle_event(&frontend, 1).await.unwrap();

    let backend = DomainEvent::new(&id, "p1", EventKind::BackendBuildSuccess { image_tag: tag.clone() });
    assert_eq!(h.coordinator.handle_event(&backend, 1).await.unwrap(), Handled::Redeliver);
    assert_eq!(h.enqueued(Topic::BackendDeploy).await, 0);
    assert_eq!(h.record(&id).await.status, DeploymentStatus::Building);

    h.registry.set_hidden(false);
    assert_eq!(h.coordinator.handle_event(&backend, 2).await.unwrap(), Handled::Ack);
    assert_eq!(h.coordinator.handle_event(&backend, 3).await.unwrap(), Handled::Ack);

    let record = h.record(&id).await;
    assert_eq!(record.status, DeploymentStatus::Deploying);
    assert_eq!(record.artifacts.backend_image_ref, Some(tag));
    assert_eq!(h.enqueued(Topic::BackendDeploy).await, 1);
}

#[tokio::test]
async fn test_invisible_image_fails_after_checks() {
    let h = Harness::new(HarnessOptions {
        max_image_checks: 2,
        ..HarnessOptions::default()
    })
    .await;
    let id = building(&h).await;
    let tag = image_tag(REPOSITORY, "p1", &id);
    h.registry.set_hidden(true);

    let frontend = DomainEvent::new(
        &id,
        "p1",
        EventKind::FrontendBuildSuccess {
            artifact_ref: "frontend/p1@v1".to_string(),
            previous_artifact_ref: None,
        },
    );
    h.coordinator.handle_event(&frontend, 1).await.unwrap();

    let backend = DomainEvent::new(&id, "p1", EventKind::BackendBuildSuccess { image_tag: tag.clone() });
    assert_eq!(h.coordinator.handle_event(&backend, 1).await.unwrap(), Handled::Redeliver);
    assert_eq!(h.coordinator.handle_event(&backend, 2).await.unwrap(), Handled::Ack);

    let record = h.record(&id).await;
    assert_eq!(record.status, DeploymentStatus::Failed);
    assert_eq!(record.error.unwrap().kind, FailureKind::Upstream);
    assert_eq!(h.enqueued(Topic::BackendDeploy).await, 0);

    let actions = compensation_actions(&h).await;
    assert_eq!(actions.len(), 2);
    assert!(actions.contains(&CompensationAction::DeleteImage { image_tag: tag }));
    assert!(actions.contains(&CompensationAction::RevertArtifact {
        key: "frontend/p1".to_string(),
        to: None
    }));
}

#[tokio::test]
async fn test_unknown_event_fails_closed() {
    let h = Harness::new(HarnessOptions::default()).await;
    let id = building(&h).await;

    let body = serde_json::json!({
        "type": "BUILD_EXPLODED",
        "deploymentId": id,
        "projectId": "p1",
        "payload": {}
    })
    .to_string();
    h.bus.publish(DEPLOYMENT_EVENTS, &id, body).await.unwrap();
    h.drain_events().await;

    let record = h.record(&id).await;
    assert_eq!(record.status, DeploymentStatus::Failed);
    let error = record.error.unwrap();
    assert_eq!(error.kind, FailureKind::Internal);
    assert!(error.message.contains("BUILD_EXPLODED"));
    assert_eq!(h.bus.pending(DEPLOYMENT_EVENTS).await, 0);
}

#[tokio::test]
async fn test_request_checks_ownership() {
    let h = Harness::new(HarnessOptions::default()).await;

    let err = h
        .coordinator
        .request_deployment("p1", "intruder", verend::queue::jobs::Credential::new("t"))
        .await
        .unwrap_err();
    assert!(matches!(err, verend::errors::PlatformError::Forbidden(_)));

    let err = h
        .coordinator
        .request_deployment("nope", "u1", verend::queue::jobs::Credential::new("t"))
        .await
        .unwrap_err();
    assert!(matches!(err, verend::errors::PlatformError::NotFound(_)));

    assert_eq!(h.enqueued(Topic::Clone).await, 0);
    assert!(h.artifacts.current("frontend/p1").await.unwrap().is_none());
}
