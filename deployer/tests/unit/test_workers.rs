//! Stage runtime behavior: budgets, retries, secret scrubbing, dead letters

use std::sync::atomic::Ordering;
use std::time::Duration;

use veren_domain::{DeploymentStatus, FailureKind, Leg, LegState};
use verend::queue::jobs::{CompensationAction, CompensationJob, JobPayload};
use verend::queue::{JobOptions, JobQueueExt, Topic};
use verend::workers::stage::JobDisposition;

use crate::common::{dead_jobs, FakeSource, Harness, HarnessOptions, TOKEN};

#[tokio::test]
async fn test_stage_over_budget_fails_with_timeout() {
    let h = Harness::new(HarnessOptions {
        source: FakeSource {
            clone_delay: Some(Duration::from_millis(500)),
            ..FakeSource::default()
        },
        attempts: 1,
        stage_timeout: Duration::from_millis(50),
        ..HarnessOptions::default()
    })
    .await;
    let id = h.request().await.deployment_id;

    assert_eq!(
        h.step(h.clone_worker.as_ref()).await,
        Some(JobDisposition::Failed(FailureKind::Timeout))
    );
    h.drain_events().await;

    let record = h.record(&id).await;
    assert_eq!(record.status, DeploymentStatus::Failed);
    assert_eq!(record.error.unwrap().kind, FailureKind::Timeout);
    assert_eq!(h.enqueued(Topic::Build).await, 0);
}

#[tokio::test]
async fn test_build_retry_skips_reported_leg() {
    let h = Harness::new(HarnessOptions::default()).await;
    let id = h.request().await.deployment_id;
    assert_eq!(h.step(h.clone_worker.as_ref()).await, Some(JobDisposition::Completed));
    h.drain_events().await;

    h.registry.fail_builds(1);
    match h.step(h.build_worker.as_ref()).await {
        Some(JobDisposition::Retrying { attempt, .. }) => assert_eq!(attempt, 2),
        other => panic!("expected a retry, got {:?}", other),
    }
    assert_eq!(h.step(h.build_worker.as_ref()).await, Some(JobDisposition::Completed));

    // Frontend ran once; only the backend leg was rebuilt
    assert_eq!(h.runtime.one_off_count(), 1);
    assert_eq!(h.registry.builds.load(Ordering::SeqCst), 2);
    assert!(h.build_worker.ledger().is_empty());

    h.drain_events().await;
    let record = h.record(&id).await;
    assert_eq!(record.status, DeploymentStatus::Deploying);
    assert_eq!(h.enqueued(Topic::BackendDeploy).await, 1);
}

#[tokio::test]
async fn test_build_timeout_reverts_uploaded_frontend() {
    let h = Harness::new(HarnessOptions {
        attempts: 1,
        stage_timeout: Duration::from_millis(400),
        ..HarnessOptions::default()
    })
    .await;
    let id = h.request().await.deployment_id;
    assert_eq!(h.step(h.clone_worker.as_ref()).await, Some(JobDisposition::Completed));
    h.drain_events().await;

    h.registry.delay_builds(Duration::from_secs(3));
    assert_eq!(
        h.step(h.build_worker.as_ref()).await,
        Some(JobDisposition::Failed(FailureKind::Timeout))
    );
    // The bundle went live before the stage ran out of time
    assert!(h.current_frontend().await.is_some());
    assert!(h.build_worker.ledger().is_empty());

    h.drain_events().await;
    let record = h.record(&id).await;
    assert_eq!(record.status, DeploymentStatus::Failed);
    assert_eq!(record.error.as_ref().unwrap().kind, FailureKind::Timeout);
    assert_eq!(record.legs.get(Leg::Frontend), LegState::Succeeded);
    assert!(record.artifacts.frontend_artifact_ref.is_some());

    assert_eq!(
        h.drain_jobs(h.compensation_worker.as_ref()).await,
        vec![JobDisposition::Completed]
    );
    assert_eq!(h.current_frontend().await, None);
}

#[tokio::test]
async fn test_build_retry_after_timeout_keeps_first_upload() {
    let h = Harness::new(HarnessOptions {
        attempts: 2,
        stage_timeout: Duration::from_millis(400),
        ..HarnessOptions::default()
    })
    .await;
    let id = h.request().await.deployment_id;
    assert_eq!(h.step(h.clone_worker.as_ref()).await, Some(JobDisposition::Completed));
    h.drain_events().await;

    h.registry.delay_builds(Duration::from_secs(3));
    match h.step(h.build_worker.as_ref()).await {
        Some(JobDisposition::Retrying { attempt, .. }) => assert_eq!(attempt, 2),
        other => panic!("expected a retry, got {:?}", other),
    }
    let uploaded = h.current_frontend().await;
    assert!(h.build_worker.ledger().leg_reported(&id, Leg::Frontend));

    *h.registry.build_delay.lock().unwrap() = None;
    assert_eq!(h.step(h.build_worker.as_ref()).await, Some(JobDisposition::Completed));
    assert_eq!(h.runtime.one_off_count(), 1);
    assert_eq!(h.current_frontend().await, uploaded);

    h.drain_events().await;
    let record = h.record(&id).await;
    assert_eq!(record.status, DeploymentStatus::Deploying);
    assert_eq!(record.artifacts.frontend_artifact_ref, uploaded);
    assert!(record.artifacts.previous_frontend_artifact_ref.is_none());
}

#[tokio::test]
async fn test_failure_message_hides_credential() {
    let h = Harness::new(HarnessOptions {
        source: FakeSource {
            clone_error: Some(format!(
                "fatal: could not read from https://x-access-token:{}@github.com/acme/shop: {} rejected",
                TOKEN, TOKEN
            )),
            ..FakeSource::default()
        },
        attempts: 1,
        ..HarnessOptions::default()
    })
    .await;
    let id = h.request().await.deployment_id;

    assert_eq!(
        h.step(h.clone_worker.as_ref()).await,
        Some(JobDisposition::Failed(FailureKind::Upstream))
    );
    h.drain_events().await;

    let record = h.record(&id).await;
    assert_eq!(record.status, DeploymentStatus::Failed);
    let error = record.error.unwrap();
    assert_eq!(error.kind, FailureKind::Upstream);
    assert!(!error.message.contains(TOKEN), "leaked: {}", error.message);
    assert!(!error.message.contains("x-access-token"), "leaked: {}", error.message);
}

#[tokio::test]
async fn test_upstream_clone_failure_is_retried() {
    let h = Harness::new(HarnessOptions {
        source: FakeSource {
            clone_error: Some("remote hung up".to_string()),
            ..FakeSource::default()
        },
        attempts: 2,
        ..HarnessOptions::default()
    })
    .await;
    let id = h.request().await.deployment_id;

    let dispositions = h.drain_jobs(h.clone_worker.as_ref()).await;
    assert_eq!(dispositions.len(), 2);
    assert!(matches!(dispositions[0], JobDisposition::Retrying { attempt: 2, .. }));
    assert_eq!(dispositions[1], JobDisposition::Failed(FailureKind::Upstream));

    h.drain_events().await;
    assert_eq!(h.record(&id).await.status, DeploymentStatus::Failed);
}

#[tokio::test]
async fn test_failed_compensation_is_dead_lettered() {
    let h = Harness::new(HarnessOptions::default()).await;
    h.queue
        .enqueue(
            JobPayload::Compensation(CompensationJob {
                deployment_id: "d9".to_string(),
                project_id: "p1".to_string(),
                action: CompensationAction::RevertArtifact {
                    key: "frontend/p1".to_string(),
                    to: Some("frontend/p1@missing".to_string()),
                },
            }),
            JobOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(
        h.step(h.compensation_worker.as_ref()).await,
        Some(JobDisposition::DeadLettered)
    );
    assert_eq!(dead_jobs(&h.queue).await, 1);
    assert_eq!(h.bus.pending(verend::bus::DEPLOYMENT_EVENTS).await, 0);
}
