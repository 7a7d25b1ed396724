//! State machine walks without queues or stores

use chrono::Utc;
use veren_domain::{
    BackendConfig, Commit, Deployment, DeploymentStatus, DomainEvent, EventKind, FailureKind, Framework,
    FrontendConfig, PackageManager, RepoConfig, StageFailure,
};
use verend::saga::machine::{apply, Decision, Effect, Facts};

const IMAGE: &str = "registry.test/veren/backend:p1-d1";

fn config() -> RepoConfig {
    RepoConfig {
        frontend: FrontendConfig {
            dir: "frontend".into(),
            runtime_version: "18".into(),
            framework: Framework::Vite,
            package_manager: PackageManager::Npm,
            install_command: "npm install".into(),
            build_command: "vite build".into(),
            out_dir: "build".into(),
        },
        backend: BackendConfig {
            dir: "backend".into(),
            runtime_version: "18".into(),
            install_command: "npm install".into(),
        },
    }
}

fn event(kind: EventKind) -> DomainEvent {
    DomainEvent::new("d1", "p1", kind)
}

fn visible() -> Facts {
    Facts {
        image_visible: Some(true),
        previous_backend_image: Some("registry.test/veren/backend:p1-d0".into()),
        ..Facts::default()
    }
}

/// Apply `kind`, expecting a state change
fn step(current: &Deployment, kind: EventKind, facts: &Facts) -> (Deployment, Vec<Effect>) {
    match apply(current, &event(kind), facts, Utc::now()) {
        Decision::Apply { next: Some(next), effects } => (next, effects),
        other => panic!("expected a state change, got {:?}", other),
    }
}

fn analyzing() -> Deployment {
    let mut d = Deployment::new("d1", "p1", "u1", 1, Utc::now());
    d.advance(DeploymentStatus::Analyzing, Utc::now()).unwrap();
    d
}

fn analyzed() -> EventKind {
    EventKind::RepoAnalysisSuccess {
        config: config(),
        commit: Commit {
            hash: "4f2c1e0".into(),
            message: "Initial commit".into(),
        },
    }
}

fn frontend_built() -> EventKind {
    EventKind::FrontendBuildSuccess {
        artifact_ref: "frontend/p1@v2".into(),
        previous_artifact_ref: Some("frontend/p1@v1".into()),
    }
}

fn backend_built() -> EventKind {
    EventKind::BackendBuildSuccess { image_tag: IMAGE.into() }
}

/// Both legs reported, waiting on the backend rollout
fn deploying() -> Deployment {
    let (d, _) = step(&analyzing(), analyzed(), &Facts::default());
    let (d, _) = step(&d, frontend_built(), &Facts::default());
    let (d, _) = step(&d, backend_built(), &visible());
    assert_eq!(d.status, DeploymentStatus::Deploying);
    d
}

#[test]
fn test_happy_path_walk() {
    let (d, effects) = step(&analyzing(), analyzed(), &Facts::default());
    assert_eq!(d.status, DeploymentStatus::Building);
    assert_eq!(d.commit.as_ref().unwrap().hash, "4f2c1e0");
    assert_eq!(effects, vec![Effect::EnqueueBuild]);

    let (d, effects) = step(
        &d,
        EventKind::BuildQueued {
            frontend_task_ref: Some("build-fe-d1".into()),
            backend_task_ref: Some("build-be-d1".into()),
        },
        &Facts::default(),
    );
    assert_eq!(d.status, DeploymentStatus::Building);
    assert_eq!(d.build_tasks.frontend_task_ref.as_deref(), Some("build-fe-d1"));
    assert_eq!(d.build_tasks.backend_task_ref.as_deref(), Some("build-be-d1"));
    assert!(effects.is_empty());

    // Backend first: no deploy until the frontend reports
    let (d, effects) = step(&d, backend_built(), &visible());
    assert_eq!(d.status, DeploymentStatus::Building);
    assert_eq!(d.artifacts.backend_image_ref.as_deref(), Some(IMAGE));
    assert_eq!(
        d.artifacts.previous_backend_image_ref.as_deref(),
        Some("registry.test/veren/backend:p1-d0")
    );
    assert!(effects.is_empty());

    let (d, effects) = step(&d, frontend_built(), &Facts::default());
    assert_eq!(d.status, DeploymentStatus::Deploying);
    assert_eq!(d.artifacts.previous_frontend_artifact_ref.as_deref(), Some("frontend/p1@v1"));
    assert_eq!(effects, vec![Effect::EnqueueBackendDeploy { image_tag: IMAGE.into() }]);

    let (d, effects) = step(
        &d,
        EventKind::BackendDeploySuccess {
            revision_ref: "backend-p1:1".into(),
        },
        &Facts::default(),
    );
    assert_eq!(d.status, DeploymentStatus::Deployed);
    assert_eq!(d.backend_revision_ref.as_deref(), Some("backend-p1:1"));
    assert!(d.finished_at.is_some());
    assert!(effects.is_empty());
}

#[test]
fn test_applied_event_is_duplicate() {
    let (d, _) = step(&analyzing(), analyzed(), &Facts::default());
    assert_eq!(apply(&d, &event(analyzed()), &Facts::default(), Utc::now()), Decision::Duplicate);
}

#[test]
fn test_analysis_failure_keeps_kind() {
    let (d, effects) = step(
        &analyzing(),
        EventKind::RepoAnalysisFailed(StageFailure::validation("Invalid package.json")),
        &Facts::default(),
    );
    assert_eq!(d.status, DeploymentStatus::Failed);
    let error = d.error.unwrap();
    assert_eq!(error.kind, FailureKind::Validation);
    assert_eq!(error.message, "Invalid package.json");
    assert!(effects.is_empty());
}

#[test]
fn test_deploy_failure_compensates_both_legs() {
    let (d, effects) = step(
        &deploying(),
        EventKind::BackendDeployFailed(StageFailure::upstream("rollout rejected")),
        &Facts::default(),
    );
    assert_eq!(d.status, DeploymentStatus::Failed);
    assert_eq!(d.error.as_ref().unwrap().kind, FailureKind::Upstream);
    assert_eq!(
        effects,
        vec![
            Effect::RevertArtifact {
                key: "frontend/p1".into(),
                to: Some("frontend/p1@v1".into()),
            },
            Effect::DeleteImage { image_tag: IMAGE.into() },
            Effect::RestoreBackend {
                image_tag: "registry.test/veren/backend:p1-d0".into()
            },
        ]
    );
    assert!(effects.iter().all(Effect::is_compensation));
}

#[test]
fn test_first_deploy_failure_has_nothing_to_restore() {
    let (d, _) = step(&analyzing(), analyzed(), &Facts::default());
    let (d, _) = step(&d, frontend_built(), &Facts::default());
    let first_release = Facts {
        image_visible: Some(true),
        ..Facts::default()
    };
    let (d, _) = step(&d, backend_built(), &first_release);
    assert_eq!(d.status, DeploymentStatus::Deploying);

    let (_, effects) = step(
        &d,
        EventKind::BackendDeployFailed(StageFailure::upstream("rollout rejected")),
        &Facts::default(),
    );
    assert!(!effects.iter().any(|e| matches!(e, Effect::RestoreBackend { .. })));
}

#[test]
fn test_stale_stage_events_are_acknowledged() {
    let (building, _) = step(&analyzing(), analyzed(), &Facts::default());
    let stale_analysis = event(EventKind::RepoAnalysisFailed(StageFailure::upstream("remote hung up")));
    assert_eq!(apply(&building, &stale_analysis, &Facts::default(), Utc::now()), Decision::Duplicate);

    let d = deploying();
    assert_eq!(apply(&d, &stale_analysis, &Facts::default(), Utc::now()), Decision::Duplicate);
    let stale_leg = event(EventKind::FrontendBuildFailed(StageFailure::upstream("runner lost")));
    assert_eq!(apply(&d, &stale_leg, &Facts::default(), Utc::now()), Decision::Duplicate);
    assert_eq!(
        apply(
            &d,
            &event(EventKind::BuildQueued {
                frontend_task_ref: None,
                backend_task_ref: None
            }),
            &Facts::default(),
            Utc::now()
        ),
        Decision::Duplicate
    );
}

#[test]
fn test_event_from_future_stage_fails_closed() {
    let d = analyzing();
    let (next, _) = step(&d, frontend_built(), &Facts::default());
    assert_eq!(next.status, DeploymentStatus::Failed);
    assert_eq!(next.error.unwrap().kind, FailureKind::Internal);
}

#[test]
fn test_events_after_deployed_are_ignored() {
    let (d, _) = step(
        &deploying(),
        EventKind::BackendDeploySuccess {
            revision_ref: "backend-p1:1".into(),
        },
        &Facts::default(),
    );

    // Same artifacts as the record: nothing to undo
    assert_eq!(apply(&d, &event(frontend_built()), &Facts::default(), Utc::now()), Decision::Duplicate);
    assert_eq!(apply(&d, &event(backend_built()), &visible(), Utc::now()), Decision::Duplicate);
}

#[test]
fn test_unconfirmed_image_before_frontend() {
    let (d, _) = step(&analyzing(), analyzed(), &Facts::default());
    let unknown = Facts::default();
    assert_eq!(apply(&d, &event(backend_built()), &unknown, Utc::now()), Decision::AwaitImage);
}
