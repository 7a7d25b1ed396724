//! Deployment state machine
//!
//! A pure function from (record, event, facts) to a decision. The coordinator
//! gathers the facts, performs the effects and writes the record.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use veren_domain::{
    Deployment, DeploymentStatus, DomainEvent, EventKind, EventType, FailureKind, Leg, LegState,
    TransitionError,
};

use crate::deploy::artifacts::frontend_key;

/// Observations the coordinator makes before deciding
#[derive(Debug, Clone, Default)]
pub struct Facts {
    /// Registry lookup of the image a `BACKEND_BUILD_SUCCESS` names
    pub image_visible: Option<bool>,
    /// The image event has been delivered as often as it may be
    pub image_checks_exhausted: bool,
    /// Backend image of the project's last successful deployment
    pub previous_backend_image: Option<String>,
}

/// Work the coordinator schedules on behalf of a decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    EnqueueBuild,
    EnqueueBackendDeploy { image_tag: String },
    DeleteImage { image_tag: String },
    RevertArtifact { key: String, to: Option<String> },
    /// Roll the project's backend back to an image that was live before
    RestoreBackend { image_tag: String },
}

impl Effect {
    pub fn is_compensation(&self) -> bool {
        matches!(
            self,
            Effect::DeleteImage { .. } | Effect::RevertArtifact { .. } | Effect::RestoreBackend { .. }
        )
    }

    /// Whether the job for this effect is built from the project record
    pub fn needs_project(&self) -> bool {
        matches!(
            self,
            Effect::EnqueueBuild | Effect::EnqueueBackendDeploy { .. } | Effect::RestoreBackend { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Perform `effects`, then store `next` if there is one
    Apply {
        next: Option<Deployment>,
        effects: Vec<Effect>,
    },
    /// Already applied, or nothing left to do; acknowledge only
    Duplicate,
    /// The registry does not show the image yet; redeliver later
    AwaitImage,
}

/// Decide how `event` changes `current`.
pub fn apply(current: &Deployment, event: &DomainEvent, facts: &Facts, now: DateTime<Utc>) -> Decision {
    if current.is_terminal() {
        return late_event(current, event);
    }

    let Some(event_type) = event.kind.event_type() else {
        let reason = match &event.kind {
            EventKind::Unrecognized { reason, .. } => reason.as_str(),
            _ => "unknown",
        };
        return fail_closed(
            current,
            format!("Unrecognized event {}: {}", event.kind.type_name(), reason),
            now,
        );
    };
    if current.has_applied(event_type) {
        return Decision::Duplicate;
    }
    if event_type.stage().precedes(current.status) {
        debug!(
            deployment_id = %current.deployment_id,
            event_type = event_type.as_str(),
            status = %current.status,
            "Event from a finished stage"
        );
        return late_event(current, event);
    }

    match transition(current, event, event_type, facts, now) {
        Ok(decision) => decision,
        Err(e) => fail_closed(current, e.to_string(), now),
    }
}

fn transition(
    current: &Deployment,
    event: &DomainEvent,
    event_type: EventType,
    facts: &Facts,
    now: DateTime<Utc>,
) -> Result<Decision, TransitionError> {
    let mut next = current.clone();
    next.applied_events.insert(event_type);
    let mut effects = Vec::new();

    match (current.status, &event.kind) {
        (DeploymentStatus::Analyzing, EventKind::RepoAnalysisSuccess { config, commit }) => {
            next.set_commit(commit.clone());
            next.config = Some(config.clone());
            next.advance(DeploymentStatus::Building, now)?;
            effects.push(Effect::EnqueueBuild);
        }
        (DeploymentStatus::Analyzing, EventKind::RepoAnalysisFailed(failure)) => {
            next.fail(failure.kind, &failure.message, now)?;
        }

        (
            DeploymentStatus::Building,
            EventKind::BuildQueued {
                frontend_task_ref,
                backend_task_ref,
            },
        ) => {
            next.build_tasks.frontend_task_ref = frontend_task_ref.clone();
            next.build_tasks.backend_task_ref = backend_task_ref.clone();
        }
        (
            DeploymentStatus::Building,
            EventKind::FrontendBuildSuccess {
                artifact_ref,
                previous_artifact_ref,
            },
        ) => {
            next.artifacts.frontend_artifact_ref = Some(artifact_ref.clone());
            next.artifacts.previous_frontend_artifact_ref = previous_artifact_ref.clone();
            next.legs.set(Leg::Frontend, LegState::Succeeded);
            effects.extend(advance_if_built(&mut next, now)?);
        }
        (DeploymentStatus::Building, EventKind::BackendBuildSuccess { image_tag }) => {
            match facts.image_visible {
                Some(true) => {
                    next.artifacts.backend_image_ref = Some(image_tag.clone());
                    next.artifacts.previous_backend_image_ref = facts.previous_backend_image.clone();
                    next.legs.set(Leg::Backend, LegState::Succeeded);
                    effects.extend(advance_if_built(&mut next, now)?);
                }
                _ if facts.image_checks_exhausted => {
                    next.fail(
                        FailureKind::Upstream,
                        format!("Image {} is not visible in the registry", image_tag),
                        now,
                    )?;
                    effects.extend(compensations(&next));
                    effects.push(Effect::DeleteImage {
                        image_tag: image_tag.clone(),
                    });
                }
                _ => return Ok(Decision::AwaitImage),
            }
        }
        (DeploymentStatus::Building, EventKind::FrontendBuildFailed(failure)) => {
            next.legs.set(Leg::Frontend, LegState::Failed);
            next.fail(failure.kind, &failure.message, now)?;
            effects.extend(compensations(&next));
        }
        (DeploymentStatus::Building, EventKind::BackendBuildFailed(failure)) => {
            next.legs.set(Leg::Backend, LegState::Failed);
            next.fail(failure.kind, &failure.message, now)?;
            effects.extend(compensations(&next));
        }

        (DeploymentStatus::Deploying, EventKind::BackendDeploySuccess { revision_ref }) => {
            next.backend_revision_ref = Some(revision_ref.clone());
            next.advance(DeploymentStatus::Deployed, now)?;
        }
        (DeploymentStatus::Deploying, EventKind::BackendDeployFailed(failure)) => {
            next.fail(failure.kind, &failure.message, now)?;
            effects.extend(compensations(&next));
            effects.extend(restore_backend(&next));
        }

        (status, kind) => {
            return Ok(fail_closed(
                current,
                format!("Unexpected {} while {}", kind.type_name(), status),
                now,
            ));
        }
    }

    Ok(Decision::Apply {
        next: Some(next),
        effects,
    })
}

/// Move to `deploying` once both legs succeeded
fn advance_if_built(next: &mut Deployment, now: DateTime<Utc>) -> Result<Vec<Effect>, TransitionError> {
    if !next.legs.both_succeeded() {
        return Ok(Vec::new());
    }
    let Some(image_tag) = next.artifacts.backend_image_ref.clone() else {
        return Ok(Vec::new());
    };
    next.advance(DeploymentStatus::Deploying, now)?;
    Ok(vec![Effect::EnqueueBackendDeploy { image_tag }])
}

/// Undo actions for every leg of `deployment` that succeeded
pub fn compensations(deployment: &Deployment) -> Vec<Effect> {
    let mut effects = Vec::new();
    if deployment.legs.get(Leg::Frontend) == LegState::Succeeded {
        effects.push(Effect::RevertArtifact {
            key: frontend_key(&deployment.project_id),
            to: deployment.artifacts.previous_frontend_artifact_ref.clone(),
        });
    }
    if deployment.legs.get(Leg::Backend) == LegState::Succeeded {
        if let Some(image_tag) = &deployment.artifacts.backend_image_ref {
            effects.push(Effect::DeleteImage {
                image_tag: image_tag.clone(),
            });
        }
    }
    effects
}

/// Rollout of the previously live backend image, if there was one.
///
/// A rollout replaces the running containers before it can fail, so a failed
/// deploy leaves the service down until the old image goes back out.
fn restore_backend(deployment: &Deployment) -> Option<Effect> {
    deployment
        .artifacts
        .previous_backend_image_ref
        .as_ref()
        .map(|image_tag| Effect::RestoreBackend {
            image_tag: image_tag.clone(),
        })
}

/// Fail `current` with an `INTERNAL` error, compensating finished legs.
pub fn fail_closed(current: &Deployment, message: String, now: DateTime<Utc>) -> Decision {
    warn!(deployment_id = %current.deployment_id, "Failing closed: {}", message);
    let mut next = current.clone();
    if next.fail(FailureKind::Internal, message, now).is_err() {
        return Decision::Duplicate;
    }
    let mut effects = compensations(&next);
    if current.status == DeploymentStatus::Deploying {
        effects.extend(restore_backend(&next));
    }
    Decision::Apply {
        next: Some(next),
        effects,
    }
}

/// Events from a stage the deployment has left. Leg successes that differ
/// from the record still get undone; anything else is acknowledged.
fn late_event(current: &Deployment, event: &DomainEvent) -> Decision {
    match &event.kind {
        EventKind::FrontendBuildSuccess {
            artifact_ref,
            previous_artifact_ref,
        } if current.artifacts.frontend_artifact_ref.as_ref() != Some(artifact_ref) => Decision::Apply {
            next: None,
            effects: vec![Effect::RevertArtifact {
                key: frontend_key(&current.project_id),
                to: previous_artifact_ref.clone(),
            }],
        },
        EventKind::BackendBuildSuccess { image_tag }
            if current.artifacts.backend_image_ref.as_ref() != Some(image_tag) =>
        {
            Decision::Apply {
                next: None,
                effects: vec![Effect::DeleteImage {
                    image_tag: image_tag.clone(),
                }],
            }
        }
        _ => Decision::Duplicate,
    }
}
