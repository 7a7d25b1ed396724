//! Build stage: frontend bundle and backend image, built concurrently
//!
//! Each leg works in its own sandbox checkout and sees only its own
//! environment. A leg publishes its success as soon as it finishes and the
//! outcome goes into a ledger, so a retried job never rebuilds or re-reports a
//! leg and a stage timeout never hides an upload that already happened.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, info, warn};
use veren_domain::{DomainEvent, EventKind, Leg, StageFailure};

use crate::bus::Publisher;
use crate::deploy::artifacts::{frontend_key, ArtifactStoreExt, PutOutcome};
use crate::deploy::docker::{ContainerRuntimeExt, ImageRegistryExt, OneOffTask};
use crate::deploy::git::SourceControlExt;
use crate::deploy::package;
use crate::filesys::dir::Dir;
use crate::queue::jobs::{BuildJob, Credential, JobPayload};
use crate::queue::{Job, Topic};
use crate::workers::stage::{sanitize, StageError, StageOutput, StageWorker};
use crate::workers::workspace::Workspace;

/// Mount point of the frontend directory inside the build container
const FRONTEND_WORKDIR: &str = "/app";

#[derive(Debug, Default)]
struct Progress {
    queued: bool,
    reported: HashSet<Leg>,
    upload: Option<PutOutcome>,
}

/// What each deployment's build has already done and reported
#[derive(Default)]
pub struct LegLedger {
    entries: Mutex<HashMap<String, Progress>>,
}

impl LegLedger {
    fn read<R>(&self, deployment_id: &str, f: impl FnOnce(Option<&Progress>) -> R) -> R {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        f(entries.get(deployment_id))
    }

    fn write<R>(&self, deployment_id: &str, f: impl FnOnce(&mut Progress) -> R) -> R {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        f(entries.entry(deployment_id.to_string()).or_default())
    }

    fn queued(&self, deployment_id: &str) -> bool {
        self.read(deployment_id, |p| p.is_some_and(|p| p.queued))
    }

    pub fn leg_reported(&self, deployment_id: &str, leg: Leg) -> bool {
        self.read(deployment_id, |p| p.is_some_and(|p| p.reported.contains(&leg)))
    }

    /// The frontend bundle already uploaded for this deployment
    pub fn upload(&self, deployment_id: &str) -> Option<PutOutcome> {
        self.read(deployment_id, |p| p.and_then(|p| p.upload.clone()))
    }

    /// Record an upload. `previous` stays the pointer seen by the first upload.
    fn remember_upload(&self, deployment_id: &str, outcome: PutOutcome) -> PutOutcome {
        self.write(deployment_id, |p| {
            let previous = match &p.upload {
                Some(first) => first.previous.clone(),
                None => outcome.previous,
            };
            let outcome = PutOutcome {
                artifact_ref: outcome.artifact_ref,
                previous,
            };
            p.upload = Some(outcome.clone());
            outcome
        })
    }

    fn record(&self, event: &DomainEvent) {
        self.write(&event.deployment_id, |p| match &event.kind {
            EventKind::BuildQueued { .. } => p.queued = true,
            EventKind::FrontendBuildSuccess { .. } | EventKind::FrontendBuildFailed(_) => {
                p.reported.insert(Leg::Frontend);
            }
            EventKind::BackendBuildSuccess { .. } | EventKind::BackendBuildFailed(_) => {
                p.reported.insert(Leg::Backend);
            }
            _ => {}
        });
    }

    /// Drop everything known about a deployment
    pub fn forget(&self, deployment_id: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(deployment_id);
    }

    /// Number of deployments with recorded progress
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn frontend_task_ref(deployment_id: &str) -> String {
    format!("build-fe-{}", deployment_id)
}

pub fn backend_task_ref(deployment_id: &str) -> String {
    format!("build-be-{}", deployment_id)
}

/// Registry tag of a deployment's backend image
pub fn image_tag(repository: &str, project_id: &str, deployment_id: &str) -> String {
    format!("{}:{}-{}", repository, project_id, deployment_id)
}

pub struct BuildWorker {
    source: Arc<dyn SourceControlExt>,
    artifacts: Arc<dyn ArtifactStoreExt>,
    registry: Arc<dyn ImageRegistryExt>,
    runtime: Arc<dyn ContainerRuntimeExt>,
    publisher: Publisher,
    workspaces: Dir,
    image_repository: String,
    ledger: LegLedger,
}

pub struct BuildWorkerDeps {
    pub source: Arc<dyn SourceControlExt>,
    pub artifacts: Arc<dyn ArtifactStoreExt>,
    pub registry: Arc<dyn ImageRegistryExt>,
    pub runtime: Arc<dyn ContainerRuntimeExt>,
    pub publisher: Publisher,
}

impl BuildWorker {
    pub fn new(deps: BuildWorkerDeps, workspaces: Dir, image_repository: impl Into<String>) -> Self {
        Self {
            source: deps.source,
            artifacts: deps.artifacts,
            registry: deps.registry,
            runtime: deps.runtime,
            publisher: deps.publisher,
            workspaces,
            image_repository: image_repository.into(),
            ledger: LegLedger::default(),
        }
    }

    pub fn ledger(&self) -> &LegLedger {
        &self.ledger
    }

    async fn build(&self, job: &Job, input: &BuildJob) -> Result<StageOutput, StageError> {
        let credential = input
            .credential
            .as_ref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| StageFailure::validation("Missing source control credential"))?;
        let deployment_id = &input.deployment_id;

        if !self.ledger.queued(deployment_id) {
            let queued = DomainEvent::new(
                deployment_id,
                &input.project_id,
                EventKind::BuildQueued {
                    frontend_task_ref: Some(frontend_task_ref(deployment_id)),
                    backend_task_ref: Some(backend_task_ref(deployment_id)),
                },
            );
            self.publisher.publish(&queued).await?;
            self.ledger.record(&queued);
        }

        let run_frontend = !self.ledger.leg_reported(deployment_id, Leg::Frontend);
        let run_backend = !self.ledger.leg_reported(deployment_id, Leg::Backend);

        let (frontend, backend) = tokio::join!(
            async {
                if run_frontend {
                    Some(self.report(self.frontend_leg(input, credential).await).await)
                } else {
                    None
                }
            },
            async {
                if run_backend {
                    Some(self.report(self.backend_leg(input, credential).await).await)
                } else {
                    None
                }
            },
        );

        let failures: Vec<(Leg, StageFailure)> = [(Leg::Frontend, frontend), (Leg::Backend, backend)]
            .into_iter()
            .filter_map(|(leg, outcome)| match outcome {
                Some(Err(failure)) => Some((leg, failure)),
                _ => None,
            })
            .collect();

        if failures.is_empty() {
            return Ok(StageOutput::default());
        }

        let retry = failures.iter().all(|(_, f)| f.kind.is_retryable()) && !job.is_last_attempt();
        if retry {
            let message = failures
                .iter()
                .map(|(leg, f)| format!("{}: {}", leg, f.message))
                .collect::<Vec<_>>()
                .join("; ");
            return Ok(StageOutput {
                events: Vec::new(),
                retry: Some(StageFailure::new(failures[0].1.kind, message)),
            });
        }

        let secrets = job.payload.secrets();
        let failures = failures
            .into_iter()
            .map(|(leg, f)| (leg, sanitize(f, &secrets)))
            .collect();
        Ok(StageOutput::events(leg_failure_events(
            input.deployment_id.as_str(),
            &input.project_id,
            failures,
        )))
    }

    /// Publish a finished leg's success right away
    async fn report(&self, outcome: Result<DomainEvent, StageFailure>) -> Result<(), StageFailure> {
        let event = outcome?;
        self.publisher
            .publish(&event)
            .await
            .map_err(|e| StageError::from(e).into_failure())?;
        self.ledger.record(&event);
        Ok(())
    }

    async fn frontend_leg(&self, input: &BuildJob, credential: &Credential) -> Result<DomainEvent, StageFailure> {
        if let Some(outcome) = self.ledger.upload(&input.deployment_id) {
            debug!(deployment_id = %input.deployment_id, artifact_ref = %outcome.artifact_ref, "Frontend already uploaded");
            return Ok(frontend_built(input, outcome));
        }

        let run = async {
            let workspace = Workspace::prepare(&self.workspaces, &input.deployment_id, "frontend").await?;
            let built = self.build_frontend(input, credential, workspace.path()).await;
            workspace.cleanup().await;
            built
        };
        run.await.map_err(|e| {
            let failure = e.into_failure();
            warn!(deployment_id = %input.deployment_id, kind = %failure.kind, "Frontend leg failed");
            failure
        })
    }

    async fn build_frontend(&self, input: &BuildJob, credential: &Credential, root: &Path) -> Result<DomainEvent, StageError> {
        let frontend = &input.config.frontend;
        let checkout = root.join("repo");
        self.source
            .clone_repo(&input.repo_url, &input.branch, credential, &checkout)
            .await?;

        let app_dir = checkout.join(&frontend.dir);
        let task = OneOffTask {
            name: frontend_task_ref(&input.deployment_id),
            image: format!("node:{}-alpine", frontend.runtime_version),
            command: format!("{} && {}", frontend.install_command, frontend.build_command),
            workdir: FRONTEND_WORKDIR.to_string(),
            mounts: vec![(app_dir.clone(), FRONTEND_WORKDIR.to_string())],
            env: input.frontend_env.clone(),
        };
        self.runtime.run_one_off(task).await?;

        let bundle = package::pack_dir(&app_dir.join(&frontend.out_dir)).await?;
        let outcome = self
            .artifacts
            .put(&frontend_key(&input.project_id), bundle, package::CONTENT_TYPE)
            .await?;
        let outcome = self.ledger.remember_upload(&input.deployment_id, outcome);

        info!(deployment_id = %input.deployment_id, artifact_ref = %outcome.artifact_ref, "Frontend built");
        Ok(frontend_built(input, outcome))
    }

    async fn backend_leg(&self, input: &BuildJob, credential: &Credential) -> Result<DomainEvent, StageFailure> {
        let run = async {
            let workspace = Workspace::prepare(&self.workspaces, &input.deployment_id, "backend").await?;
            let built = self.build_backend(input, credential, workspace.path()).await;
            workspace.cleanup().await;
            built
        };
        run.await.map_err(|e| {
            let failure = e.into_failure();
            warn!(deployment_id = %input.deployment_id, kind = %failure.kind, "Backend leg failed");
            failure
        })
    }

    async fn build_backend(&self, input: &BuildJob, credential: &Credential, root: &Path) -> Result<DomainEvent, StageError> {
        let checkout = root.join("repo");
        self.source
            .clone_repo(&input.repo_url, &input.branch, credential, &checkout)
            .await?;

        let tag = image_tag(&self.image_repository, &input.project_id, &input.deployment_id);
        self.registry
            .build(&checkout.join(&input.config.backend.dir), &tag, &input.backend_env)
            .await?;
        self.registry.push(&tag).await?;

        info!(deployment_id = %input.deployment_id, image_tag = %tag, "Backend built");
        Ok(DomainEvent::new(
            &input.deployment_id,
            &input.project_id,
            EventKind::BackendBuildSuccess { image_tag: tag },
        ))
    }
}

fn frontend_built(input: &BuildJob, outcome: PutOutcome) -> DomainEvent {
    DomainEvent::new(
        &input.deployment_id,
        &input.project_id,
        EventKind::FrontendBuildSuccess {
            artifact_ref: outcome.artifact_ref,
            previous_artifact_ref: outcome.previous,
        },
    )
}

/// Failure events for the given legs, backend first. When both legs failed
/// the backend failure carries the frontend error.
fn leg_failure_events(deployment_id: &str, project_id: &str, mut failures: Vec<(Leg, StageFailure)>) -> Vec<DomainEvent> {
    failures.sort_by_key(|(leg, _)| match leg {
        Leg::Backend => 0,
        Leg::Frontend => 1,
    });

    let frontend_error = failures
        .iter()
        .find(|(leg, _)| *leg == Leg::Frontend)
        .map(|(_, f)| f.message.clone());

    failures
        .into_iter()
        .map(|(leg, failure)| {
            let failure = match (leg, &frontend_error) {
                (Leg::Backend, Some(message)) => failure.with_metadata("frontendError", message.as_str()),
                _ => failure,
            };
            DomainEvent::new(deployment_id, project_id, EventKind::leg_failed(leg, failure))
        })
        .collect()
}

#[async_trait]
impl StageWorker for BuildWorker {
    fn name(&self) -> &'static str {
        "build"
    }

    fn topic(&self) -> Topic {
        Topic::Build
    }

    async fn execute(&self, job: &Job) -> Result<StageOutput, StageError> {
        match &job.payload {
            JobPayload::Build(input) => self.build(job, input).await,
            _ => Err(StageFailure::internal("Build worker received a foreign job").into()),
        }
    }

    fn failure_events(&self, job: &Job, failure: StageFailure) -> Vec<DomainEvent> {
        let deployment_id = job.deployment_id();
        let pending = [Leg::Frontend, Leg::Backend]
            .into_iter()
            .filter(|leg| !self.ledger.leg_reported(deployment_id, *leg))
            .map(|leg| (leg, failure.clone()))
            .collect();
        leg_failure_events(deployment_id, job.payload.project_id(), pending)
    }

    async fn published(&self, _job: &Job, events: &[DomainEvent]) {
        for event in events {
            self.ledger.record(event);
        }
    }

    async fn settled(&self, job: &Job) {
        self.ledger.forget(job.deployment_id());
    }
}
