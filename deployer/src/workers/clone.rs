//! Analyze stage: clone the repository and derive its build configuration

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;
use veren_domain::{DomainEvent, EventKind, StageFailure};

use crate::deploy::git::SourceControlExt;
use crate::detect::detect_config;
use crate::filesys::dir::Dir;
use crate::queue::jobs::{CloneJob, Credential, JobPayload};
use crate::queue::{Job, Topic};
use crate::workers::stage::{StageError, StageOutput, StageWorker};
use crate::workers::workspace::Workspace;

pub struct CloneWorker {
    source: Arc<dyn SourceControlExt>,
    workspaces: Dir,
}

impl CloneWorker {
    pub fn new(source: Arc<dyn SourceControlExt>, workspaces: Dir) -> Self {
        Self { source, workspaces }
    }

    async fn analyze(&self, input: &CloneJob) -> Result<StageOutput, StageError> {
        let credential = validate(input)?;

        let workspace = Workspace::prepare(&self.workspaces, &input.deployment_id, "clone").await?;
        let result = self.inspect(input, credential, workspace.path()).await;
        workspace.cleanup().await;
        result
    }

    async fn inspect(&self, input: &CloneJob, credential: &Credential, root: &Path) -> Result<StageOutput, StageError> {
        let checkout = root.join("repo");
        self.source
            .clone_repo(&input.repo_url, &input.branch, credential, &checkout)
            .await?;

        let commit = self.source.head_commit(&checkout).await?;
        if commit.hash.is_empty() {
            return Err(StageFailure::internal("Commit metadata missing")
                .with_metadata("projectId", &input.project_id)
                .into());
        }

        for (label, dir) in [
            ("frontend", &input.frontend_dir_path),
            ("backend", &input.backend_dir_path),
        ] {
            if Dir::new(checkout.join(dir)).exists().await {
                continue;
            }
            let on_remote = self
                .source
                .path_exists(&input.repo_url, dir, &input.branch, credential)
                .await?;
            let message = if on_remote {
                format!("{} directory {} not found after clone", label, dir)
            } else {
                format!("{} directory {} does not exist on branch {}", label, dir, input.branch)
            };
            return Err(StageFailure::internal(message)
                .with_metadata(format!("{}DirPath", label), dir.as_str())
                .with_metadata("existsOnRemote", on_remote.to_string())
                .into());
        }

        let config = detect_config(
            &checkout,
            &input.frontend_dir_path,
            &input.backend_dir_path,
            &input.hints,
        )
        .await?;

        info!(
            deployment_id = %input.deployment_id,
            commit = %commit.hash,
            framework = config.frontend.framework.as_str(),
            "Repository analyzed"
        );
        Ok(StageOutput::events(vec![DomainEvent::new(
            &input.deployment_id,
            &input.project_id,
            EventKind::RepoAnalysisSuccess { config, commit },
        )]))
    }
}

fn validate(input: &CloneJob) -> Result<&Credential, StageFailure> {
    if input.deployment_id.trim().is_empty() || input.project_id.trim().is_empty() {
        return Err(StageFailure::validation("Missing deployment or project id"));
    }
    if input.repo_url.trim().is_empty() || input.branch.trim().is_empty() {
        return Err(StageFailure::validation("Missing repository URL or branch"));
    }
    for dir in [&input.frontend_dir_path, &input.backend_dir_path] {
        let unsafe_path = dir.trim().is_empty()
            || dir.starts_with('/')
            || dir.split('/').any(|segment| segment == "..");
        if unsafe_path {
            return Err(StageFailure::validation(format!("Invalid directory path: {:?}", dir)));
        }
    }
    input
        .credential
        .as_ref()
        .filter(|c| !c.is_empty())
        .ok_or_else(|| StageFailure::validation("Missing source control credential"))
}

#[async_trait]
impl StageWorker for CloneWorker {
    fn name(&self) -> &'static str {
        "clone"
    }

    fn topic(&self) -> Topic {
        Topic::Clone
    }

    async fn execute(&self, job: &Job) -> Result<StageOutput, StageError> {
        match &job.payload {
            JobPayload::Clone(input) => self.analyze(input).await,
            _ => Err(StageFailure::internal("Clone worker received a foreign job").into()),
        }
    }

    fn failure_events(&self, job: &Job, failure: StageFailure) -> Vec<DomainEvent> {
        vec![DomainEvent::new(
            job.deployment_id(),
            job.payload.project_id(),
            EventKind::RepoAnalysisFailed(failure),
        )]
    }
}
