//! Source control access

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};
use url::Url;
use veren_domain::Commit;

use crate::deploy::command;
use crate::errors::PlatformError;
use crate::http::github::GithubClient;
use crate::queue::jobs::Credential;

#[async_trait]
pub trait SourceControlExt: Send + Sync {
    /// Shallow clone of `branch` into `dest`, which must not exist.
    async fn clone_repo(
        &self,
        repo_url: &str,
        branch: &str,
        credential: &Credential,
        dest: &Path,
    ) -> Result<(), PlatformError>;

    /// Head commit of the checkout at `dir`
    async fn head_commit(&self, dir: &Path) -> Result<Commit, PlatformError>;

    /// Whether `path` exists on the remote branch
    async fn path_exists(
        &self,
        repo_url: &str,
        path: &str,
        branch: &str,
        credential: &Credential,
    ) -> Result<bool, PlatformError>;
}

/// `git` CLI for checkouts, the contents API for remote lookups
pub struct GitSourceControl {
    api: GithubClient,
}

impl GitSourceControl {
    pub fn new(api: GithubClient) -> Self {
        Self { api }
    }
}

#[async_trait]
impl SourceControlExt for GitSourceControl {
    async fn clone_repo(
        &self,
        repo_url: &str,
        branch: &str,
        credential: &Credential,
        dest: &Path,
    ) -> Result<(), PlatformError> {
        info!("Cloning {} (branch: {})", repo_url, branch);
        let authed = authenticated_url(repo_url, credential)?;

        let mut cmd = Command::new("git");
        cmd.args(["clone", "--depth", "1", "--single-branch", "--branch", branch])
            .arg(authed.as_str())
            .arg(dest)
            .env("GIT_TERMINAL_PROMPT", "0");

        command::run(&mut cmd, "git clone")
            .await
            .map_err(|e| PlatformError::SourceControlError(e.to_string()))?;
        Ok(())
    }

    async fn head_commit(&self, dir: &Path) -> Result<Commit, PlatformError> {
        let mut cmd = Command::new("git");
        cmd.current_dir(dir).args(["log", "-1", "--format=%H%n%B"]);
        let out = command::run(&mut cmd, "git log").await?;
        debug!("Head commit read from {}", dir.display());
        Ok(parse_commit(&out))
    }

    async fn path_exists(
        &self,
        repo_url: &str,
        path: &str,
        branch: &str,
        credential: &Credential,
    ) -> Result<bool, PlatformError> {
        self.api
            .path_exists(repo_url, path, branch, credential.expose())
            .await
    }
}

/// Put the token in the URL userinfo so git never prompts
fn authenticated_url(repo_url: &str, credential: &Credential) -> Result<Url, PlatformError> {
    let mut url = Url::parse(repo_url)
        .map_err(|e| PlatformError::ValidationError(format!("Invalid repository URL: {}", e)))?;
    if url.scheme() != "https" {
        return Err(PlatformError::ValidationError(format!(
            "Unsupported repository scheme: {}",
            url.scheme()
        )));
    }
    url.set_username("x-access-token")
        .and_then(|_| url.set_password(Some(credential.expose())))
        .map_err(|_| PlatformError::ValidationError("Repository URL cannot carry credentials".into()))?;
    Ok(url)
}

/// First line is the hash, the rest the message
fn parse_commit(log: &str) -> Commit {
    let mut lines = log.splitn(2, '\n');
    let hash = lines.next().unwrap_or_default().trim().to_string();
    let message = lines.next().unwrap_or_default().trim().to_string();
    Commit { hash, message }
}
