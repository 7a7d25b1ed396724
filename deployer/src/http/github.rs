//! Source control contents API

use reqwest::{header, Client, StatusCode};
use tracing::{debug, error};
use url::Url;

use crate::errors::PlatformError;

/// Client for the repository contents endpoint
pub struct GithubClient {
    client: Client,
    base_url: String,
}

impl GithubClient {
    pub fn new(base_url: &str) -> Result<Self, PlatformError> {
        Ok(Self {
            client: super::build_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Whether `path` exists on `branch` of the repository at `repo_url`.
    pub async fn path_exists(
        &self,
        repo_url: &str,
        path: &str,
        branch: &str,
        token: &str,
    ) -> Result<bool, PlatformError> {
        let (owner, repo) = parse_repo(repo_url)?;
        let path = normalize_path(path);
        let url = format!(
            "{}/repos/{}/{}/contents/{}?ref={}",
            self.base_url, owner, repo, path, branch
        );
        debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .header(header::ACCEPT, "application/vnd.github+json")
            .send()
            .await?;

        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => {
                let body = response.text().await.unwrap_or_default();
                error!("Contents lookup failed: {}", status);
                Err(PlatformError::SourceControlError(format!("{}: {}", status, body)))
            }
        }
    }
}

/// `https://github.com/acme/shop.git` gives `("acme", "shop")`
pub fn parse_repo(repo_url: &str) -> Result<(String, String), PlatformError> {
    let url = Url::parse(repo_url)
        .map_err(|e| PlatformError::ValidationError(format!("Invalid repository URL: {}", e)))?;
    let mut segments = url
        .path_segments()
        .map(|s| s.filter(|p| !p.is_empty()).collect::<Vec<_>>())
        .unwrap_or_default();

    if segments.len() < 2 {
        return Err(PlatformError::ValidationError(format!(
            "Repository URL has no owner/name: {}",
            url.path()
        )));
    }
    let repo = segments.pop().unwrap_or_default();
    let owner = segments.pop().unwrap_or_default();
    Ok((
        owner.to_string(),
        repo.trim_end_matches(".git").to_string(),
    ))
}

fn normalize_path(path: &str) -> &str {
    path.trim_start_matches("./").trim_matches('/')
}
