//! Container registry v2 API

use reqwest::{header, Client, RequestBuilder, StatusCode};
use tracing::{debug, warn};

use crate::errors::PlatformError;

const MANIFEST_TYPES: &str = "application/vnd.docker.distribution.manifest.v2+json, \
    application/vnd.oci.image.manifest.v1+json, \
    application/vnd.oci.image.index.v1+json";

pub struct RegistryClient {
    client: Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
}

impl RegistryClient {
    pub fn new(
        base_url: &str,
        username: Option<String>,
        password: Option<String>,
    ) -> Result<Self, PlatformError> {
        Ok(Self {
            client: super::build_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            username,
            password,
        })
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.username {
            Some(username) => request.basic_auth(username, self.password.as_ref()),
            None => request,
        }
    }

    fn manifest_url(&self, image_tag: &str) -> Result<String, PlatformError> {
        let (name, reference) = split_image(image_tag)?;
        Ok(format!("{}/v2/{}/manifests/{}", self.base_url, name, reference))
    }

    /// Digest of the manifest `image_tag` points at, `None` if absent
    pub async fn manifest_digest(&self, image_tag: &str) -> Result<Option<String>, PlatformError> {
        let url = self.manifest_url(image_tag)?;
        debug!("HEAD {}", url);

        let response = self
            .authed(self.client.head(&url))
            .header(header::ACCEPT, MANIFEST_TYPES)
            .send()
            .await?;

        match response.status() {
            s if s.is_success() => Ok(Some(
                response
                    .headers()
                    .get("Docker-Content-Digest")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string(),
            )),
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(PlatformError::RegistryError(format!(
                "Manifest lookup for {} failed: {}",
                image_tag, status
            ))),
        }
    }

    /// Delete the manifest behind `image_tag`. An absent image is not an error.
    pub async fn delete_manifest(&self, image_tag: &str) -> Result<(), PlatformError> {
        let Some(digest) = self.manifest_digest(image_tag).await? else {
            debug!(image_tag = %image_tag, "Image already absent");
            return Ok(());
        };
        if digest.is_empty() {
            return Err(PlatformError::RegistryError(format!(
                "Registry returned no digest for {}",
                image_tag
            )));
        }

        let (name, _) = split_image(image_tag)?;
        let url = format!("{}/v2/{}/manifests/{}", self.base_url, name, digest);
        debug!("DELETE {}", url);

        let response = self.authed(self.client.delete(&url)).send().await?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => {
                warn!(image_tag = %image_tag, "Manifest vanished before delete");
                Ok(())
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(PlatformError::RegistryError(format!(
                    "Delete of {} failed: {}: {}",
                    image_tag, status, body
                )))
            }
        }
    }
}

/// Split `host:5000/team/app:tag` into (`team/app`, `tag`).
///
/// The first path component is treated as a registry host when it contains a
/// dot or a port, or is `localhost`.
pub fn split_image(image_tag: &str) -> Result<(String, String), PlatformError> {
    let invalid = || PlatformError::ValidationError(format!("Invalid image reference: {}", image_tag));

    let (repository, reference) = match image_tag.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo, tag),
        _ => return Err(invalid()),
    };
    if reference.is_empty() {
        return Err(invalid());
    }

    let name = match repository.split_once('/') {
        Some((host, rest)) if host.contains('.') || host.contains(':') || host == "localhost" => rest,
        _ => repository,
    };
    if name.is_empty() {
        return Err(invalid());
    }
    Ok((name.to_string(), reference.to_string()))
}
