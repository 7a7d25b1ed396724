//! Outbound HTTP clients

pub mod github;
pub mod registry;

use std::time::Duration;

use reqwest::Client;

use crate::errors::PlatformError;

const USER_AGENT: &str = concat!("verend/", env!("CARGO_PKG_VERSION"));

/// Shared client settings for every outbound API
pub fn build_client() -> Result<Client, PlatformError> {
    let client = Client::builder()
        .timeout(Duration::from_secs(30))
        .user_agent(USER_AGENT)
        .build()?;
    Ok(client)
}
