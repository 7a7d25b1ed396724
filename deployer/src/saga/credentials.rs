//! Per-deployment source control credentials
//!
//! Tokens are held in memory only, from the deployment request until the
//! deployment reaches a terminal status. They are never written to the record.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::queue::jobs::Credential;

#[derive(Default)]
pub struct CredentialCache {
    tokens: Mutex<HashMap<String, Credential>>,
}

impl CredentialCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remember(&self, deployment_id: &str, credential: Credential) {
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.insert(deployment_id.to_string(), credential);
        }
    }

    pub fn get(&self, deployment_id: &str) -> Option<Credential> {
        self.tokens
            .lock()
            .ok()
            .and_then(|tokens| tokens.get(deployment_id).cloned())
    }

    pub fn forget(&self, deployment_id: &str) {
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.remove(deployment_id);
        }
    }
}
