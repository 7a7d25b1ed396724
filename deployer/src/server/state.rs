//! Server state

use std::sync::Arc;

use crate::saga::Coordinator;
use crate::store::DeploymentStoreExt;

/// Server state shared across handlers
pub struct ServerState {
    pub coordinator: Arc<Coordinator>,
    pub deployments: Arc<dyn DeploymentStoreExt>,
}

impl ServerState {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        let deployments = coordinator.deployments().clone();
        Self {
            coordinator,
            deployments,
        }
    }
}
