//! Veren domain models
//!
//! Records, events and failure types shared by the deployment services.

pub mod config;
pub mod deployment;
pub mod events;
pub mod failure;
pub mod project;

pub use config::{BackendConfig, Framework, FrontendConfig, PackageManager, RepoConfig};
pub use deployment::{
    Artifacts, BuildTasks, Commit, Deployment, DeploymentError, DeploymentStatus, Leg, LegState,
    Legs, TransitionError,
};
pub use events::{DecodeError, DomainEvent, EventKind, EventType};
pub use failure::{FailureKind, StageFailure};
pub use project::{BuildHints, EnvVar, Envs, GitSettings, Project, RepoPaths, RuntimeSettings};
