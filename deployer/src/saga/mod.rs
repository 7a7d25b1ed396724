//! Deployment saga
//!
//! Clone, build and backend deploy run as independent stages. The coordinator
//! advances each deployment record from stage events and compensates build
//! outputs of deployments that fail.

pub mod coordinator;
pub mod credentials;
pub mod machine;

pub use coordinator::{Coordinator, Handled};
