//! Stage workers

pub mod backend_deploy;
pub mod build;
pub mod clone;
pub mod compensation;
pub mod stage;
pub mod workspace;
