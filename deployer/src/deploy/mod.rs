//! Capabilities the stage workers drive: source control, artifact storage,
//! image registry and container runtime.

pub mod artifacts;
pub mod command;
pub mod docker;
pub mod git;
pub mod package;
