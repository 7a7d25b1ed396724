//! Veren deployment daemon
//!
//! Clones, builds and deploys projects as a saga of independent stages
//! coordinated through a job queue and an event bus.

pub mod app;
pub mod bus;
pub mod deploy;
pub mod detect;
pub mod errors;
pub mod filesys;
pub mod http;
pub mod logs;
pub mod queue;
pub mod saga;
pub mod server;
pub mod storage;
pub mod store;
pub mod utils;
pub mod workers;
