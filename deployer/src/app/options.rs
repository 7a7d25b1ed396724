//! Application configuration options

use std::time::Duration;

use crate::bus;
use crate::queue::{self, JobOptions};
use crate::saga::coordinator;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::utils::CooldownOptions;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// State directory layout
    pub layout: StorageLayout,

    /// Enable local HTTP server
    pub enable_server: bool,

    /// Server configuration
    pub server: ServerOptions,

    /// Worker pool sizes and stage budget
    pub workers: WorkerOptions,

    /// Coordinator options
    pub coordinator: coordinator::Options,

    /// Job queue options
    pub queue: queue::memory::Options,

    /// Event bus options
    pub bus: bus::memory::Options,

    /// Image registry
    pub registry: RegistryOptions,

    /// Source control API base URL
    pub source_control_api: String,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            layout: StorageLayout::new("/var/lib/verend"),
            enable_server: true,
            server: ServerOptions::default(),
            workers: WorkerOptions::default(),
            coordinator: coordinator::Options::default(),
            queue: queue::memory::Options::default(),
            bus: bus::memory::Options::default(),
            registry: RegistryOptions::default(),
            source_control_api: "https://api.github.com".to_string(),
        }
    }
}

impl AppOptions {
    pub fn from_settings(settings: &Settings, layout: StorageLayout) -> Self {
        let defaults = Self::default();
        let stage_jobs = JobOptions {
            attempts: settings.workers.max_attempts.max(1),
            ..JobOptions::default()
        };
        let compensation_jobs = JobOptions {
            attempts: settings.workers.max_attempts.max(1) + 2,
            backoff: CooldownOptions {
                base_delay: Duration::from_secs(10),
                max_delay: Duration::from_secs(300),
                multiplier: 2.0,
            },
        };

        Self {
            layout,
            enable_server: settings.server.enabled,
            server: ServerOptions {
                host: settings.server.host.clone(),
                port: settings.server.port,
            },
            workers: WorkerOptions {
                clone_workers: settings.workers.clone_workers,
                build_workers: settings.workers.build_workers,
                deploy_workers: settings.workers.deploy_workers,
                compensation_workers: settings.workers.compensation_workers,
                stage_timeout: Duration::from_secs(settings.workers.stage_timeout_secs),
            },
            coordinator: coordinator::Options {
                stage_jobs,
                compensation_jobs,
                max_image_checks: settings.delivery.max_image_checks.max(1),
                ..defaults.coordinator
            },
            queue: queue::memory::Options {
                lease_duration: Duration::from_secs(settings.delivery.job_lease_secs),
                ..defaults.queue
            },
            bus: bus::memory::Options {
                visibility_timeout: Duration::from_secs(settings.delivery.event_visibility_secs),
                ..defaults.bus
            },
            registry: RegistryOptions {
                repository: settings.registry.repository.clone(),
                api_base_url: settings.registry.api_base_url.clone(),
                username: settings.registry.username.clone(),
                password: settings.registry.password.clone(),
            },
            source_control_api: settings.source_control.api_base_url.clone(),
            lifecycle: defaults.lifecycle,
        }
    }
}

/// Lifecycle options for the daemon
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub clone_workers: usize,
    pub build_workers: usize,
    pub deploy_workers: usize,
    pub compensation_workers: usize,

    /// Wall-clock budget per stage
    pub stage_timeout: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            clone_workers: 2,
            build_workers: 2,
            deploy_workers: 2,
            compensation_workers: 2,
            stage_timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Clone)]
pub struct RegistryOptions {
    /// Repository images are tagged into
    pub repository: String,
    pub api_base_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl std::fmt::Debug for RegistryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryOptions")
            .field("repository", &self.repository)
            .field("api_base_url", &self.api_base_url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            repository: "localhost:5000/veren/backend".to_string(),
            api_base_url: "http://localhost:5000".to_string(),
            username: None,
            password: None,
        }
    }
}

/// Local HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}
