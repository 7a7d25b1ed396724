//! Settings file management

use serde::{Deserialize, Serialize};

use crate::logs::LogLevel;

/// Daemon settings, read from `settings.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON logs on stdout
    #[serde(default)]
    pub json_logs: bool,

    /// Also write daily-rotated log files under the state directory
    #[serde(default)]
    pub file_logs: bool,

    /// Local HTTP server
    #[serde(default)]
    pub server: ServerSettings,

    /// Worker pools and stage limits
    #[serde(default)]
    pub workers: WorkerSettings,

    /// Queue and bus delivery
    #[serde(default)]
    pub delivery: DeliverySettings,

    /// Image registry
    #[serde(default)]
    pub registry: RegistrySettings,

    /// Source control API
    #[serde(default)]
    pub source_control: SourceControlSettings,
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            json_logs: false,
            file_logs: false,
            server: ServerSettings::default(),
            workers: WorkerSettings::default(),
            delivery: DeliverySettings::default(),
            registry: RegistrySettings::default(),
            source_control: SourceControlSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    #[serde(default = "default_pool_size")]
    pub clone_workers: usize,

    #[serde(default = "default_pool_size")]
    pub build_workers: usize,

    #[serde(default = "default_pool_size")]
    pub deploy_workers: usize,

    #[serde(default = "default_pool_size")]
    pub compensation_workers: usize,

    /// Wall-clock budget per stage
    #[serde(default = "default_stage_timeout")]
    pub stage_timeout_secs: u64,

    /// Attempts per stage job, first run included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_pool_size() -> usize {
    2
}

fn default_stage_timeout() -> u64 {
    600
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            clone_workers: default_pool_size(),
            build_workers: default_pool_size(),
            deploy_workers: default_pool_size(),
            compensation_workers: default_pool_size(),
            stage_timeout_secs: default_stage_timeout(),
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliverySettings {
    /// Unacknowledged events are redelivered after this window
    #[serde(default = "default_visibility")]
    pub event_visibility_secs: u64,

    /// Job lease length; should exceed the stage timeout
    #[serde(default = "default_lease")]
    pub job_lease_secs: u64,

    /// Deliveries of an image-confirmation event before the deployment fails
    #[serde(default = "default_max_image_checks")]
    pub max_image_checks: u32,
}

fn default_visibility() -> u64 {
    60
}

fn default_lease() -> u64 {
    660
}

fn default_max_image_checks() -> u32 {
    5
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            event_visibility_secs: default_visibility(),
            job_lease_secs: default_lease(),
            max_image_checks: default_max_image_checks(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySettings {
    /// Repository images are pushed to, e.g. `registry.example.com/veren/backend`
    #[serde(default = "default_repository")]
    pub repository: String,

    /// Registry v2 API base URL
    #[serde(default = "default_registry_api")]
    pub api_base_url: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

fn default_repository() -> String {
    "localhost:5000/veren/backend".to_string()
}

fn default_registry_api() -> String {
    "http://localhost:5000".to_string()
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            repository: default_repository(),
            api_base_url: default_registry_api(),
            username: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceControlSettings {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
}

fn default_api_base_url() -> String {
    "https://api.github.com".to_string()
}

impl Default for SourceControlSettings {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
        }
    }
}
