//! Project documents
//!
//! Projects are owned by the control plane. The deployment services only
//! read them.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitSettings {
    pub repo_url: String,
    #[serde(default = "default_branch")]
    pub branch: String,
}

fn default_branch() -> String {
    "main".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoPaths {
    #[serde(default = "default_frontend_dir")]
    pub frontend_dir_path: String,
    #[serde(default = "default_backend_dir")]
    pub backend_dir_path: String,
}

fn default_frontend_dir() -> String {
    "./frontend".to_string()
}

fn default_backend_dir() -> String {
    "./backend".to_string()
}

impl Default for RepoPaths {
    fn default() -> Self {
        Self {
            frontend_dir_path: default_frontend_dir(),
            backend_dir_path: default_backend_dir(),
        }
    }
}

/// User-declared overrides for detected build settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildHints {
    #[serde(default)]
    pub framework: Option<String>,
    #[serde(default)]
    pub frontend_build_command: Option<String>,
    #[serde(default)]
    pub frontend_install_command: Option<String>,
    #[serde(default)]
    pub backend_install_command: Option<String>,
    #[serde(default)]
    pub frontend_out_dir: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envs {
    #[serde(default)]
    pub frontend_env: Vec<EnvVar>,
    #[serde(default)]
    pub backend_env: Vec<EnvVar>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSettings {
    #[serde(default)]
    pub backend_port: Option<u16>,
}

/// A registered repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub project_id: String,
    pub name: String,
    pub owner_id: String,
    pub git: GitSettings,
    #[serde(default)]
    pub repo_path: RepoPaths,
    #[serde(default)]
    pub build: BuildHints,
    #[serde(default)]
    pub envs: Envs,
    #[serde(default)]
    pub runtime: RuntimeSettings,
}
