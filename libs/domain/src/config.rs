//! Build configuration derived from a repository

use serde::{Deserialize, Serialize};

/// Frontend framework detected from the package manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framework {
    Nextjs,
    Vue,
    React,
    Vite,
    Static,
}

impl Framework {
    pub fn as_str(&self) -> &'static str {
        match self {
            Framework::Nextjs => "nextjs",
            Framework::Vue => "vue",
            Framework::React => "react",
            Framework::Vite => "vite",
            Framework::Static => "static",
        }
    }
}

impl std::str::FromStr for Framework {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "nextjs" | "next" => Ok(Framework::Nextjs),
            "vue" => Ok(Framework::Vue),
            "react" => Ok(Framework::React),
            "vite" => Ok(Framework::Vite),
            "static" => Ok(Framework::Static),
            _ => Err(format!("Invalid framework: {}", s)),
        }
    }
}

/// Node package manager, chosen by lockfile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    Npm,
    Yarn,
    Pnpm,
}

impl PackageManager {
    pub fn install_command(&self) -> &'static str {
        match self {
            PackageManager::Npm => "npm install",
            PackageManager::Yarn => "yarn install --frozen-lockfile",
            PackageManager::Pnpm => "pnpm install --frozen-lockfile",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrontendConfig {
    /// Directory relative to the repository root
    pub dir: String,
    pub runtime_version: String,
    pub framework: Framework,
    pub package_manager: PackageManager,
    pub install_command: String,
    pub build_command: String,
    /// Build output directory relative to `dir`
    pub out_dir: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    /// Directory relative to the repository root
    pub dir: String,
    pub runtime_version: String,
    pub install_command: String,
}

/// Output of repository analysis, consumed by the build stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoConfig {
    pub frontend: FrontendConfig,
    pub backend: BackendConfig,
}
