//! Build configuration detection
//!
//! Derives a [`RepoConfig`] from the files of a checkout. Project build hints
//! take precedence over anything detected.

use std::path::Path;

use serde_json::Value;
use tracing::debug;
use veren_domain::{BackendConfig, BuildHints, Framework, FrontendConfig, PackageManager, RepoConfig};

use crate::errors::PlatformError;
use crate::filesys::file::File;

const DEFAULT_NODE_VERSION: &str = "18";
/// Used when `engines.node` is declared but carries no version number
const UNPARSED_ENGINE_VERSION: &str = "20";
const NO_BUILD_SCRIPT: &str = "echo 'No build script defined'";

/// Detect the configuration of both app directories under `repo_root`.
pub async fn detect_config(
    repo_root: &Path,
    frontend_dir: &str,
    backend_dir: &str,
    hints: &BuildHints,
) -> Result<RepoConfig, PlatformError> {
    let frontend = detect_frontend(&repo_root.join(frontend_dir), frontend_dir, hints).await?;
    let backend = detect_backend(&repo_root.join(backend_dir), backend_dir, hints).await?;
    Ok(RepoConfig { frontend, backend })
}

async fn detect_frontend(dir: &Path, rel_dir: &str, hints: &BuildHints) -> Result<FrontendConfig, PlatformError> {
    let manifest = read_manifest(dir).await?;

    let framework = match hints.framework.as_deref() {
        Some(name) => name
            .parse::<Framework>()
            .map_err(PlatformError::ValidationError)?,
        None => manifest.as_ref().map(detect_framework).unwrap_or(Framework::Static),
    };
    let package_manager = detect_package_manager(dir).await;
    let runtime_version = detect_runtime_version(dir, manifest.as_ref()).await;

    let build_command = hints.frontend_build_command.clone().unwrap_or_else(|| {
        manifest
            .as_ref()
            .and_then(|m| m.pointer("/scripts/build"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| default_build_command(framework).to_string())
    });
    let install_command = hints
        .frontend_install_command
        .clone()
        .unwrap_or_else(|| package_manager.install_command().to_string());
    let out_dir = hints
        .frontend_out_dir
        .clone()
        .unwrap_or_else(|| default_out_dir(framework).to_string());

    debug!(framework = framework.as_str(), "Detected frontend in {}", rel_dir);
    Ok(FrontendConfig {
        dir: rel_dir.to_string(),
        runtime_version,
        framework,
        package_manager,
        install_command,
        build_command,
        out_dir,
    })
}

async fn detect_backend(dir: &Path, rel_dir: &str, hints: &BuildHints) -> Result<BackendConfig, PlatformError> {
    let manifest = read_manifest(dir).await?;
    let runtime_version = detect_runtime_version(dir, manifest.as_ref()).await;
    let install_command = match &hints.backend_install_command {
        Some(command) => command.clone(),
        None => detect_package_manager(dir).await.install_command().to_string(),
    };

    Ok(BackendConfig {
        dir: rel_dir.to_string(),
        runtime_version,
        install_command,
    })
}

/// `package.json`, `None` when absent
async fn read_manifest(dir: &Path) -> Result<Option<Value>, PlatformError> {
    let file = File::new(dir.join("package.json"));
    if !file.exists().await {
        return Ok(None);
    }
    let contents = file.read_string().await?;
    serde_json::from_str(&contents)
        .map(Some)
        .map_err(|e| PlatformError::ValidationError(format!("Invalid package.json in {}: {}", dir.display(), e)))
}

fn has_dependency(manifest: &Value, name: &str) -> bool {
    ["dependencies", "devDependencies"]
        .iter()
        .any(|section| manifest.get(section).and_then(|deps| deps.get(name)).is_some())
}

pub fn detect_framework(manifest: &Value) -> Framework {
    if has_dependency(manifest, "next") {
        Framework::Nextjs
    } else if has_dependency(manifest, "vue") || has_dependency(manifest, "vue-router") {
        Framework::Vue
    } else if has_dependency(manifest, "react") && has_dependency(manifest, "react-scripts") {
        Framework::React
    } else if has_dependency(manifest, "vite") {
        Framework::Vite
    } else {
        Framework::Static
    }
}

async fn detect_package_manager(dir: &Path) -> PackageManager {
    if File::new(dir.join("pnpm-lock.yaml")).exists().await {
        PackageManager::Pnpm
    } else if File::new(dir.join("yarn.lock")).exists().await {
        PackageManager::Yarn
    } else {
        PackageManager::Npm
    }
}

async fn detect_runtime_version(dir: &Path, manifest: Option<&Value>) -> String {
    for name in [".nvmrc", ".node-version"] {
        if let Ok(contents) = File::new(dir.join(name)).read_string().await {
            if let Some(version) = normalize_version(&contents) {
                return version;
            }
        }
    }

    manifest
        .and_then(|m| m.pointer("/engines/node"))
        .and_then(Value::as_str)
        .map(|range| major_from_range(range).unwrap_or_else(|| UNPARSED_ENGINE_VERSION.to_string()))
        .unwrap_or_else(|| DEFAULT_NODE_VERSION.to_string())
}

/// `v20.11.0\n` gives `20.11.0`
fn normalize_version(raw: &str) -> Option<String> {
    let version = raw.trim().trim_start_matches('v');
    (!version.is_empty()).then(|| version.to_string())
}

/// First integer of a semver range: `>=18.0.0 <21` gives `18`
fn major_from_range(range: &str) -> Option<String> {
    let start = range.find(|c: char| c.is_ascii_digit())?;
    let digits: String = range[start..].chars().take_while(|c| c.is_ascii_digit()).collect();
    Some(digits)
}

fn default_build_command(framework: Framework) -> &'static str {
    match framework {
        Framework::Nextjs => "npx next build",
        Framework::Vue => "npx vue-cli-service build",
        Framework::React => "npx react-scripts build",
        Framework::Vite => "npx vite build",
        Framework::Static => NO_BUILD_SCRIPT,
    }
}

fn default_out_dir(framework: Framework) -> &'static str {
    match framework {
        Framework::Nextjs => ".next",
        Framework::Vue | Framework::Vite | Framework::React => "build",
        Framework::Static => "dist",
    }
}
