//! Home directory and manifest path resolution.
//!
//! The effective home directory is, in order of preference: an explicit
//! `APPIUM_HOME` override, the closest enclosing project that depends on the
//! host tool, or a per-user default (`~/.appium`).

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::debug;

use crate::error::{Result, StoreError};

/// Environment variable that overrides the home directory.
pub const HOME_ENV_VAR: &str = "APPIUM_HOME";

/// Environment flag that makes entry-point loads bypass loader caching, for
/// hot-reload during extension development.
pub const RELOAD_EXTENSIONS_ENV_VAR: &str = "APPIUM_RELOAD_EXTENSIONS";

/// File name of the persisted manifest.
pub const MANIFEST_BASENAME: &str = "extensions.yaml";

/// Directory name of the per-user default home.
pub const DEFAULT_HOME_DIRNAME: &str = ".appium";

const HOST_PACKAGE: &str = "appium";

/// Whether the development reload flag is set to a truthy value.
pub fn reload_extensions_enabled() -> bool {
    match std::env::var(RELOAD_EXTENSIONS_ENV_VAR) {
        Ok(value) => !value.is_empty() && value != "0" && value.to_lowercase() != "false",
        Err(_) => false,
    }
}

/// Determine the effective home directory for a process working in `cwd`.
pub async fn resolve_home_dir(cwd: impl AsRef<Path>) -> Result<PathBuf> {
    if let Ok(explicit) = std::env::var(HOME_ENV_VAR) {
        if !explicit.is_empty() {
            debug!("Using home directory from {}: {}", HOME_ENV_VAR, explicit);
            return Ok(PathBuf::from(explicit));
        }
    }
    if let Some(project) = find_local_project(cwd.as_ref()).await {
        debug!(
            "Using local project as home directory: {}",
            project.display()
        );
        return Ok(project);
    }
    default_home_dir()
}

/// The per-user fallback home directory.
pub fn default_home_dir() -> Result<PathBuf> {
    let dirs = directories::BaseDirs::new().ok_or_else(|| StoreError::PathResolution {
        source: "could not determine the user home directory".into(),
    })?;
    Ok(dirs.home_dir().join(DEFAULT_HOME_DIRNAME))
}

/// The manifest path for a home directory. When the home directory carries a
/// local installation of the host tool, the manifest lives inside that
/// installation's cache directory so it is removed along with it.
pub async fn manifest_path_for_home(home_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let home_dir = home_dir.as_ref();
    let local = has_local_install(home_dir)
        .await
        .map_err(|e| StoreError::PathResolution {
            source: Box::new(e),
        })?;
    if local {
        Ok(home_dir
            .join("node_modules")
            .join(".cache")
            .join(HOST_PACKAGE)
            .join(MANIFEST_BASENAME))
    } else {
        Ok(home_dir.join(MANIFEST_BASENAME))
    }
}

async fn has_local_install(home_dir: &Path) -> std::io::Result<bool> {
    let marker = home_dir
        .join("node_modules")
        .join(HOST_PACKAGE)
        .join("package.json");
    match fs::metadata(&marker).await {
        Ok(metadata) => Ok(metadata.is_file()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Walk up from `start` looking for a project that depends on the host
/// tool (or is the host tool itself).
async fn find_local_project(start: &Path) -> Option<PathBuf> {
    let mut current = Some(start);
    while let Some(dir) = current {
        let pkg_path = dir.join("package.json");
        if let Ok(raw) = fs::read_to_string(&pkg_path).await {
            if let Ok(pkg) = serde_json::from_str::<serde_json::Value>(&raw) {
                if depends_on_host(&pkg) {
                    return Some(dir.to_path_buf());
                }
            }
        }
        current = dir.parent();
    }
    None
}

fn depends_on_host(pkg: &serde_json::Value) -> bool {
    if pkg.get("name").and_then(serde_json::Value::as_str) == Some(HOST_PACKAGE) {
        return true;
    }
    ["dependencies", "devDependencies", "optionalDependencies"]
        .iter()
        .any(|table| pkg.get(table).and_then(|t| t.get(HOST_PACKAGE)).is_some())
}
