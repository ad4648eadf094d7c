//! Collaborator interfaces for schema registration and module loading.
//!
//! The store validates and registers extension config schemas but does not
//! own the schema system or the platform's module loader; both are consumed
//! through the traits here. Defaults are provided for embedders and tests
//! that do not bring their own.

use std::any::Any;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::{debug, error};

use crate::error::DynError;
use crate::models::ExtensionType;

const POISONED: &str = "schema registrar mutex poisoned";

/// File extensions a string-valued `schema` field may point at.
pub const ALLOWED_SCHEMA_EXTENSIONS: [&str; 3] = [".json", ".js", ".cjs"];

/// Registrar consuming `(type, name, schema)` tuples. Registration may be
/// rejected, in which case the failure becomes a validation problem on the
/// offending record.
pub trait SchemaRegistrar: Send + Sync {
    fn register(
        &self,
        extension_type: ExtensionType,
        extension_name: &str,
        schema: serde_json::Value,
    ) -> std::result::Result<(), DynError>;

    fn is_allowed_schema_file_extension(&self, path: &str) -> bool {
        ALLOWED_SCHEMA_EXTENSIONS
            .iter()
            .any(|ext| path.ends_with(ext))
    }
}

/// Default registrar retaining registered schemas in memory. Rejects
/// payloads that are not objects.
#[derive(Debug, Default)]
pub struct InMemorySchemaRegistrar {
    schemas: Mutex<HashMap<(ExtensionType, String), serde_json::Value>>,
}

impl InMemorySchemaRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, extension_type: ExtensionType, name: &str) -> Option<serde_json::Value> {
        self.schemas
            .lock()
            .expect(POISONED)
            .get(&(extension_type, name.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.schemas.lock().expect(POISONED).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SchemaRegistrar for InMemorySchemaRegistrar {
    fn register(
        &self,
        extension_type: ExtensionType,
        extension_name: &str,
        schema: serde_json::Value,
    ) -> std::result::Result<(), DynError> {
        if !schema.is_object() {
            return Err(format!(
                "schema for {extension_type} '{extension_name}' must be an object"
            )
            .into());
        }
        debug!("Registered schema for {extension_type} '{extension_name}'");
        self.schemas
            .lock()
            .expect(POISONED)
            .insert((extension_type, extension_name.to_string()), schema);
        Ok(())
    }
}

/// Loader resolving package-relative paths inside an extension's installed
/// code to data modules (schemas) and exported entry-point symbols.
#[async_trait]
pub trait ModuleLoader: Send + Sync {
    /// Load a data module, such as a schema file, from the package
    /// `pkg_name` installed under `install_dir`.
    async fn load_value(
        &self,
        install_dir: &Path,
        pkg_name: &str,
        relative: &str,
    ) -> std::result::Result<serde_json::Value, DynError>;

    /// Load the exported symbol serving as an extension's entry point.
    /// `bypass_cache` discards any cached prior load of the same location.
    async fn load_symbol(
        &self,
        install_dir: &Path,
        pkg_name: &str,
        symbol: &str,
        bypass_cache: bool,
    ) -> std::result::Result<Box<dyn Any + Send + Sync>, DynError>;
}

/// If a loaded module is a transpiled-module wrapper carrying a `default`
/// payload, use the payload; otherwise use the value directly.
pub fn unwrap_default_export(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(mut map)
            if map
                .get("__esModule")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false)
                && map.contains_key("default") =>
        {
            map.remove("default").unwrap_or(serde_json::Value::Null)
        }
        other => other,
    }
}

/// Default loader for data modules laid out in `node_modules` fashion.
/// Only JSON modules can be loaded; executable entry points need a loader
/// supplied by the embedding platform.
#[derive(Debug, Default)]
pub struct JsonModuleLoader {
    cache: Mutex<HashMap<PathBuf, serde_json::Value>>,
}

impl JsonModuleLoader {
    pub fn new() -> Self {
        Self::default()
    }

    fn module_path(install_dir: &Path, pkg_name: &str, relative: &str) -> PathBuf {
        install_dir.join("node_modules").join(pkg_name).join(relative)
    }
}

#[async_trait]
impl ModuleLoader for JsonModuleLoader {
    async fn load_value(
        &self,
        install_dir: &Path,
        pkg_name: &str,
        relative: &str,
    ) -> std::result::Result<serde_json::Value, DynError> {
        let path = Self::module_path(install_dir, pkg_name, relative);
        if let Some(hit) = self.cache.lock().expect(POISONED).get(&path) {
            return Ok(hit.clone());
        }
        if !relative.ends_with(".json") {
            return Err(format!(
                "cannot load module at {}: the built-in loader only supports JSON modules",
                path.display()
            )
            .into());
        }
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| format!("could not read {}: {e}", path.display()))?;
        let value: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|e| format!("could not parse {}: {e}", path.display()))?;
        self.cache
            .lock()
            .expect(POISONED)
            .insert(path, value.clone());
        Ok(value)
    }

    async fn load_symbol(
        &self,
        install_dir: &Path,
        pkg_name: &str,
        symbol: &str,
        bypass_cache: bool,
    ) -> std::result::Result<Box<dyn Any + Send + Sync>, DynError> {
        if bypass_cache {
            self.cache.lock().expect(POISONED).clear();
        }
        let path = Self::module_path(install_dir, pkg_name, "");
        Err(format!(
            "cannot load entry point '{symbol}' from {}: executable modules require a loader \
             supplied by the embedding platform",
            path.display()
        )
        .into())
    }
}

/// Sink for validation problem reports.
pub trait ProblemSink: Send + Sync {
    fn report(&self, message: &str);
}

/// Default sink emitting reports at error level.
#[derive(Debug, Default)]
pub struct LogProblemSink;

impl ProblemSink for LogProblemSink {
    fn report(&self, message: &str) {
        error!("{message}");
    }
}
