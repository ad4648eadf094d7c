//! Generic validation pipeline and CRUD over one extension type's records.
//!
//! [`ExtensionRegistry`] owns no records itself; it operates on its slice
//! of the manifest held by the bound [`ManifestStore`], so every registry
//! bound to the same store sees the same data. Type-specific checks are
//! supplied by an [`ExtensionRules`] implementation.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use serde_yaml::Value;
use tracing::info;

use crate::env;
use crate::error::{Result, StoreError};
use crate::models::{fields, ExtensionRecord, ExtensionType, Problem, INSTALL_TYPES};
use crate::schema::{
    unwrap_default_export, InMemorySchemaRegistrar, JsonModuleLoader, LogProblemSink,
    ModuleLoader, ProblemSink, SchemaRegistrar, ALLOWED_SCHEMA_EXTENSIONS,
};
use crate::store::ManifestStore;

/// Type-specific validation hooks. The registry calls `begin_pass` at the
/// start of every validation pass, then `config_problems` once per record
/// in mapping order.
pub trait ExtensionRules: Send + Sync {
    fn extension_type(&self) -> ExtensionType;

    /// Reset any per-pass state, such as cross-record uniqueness trackers.
    fn begin_pass(&mut self) {}

    fn config_problems(&mut self, record: &ExtensionRecord) -> Vec<Problem> {
        let _ = record;
        Vec::new()
    }

    /// One-line human-readable description of an installed extension.
    fn extension_desc(&self, name: &str, record: &ExtensionRecord) -> String {
        format!("{}@{}", name, record.version().unwrap_or("unknown"))
    }
}

/// CRUD and validation over one extension type's slice of the manifest.
pub struct ExtensionRegistry<R: ExtensionRules> {
    rules: R,
    store: ManifestStore,
    registrar: Arc<dyn SchemaRegistrar>,
    loader: Arc<dyn ModuleLoader>,
    sink: Arc<dyn ProblemSink>,
}

impl<R: ExtensionRules> ExtensionRegistry<R> {
    pub fn new(rules: R, store: ManifestStore) -> Self {
        Self {
            rules,
            store,
            registrar: Arc::new(InMemorySchemaRegistrar::new()),
            loader: Arc::new(JsonModuleLoader::new()),
            sink: Arc::new(LogProblemSink),
        }
    }

    pub fn with_registrar(mut self, registrar: Arc<dyn SchemaRegistrar>) -> Self {
        self.registrar = registrar;
        self
    }

    pub fn with_loader(mut self, loader: Arc<dyn ModuleLoader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ProblemSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn extension_type(&self) -> ExtensionType {
        self.rules.extension_type()
    }

    pub fn store(&self) -> &ManifestStore {
        &self.store
    }

    /// Validate every record of this registry's type, removing records
    /// with problems from the manifest and reporting them through the
    /// sink. Returns the surviving records. Per-record problems never
    /// fail the call; only structural store errors do.
    pub async fn validate(&mut self) -> Result<BTreeMap<String, ExtensionRecord>> {
        let extension_type = self.rules.extension_type();
        let snapshot: Vec<(String, ExtensionRecord)> = self.store.with_manifest(|m| {
            m.records(extension_type)
                .iter()
                .map(|(name, record)| (name.clone(), record.clone()))
                .collect()
        })?;

        self.rules.begin_pass();
        let mut report = String::new();
        let mut pruned = Vec::new();

        for (name, record) in &snapshot {
            let mut problems = general_problems(record);
            problems.extend(self.rules.config_problems(record));
            problems.extend(self.schema_problems(name, record).await);
            if problems.is_empty() {
                continue;
            }
            pruned.push(name.clone());
            let _ = writeln!(report, "  {extension_type} '{name}':");
            for problem in &problems {
                let _ = writeln!(report, "    - {problem}");
            }
        }

        if !pruned.is_empty() {
            self.store.with_manifest_mut(|m| {
                let records = m.records_mut(extension_type);
                for name in &pruned {
                    records.remove(name);
                }
            })?;

            let path = self.store.manifest_path().await?;
            self.sink.report(&format!(
                "Problems were found while validating {extension_type}s in manifest {}:\n{}",
                path.display(),
                report.trim_end()
            ));
        }

        self.installed_extensions()
    }

    async fn schema_problems(&self, name: &str, record: &ExtensionRecord) -> Vec<Problem> {
        let Some(schema) = record.get(fields::SCHEMA) else {
            return Vec::new();
        };
        let extension_type = self.rules.extension_type();
        match schema {
            Value::String(path) => {
                if !self.registrar.is_allowed_schema_file_extension(path) {
                    return vec![Problem::new(
                        format!(
                            "`schema` file path must have one of these extensions: {}",
                            ALLOWED_SCHEMA_EXTENSIONS.join(", ")
                        ),
                        Some(schema),
                    )];
                }
                let Some(install_path) = record.install_path() else {
                    return vec![Problem::new(
                        "`schema` could not be loaded because `installPath` is not a string",
                        Some(schema),
                    )];
                };
                let install_dir = self.store.home_dir().join(install_path);
                let pkg_name = record.pkg_name().unwrap_or_default();
                match self.loader.load_value(&install_dir, pkg_name, path).await {
                    Ok(value) => {
                        let value = unwrap_default_export(value);
                        self.register_schema(extension_type, name, value, schema)
                    }
                    Err(e) => vec![Problem::new(
                        format!("unable to load schema from `{path}`: {e}"),
                        Some(schema),
                    )],
                }
            }
            Value::Mapping(_) => match serde_json::to_value(schema) {
                Ok(value) => self.register_schema(extension_type, name, value, schema),
                Err(e) => vec![Problem::new(
                    format!("unable to register schema: {e}"),
                    Some(schema),
                )],
            },
            _ => vec![Problem::new(
                "`schema` field must be a path to a schema file or a schema object",
                Some(schema),
            )],
        }
    }

    fn register_schema(
        &self,
        extension_type: ExtensionType,
        name: &str,
        value: serde_json::Value,
        original: &Value,
    ) -> Vec<Problem> {
        match self.registrar.register(extension_type, name, value) {
            Ok(()) => Vec::new(),
            Err(e) => vec![Problem::new(
                format!("unable to register schema: {e}"),
                Some(original),
            )],
        }
    }

    /// Record a newly installed extension and persist the manifest.
    pub async fn add_extension(&self, name: &str, record: ExtensionRecord) -> Result<()> {
        let extension_type = self.rules.extension_type();
        self.store.with_manifest_mut(|m| {
            m.records_mut(extension_type).insert(name, record);
        })?;
        self.store.write(false).await?;
        info!("Registered {extension_type} '{name}'");
        Ok(())
    }

    /// Shallow-merge `patch` into an installed extension's record and
    /// persist the manifest. Returns the merged record.
    pub async fn update_extension(
        &self,
        name: &str,
        patch: ExtensionRecord,
    ) -> Result<ExtensionRecord> {
        let extension_type = self.rules.extension_type();
        let merged = self.store.with_manifest_mut(|m| {
            let records = m.records_mut(extension_type);
            let Some(current) = records.get(name) else {
                return Err(StoreError::ExtensionNotFound(name.to_string()));
            };
            let mut merged = current.clone();
            merged.merge(&patch);
            records.insert(name, merged.clone());
            Ok(merged)
        })??;
        self.store.write(false).await?;
        Ok(merged)
    }

    /// Remove an extension's record and persist the manifest. Returns
    /// whether the extension was present.
    pub async fn remove_extension(&self, name: &str) -> Result<bool> {
        let extension_type = self.rules.extension_type();
        let removed = self.store.with_manifest_mut(|m| {
            m.records_mut(extension_type).remove(name).is_some()
        })?;
        self.store.write(false).await?;
        if removed {
            info!("Removed {extension_type} '{name}'");
        }
        Ok(removed)
    }

    pub fn is_installed(&self, name: &str) -> Result<bool> {
        let extension_type = self.rules.extension_type();
        self.store
            .with_manifest(|m| m.records(extension_type).contains_key(name))
    }

    pub fn installed_extension(&self, name: &str) -> Result<Option<ExtensionRecord>> {
        let extension_type = self.rules.extension_type();
        self.store
            .with_manifest(|m| m.records(extension_type).get(name).cloned())
    }

    /// Snapshot of all records of this registry's type.
    pub fn installed_extensions(&self) -> Result<BTreeMap<String, ExtensionRecord>> {
        let extension_type = self.rules.extension_type();
        self.store
            .with_manifest(|m| m.records(extension_type).snapshot())
    }

    /// Emit a human-readable listing of installed extensions, marking the
    /// ones named in `active_names`.
    pub fn print(&self, active_names: &[&str]) -> Result<()> {
        let extension_type = self.rules.extension_type();
        let records = self.installed_extensions()?;
        if records.is_empty() {
            info!(
                "No {extension_type}s have been installed. \
                 Run \"appium {extension_type} install <name>\" to add one"
            );
            return Ok(());
        }
        info!("Available {extension_type}s:");
        for (name, record) in &records {
            let marker = if active_names.contains(&name.as_str()) {
                " [active]"
            } else {
                ""
            };
            let install_type = record.get_str(fields::INSTALL_TYPE).unwrap_or("unknown");
            info!(
                "  - {} [{install_type}]{marker}",
                self.rules.extension_desc(name, record)
            );
        }
        Ok(())
    }

    /// Absolute directory an extension is installed into.
    pub fn install_path(&self, name: &str) -> Result<PathBuf> {
        let record = self.required_record(name)?;
        let relative = record.install_path().ok_or_else(|| StoreError::InvalidRecord {
            name: name.to_string(),
            reason: "`installPath` field must be a string".to_string(),
        })?;
        Ok(self.store.home_dir().join(relative))
    }

    /// Location of an extension's installed package code.
    pub fn extension_module_path(&self, name: &str) -> Result<PathBuf> {
        let record = self.required_record(name)?;
        let pkg_name = record.pkg_name().ok_or_else(|| StoreError::InvalidRecord {
            name: name.to_string(),
            reason: "`pkgName` field must be a string".to_string(),
        })?;
        Ok(self.install_path(name)?.join("node_modules").join(pkg_name))
    }

    /// Load an extension's entry point: the export named by its
    /// `mainClass` field. Honors the development reload flag by bypassing
    /// loader caching. Failures propagate to the caller.
    pub async fn load_entry_point(&self, name: &str) -> Result<Box<dyn Any + Send + Sync>> {
        let record = self.required_record(name)?;
        let pkg_name = record.pkg_name().ok_or_else(|| StoreError::InvalidRecord {
            name: name.to_string(),
            reason: "`pkgName` field must be a string".to_string(),
        })?;
        let main_class = record.main_class().ok_or_else(|| StoreError::InvalidRecord {
            name: name.to_string(),
            reason: "`mainClass` field must be a string".to_string(),
        })?;
        let install_dir = self.install_path(name)?;
        let bypass_cache = env::reload_extensions_enabled();
        self.loader
            .load_symbol(&install_dir, pkg_name, main_class, bypass_cache)
            .await
            .map_err(|source| StoreError::EntryPointLoad {
                name: name.to_string(),
                source,
            })
    }

    fn required_record(&self, name: &str) -> Result<ExtensionRecord> {
        self.installed_extension(name)?
            .ok_or_else(|| StoreError::ExtensionNotFound(name.to_string()))
    }
}

/// Field checks shared by every extension type.
fn general_problems(record: &ExtensionRecord) -> Vec<Problem> {
    let mut problems = Vec::new();
    for field in [fields::VERSION, fields::PKG_NAME, fields::INSTALL_SPEC] {
        if record.get_str(field).is_none() {
            problems.push(Problem::new(
                format!("`{field}` field must be a string"),
                record.get(field),
            ));
        }
    }
    match record.get_str(fields::INSTALL_TYPE) {
        Some(install_type) if INSTALL_TYPES.contains(&install_type) => {}
        _ => problems.push(Problem::new(
            format!(
                "`installType` field must be one of: {}",
                INSTALL_TYPES.join(", ")
            ),
            record.get(fields::INSTALL_TYPE),
        )),
    }
    for field in [fields::INSTALL_PATH, fields::MAIN_CLASS] {
        if record.get_str(field).is_none() {
            problems.push(Problem::new(
                format!("`{field}` field must be a string"),
                record.get(field),
            ));
        }
    }
    problems
}
