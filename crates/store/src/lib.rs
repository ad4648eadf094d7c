//! Appium Store - extension manifest management
//!
//! This crate owns the persisted manifest of installed driver and plugin
//! extensions for an Appium-compatible test-automation CLI. It provides:
//!
//! - **Manifest I/O**: a change-tracked, concurrency-safe store per home
//!   directory, with coalesced reads and writes over a single YAML file
//! - **Validation**: a layered rule set (generic field rules, type-specific
//!   rules, schema rules) that prunes invalid records and reports problems
//! - **Registries**: CRUD over installed drivers and plugins, with
//!   driver-specific capability-uniqueness checks
//!
//! # Examples
//!
//! ```no_run
//! use appium_store::load_extensions;
//!
//! # async fn example() -> appium_store::Result<()> {
//! let extensions = load_extensions("/home/me/.appium").await?;
//! let drivers = extensions.drivers.lock().await;
//! drivers.print(&[])?;
//! # Ok(())
//! # }
//! ```

pub mod driver;
pub mod env;
pub mod error;
pub mod models;
pub mod plugin;
pub mod registry;
pub mod schema;
pub mod store;
pub mod watched;

pub use driver::{
    create_driver_registry, current_driver_registry, reset_driver_registries, DriverRegistry,
    DriverRules,
};
pub use error::{DynError, Result, StoreError};
pub use models::{
    ExtensionRecord, ExtensionType, InstallType, Manifest, Problem, CURRENT_SCHEMA_REV,
    INSTALL_TYPES,
};
pub use plugin::{
    create_plugin_registry, current_plugin_registry, reset_plugin_registries, PluginRegistry,
    PluginRules,
};
pub use registry::{ExtensionRegistry, ExtensionRules};
pub use schema::{
    InMemorySchemaRegistrar, JsonModuleLoader, LogProblemSink, ModuleLoader, ProblemSink,
    SchemaRegistrar, ALLOWED_SCHEMA_EXTENSIONS,
};
pub use store::ManifestStore;
pub use watched::WatchedMap;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Everything the loader hands back: the store plus both registries,
/// freshly validated.
pub struct LoadedExtensions {
    pub store: ManifestStore,
    pub drivers: Arc<Mutex<DriverRegistry>>,
    pub plugins: Arc<Mutex<PluginRegistry>>,
}

/// Load the extension manifest for a home directory and build validated
/// driver and plugin registries over it.
///
/// The store is the per-home singleton; the registries replace any prior
/// instances registered for that home. Invalid records are pruned from the
/// in-memory manifest and reported; structural read failures propagate.
pub async fn load_extensions(home_dir: impl Into<PathBuf>) -> Result<LoadedExtensions> {
    let store = ManifestStore::for_home(home_dir);
    store.read(false).await?;

    let drivers = create_driver_registry(store.clone());
    let plugins = create_plugin_registry(store.clone());
    drivers.lock().await.validate().await?;
    plugins.lock().await.validate().await?;

    Ok(LoadedExtensions {
        store,
        drivers,
        plugins,
    })
}
