//! Plugin-specific rules and the per-home plugin registry cache.
//!
//! Plugins currently have no structural rules beyond the generic ones.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::Lazy;
use tokio::sync::Mutex;

use crate::models::ExtensionType;
use crate::registry::{ExtensionRegistry, ExtensionRules};
use crate::store::ManifestStore;

const POISONED: &str = "plugin registry cache mutex poisoned";

pub type PluginRegistry = ExtensionRegistry<PluginRules>;

static PLUGIN_REGISTRIES: Lazy<std::sync::Mutex<HashMap<PathBuf, Arc<Mutex<PluginRegistry>>>>> =
    Lazy::new(|| std::sync::Mutex::new(HashMap::new()));

#[derive(Debug, Default)]
pub struct PluginRules;

impl ExtensionRules for PluginRules {
    fn extension_type(&self) -> ExtensionType {
        ExtensionType::Plugin
    }
}

/// Create the plugin registry for `store`'s home directory, replacing any
/// previously registered instance for that home.
pub fn create_plugin_registry(store: ManifestStore) -> Arc<Mutex<PluginRegistry>> {
    let home_dir = store.home_dir().to_path_buf();
    let registry = Arc::new(Mutex::new(ExtensionRegistry::new(PluginRules, store)));
    PLUGIN_REGISTRIES
        .lock()
        .expect(POISONED)
        .insert(home_dir, Arc::clone(&registry));
    registry
}

/// The most recently created plugin registry for a home directory, if any.
pub fn current_plugin_registry(home_dir: impl AsRef<Path>) -> Option<Arc<Mutex<PluginRegistry>>> {
    PLUGIN_REGISTRIES
        .lock()
        .expect(POISONED)
        .get(home_dir.as_ref())
        .cloned()
}

/// Drop all cached plugin registries. Intended for test isolation.
pub fn reset_plugin_registries() {
    PLUGIN_REGISTRIES.lock().expect(POISONED).clear();
}
