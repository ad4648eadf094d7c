//! Driver-specific validation rules and the per-home driver registry
//! cache.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::Lazy;
use serde_yaml::Value;
use tokio::sync::Mutex;

use crate::models::{fields, ExtensionRecord, ExtensionType, Problem};
use crate::registry::{ExtensionRegistry, ExtensionRules};
use crate::store::ManifestStore;

const POISONED: &str = "driver registry cache mutex poisoned";

pub type DriverRegistry = ExtensionRegistry<DriverRules>;

static DRIVER_REGISTRIES: Lazy<std::sync::Mutex<HashMap<PathBuf, Arc<Mutex<DriverRegistry>>>>> =
    Lazy::new(|| std::sync::Mutex::new(HashMap::new()));

/// Rules for driver records. Beyond the generic checks, drivers must carry
/// a non-empty list of platform names and an automation name that no other
/// driver in the same manifest claims.
#[derive(Debug, Default)]
pub struct DriverRules {
    seen_automation_names: HashSet<String>,
}

impl ExtensionRules for DriverRules {
    fn extension_type(&self) -> ExtensionType {
        ExtensionType::Driver
    }

    fn begin_pass(&mut self) {
        self.seen_automation_names.clear();
    }

    fn config_problems(&mut self, record: &ExtensionRecord) -> Vec<Problem> {
        let mut problems = Vec::new();

        match record.get(fields::PLATFORM_NAMES) {
            Some(Value::Sequence(platforms)) => {
                if platforms.is_empty() {
                    problems.push(Problem::new(
                        "`platformNames` must be a non-empty array of strings",
                        record.get(fields::PLATFORM_NAMES),
                    ));
                } else {
                    for platform in platforms {
                        if !platform.is_string() {
                            problems.push(Problem::new(
                                "`platformNames` contains a non-string member",
                                Some(platform),
                            ));
                        }
                    }
                }
            }
            other => problems.push(Problem::new(
                "`platformNames` field must be an array of strings",
                other,
            )),
        }

        match record.automation_name() {
            Some(automation_name) => {
                if self.seen_automation_names.contains(automation_name) {
                    problems.push(Problem::new(
                        "`automationName` is already claimed by another driver in this manifest",
                        record.get(fields::AUTOMATION_NAME),
                    ));
                }
                // Recorded regardless of the duplicate outcome, so later
                // duplicates are still caught.
                self.seen_automation_names.insert(automation_name.to_string());
            }
            None => problems.push(Problem::new(
                "`automationName` field must be a string",
                record.get(fields::AUTOMATION_NAME),
            )),
        }

        problems
    }

    fn extension_desc(&self, name: &str, record: &ExtensionRecord) -> String {
        format!(
            "{}@{} (automationName '{}')",
            name,
            record.version().unwrap_or("unknown"),
            record.automation_name().unwrap_or("unknown")
        )
    }
}

/// Create the driver registry for `store`'s home directory, replacing any
/// previously registered instance for that home.
pub fn create_driver_registry(store: ManifestStore) -> Arc<Mutex<DriverRegistry>> {
    let home_dir = store.home_dir().to_path_buf();
    let registry = Arc::new(Mutex::new(ExtensionRegistry::new(
        DriverRules::default(),
        store,
    )));
    DRIVER_REGISTRIES
        .lock()
        .expect(POISONED)
        .insert(home_dir, Arc::clone(&registry));
    registry
}

/// The most recently created driver registry for a home directory, if any.
pub fn current_driver_registry(home_dir: impl AsRef<Path>) -> Option<Arc<Mutex<DriverRegistry>>> {
    DRIVER_REGISTRIES
        .lock()
        .expect(POISONED)
        .get(home_dir.as_ref())
        .cloned()
}

/// Drop all cached driver registries. Intended for test isolation.
pub fn reset_driver_registries() {
    DRIVER_REGISTRIES.lock().expect(POISONED).clear();
}
