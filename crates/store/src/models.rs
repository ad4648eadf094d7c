use std::fmt::{self, Display};
use std::str::FromStr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use crate::watched::WatchedMap;

/// Current manifest schema revision. Written into every persisted manifest
/// and assumed for manifests that omit the field.
pub const CURRENT_SCHEMA_REV: u32 = 2;

/// Field names as they appear in the persisted manifest.
pub mod fields {
    pub const PKG_NAME: &str = "pkgName";
    pub const VERSION: &str = "version";
    pub const INSTALL_SPEC: &str = "installSpec";
    pub const INSTALL_TYPE: &str = "installType";
    pub const INSTALL_PATH: &str = "installPath";
    pub const MAIN_CLASS: &str = "mainClass";
    pub const SCRIPTS: &str = "scripts";
    pub const SCHEMA: &str = "schema";
    pub const AUTOMATION_NAME: &str = "automationName";
    pub const PLATFORM_NAMES: &str = "platformNames";
    pub const DRIVER_NAME: &str = "driverName";
    pub const PLUGIN_NAME: &str = "pluginName";
}

/// The two kinds of installable extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtensionType {
    Driver,
    Plugin,
}

impl ExtensionType {
    /// Key of this type's record mapping in the manifest document.
    pub fn manifest_key(&self) -> &'static str {
        match self {
            ExtensionType::Driver => "drivers",
            ExtensionType::Plugin => "plugins",
        }
    }
}

impl Display for ExtensionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtensionType::Driver => write!(f, "driver"),
            ExtensionType::Plugin => write!(f, "plugin"),
        }
    }
}

/// Where an extension was installed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallType {
    Npm,
    Local,
    Github,
    Git,
}

/// Valid values of the `installType` field, in display order.
pub const INSTALL_TYPES: [&str; 4] = ["npm", "local", "github", "git"];

impl Display for InstallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstallType::Npm => write!(f, "npm"),
            InstallType::Local => write!(f, "local"),
            InstallType::Github => write!(f, "github"),
            InstallType::Git => write!(f, "git"),
        }
    }
}

impl FromStr for InstallType {
    type Err = &'static str;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "npm" => Ok(InstallType::Npm),
            "local" => Ok(InstallType::Local),
            "github" => Ok(InstallType::Github),
            "git" => Ok(InstallType::Git),
            _ => Err("unknown install type"),
        }
    }
}

/// One extension's metadata as stored in the manifest.
///
/// Records are kept loosely typed: manifests are hand-editable, and
/// validation must be able to inspect wrong-typed fields and prune the
/// offending record instead of failing the whole manifest parse. Typed
/// accessors return `None` for missing or wrong-typed fields.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtensionRecord(pub Mapping);

impl ExtensionRecord {
    /// Create a record carrying the fields common to every extension type.
    pub fn new(
        pkg_name: impl Into<String>,
        version: impl Into<String>,
        install_spec: impl Into<String>,
        install_type: InstallType,
        install_path: impl Into<String>,
        main_class: impl Into<String>,
    ) -> Self {
        let mut record = ExtensionRecord::default();
        record.set(fields::PKG_NAME, pkg_name.into());
        record.set(fields::VERSION, version.into());
        record.set(fields::INSTALL_SPEC, install_spec.into());
        record.set(fields::INSTALL_TYPE, install_type.to_string());
        record.set(fields::INSTALL_PATH, install_path.into());
        record.set(fields::MAIN_CLASS, main_class.into());
        record
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }

    pub fn set(&mut self, field: &str, value: impl Into<Value>) {
        self.0.insert(Value::String(field.to_string()), value.into());
    }

    pub fn pkg_name(&self) -> Option<&str> {
        self.get_str(fields::PKG_NAME)
    }

    pub fn version(&self) -> Option<&str> {
        self.get_str(fields::VERSION)
    }

    pub fn install_spec(&self) -> Option<&str> {
        self.get_str(fields::INSTALL_SPEC)
    }

    pub fn install_type(&self) -> Option<InstallType> {
        self.get_str(fields::INSTALL_TYPE)?.parse().ok()
    }

    pub fn install_path(&self) -> Option<&str> {
        self.get_str(fields::INSTALL_PATH)
    }

    pub fn main_class(&self) -> Option<&str> {
        self.get_str(fields::MAIN_CLASS)
    }

    pub fn scripts(&self) -> Option<&Mapping> {
        self.get(fields::SCRIPTS).and_then(Value::as_mapping)
    }

    pub fn schema(&self) -> Option<&Value> {
        self.get(fields::SCHEMA)
    }

    pub fn automation_name(&self) -> Option<&str> {
        self.get_str(fields::AUTOMATION_NAME)
    }

    pub fn platform_names(&self) -> Option<&Vec<Value>> {
        self.get(fields::PLATFORM_NAMES).and_then(Value::as_sequence)
    }

    pub fn driver_name(&self) -> Option<&str> {
        self.get_str(fields::DRIVER_NAME)
    }

    pub fn plugin_name(&self) -> Option<&str> {
        self.get_str(fields::PLUGIN_NAME)
    }

    pub fn with_automation_name(mut self, automation_name: impl Into<String>) -> Self {
        self.set(fields::AUTOMATION_NAME, automation_name.into());
        self
    }

    pub fn with_platform_names<I, S>(mut self, platform_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<Value> = platform_names
            .into_iter()
            .map(|name| Value::String(name.into()))
            .collect();
        self.set(fields::PLATFORM_NAMES, Value::Sequence(names));
        self
    }

    pub fn with_driver_name(mut self, driver_name: impl Into<String>) -> Self {
        self.set(fields::DRIVER_NAME, driver_name.into());
        self
    }

    pub fn with_plugin_name(mut self, plugin_name: impl Into<String>) -> Self {
        self.set(fields::PLUGIN_NAME, plugin_name.into());
        self
    }

    pub fn with_schema_path(mut self, path: impl Into<String>) -> Self {
        self.set(fields::SCHEMA, path.into());
        self
    }

    pub fn with_schema_object(mut self, schema: Mapping) -> Self {
        self.set(fields::SCHEMA, Value::Mapping(schema));
        self
    }

    /// Shallow-merge `patch` into this record. Fields present in the patch
    /// overwrite fields of the same name; all other fields are kept.
    pub fn merge(&mut self, patch: &ExtensionRecord) {
        for (key, value) in &patch.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }
}

/// The full persisted manifest of installed extensions for one home
/// directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub drivers: WatchedMap,
    #[serde(default)]
    pub plugins: WatchedMap,
    #[serde(rename = "schemaRev", default = "current_schema_rev")]
    pub schema_rev: u32,
}

fn current_schema_rev() -> u32 {
    CURRENT_SCHEMA_REV
}

impl Manifest {
    /// A manifest with no installed extensions, at the current schema
    /// revision.
    pub fn empty() -> Self {
        Self {
            drivers: WatchedMap::new(),
            plugins: WatchedMap::new(),
            schema_rev: CURRENT_SCHEMA_REV,
        }
    }

    pub fn records(&self, extension_type: ExtensionType) -> &WatchedMap {
        match extension_type {
            ExtensionType::Driver => &self.drivers,
            ExtensionType::Plugin => &self.plugins,
        }
    }

    pub fn records_mut(&mut self, extension_type: ExtensionType) -> &mut WatchedMap {
        match extension_type {
            ExtensionType::Driver => &mut self.drivers,
            ExtensionType::Plugin => &mut self.plugins,
        }
    }

    /// Point both record mappings at the owning store's dirty flag.
    pub(crate) fn bind_dirty(&mut self, flag: &Arc<AtomicBool>) {
        self.drivers.bind(flag);
        self.plugins.bind(flag);
    }
}

impl Default for Manifest {
    fn default() -> Self {
        Self::empty()
    }
}

/// A single validation finding: what went wrong and the offending value.
/// Problems are ephemeral; they are reported and never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct Problem {
    pub err: String,
    pub val: Value,
}

impl Problem {
    pub fn new(err: impl Into<String>, val: Option<&Value>) -> Self {
        Self {
            err: err.into(),
            val: val.cloned().unwrap_or(Value::Null),
        }
    }
}

impl Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = serde_json::to_string(&self.val)
            .unwrap_or_else(|_| "<unserializable>".to_string());
        write!(f, "{} ({})", self.err, rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_rev_defaults_when_absent() {
        let manifest: Manifest = serde_yaml::from_str("drivers: {}\nplugins: {}\n").unwrap();
        assert_eq!(manifest.schema_rev, CURRENT_SCHEMA_REV);
    }

    #[test]
    fn test_manifest_round_trip_uses_camel_case() {
        let manifest = Manifest::empty();
        let serialized = serde_yaml::to_string(&manifest).unwrap();
        assert!(serialized.contains("schemaRev: 2"));
        assert!(serialized.contains("drivers: {}"));
        assert!(serialized.contains("plugins: {}"));
    }

    #[test]
    fn test_record_accessors_tolerate_wrong_types() {
        let record: ExtensionRecord =
            serde_yaml::from_str("pkgName: foo\nversion: 17\nplatformNames: ios\n").unwrap();
        assert_eq!(record.pkg_name(), Some("foo"));
        assert_eq!(record.version(), None);
        assert!(record.platform_names().is_none());
    }

    #[test]
    fn test_record_builder_and_merge() {
        let mut record = ExtensionRecord::new(
            "appium-xcuitest-driver",
            "4.0.0",
            "xcuitest",
            InstallType::Npm,
            "node_modules/.cache/appium",
            "XCUITestDriver",
        )
        .with_automation_name("XCUITest")
        .with_platform_names(["iOS", "tvOS"]);

        assert_eq!(record.install_type(), Some(InstallType::Npm));
        assert_eq!(record.automation_name(), Some("XCUITest"));
        assert_eq!(record.platform_names().map(Vec::len), Some(2));

        let mut patch = ExtensionRecord::default();
        patch.set(fields::VERSION, "4.1.0");
        record.merge(&patch);
        assert_eq!(record.version(), Some("4.1.0"));
        assert_eq!(record.main_class(), Some("XCUITestDriver"));
    }

    #[test]
    fn test_install_type_display_matches_valid_set() {
        for raw in INSTALL_TYPES {
            let parsed: InstallType = raw.parse().unwrap();
            assert_eq!(parsed.to_string(), raw);
        }
        assert!("registry".parse::<InstallType>().is_err());
    }

    #[test]
    fn test_problem_display_serializes_offending_value() {
        let problem = Problem::new("`version` field must be a string", Some(&Value::from(17)));
        assert_eq!(
            problem.to_string(),
            "`version` field must be a string (17)"
        );
        let missing = Problem::new("`mainClass` field must be a string", None);
        assert_eq!(
            missing.to_string(),
            "`mainClass` field must be a string (null)"
        );
    }
}
