//! Manifest I/O.
//!
//! [`ManifestStore`] is the single authoritative, change-tracked accessor
//! for one home directory's manifest file. Reads and writes are coalesced:
//! at most one file read and one file write is ever in flight per store,
//! and concurrent callers share the in-flight operation's outcome.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use once_cell::sync::Lazy;
use tokio::fs;
use tracing::{debug, info};

use crate::env;
use crate::error::{DynError, Result, StoreError};
use crate::models::Manifest;

const POISONED: &str = "manifest store state mutex poisoned";

type FlightResult<T> = std::result::Result<T, Arc<StoreError>>;
type Flight<T> = Shared<BoxFuture<'static, FlightResult<T>>>;

static STORES: Lazy<Mutex<HashMap<PathBuf, ManifestStore>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Handle to the manifest store for one home directory. Clones share the
/// same underlying state; one store exists per home directory path.
#[derive(Clone)]
pub struct ManifestStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    home_dir: PathBuf,
    dirty: Arc<AtomicBool>,
    state: Mutex<StoreState>,
    #[cfg(test)]
    file_reads: std::sync::atomic::AtomicUsize,
    #[cfg(test)]
    file_writes: std::sync::atomic::AtomicUsize,
}

#[derive(Default)]
struct StoreState {
    manifest: Option<Manifest>,
    manifest_path: Option<PathBuf>,
    read_flight: Option<Flight<Manifest>>,
    write_flight: Option<Flight<bool>>,
}

impl ManifestStore {
    /// The store for `home_dir`, creating it on first lookup. Repeated
    /// lookups for the same path return the same instance; paths are
    /// matched exactly, without normalization.
    pub fn for_home(home_dir: impl Into<PathBuf>) -> ManifestStore {
        let home_dir = home_dir.into();
        let mut stores = STORES.lock().expect(POISONED);
        stores
            .entry(home_dir.clone())
            .or_insert_with(|| ManifestStore::new(home_dir))
            .clone()
    }

    /// Drop all cached store instances. Intended for test isolation.
    pub fn reset_store_cache() {
        STORES.lock().expect(POISONED).clear();
    }

    pub(crate) fn new(home_dir: PathBuf) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                home_dir,
                dirty: Arc::new(AtomicBool::new(false)),
                state: Mutex::new(StoreState::default()),
                #[cfg(test)]
                file_reads: std::sync::atomic::AtomicUsize::new(0),
                #[cfg(test)]
                file_writes: std::sync::atomic::AtomicUsize::new(0),
            }),
        }
    }

    pub fn home_dir(&self) -> &Path {
        &self.inner.home_dir
    }

    /// Whether the two handles refer to the same underlying store.
    pub fn ptr_eq(&self, other: &ManifestStore) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Whether in-memory changes have not yet been persisted.
    pub fn is_dirty(&self) -> bool {
        self.inner.dirty.load(Ordering::SeqCst)
    }

    /// The resolved manifest file path, computed on first use and cached.
    pub async fn manifest_path(&self) -> Result<PathBuf> {
        StoreInner::resolve_manifest_path(&self.inner).await
    }

    /// Read the manifest, parsing the file on first call and returning the
    /// in-memory copy afterwards unless `force` is set. Concurrent callers
    /// share a single underlying file read. When no manifest file exists an
    /// empty one is synthesized and immediately persisted.
    ///
    /// The returned manifest is a snapshot; mutations meant to be persisted
    /// go through [`ManifestStore::with_manifest_mut`].
    pub async fn read(&self, force: bool) -> Result<Manifest> {
        let flight = {
            let mut state = self.inner.state.lock().expect(POISONED);
            if !force {
                if let Some(manifest) = &state.manifest {
                    return Ok(manifest.clone());
                }
            }
            if let Some(flight) = &state.read_flight {
                flight.clone()
            } else {
                let inner = Arc::clone(&self.inner);
                let flight: Flight<Manifest> = async move {
                    let result = StoreInner::perform_read(&inner).await;
                    inner.state.lock().expect(POISONED).read_flight = None;
                    result.map_err(Arc::new)
                }
                .boxed()
                .shared();
                state.read_flight = Some(flight.clone());
                flight
            }
        };
        flight.await.map_err(StoreError::from)
    }

    /// Persist the manifest if it has unsaved changes (or unconditionally
    /// with `force`). Returns whether a write occurred. Concurrent callers
    /// share the in-flight write's outcome; a call arriving after that
    /// write settles performs a fresh dirty-check.
    pub async fn write(&self, force: bool) -> Result<bool> {
        let flight = {
            let mut state = self.inner.state.lock().expect(POISONED);
            if state.write_flight.is_none() {
                if !self.inner.dirty.load(Ordering::SeqCst) && !force {
                    return Ok(false);
                }
                if state.manifest.is_none() {
                    return if force {
                        Err(StoreError::WriteBeforeRead)
                    } else {
                        Ok(false)
                    };
                }
            }
            StoreInner::spawn_write_flight(&self.inner, &mut state, force)
        };
        flight.await.map_err(StoreError::from)
    }

    /// Run `f` against the shared in-memory manifest.
    pub fn with_manifest<T>(&self, f: impl FnOnce(&Manifest) -> T) -> Result<T> {
        let state = self.inner.state.lock().expect(POISONED);
        match &state.manifest {
            Some(manifest) => Ok(f(manifest)),
            None => Err(StoreError::ManifestNotLoaded),
        }
    }

    /// Run `f` against the shared in-memory manifest, with mutation.
    /// Changes are tracked by the record mappings; call
    /// [`ManifestStore::write`] to persist them.
    pub fn with_manifest_mut<T>(&self, f: impl FnOnce(&mut Manifest) -> T) -> Result<T> {
        let mut state = self.inner.state.lock().expect(POISONED);
        match &mut state.manifest {
            Some(manifest) => Ok(f(manifest)),
            None => Err(StoreError::ManifestNotLoaded),
        }
    }
}

impl fmt::Debug for ManifestStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManifestStore")
            .field("home_dir", &self.inner.home_dir)
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

impl StoreInner {
    async fn resolve_manifest_path(inner: &Arc<StoreInner>) -> Result<PathBuf> {
        if let Some(path) = inner.state.lock().expect(POISONED).manifest_path.clone() {
            return Ok(path);
        }
        let path = env::manifest_path_for_home(&inner.home_dir).await?;
        inner.state.lock().expect(POISONED).manifest_path = Some(path.clone());
        Ok(path)
    }

    /// Register (or join) the shared write flight. Callers have already
    /// decided a write should happen; the flight itself re-checks the
    /// dirty flag when it runs.
    fn spawn_write_flight(
        inner: &Arc<StoreInner>,
        state: &mut StoreState,
        force: bool,
    ) -> Flight<bool> {
        if let Some(flight) = &state.write_flight {
            return flight.clone();
        }
        let owner = Arc::clone(inner);
        let flight: Flight<bool> = async move {
            let result = StoreInner::perform_write(&owner, force).await;
            owner.state.lock().expect(POISONED).write_flight = None;
            result.map_err(Arc::new)
        }
        .boxed()
        .shared();
        state.write_flight = Some(flight.clone());
        flight
    }

    async fn perform_read(inner: &Arc<StoreInner>) -> Result<Manifest> {
        let path = Self::resolve_manifest_path(inner).await?;
        #[cfg(test)]
        inner.file_reads.fetch_add(1, Ordering::SeqCst);
        let mut fresh = false;
        let manifest = match fs::read_to_string(&path).await {
            Ok(raw) => {
                serde_yaml::from_str::<Manifest>(&raw).map_err(|e| StoreError::ManifestRead {
                    path: path.clone(),
                    source: Box::new(e),
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    "No manifest found at {}; starting an empty one",
                    path.display()
                );
                fresh = true;
                Manifest::empty()
            }
            Err(e) => {
                return Err(StoreError::ManifestRead {
                    path: path.clone(),
                    source: Box::new(e),
                })
            }
        };
        // The stored copy is the one bound to the dirty flag; the returned
        // snapshot stays detached, so mutating it cannot dirty the store.
        let snapshot = {
            let mut state = inner.state.lock().expect(POISONED);
            let stored = state.manifest.insert(manifest);
            stored.bind_dirty(&inner.dirty);
            stored.clone()
        };
        if fresh {
            let flight = {
                let mut state = inner.state.lock().expect(POISONED);
                Self::spawn_write_flight(inner, &mut state, true)
            };
            flight.await.map_err(StoreError::from)?;
        } else {
            debug!(
                "Loaded manifest with {} drivers and {} plugins from {}",
                snapshot.drivers.len(),
                snapshot.plugins.len(),
                path.display()
            );
        }
        Ok(snapshot)
    }

    async fn perform_write(inner: &Arc<StoreInner>, force: bool) -> Result<bool> {
        if !inner.dirty.load(Ordering::SeqCst) && !force {
            return Ok(false);
        }
        let path = Self::resolve_manifest_path(inner).await?;

        let serialized = {
            let state = inner.state.lock().expect(POISONED);
            match &state.manifest {
                Some(manifest) => serde_yaml::to_string(manifest)
                    .map_err(|e| inner.write_error(&path, Box::new(e)))?,
                None => {
                    return if force {
                        Err(StoreError::WriteBeforeRead)
                    } else {
                        Ok(false)
                    };
                }
            }
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| inner.write_error(&path, Box::new(e)))?;
        }
        #[cfg(test)]
        inner.file_writes.fetch_add(1, Ordering::SeqCst);
        fs::write(&path, serialized)
            .await
            .map_err(|e| inner.write_error(&path, Box::new(e)))?;

        inner.dirty.store(false, Ordering::SeqCst);
        debug!("Wrote manifest to {}", path.display());
        Ok(true)
    }
}

impl StoreInner {
    fn write_error(&self, path: &Path, source: DynError) -> StoreError {
        StoreError::ManifestWrite {
            path: path.to_path_buf(),
            home: self.home_dir.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExtensionRecord, ExtensionType, InstallType, CURRENT_SCHEMA_REV};
    use tempfile::TempDir;

    fn store_for(temp_dir: &TempDir) -> ManifestStore {
        ManifestStore::new(temp_dir.path().to_path_buf())
    }

    fn fake_driver(version: &str) -> ExtensionRecord {
        ExtensionRecord::new(
            "appium-fake-driver",
            version,
            "fake",
            InstallType::Npm,
            "fake-driver",
            "FakeDriver",
        )
        .with_automation_name("Fake")
        .with_platform_names(["iOS"])
    }

    #[tokio::test]
    async fn test_bootstrap_writes_empty_manifest() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_for(&temp_dir);

        let manifest = store.read(false).await.unwrap();
        assert!(manifest.drivers.is_empty());
        assert!(manifest.plugins.is_empty());
        assert_eq!(manifest.schema_rev, CURRENT_SCHEMA_REV);

        let path = store.manifest_path().await.unwrap();
        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(raw.contains("drivers: {}"));
        assert!(raw.contains("plugins: {}"));
        assert!(raw.contains("schemaRev: 2"));

        // The bootstrap persist is a single write, routed through the
        // shared write flight.
        assert_eq!(store.inner.file_writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_bootstrap_creates_parent_directories() {
        let temp_dir = TempDir::new().unwrap();
        let pkg_dir = temp_dir.path().join("node_modules").join("appium");
        tokio::fs::create_dir_all(&pkg_dir).await.unwrap();
        tokio::fs::write(pkg_dir.join("package.json"), "{\"name\": \"appium\"}")
            .await
            .unwrap();

        let store = store_for(&temp_dir);
        store.read(false).await.unwrap();

        let path = store.manifest_path().await.unwrap();
        assert!(path.ends_with("node_modules/.cache/appium/extensions.yaml"));
        assert!(tokio::fs::try_exists(&path).await.unwrap());
    }

    #[tokio::test]
    async fn test_read_is_idempotent_without_force() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_for(&temp_dir);
        store.read(false).await.unwrap();

        // Change the file behind the store's back; a non-forced read must
        // not see it, since no file read may occur.
        let path = store.manifest_path().await.unwrap();
        tokio::fs::write(
            &path,
            "drivers:\n  sneaky:\n    pkgName: x\nplugins: {}\nschemaRev: 2\n",
        )
        .await
        .unwrap();

        let manifest = store.read(false).await.unwrap();
        assert!(manifest.drivers.is_empty());

        let forced = store.read(true).await.unwrap();
        assert!(forced.drivers.contains_key("sneaky"));
    }

    #[tokio::test]
    async fn test_concurrent_reads_coalesce() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_for(&temp_dir);

        let (a, b) = tokio::join!(store.read(false), store.read(false));
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(store.inner.file_reads.load(Ordering::SeqCst), 1);

        // Cached afterwards; only a forced read touches the file again.
        store.read(false).await.unwrap();
        assert_eq!(store.inner.file_reads.load(Ordering::SeqCst), 1);
        store.read(true).await.unwrap();
        assert_eq!(store.inner.file_reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_snapshot_mutation_does_not_dirty_store() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_for(&temp_dir);

        let mut snapshot = store.read(false).await.unwrap();
        snapshot
            .records_mut(ExtensionType::Driver)
            .insert("foo", fake_driver("1.0.0"));
        assert!(!store.is_dirty());
        assert!(!store.write(false).await.unwrap());

        let path = store.manifest_path().await.unwrap();
        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(!raw.contains("foo"));
    }

    #[tokio::test]
    async fn test_clean_write_is_a_noop() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_for(&temp_dir);
        store.read(false).await.unwrap();

        assert!(!store.write(false).await.unwrap());
    }

    #[tokio::test]
    async fn test_dirty_tracking_through_record_mutation() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_for(&temp_dir);
        store.read(false).await.unwrap();

        store
            .with_manifest_mut(|m| {
                m.records_mut(ExtensionType::Driver)
                    .insert("fake", fake_driver("1.0.0"));
            })
            .unwrap();
        assert!(store.is_dirty());
        assert!(store.write(false).await.unwrap());
        assert!(!store.is_dirty());

        let path = store.manifest_path().await.unwrap();
        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(raw.contains("fake:"));
        assert!(raw.contains("automationName: Fake"));

        // Re-inserting an identical record is not a change.
        store
            .with_manifest_mut(|m| {
                m.records_mut(ExtensionType::Driver)
                    .insert("fake", fake_driver("1.0.0"));
            })
            .unwrap();
        assert!(!store.write(false).await.unwrap());

        // Deleting an existing key is.
        store
            .with_manifest_mut(|m| {
                m.records_mut(ExtensionType::Driver).remove("fake");
            })
            .unwrap();
        assert!(store.write(false).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_writes_share_one_outcome() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_for(&temp_dir);
        store.read(false).await.unwrap();
        store
            .with_manifest_mut(|m| {
                m.records_mut(ExtensionType::Driver)
                    .insert("fake", fake_driver("1.0.0"));
            })
            .unwrap();

        let (a, b) = tokio::join!(store.write(false), store.write(false));
        assert!(a.unwrap());
        assert!(b.unwrap());

        // One write for the bootstrap, one shared by the pair.
        assert_eq!(store.inner.file_writes.load(Ordering::SeqCst), 2);

        // After the flight settles, a fresh dirty-check applies.
        assert!(!store.write(false).await.unwrap());
    }

    #[tokio::test]
    async fn test_write_before_read_guard() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_for(&temp_dir);

        assert!(!store.write(false).await.unwrap());
        let err = store.write(true).await.unwrap_err();
        assert!(matches!(err, StoreError::WriteBeforeRead));
        assert!(err.is_programmer_error());
    }

    #[tokio::test]
    async fn test_write_failure_names_path_and_home() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_for(&temp_dir);
        store.read(false).await.unwrap();

        // Replace the manifest file with a directory so the next write
        // fails even when running with elevated privileges.
        let path = store.manifest_path().await.unwrap();
        tokio::fs::remove_file(&path).await.unwrap();
        tokio::fs::create_dir(&path).await.unwrap();

        let err = store.write(true).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains(&path.display().to_string()));
        assert!(message.contains(&temp_dir.path().display().to_string()));
    }

    #[tokio::test]
    async fn test_manifest_access_requires_read() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_for(&temp_dir);
        let err = store.with_manifest(|m| m.schema_rev).unwrap_err();
        assert!(matches!(err, StoreError::ManifestNotLoaded));
    }

    #[tokio::test]
    async fn test_corrupt_manifest_surfaces_read_error() {
        let temp_dir = TempDir::new().unwrap();
        tokio::fs::write(
            temp_dir.path().join(env::MANIFEST_BASENAME),
            "drivers: [not, a, mapping]\n",
        )
        .await
        .unwrap();

        let store = store_for(&temp_dir);
        let err = store.read(false).await.unwrap_err();
        assert!(matches!(err, StoreError::ManifestRead { .. }));
        assert!(err.to_string().contains(env::MANIFEST_BASENAME));
    }
}
