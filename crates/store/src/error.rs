use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// Boxed error type used for wrapping causes from collaborators and the
/// file system.
pub type DynError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Could not read manifest at '{path}': {source}")]
    ManifestRead { path: PathBuf, source: DynError },

    #[error("Could not write manifest at '{path}' for home directory '{home}': {source}")]
    ManifestWrite {
        path: PathBuf,
        home: PathBuf,
        source: DynError,
    },

    #[error("Could not resolve the manifest path: {source}")]
    PathResolution { source: DynError },

    #[error("Manifest must be read before it can be written; call read() first")]
    WriteBeforeRead,

    #[error("No manifest has been loaded; call read() first")]
    ManifestNotLoaded,

    #[error("Extension '{0}' is not installed")]
    ExtensionNotFound(String),

    #[error("Record for '{name}' is invalid: {reason}")]
    InvalidRecord { name: String, reason: String },

    #[error("Could not load entry point for extension '{name}': {source}")]
    EntryPointLoad { name: String, source: DynError },

    #[error(transparent)]
    Shared(#[from] Arc<StoreError>),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    /// Whether this error indicates incorrect API usage rather than an
    /// environmental failure.
    pub fn is_programmer_error(&self) -> bool {
        matches!(
            self,
            StoreError::WriteBeforeRead | StoreError::ManifestNotLoaded
        )
    }
}
