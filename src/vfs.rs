//! The virtual filesystem.
//!
//! A [`Vfs`] directs every persistent I/O operation to the backend
//! registered for the URI scheme. Backends implement [`VfsBackend`] and
//! must be internally thread safe; the `file` and `mem` schemes are
//! registered by default. No caching happens at this layer.

pub mod memory;
pub mod posix;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::debug;

use crate::uri::URI;

pub use memory::MemoryFilesystem;
pub use posix::PosixFilesystem;

/// A virtual filesystem error.
#[derive(Debug, Error)]
pub enum VfsError {
    /// An I/O error, annotated with the path it occurred on.
    #[error("I/O error on `{path}`: {source}")]
    Io {
        /// The path the operation failed on.
        path: String,
        /// The underlying I/O error.
        source: std::io::Error,
    },
    /// A path that does not exist.
    #[error("`{0}` not found")]
    NotFound(String),
    /// A move target that already exists.
    #[error("`{0}` already exists")]
    AlreadyExists(String),
    /// A URI scheme without a registered backend.
    #[error("unsupported URI scheme `{0}`")]
    UnsupportedScheme(String),
    /// A move between different URI schemes.
    #[error("cannot move `{0}` to `{1}` across filesystems")]
    CrossScheme(String, String),
}

impl VfsError {
    pub(crate) fn io(uri: &URI, source: std::io::Error) -> Self {
        Self::Io {
            path: uri.to_string(),
            source,
        }
    }
}

/// The capability set of a filesystem backend.
///
/// All operations are synchronous and may block arbitrarily on I/O.
/// Implementations must be internally thread safe.
pub trait VfsBackend: Send + Sync + std::fmt::Debug {
    /// Create a directory (and any missing parents).
    fn create_dir(&self, uri: &URI) -> Result<(), VfsError>;

    /// Create an empty file if none exists.
    fn create_file(&self, uri: &URI) -> Result<(), VfsError>;

    /// Whether `uri` is a directory.
    fn is_dir(&self, uri: &URI) -> bool;

    /// Whether `uri` is a file.
    fn is_file(&self, uri: &URI) -> bool;

    /// The size of the file at `uri` in bytes.
    fn file_size(&self, uri: &URI) -> Result<u64, VfsError>;

    /// Read exactly `buffer.len()` bytes from the file at `uri`, starting
    /// at `offset`.
    fn read(&self, uri: &URI, offset: u64, buffer: &mut [u8]) -> Result<(), VfsError>;

    /// Append `data` to the file at `uri`, creating it if necessary.
    fn write(&self, uri: &URI, data: &[u8]) -> Result<(), VfsError>;

    /// Commit the contents of a file or directory to persistent storage.
    fn sync(&self, uri: &URI) -> Result<(), VfsError>;

    /// Remove the file or directory (recursively) at `uri`.
    fn remove_path(&self, uri: &URI) -> Result<(), VfsError>;

    /// Rename `old_uri` to `new_uri`. Refuses an existing target unless
    /// `force` is set, in which case the target is replaced.
    fn move_path(&self, old_uri: &URI, new_uri: &URI, force: bool) -> Result<(), VfsError>;

    /// List the immediate children of the directory at `uri`, sorted.
    fn ls(&self, uri: &URI) -> Result<Vec<URI>, VfsError>;
}

/// The virtual filesystem: a scheme-indexed registry of backends.
#[derive(Debug)]
pub struct Vfs {
    backends: RwLock<HashMap<String, Arc<dyn VfsBackend>>>,
}

impl Default for Vfs {
    fn default() -> Self {
        let vfs = Self {
            backends: RwLock::new(HashMap::new()),
        };
        vfs.register("file", Arc::new(PosixFilesystem::new()));
        vfs.register("mem", Arc::new(MemoryFilesystem::new()));
        vfs
    }
}

impl Vfs {
    /// Create a virtual filesystem with the default `file` and `mem`
    /// backends.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `backend` for `scheme`, replacing any previous backend.
    pub fn register(&self, scheme: &str, backend: Arc<dyn VfsBackend>) {
        self.backends.write().insert(scheme.to_string(), backend);
    }

    fn backend(&self, uri: &URI) -> Result<Arc<dyn VfsBackend>, VfsError> {
        self.backends
            .read()
            .get(uri.scheme())
            .cloned()
            .ok_or_else(|| VfsError::UnsupportedScheme(uri.scheme().to_string()))
    }

    /// Create a directory (and any missing parents).
    pub fn create_dir(&self, uri: &URI) -> Result<(), VfsError> {
        debug!(%uri, "create dir");
        self.backend(uri)?.create_dir(uri)
    }

    /// Create an empty file if none exists.
    pub fn create_file(&self, uri: &URI) -> Result<(), VfsError> {
        self.backend(uri)?.create_file(uri)
    }

    /// Whether `uri` is a directory.
    #[must_use]
    pub fn is_dir(&self, uri: &URI) -> bool {
        self.backend(uri).is_ok_and(|b| b.is_dir(uri))
    }

    /// Whether `uri` is a file.
    #[must_use]
    pub fn is_file(&self, uri: &URI) -> bool {
        self.backend(uri).is_ok_and(|b| b.is_file(uri))
    }

    /// The size of the file at `uri` in bytes.
    pub fn file_size(&self, uri: &URI) -> Result<u64, VfsError> {
        self.backend(uri)?.file_size(uri)
    }

    /// Read exactly `buffer.len()` bytes from the file at `uri`, starting
    /// at `offset`.
    pub fn read(&self, uri: &URI, offset: u64, buffer: &mut [u8]) -> Result<(), VfsError> {
        self.backend(uri)?.read(uri, offset, buffer)
    }

    /// Append `data` to the file at `uri`, creating it if necessary.
    pub fn write(&self, uri: &URI, data: &[u8]) -> Result<(), VfsError> {
        self.backend(uri)?.write(uri, data)
    }

    /// Commit the contents of a file or directory to persistent storage.
    pub fn sync(&self, uri: &URI) -> Result<(), VfsError> {
        self.backend(uri)?.sync(uri)
    }

    /// Remove the file or directory (recursively) at `uri`.
    pub fn remove_path(&self, uri: &URI) -> Result<(), VfsError> {
        debug!(%uri, "remove path");
        self.backend(uri)?.remove_path(uri)
    }

    /// Rename `old_uri` to `new_uri`. Refuses an existing target unless
    /// `force` is set, in which case the target is replaced.
    pub fn move_path(&self, old_uri: &URI, new_uri: &URI, force: bool) -> Result<(), VfsError> {
        debug!(%old_uri, %new_uri, force, "move path");
        if old_uri.scheme() != new_uri.scheme() {
            return Err(VfsError::CrossScheme(
                old_uri.to_string(),
                new_uri.to_string(),
            ));
        }
        self.backend(old_uri)?.move_path(old_uri, new_uri, force)
    }

    /// List the immediate children of the directory at `uri`, sorted.
    pub fn ls(&self, uri: &URI) -> Result<Vec<URI>, VfsError> {
        self.backend(uri)?.ls(uri)
    }
}
