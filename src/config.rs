//! Global configuration options.

use std::sync::{OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Global configuration options.
///
/// Retrieve the global [`Config`] with [`global_config`] and modify it with
/// [`global_config_mut`]. Options are read when a
/// [`StorageManager`](crate::storage_manager::StorageManager) is created.
///
/// ## Async Priority Classes
/// > default: `2`
///
/// The number of asynchronous query priority classes, each served by one
/// dedicated worker thread. Class `0` is for user queries and class `1` for
/// internal queries; further classes are available to embedders.
///
/// ## Sync Writes
/// > default: [`true`]
///
/// If enabled, metadata files are synced to persistent storage after they
/// are written.
#[derive(Debug)]
pub struct Config {
    async_priority_classes: usize,
    sync_writes: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            async_priority_classes: 2,
            sync_writes: true,
        }
    }
}

impl Config {
    /// Get the [async priority classes](#async-priority-classes) configuration.
    #[must_use]
    pub fn async_priority_classes(&self) -> usize {
        self.async_priority_classes
    }

    /// Set the [async priority classes](#async-priority-classes) configuration.
    ///
    /// Values below `2` are clamped to `2`.
    pub fn set_async_priority_classes(&mut self, classes: usize) {
        self.async_priority_classes = classes.max(2);
    }

    /// Get the [sync writes](#sync-writes) configuration.
    #[must_use]
    pub fn sync_writes(&self) -> bool {
        self.sync_writes
    }

    /// Set the [sync writes](#sync-writes) configuration.
    pub fn set_sync_writes(&mut self, sync_writes: bool) {
        self.sync_writes = sync_writes;
    }
}

static CONFIG: OnceLock<RwLock<Config>> = OnceLock::new();

/// Returns a reference to the global configuration.
///
/// # Panics
/// Panics if the underlying lock has been poisoned.
pub fn global_config() -> RwLockReadGuard<'static, Config> {
    CONFIG
        .get_or_init(|| RwLock::new(Config::default()))
        .read()
        .unwrap()
}

/// Returns a mutable reference to the global configuration.
///
/// # Panics
/// Panics if the underlying lock has been poisoned.
pub fn global_config_mut() -> RwLockWriteGuard<'static, Config> {
    CONFIG
        .get_or_init(|| RwLock::new(Config::default()))
        .write()
        .unwrap()
}
