//! The storage manager: the central coordinator of the engine.
//!
//! A [`StorageManager`] owns the catalog of currently open arrays and
//! their in-memory metadata, enforces array-level shared/exclusive
//! locking across concurrent queries, schedules synchronous and
//! asynchronous queries on dedicated worker threads (one per priority
//! class, class `0` for user queries and class `1` for internal queries),
//! mediates all persistent I/O through the [`Vfs`], serialises and
//! deserialises array metadata, and orchestrates fragment consolidation.
//!
//! Lock ordering: the lock-table mutex, then the open-array catalog
//! mutex, then any per-[`OpenArray`] mutex. No code path acquires in
//! reverse, and VFS calls happen with none of these held.

mod consolidator;
mod locked_array;
mod open_array;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

use crate::array::array_metadata::{ArrayMetadata, ArrayMetadataError, DomainError};
use crate::array::data_type::{coords_dispatch, DomainValues};
use crate::array::fragment_metadata::{FragmentMetadata, FragmentMetadataError, FragmentName};
use crate::array::Layout;
use crate::buffer::{Buffer, BufferError, ConstBuffer};
use crate::config::global_config;
use crate::query::{Query, QueryCallback, QueryError, QueryStatus, QueryType};
use crate::uri::{UriError, URI};
use crate::vfs::{Vfs, VfsError};

use locked_array::LockedArray;
use open_array::OpenArray;

/// The sentinel file marking a directory as a group.
pub const GROUP_FILENAME: &str = "__tiledb_group";
/// The array metadata file name.
pub const ARRAY_METADATA_FILENAME: &str = "__array_metadata.tdb";
/// The fragment metadata file name.
pub const FRAGMENT_METADATA_FILENAME: &str = "__fragment_metadata.tdb";

/// A storage manager error.
#[derive(Debug, Error)]
pub enum StorageManagerError {
    /// A virtual filesystem error.
    #[error(transparent)]
    Vfs(#[from] VfsError),
    /// A buffer read error.
    #[error(transparent)]
    Buffer(#[from] BufferError),
    /// An array metadata error.
    #[error(transparent)]
    Metadata(#[from] ArrayMetadataError),
    /// A fragment metadata error.
    #[error(transparent)]
    Fragment(#[from] FragmentMetadataError),
    /// A coordinate or subarray domain error.
    #[error(transparent)]
    Domain(#[from] DomainError),
    /// A query processing error.
    #[error(transparent)]
    Query(#[from] QueryError),
    /// An invalid URI.
    #[error(transparent)]
    Uri(#[from] UriError),
    /// A path that is not a recognised TileDB object.
    #[error("`{0}` is not a TileDB object")]
    UnrecognizedObject(String),
    /// An array that does not exist.
    #[error("array `{0}` does not exist")]
    ArrayNotFound(String),
    /// A target path that already exists.
    #[error("`{0}` already exists")]
    AlreadyExists(String),
    /// An unlock of an array that is not locked accordingly.
    #[error("`{0}` is not locked")]
    Lock(String),
    /// An operation in the wrong lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    /// An async priority class outside the configured range.
    #[error("async priority class {0} out of range")]
    InvalidPriorityClass(usize),
    /// A worker thread could not be spawned.
    #[error("failed to spawn async worker thread: {0}")]
    ThreadSpawn(std::io::Error),
}

/// The type of a TileDB object on persistent storage.
#[derive(Copy, Clone, Debug, derive_more::Display, PartialEq, Eq)]
pub enum ObjectType {
    /// A group directory.
    #[display("group")]
    Group,
    /// An array directory.
    #[display("array")]
    Array,
    /// A fragment directory.
    #[display("fragment")]
    Fragment,
    /// Not a TileDB object.
    #[display("invalid")]
    Invalid,
}

struct AsyncQueue {
    queries: VecDeque<Arc<Mutex<Query>>>,
    done: bool,
}

struct AsyncClass {
    queue: Mutex<AsyncQueue>,
    cv: Condvar,
}

impl AsyncClass {
    fn new() -> Self {
        Self {
            queue: Mutex::new(AsyncQueue {
                queries: VecDeque::new(),
                done: false,
            }),
            cv: Condvar::new(),
        }
    }
}

/// State shared between the storage manager and its worker threads.
///
/// The workers hold an [`Arc`] of this state rather than a reference to
/// the manager; shutdown is signalled through the per-class `done` flags.
struct AsyncState {
    vfs: Arc<Vfs>,
    classes: Vec<AsyncClass>,
}

/// Worker loop of async priority class `class`: pop queries in FIFO order
/// and process them until shutdown. Queued-but-unstarted queries are
/// dropped on shutdown; the in-flight query runs to completion.
fn async_process_queries(state: &AsyncState, class: usize) {
    let class_state = &state.classes[class];
    loop {
        let query = {
            let mut queue = class_state.queue.lock();
            loop {
                if queue.done {
                    return;
                }
                if let Some(query) = queue.queries.pop_front() {
                    break query;
                }
                class_state.cv.wait(&mut queue);
            }
        };
        async_process_query(&state.vfs, &query);
    }
}

/// Process one async query and invoke its completion callback. Errors are
/// reported through the query status, never by aborting the worker.
fn async_process_query(vfs: &Vfs, query: &Mutex<Query>) {
    let mut guard = query.lock();
    guard.set_status(QueryStatus::InProgress);
    match guard.process(vfs) {
        Ok(()) => guard.set_status(QueryStatus::Completed),
        Err(e) => {
            warn!(error = %e, "async query failed");
            guard.set_status(QueryStatus::Failed);
        }
    }
    let callback = guard.take_callback();
    drop(guard);
    if let Some(callback) = callback {
        callback();
    }
}

/// The central coordinator: open-array catalog, lock manager, async
/// scheduler, and object lifecycle operations.
pub struct StorageManager {
    vfs: Arc<Vfs>,
    open_arrays: Mutex<HashMap<String, Arc<OpenArray>>>,
    locked_arrays: Mutex<HashMap<String, LockedArray>>,
    locked_array_cv: Condvar,
    async_state: Arc<AsyncState>,
    async_threads: Vec<JoinHandle<()>>,
    sync_writes: bool,
}

impl std::fmt::Debug for StorageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageManager")
            .field("async_classes", &self.async_state.classes.len())
            .finish_non_exhaustive()
    }
}

impl StorageManager {
    /// Create a storage manager with the default [`Vfs`], spawning one
    /// worker thread per configured async priority class.
    pub fn new() -> Result<Self, StorageManagerError> {
        Self::with_vfs(Vfs::new())
    }

    /// Create a storage manager over `vfs`.
    pub fn with_vfs(vfs: Vfs) -> Result<Self, StorageManagerError> {
        let vfs = Arc::new(vfs);
        let (class_num, sync_writes) = {
            let config = global_config();
            (config.async_priority_classes(), config.sync_writes())
        };
        let async_state = Arc::new(AsyncState {
            vfs: vfs.clone(),
            classes: (0..class_num).map(|_| AsyncClass::new()).collect(),
        });

        let mut async_threads = Vec::with_capacity(class_num);
        for class in 0..class_num {
            let state = async_state.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("tiledbrs-async-{class}"))
                .spawn(move || async_process_queries(&state, class));
            match spawned {
                Ok(handle) => async_threads.push(handle),
                Err(e) => {
                    shutdown_async(&async_state, async_threads);
                    return Err(StorageManagerError::ThreadSpawn(e));
                }
            }
        }

        Ok(Self {
            vfs,
            open_arrays: Mutex::new(HashMap::new()),
            locked_arrays: Mutex::new(HashMap::new()),
            locked_array_cv: Condvar::new(),
            async_state,
            async_threads,
            sync_writes,
        })
    }

    pub(crate) fn vfs(&self) -> &Vfs {
        &self.vfs
    }

    // ------------------------------------------------------------------
    // Object operations
    // ------------------------------------------------------------------

    /// Create an array on persistent storage from initialised `metadata`.
    pub fn array_create(&self, metadata: &ArrayMetadata) -> Result<(), StorageManagerError> {
        metadata.check()?;
        let array_uri = metadata.array_uri();
        if self.vfs.is_dir(array_uri) {
            return Err(StorageManagerError::AlreadyExists(array_uri.to_string()));
        }
        self.vfs.create_dir(array_uri)?;
        if let Err(e) = self.store(metadata) {
            let _ = self.vfs.remove_path(array_uri);
            return Err(e);
        }
        debug!(%array_uri, "created array");
        Ok(())
    }

    /// Consolidate the fragments of the array named `array_name` into one.
    pub fn array_consolidate(&self, array_name: &str) -> Result<(), StorageManagerError> {
        consolidator::consolidate(self, array_name)
    }

    /// Create a group at `group` (a directory with a group sentinel file).
    pub fn group_create(&self, group: &str) -> Result<(), StorageManagerError> {
        let group_uri = URI::new(group)?;
        if self.vfs.is_dir(&group_uri) {
            return Err(StorageManagerError::AlreadyExists(group_uri.to_string()));
        }
        self.vfs.create_dir(&group_uri)?;
        self.vfs.create_file(&group_uri.join(GROUP_FILENAME))?;
        Ok(())
    }

    /// The type of the TileDB object at `uri`, determined by sentinel
    /// files.
    #[must_use]
    pub fn object_type(&self, uri: &URI) -> ObjectType {
        if !self.vfs.is_dir(uri) {
            return ObjectType::Invalid;
        }
        if self.vfs.is_file(&uri.join(GROUP_FILENAME)) {
            ObjectType::Group
        } else if self.vfs.is_file(&uri.join(ARRAY_METADATA_FILENAME)) {
            ObjectType::Array
        } else if self.vfs.is_file(&uri.join(FRAGMENT_METADATA_FILENAME)) {
            ObjectType::Fragment
        } else {
            ObjectType::Invalid
        }
    }

    /// Whether `uri` is a group directory.
    #[must_use]
    pub fn is_group(&self, uri: &URI) -> bool {
        self.object_type(uri) == ObjectType::Group
    }

    /// Whether `uri` is an array directory.
    #[must_use]
    pub fn is_array(&self, uri: &URI) -> bool {
        self.object_type(uri) == ObjectType::Array
    }

    /// Whether `uri` is a fragment directory.
    #[must_use]
    pub fn is_fragment(&self, uri: &URI) -> bool {
        self.object_type(uri) == ObjectType::Fragment
    }

    /// Remove the TileDB object at `uri`. Paths that are not recognised
    /// objects are refused.
    pub fn remove_path(&self, uri: &URI) -> Result<(), StorageManagerError> {
        if self.object_type(uri) == ObjectType::Invalid {
            return Err(StorageManagerError::UnrecognizedObject(uri.to_string()));
        }
        Ok(self.vfs.remove_path(uri)?)
    }

    /// Remove the fragment directory at `uri`.
    pub fn delete_fragment(&self, uri: &URI) -> Result<(), StorageManagerError> {
        if !self.is_fragment(uri) {
            return Err(StorageManagerError::UnrecognizedObject(uri.to_string()));
        }
        Ok(self.vfs.remove_path(uri)?)
    }

    /// Move the TileDB object at `old_uri` to `new_uri`. Refuses an
    /// existing target unless `force` is set.
    pub fn move_path(
        &self,
        old_uri: &URI,
        new_uri: &URI,
        force: bool,
    ) -> Result<(), StorageManagerError> {
        if self.object_type(old_uri) == ObjectType::Invalid {
            return Err(StorageManagerError::UnrecognizedObject(old_uri.to_string()));
        }
        self.vfs
            .move_path(old_uri, new_uri, force)
            .map_err(|e| match e {
                VfsError::AlreadyExists(path) => StorageManagerError::AlreadyExists(path),
                e => e.into(),
            })
    }

    // ------------------------------------------------------------------
    // VFS pass-throughs
    // ------------------------------------------------------------------

    /// Create a directory at `uri`.
    pub fn create_dir(&self, uri: &URI) -> Result<(), StorageManagerError> {
        Ok(self.vfs.create_dir(uri)?)
    }

    /// Create an empty file at `uri`.
    pub fn create_file(&self, uri: &URI) -> Result<(), StorageManagerError> {
        Ok(self.vfs.create_file(uri)?)
    }

    /// Whether `uri` is a directory.
    #[must_use]
    pub fn is_dir(&self, uri: &URI) -> bool {
        self.vfs.is_dir(uri)
    }

    /// Whether `uri` is a file.
    #[must_use]
    pub fn is_file(&self, uri: &URI) -> bool {
        self.vfs.is_file(uri)
    }

    /// The size of the file at `uri` in bytes.
    pub fn file_size(&self, uri: &URI) -> Result<u64, StorageManagerError> {
        Ok(self.vfs.file_size(uri)?)
    }

    /// Commit the contents of `uri` to persistent storage.
    pub fn sync(&self, uri: &URI) -> Result<(), StorageManagerError> {
        Ok(self.vfs.sync(uri)?)
    }

    /// Read `nbytes` from the file at `uri`, starting at `offset`.
    pub fn read_from_file(
        &self,
        uri: &URI,
        offset: u64,
        nbytes: u64,
    ) -> Result<Buffer, StorageManagerError> {
        let mut data = vec![0_u8; usize::try_from(nbytes).unwrap()];
        self.vfs.read(uri, offset, &mut data)?;
        Ok(Buffer::from_vec(data))
    }

    /// Append the contents of `buffer` to the file at `uri`.
    pub fn write_to_file(&self, uri: &URI, buffer: &Buffer) -> Result<(), StorageManagerError> {
        Ok(self.vfs.write(uri, buffer.data())?)
    }

    // ------------------------------------------------------------------
    // Metadata store/load
    // ------------------------------------------------------------------

    /// Store `metadata` on persistent storage, replacing any previous
    /// version. A partial write is repaired by removing the partial file.
    pub fn store(&self, metadata: &ArrayMetadata) -> Result<(), StorageManagerError> {
        let mut buffer = Buffer::new();
        metadata.serialize(&mut buffer)?;
        let metadata_uri = metadata.array_uri().join(ARRAY_METADATA_FILENAME);
        if self.vfs.is_file(&metadata_uri) {
            self.vfs.remove_path(&metadata_uri)?;
        }
        if let Err(e) = self.vfs.write(&metadata_uri, buffer.data()) {
            let _ = self.vfs.remove_path(&metadata_uri);
            return Err(e.into());
        }
        if self.sync_writes {
            self.vfs.sync(&metadata_uri)?;
        }
        Ok(())
    }

    /// Load and initialise the metadata of the array named `array_name`.
    pub fn load(&self, array_name: &str) -> Result<ArrayMetadata, StorageManagerError> {
        let array_uri = URI::new(array_name)?;
        let metadata_uri = array_uri.join(ARRAY_METADATA_FILENAME);
        if !self.vfs.is_file(&metadata_uri) {
            return Err(StorageManagerError::ArrayNotFound(array_uri.to_string()));
        }
        let nbytes = self.vfs.file_size(&metadata_uri)?;
        let buffer = self.read_from_file(&metadata_uri, 0, nbytes)?;
        let mut metadata =
            ArrayMetadata::deserialize(array_uri, &mut ConstBuffer::new(buffer.data()))?;
        metadata.init()?;
        Ok(metadata)
    }

    /// Store fragment `metadata` on persistent storage.
    pub fn store_fragment(&self, metadata: &FragmentMetadata) -> Result<(), StorageManagerError> {
        let mut buffer = Buffer::new();
        metadata.serialize(&mut buffer);
        let metadata_uri = metadata.fragment_uri().join(FRAGMENT_METADATA_FILENAME);
        if let Err(e) = self.vfs.write(&metadata_uri, buffer.data()) {
            let _ = self.vfs.remove_path(&metadata_uri);
            return Err(e.into());
        }
        if self.sync_writes {
            self.vfs.sync(&metadata_uri)?;
        }
        Ok(())
    }

    /// Load the metadata of the fragment at `fragment_uri` (one read per
    /// fragment).
    pub fn load_fragment(
        &self,
        array_metadata: Arc<ArrayMetadata>,
        fragment_uri: &URI,
    ) -> Result<FragmentMetadata, StorageManagerError> {
        let metadata_uri = fragment_uri.join(FRAGMENT_METADATA_FILENAME);
        let nbytes = self.vfs.file_size(&metadata_uri)?;
        let buffer = self.read_from_file(&metadata_uri, 0, nbytes)?;
        Ok(FragmentMetadata::deserialize(
            array_metadata,
            fragment_uri.clone(),
            &mut ConstBuffer::new(buffer.data()),
        )?)
    }

    /// The fragment URIs of the array at `array_uri`, in the canonical
    /// order: ascending timestamp, ties broken by ascending pid.
    pub fn get_fragment_uris(&self, array_uri: &URI) -> Result<Vec<URI>, StorageManagerError> {
        let mut fragments: Vec<(FragmentName, URI)> = self
            .vfs
            .ls(array_uri)?
            .into_iter()
            .filter(|uri| self.vfs.is_dir(uri))
            .filter_map(|uri| {
                FragmentName::parse(uri.last_path_part())
                    .ok()
                    .map(|name| (name, uri))
            })
            .collect();
        fragments.sort_by_key(|(name, _)| *name);
        Ok(fragments.into_iter().map(|(_, uri)| uri).collect())
    }

    // ------------------------------------------------------------------
    // Array locking
    // ------------------------------------------------------------------

    /// Lock the array at `array_uri`, shared or exclusive.
    ///
    /// Blocks until the lock is available. While an exclusive request is
    /// waiting, new shared requests also wait, so writers are not starved.
    pub fn array_lock(&self, array_uri: &URI, shared: bool) -> Result<(), StorageManagerError> {
        let key = array_uri.to_string();
        let mut locked_arrays = self.locked_arrays.lock();
        if shared {
            loop {
                let entry = locked_arrays.entry(key.clone()).or_insert_with(LockedArray::new);
                if entry.can_lock_shared() {
                    entry.incr_shared();
                    return Ok(());
                }
                self.locked_array_cv.wait(&mut locked_arrays);
            }
        } else {
            locked_arrays
                .entry(key.clone())
                .or_insert_with(LockedArray::new)
                .incr_waiting_exclusive();
            loop {
                let entry = locked_arrays
                    .get_mut(&key)
                    .expect("entry inserted above is only evicted when idle");
                if entry.can_lock_exclusive() {
                    entry.decr_waiting_exclusive();
                    entry.set_exclusive();
                    return Ok(());
                }
                self.locked_array_cv.wait(&mut locked_arrays);
            }
        }
    }

    /// Unlock the array at `array_uri`.
    pub fn array_unlock(&self, array_uri: &URI, shared: bool) -> Result<(), StorageManagerError> {
        let key = array_uri.to_string();
        let mut locked_arrays = self.locked_arrays.lock();
        let entry = locked_arrays
            .get_mut(&key)
            .ok_or_else(|| StorageManagerError::Lock(key.clone()))?;
        if shared {
            if entry.shared() == 0 {
                return Err(StorageManagerError::Lock(key));
            }
            entry.decr_shared();
        } else {
            if !entry.exclusive() {
                return Err(StorageManagerError::Lock(key));
            }
            entry.clear_exclusive();
        }
        if entry.idle() {
            locked_arrays.remove(&key);
        }
        self.locked_array_cv.notify_all();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Initialise `query` against the array named `array_name`: lock the
    /// array (shared for both reads and writes, as fragment creation is
    /// conflict free), open it, attach its metadata and fragment metadata,
    /// resolve the attribute names, and validate the subarray.
    #[allow(clippy::too_many_arguments)]
    pub fn query_init(
        &self,
        query: &mut Query,
        array_name: &str,
        query_type: QueryType,
        layout: Layout,
        subarray: Option<DomainValues>,
        attributes: &[&str],
        buffers: Vec<Vec<u8>>,
        consolidation_fragment_uri: Option<URI>,
    ) -> Result<(), StorageManagerError> {
        self.query_init_impl(
            query,
            array_name,
            query_type,
            layout,
            subarray,
            attributes,
            buffers,
            consolidation_fragment_uri,
            false,
        )
    }

    /// As [`Self::query_init`], but without taking the array lock. Used
    /// by the consolidator, which holds the exclusive lock for the whole
    /// operation.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn query_init_internal(
        &self,
        query: &mut Query,
        array_name: &str,
        query_type: QueryType,
        layout: Layout,
        subarray: Option<DomainValues>,
        attributes: &[&str],
        buffers: Vec<Vec<u8>>,
        consolidation_fragment_uri: Option<URI>,
    ) -> Result<(), StorageManagerError> {
        self.query_init_impl(
            query,
            array_name,
            query_type,
            layout,
            subarray,
            attributes,
            buffers,
            consolidation_fragment_uri,
            true,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn query_init_impl(
        &self,
        query: &mut Query,
        array_name: &str,
        query_type: QueryType,
        layout: Layout,
        subarray: Option<DomainValues>,
        attributes: &[&str],
        buffers: Vec<Vec<u8>>,
        consolidation_fragment_uri: Option<URI>,
        skip_array_lock: bool,
    ) -> Result<(), StorageManagerError> {
        if query.status() != QueryStatus::Uninitialized {
            return Err(StorageManagerError::InvalidState(
                "query is already initialized",
            ));
        }
        if query.query_type() != query_type || query.layout() != layout {
            return Err(StorageManagerError::InvalidState(
                "query type or layout does not match the query",
            ));
        }
        if attributes.is_empty() {
            return Err(StorageManagerError::InvalidState(
                "a query requires at least one attribute",
            ));
        }
        if attributes.len() != buffers.len() {
            return Err(StorageManagerError::InvalidState(
                "a query requires one buffer per attribute",
            ));
        }
        let array_uri = URI::new(array_name)?;
        if !skip_array_lock {
            self.array_lock(&array_uri, true)?;
        }
        let result = self.query_init_locked(
            query,
            &array_uri,
            subarray,
            attributes,
            buffers,
            consolidation_fragment_uri,
            skip_array_lock,
        );
        if result.is_err() && !skip_array_lock {
            let _ = self.array_unlock(&array_uri, true);
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn query_init_locked(
        &self,
        query: &mut Query,
        array_uri: &URI,
        subarray: Option<DomainValues>,
        attributes: &[&str],
        buffers: Vec<Vec<u8>>,
        consolidation_fragment_uri: Option<URI>,
        skip_array_lock: bool,
    ) -> Result<(), StorageManagerError> {
        let (array_metadata, fragment_metadata) = self.array_open(array_uri)?;
        let result = (|| {
            let attribute_indexes = array_metadata.attribute_indexes(attributes)?;
            if let Some(subarray) = &subarray {
                coords_dispatch!(array_metadata.coords_type(), T => {
                    let typed = subarray.typed::<T>().ok_or_else(|| {
                        DomainError::DatatypeMismatch(
                            subarray.datatype(),
                            array_metadata.coords_type(),
                        )
                    })?;
                    array_metadata.check_subarray(typed)?;
                });
            }
            Ok::<Vec<usize>, StorageManagerError>(attribute_indexes)
        })();
        match result {
            Ok(attribute_indexes) => {
                query.attach(
                    array_uri.clone(),
                    array_metadata,
                    fragment_metadata,
                    subarray,
                    attributes.iter().map(|&name| name.to_string()).collect(),
                    attribute_indexes,
                    buffers,
                    consolidation_fragment_uri,
                    skip_array_lock,
                );
                Ok(())
            }
            Err(e) => {
                self.array_close(array_uri);
                Err(e)
            }
        }
    }

    /// Run `query` to completion in the calling thread.
    pub fn query_submit(&self, query: &mut Query) -> Result<(), StorageManagerError> {
        if query.status() != QueryStatus::Initialized {
            return Err(StorageManagerError::InvalidState(
                "query_submit requires an initialized query",
            ));
        }
        query.set_status(QueryStatus::InProgress);
        match query.process(&self.vfs) {
            Ok(()) => {
                query.set_status(QueryStatus::Completed);
                Ok(())
            }
            Err(e) => {
                query.set_status(QueryStatus::Failed);
                Err(e.into())
            }
        }
    }

    /// Enqueue `query` on the user async queue (priority class `0`) and
    /// return immediately. `callback` is invoked once processing
    /// completes; it is the only synchronisation signal.
    pub fn query_submit_async(
        &self,
        query: Arc<Mutex<Query>>,
        callback: Option<QueryCallback>,
    ) -> Result<(), StorageManagerError> {
        {
            let mut guard = query.lock();
            if guard.status() != QueryStatus::Initialized {
                return Err(StorageManagerError::InvalidState(
                    "query_submit_async requires an initialized query",
                ));
            }
            if let Some(callback) = callback {
                guard.set_callback(callback);
            }
        }
        self.async_push_query(query, 0)
    }

    /// Push `query` onto async priority class `class` in FIFO order.
    pub fn async_push_query(
        &self,
        query: Arc<Mutex<Query>>,
        class: usize,
    ) -> Result<(), StorageManagerError> {
        let class_state = self
            .async_state
            .classes
            .get(class)
            .ok_or(StorageManagerError::InvalidPriorityClass(class))?;
        let mut queue = class_state.queue.lock();
        if queue.done {
            return Err(StorageManagerError::InvalidState(
                "storage manager is shutting down",
            ));
        }
        queue.queries.push_back(query);
        class_state.cv.notify_one();
        Ok(())
    }

    /// Finalize `query`: close the array (decrementing its open count),
    /// release the shared lock, and invoke the completion callback if one
    /// is still pending.
    pub fn query_finalize(&self, query: &mut Query) -> Result<(), StorageManagerError> {
        if query.finalized() {
            return Err(StorageManagerError::InvalidState(
                "query is already finalized",
            ));
        }
        query.set_finalized();
        if let Some(array_uri) = query.array_uri().cloned() {
            self.array_close(&array_uri);
            if !query.skip_array_lock() {
                self.array_unlock(&array_uri, true)?;
            }
        }
        if let Some(callback) = query.take_callback() {
            callback();
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Open-array catalog
    // ------------------------------------------------------------------

    /// Open the array at `array_uri`: bump its open count and load its
    /// metadata and fragment metadata (fragments lacking a metadata file
    /// are skipped as in-progress).
    fn array_open(
        &self,
        array_uri: &URI,
    ) -> Result<(Arc<ArrayMetadata>, Vec<Arc<FragmentMetadata>>), StorageManagerError> {
        let open_array = {
            let mut open_arrays = self.open_arrays.lock();
            let entry = open_arrays
                .entry(array_uri.to_string())
                .or_insert_with(|| Arc::new(OpenArray::new(array_uri.clone())));
            entry.incr_query_num();
            entry.clone()
        };
        match self.array_open_load(&open_array) {
            Ok(loaded) => Ok(loaded),
            Err(e) => {
                self.array_close(array_uri);
                Err(e)
            }
        }
    }

    fn array_open_load(
        &self,
        open_array: &OpenArray,
    ) -> Result<(Arc<ArrayMetadata>, Vec<Arc<FragmentMetadata>>), StorageManagerError> {
        let array_uri = open_array.array_uri().clone();
        let array_metadata =
            open_array.get_or_load_metadata(|| self.load(array_uri.as_str()))?;

        let mut fragment_metadata = Vec::new();
        for fragment_uri in self.get_fragment_uris(&array_uri)? {
            if !self
                .vfs
                .is_file(&fragment_uri.join(FRAGMENT_METADATA_FILENAME))
            {
                debug!(%fragment_uri, "skipping fragment without metadata");
                continue;
            }
            let fragment = open_array.get_or_load_fragment(&fragment_uri, || {
                self.load_fragment(array_metadata.clone(), &fragment_uri)
            })?;
            fragment_metadata.push(fragment);
        }
        Ok((array_metadata, fragment_metadata))
    }

    /// Close the array at `array_uri`, evicting it from the catalog when
    /// its open count returns to zero.
    fn array_close(&self, array_uri: &URI) {
        let mut open_arrays = self.open_arrays.lock();
        if let Some(open_array) = open_arrays.get(array_uri.as_str()) {
            if open_array.decr_query_num() == 0 {
                open_arrays.remove(array_uri.as_str());
                debug!(%array_uri, "evicted open array");
            }
        }
    }
}

fn shutdown_async(state: &AsyncState, threads: Vec<JoinHandle<()>>) {
    for class in &state.classes {
        class.queue.lock().done = true;
        class.cv.notify_all();
    }
    for handle in threads {
        let _ = handle.join();
    }
}

impl Drop for StorageManager {
    fn drop(&mut self) {
        shutdown_async(&self.async_state, std::mem::take(&mut self.async_threads));
        debug_assert!(
            self.open_arrays.lock().is_empty(),
            "open-array catalog not empty on shutdown"
        );
    }
}
