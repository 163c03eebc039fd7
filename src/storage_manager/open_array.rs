//! Reference-counted in-memory state of an open array.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::array::array_metadata::ArrayMetadata;
use crate::array::fragment_metadata::FragmentMetadata;
use crate::uri::URI;

use super::StorageManagerError;

/// The in-memory state of one open array: its metadata, the loaded
/// fragment metadata, and the number of queries holding it open.
///
/// Created on the first `query_init` for a URI and evicted from the
/// storage manager catalog when the count returns to zero. Metadata loads
/// are serialised through the entry's own mutexes.
#[derive(Debug)]
pub(crate) struct OpenArray {
    array_uri: URI,
    array_metadata: Mutex<Option<Arc<ArrayMetadata>>>,
    fragment_metadata: Mutex<HashMap<String, Arc<FragmentMetadata>>>,
    query_num: AtomicU64,
}

impl OpenArray {
    pub(crate) fn new(array_uri: URI) -> Self {
        Self {
            array_uri,
            array_metadata: Mutex::new(None),
            fragment_metadata: Mutex::new(HashMap::new()),
            query_num: AtomicU64::new(0),
        }
    }

    pub(crate) fn array_uri(&self) -> &URI {
        &self.array_uri
    }

    /// Increment the open-query count, returning the new count.
    pub(crate) fn incr_query_num(&self) -> u64 {
        self.query_num.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Decrement the open-query count, returning the new count.
    pub(crate) fn decr_query_num(&self) -> u64 {
        self.query_num.fetch_sub(1, Ordering::SeqCst) - 1
    }

    /// The cached array metadata, loading it with `load` on first use.
    pub(crate) fn get_or_load_metadata(
        &self,
        load: impl FnOnce() -> Result<ArrayMetadata, StorageManagerError>,
    ) -> Result<Arc<ArrayMetadata>, StorageManagerError> {
        let mut metadata = self.array_metadata.lock();
        if let Some(metadata) = &*metadata {
            return Ok(metadata.clone());
        }
        let loaded = Arc::new(load()?);
        *metadata = Some(loaded.clone());
        Ok(loaded)
    }

    /// The cached metadata of the fragment at `fragment_uri`, loading it
    /// with `load` on first use.
    pub(crate) fn get_or_load_fragment(
        &self,
        fragment_uri: &URI,
        load: impl FnOnce() -> Result<FragmentMetadata, StorageManagerError>,
    ) -> Result<Arc<FragmentMetadata>, StorageManagerError> {
        let mut fragments = self.fragment_metadata.lock();
        if let Some(fragment) = fragments.get(fragment_uri.as_str()) {
            return Ok(fragment.clone());
        }
        let loaded = Arc::new(load()?);
        fragments.insert(fragment_uri.to_string(), loaded.clone());
        Ok(loaded)
    }
}
