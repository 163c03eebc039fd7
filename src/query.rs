//! Queries: the unit of work submitted to the storage manager.
//!
//! A [`Query`] targets a rectangular subarray and a subset of attributes
//! of one array. It is created by the caller, initialised with
//! [`StorageManager::query_init`](crate::storage_manager::StorageManager::query_init)
//! (which opens the array and attaches its metadata), run with
//! `query_submit` or `query_submit_async`, and released with
//! `query_finalize`.
//!
//! The full tile-based execution engine (tile I/O, filter pipelines,
//! result assembly) is layered on top of this crate. The executor here is
//! contract-level: a write materialises a fragment from the caller
//! buffers, a read merges fragments cell-wise in the canonical fragment
//! order. Buffers hold cells in the array cell order over the query
//! subarray.

use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::array::array_metadata::{ArrayMetadata, ArrayMetadataError, DomainError, VAR_SIZE};
use crate::array::data_type::{coords_dispatch, CoordType, DomainValues};
use crate::array::fragment_metadata::{FragmentMetadata, FragmentMetadataError, FragmentName};
use crate::array::{Layout, OverlapKind};
use crate::buffer::Buffer;
use crate::storage_manager::FRAGMENT_METADATA_FILENAME;
use crate::uri::URI;
use crate::vfs::{Vfs, VfsError};

/// A query processing error.
#[derive(Debug, Error)]
pub enum QueryError {
    /// A virtual filesystem error.
    #[error(transparent)]
    Vfs(#[from] VfsError),
    /// A coordinate or subarray domain error.
    #[error(transparent)]
    Domain(#[from] DomainError),
    /// An array metadata error.
    #[error(transparent)]
    Metadata(#[from] ArrayMetadataError),
    /// A fragment metadata error.
    #[error(transparent)]
    Fragment(#[from] FragmentMetadataError),
    /// An operation in the wrong query lifecycle state.
    #[error("invalid query state: {0}")]
    InvalidState(&'static str),
    /// A caller buffer too small for the query subarray.
    #[error("buffer for attribute `{0}` is too small")]
    BufferTooSmall(String),
    /// A fragment data file shorter than its metadata implies.
    #[error("fragment `{0}` is corrupt: {1}")]
    CorruptFragment(String, &'static str),
    /// An operation the contract-level executor does not implement.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

/// The query type.
#[derive(Copy, Clone, Debug, derive_more::Display, PartialEq, Eq)]
pub enum QueryType {
    /// Read cells from the array.
    #[display("read")]
    Read,
    /// Write cells as a new fragment.
    #[display("write")]
    Write,
}

/// The query lifecycle status.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum QueryStatus {
    /// Created but not yet initialised.
    Uninitialized,
    /// Initialised and ready for submission.
    Initialized,
    /// Being processed.
    InProgress,
    /// Processed successfully.
    Completed,
    /// Processing failed.
    Failed,
}

/// A completion callback, invoked exactly once after an asynchronously
/// submitted query is processed (or on finalize if still pending).
pub type QueryCallback = Box<dyn FnOnce() + Send + 'static>;

/// A read or write work unit over one array.
pub struct Query {
    query_type: QueryType,
    layout: Layout,
    status: QueryStatus,
    array_uri: Option<URI>,
    array_metadata: Option<Arc<ArrayMetadata>>,
    fragment_metadata: Vec<Arc<FragmentMetadata>>,
    subarray: Option<DomainValues>,
    attributes: Vec<String>,
    attribute_indexes: Vec<usize>,
    buffers: Vec<Vec<u8>>,
    buffer_sizes: Vec<u64>,
    consolidation_fragment_uri: Option<URI>,
    fragment_uri: Option<URI>,
    callback: Option<QueryCallback>,
    skip_array_lock: bool,
    finalized: bool,
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("query_type", &self.query_type)
            .field("layout", &self.layout)
            .field("status", &self.status)
            .field("array_uri", &self.array_uri)
            .field("attributes", &self.attributes)
            .finish_non_exhaustive()
    }
}

impl Query {
    /// Create an uninitialised query.
    #[must_use]
    pub fn new(query_type: QueryType, layout: Layout) -> Self {
        Self {
            query_type,
            layout,
            status: QueryStatus::Uninitialized,
            array_uri: None,
            array_metadata: None,
            fragment_metadata: Vec::new(),
            subarray: None,
            attributes: Vec::new(),
            attribute_indexes: Vec::new(),
            buffers: Vec::new(),
            buffer_sizes: Vec::new(),
            consolidation_fragment_uri: None,
            fragment_uri: None,
            callback: None,
            skip_array_lock: false,
            finalized: false,
        }
    }

    /// The query type.
    #[must_use]
    pub fn query_type(&self) -> QueryType {
        self.query_type
    }

    /// The cell layout of the caller buffers.
    #[must_use]
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// The lifecycle status.
    #[must_use]
    pub fn status(&self) -> QueryStatus {
        self.status
    }

    /// The queried attribute names.
    #[must_use]
    pub fn attributes(&self) -> &[String] {
        &self.attributes
    }

    /// The query subarray.
    #[must_use]
    pub fn subarray(&self) -> Option<&DomainValues> {
        self.subarray.as_ref()
    }

    /// The caller buffers, one per queried attribute.
    #[must_use]
    pub fn buffers(&self) -> &[Vec<u8>] {
        &self.buffers
    }

    /// The number of bytes valid in each caller buffer.
    ///
    /// For a read query that failed mid-stream these reflect the bytes
    /// written before the failure.
    #[must_use]
    pub fn buffer_sizes(&self) -> &[u64] {
        &self.buffer_sizes
    }

    /// Consume the query, returning the caller buffers.
    #[must_use]
    pub fn into_buffers(self) -> Vec<Vec<u8>> {
        self.buffers
    }

    /// The metadata of the opened array, if initialised.
    #[must_use]
    pub fn array_metadata(&self) -> Option<&Arc<ArrayMetadata>> {
        self.array_metadata.as_ref()
    }

    /// The fragment created by a completed write query.
    #[must_use]
    pub fn fragment_uri(&self) -> Option<&URI> {
        self.fragment_uri.as_ref()
    }

    /// The fragment metadata attached at initialisation, in the canonical
    /// fragment order.
    #[must_use]
    pub fn fragment_metadata(&self) -> &[Arc<FragmentMetadata>] {
        &self.fragment_metadata
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn attach(
        &mut self,
        array_uri: URI,
        array_metadata: Arc<ArrayMetadata>,
        fragment_metadata: Vec<Arc<FragmentMetadata>>,
        subarray: Option<DomainValues>,
        attributes: Vec<String>,
        attribute_indexes: Vec<usize>,
        buffers: Vec<Vec<u8>>,
        consolidation_fragment_uri: Option<URI>,
        skip_array_lock: bool,
    ) {
        self.buffer_sizes = buffers.iter().map(|b| b.len() as u64).collect();
        self.array_uri = Some(array_uri);
        self.array_metadata = Some(array_metadata);
        self.fragment_metadata = fragment_metadata;
        self.subarray = subarray;
        self.attributes = attributes;
        self.attribute_indexes = attribute_indexes;
        self.buffers = buffers;
        self.consolidation_fragment_uri = consolidation_fragment_uri;
        self.skip_array_lock = skip_array_lock;
        self.status = QueryStatus::Initialized;
    }

    pub(crate) fn array_uri(&self) -> Option<&URI> {
        self.array_uri.as_ref()
    }

    pub(crate) fn set_status(&mut self, status: QueryStatus) {
        self.status = status;
    }

    pub(crate) fn set_callback(&mut self, callback: QueryCallback) {
        self.callback = Some(callback);
    }

    pub(crate) fn take_callback(&mut self) -> Option<QueryCallback> {
        self.callback.take()
    }

    pub(crate) fn skip_array_lock(&self) -> bool {
        self.skip_array_lock
    }

    pub(crate) fn finalized(&self) -> bool {
        self.finalized
    }

    pub(crate) fn set_finalized(&mut self) {
        self.finalized = true;
    }

    /// Process the query to completion in the calling thread.
    pub(crate) fn process(&mut self, vfs: &Vfs) -> Result<(), QueryError> {
        if self.array_metadata.is_none() {
            return Err(QueryError::InvalidState("query is not initialized"));
        }
        debug!(query_type = %self.query_type, array = ?self.array_uri, "process query");
        match self.query_type {
            QueryType::Write => self.process_write(vfs),
            QueryType::Read => self.process_read(vfs),
        }
    }

    /// Materialise a fragment from the caller buffers. On failure the
    /// partial fragment directory is removed so the write leaves no trace.
    fn process_write(&mut self, vfs: &Vfs) -> Result<(), QueryError> {
        let metadata = self.array_metadata.clone().expect("checked by process");
        let fragment_uri = self.consolidation_fragment_uri.clone().unwrap_or_else(|| {
            metadata
                .array_uri()
                .join(&FragmentName::generate().to_string())
        });
        vfs.create_dir(&fragment_uri)?;
        match self.write_fragment(vfs, &metadata, &fragment_uri) {
            Ok(()) => {
                self.fragment_uri = Some(fragment_uri);
                Ok(())
            }
            Err(e) => {
                if let Err(remove_error) = vfs.remove_path(&fragment_uri) {
                    debug!(%fragment_uri, %remove_error, "failed to remove partial fragment");
                }
                Err(e)
            }
        }
    }

    fn write_fragment(
        &mut self,
        vfs: &Vfs,
        metadata: &Arc<ArrayMetadata>,
        fragment_uri: &URI,
    ) -> Result<(), QueryError> {
        let mut fragment =
            FragmentMetadata::new(metadata.clone(), fragment_uri.clone(), metadata.dense())?;
        if let Some(subarray) = &self.subarray {
            fragment.set_non_empty_domain(subarray.clone());
        }
        for (i, &attribute_index) in self.attribute_indexes.iter().enumerate() {
            let name = metadata
                .attribute_name(attribute_index)
                .expect("validated by query_init");
            let file_uri = fragment_uri.join(&format!("{name}.tdb"));
            vfs.write(&file_uri, &self.buffers[i])?;
            fragment.append_tile_offset(attribute_index, 0)?;
            fragment.append_tile_size(attribute_index, self.buffers[i].len() as u64)?;
        }
        let mut buffer = Buffer::new();
        fragment.serialize(&mut buffer);
        vfs.write(
            &fragment_uri.join(FRAGMENT_METADATA_FILENAME),
            buffer.data(),
        )?;
        Ok(())
    }

    /// Merge fragments into the caller buffers, newest last so later
    /// writes mask earlier ones.
    fn process_read(&mut self, vfs: &Vfs) -> Result<(), QueryError> {
        let metadata = self.array_metadata.clone().expect("checked by process");
        if !metadata.dense() {
            return Err(QueryError::Unsupported(
                "sparse reads are handled by the execution engine",
            ));
        }
        let subarray = self
            .subarray
            .clone()
            .ok_or(QueryError::InvalidState("read query has no subarray"))?;
        self.buffer_sizes = vec![0; self.buffers.len()];
        coords_dispatch!(metadata.coords_type(), T => {
            self.read_dense::<T>(vfs, &metadata, &subarray)
        })
    }

    fn read_dense<T: CoordType>(
        &mut self,
        vfs: &Vfs,
        metadata: &Arc<ArrayMetadata>,
        subarray: &DomainValues,
    ) -> Result<(), QueryError> {
        let subarray: &[T] = subarray
            .typed()
            .ok_or_else(|| DomainError::DatatypeMismatch(T::DATATYPE, metadata.coords_type()))?;
        let cell_num = metadata.cell_num_in_range(subarray);

        let attributes: Vec<(usize, usize)> =
            self.attribute_indexes.iter().copied().enumerate().collect();
        for &(i, attribute_index) in &attributes {
            let cell_size = metadata.cell_size(attribute_index);
            if cell_size == VAR_SIZE {
                return Err(QueryError::Unsupported(
                    "variable-sized attribute reads are handled by the execution engine",
                ));
            }
            if (self.buffers[i].len() as u64) < cell_num * cell_size {
                return Err(QueryError::BufferTooSmall(self.attributes[i].clone()));
            }
        }

        let fragments = self.fragment_metadata.clone();
        for fragment in &fragments {
            let Some(non_empty_domain) = fragment.non_empty_domain() else {
                continue;
            };
            let fragment_domain: &[T] = non_empty_domain.typed().ok_or_else(|| {
                DomainError::DatatypeMismatch(T::DATATYPE, metadata.coords_type())
            })?;
            let (kind, region) = metadata.subarray_overlap(fragment_domain, subarray);
            if kind == OverlapKind::None {
                continue;
            }
            for &(i, attribute_index) in &attributes {
                self.read_fragment_region::<T>(
                    vfs,
                    metadata,
                    fragment,
                    fragment_domain,
                    subarray,
                    &region,
                    i,
                    attribute_index,
                )?;
            }
        }
        Ok(())
    }

    /// Copy the cells of `region` from one fragment attribute file into
    /// the caller buffer.
    #[allow(clippy::too_many_arguments)]
    fn read_fragment_region<T: CoordType>(
        &mut self,
        vfs: &Vfs,
        metadata: &Arc<ArrayMetadata>,
        fragment: &Arc<FragmentMetadata>,
        fragment_domain: &[T],
        subarray: &[T],
        region: &[T],
        buffer_index: usize,
        attribute_index: usize,
    ) -> Result<(), QueryError> {
        let cell_size = usize::try_from(metadata.cell_size(attribute_index)).unwrap();
        let name = metadata
            .attribute_name(attribute_index)
            .expect("validated by query_init");
        let file_uri = fragment.fragment_uri().join(&format!("{name}.tdb"));
        let file_size = usize::try_from(vfs.file_size(&file_uri)?).unwrap();
        let mut data = vec![0_u8; file_size];
        vfs.read(&file_uri, 0, &mut data)?;

        let cell_order = metadata.cell_order();
        let mut coords: Vec<T> = region.chunks_exact(2).map(|bounds| bounds[0]).collect();
        let mut high_water = self.buffer_sizes[buffer_index];
        loop {
            let src = domain_cell_pos(fragment_domain, &coords, cell_order) * cell_size as u64;
            let dst = domain_cell_pos(subarray, &coords, cell_order) * cell_size as u64;
            let src = usize::try_from(src).unwrap();
            let dst = usize::try_from(dst).unwrap();
            if src + cell_size > data.len() {
                return Err(QueryError::CorruptFragment(
                    fragment.fragment_uri().to_string(),
                    "attribute file shorter than its non-empty domain implies",
                ));
            }
            self.buffers[buffer_index][dst..dst + cell_size]
                .copy_from_slice(&data[src..src + cell_size]);
            high_water = high_water.max((dst + cell_size) as u64);
            if !metadata.get_next_cell_coords(region, &mut coords) {
                break;
            }
        }
        self.buffer_sizes[buffer_index] = high_water;
        Ok(())
    }
}

/// The position of `coords` within `domain` (interleaved `[lo, hi]`
/// pairs) under a row- or column-major linearisation of the whole domain.
fn domain_cell_pos<T: CoordType>(domain: &[T], coords: &[T], layout: Layout) -> u64 {
    let dim_num = coords.len();
    let span = |d: usize| {
        (domain[2 * d + 1] - domain[2 * d] + T::one())
            .to_u64()
            .unwrap()
    };
    (0..dim_num)
        .map(|d| {
            let stride: u64 = match layout {
                Layout::RowMajor => (d + 1..dim_num).map(span).product(),
                Layout::ColMajor => (0..d).map(span).product(),
            };
            (coords[d] - domain[2 * d]).to_u64().unwrap() * stride
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_cell_pos_row_and_col() {
        let domain = [0_i64, 3, 0, 3];
        assert_eq!(domain_cell_pos(&domain, &[0_i64, 1], Layout::RowMajor), 1);
        assert_eq!(domain_cell_pos(&domain, &[1_i64, 0], Layout::RowMajor), 4);
        assert_eq!(domain_cell_pos(&domain, &[1_i64, 0], Layout::ColMajor), 1);
        assert_eq!(domain_cell_pos(&domain, &[0_i64, 1], Layout::ColMajor), 4);
    }

    #[test]
    fn query_starts_uninitialized() {
        let query = Query::new(QueryType::Read, Layout::RowMajor);
        assert_eq!(query.status(), QueryStatus::Uninitialized);
        assert_eq!(query.query_type(), QueryType::Read);
        assert!(query.buffers().is_empty());
    }
}
