//! Array metadata: the schema and its derived geometry.
//!
//! An [`ArrayMetadata`] is built empty, populated with setters and
//! [`ArrayMetadata::add_attribute`], and frozen with
//! [`ArrayMetadata::init`], which computes the derived geometry (cells per
//! tile, cell sizes, the tile domain, and the tile offsets) and verifies
//! the schema invariants. After `init` the object is read-only.
//!
//! The coordinate algorithms translate between global cell coordinates,
//! tile coordinates, and in-tile linear positions under the array's
//! row-major or column-major tile and cell orderings. They are generic
//! over the coordinate type; [`coords_dispatch`] selects the
//! instantiation matching [`ArrayMetadata::coords_type`].

use std::cmp::Ordering;
use std::io;

use itertools::izip;
use num::{One, ToPrimitive, Zero};
use thiserror::Error;

use crate::buffer::{Buffer, BufferError, ConstBuffer};
use crate::uri::URI;

use super::attribute::{Attribute, AttributeError, COORDS_NAME};
use super::data_type::{coords_dispatch, Compressor, CoordType, Datatype, DomainValues};
use super::hyperspace::{Hyperspace, HyperspaceError};
use super::{ArrayType, InvalidTagError, Layout};

/// Sentinel cell size recorded for variable-sized attributes.
pub const VAR_SIZE: u64 = u64::MAX;

/// The default sparse tile capacity.
const DEFAULT_CAPACITY: u64 = 10_000;

/// A coordinate or subarray domain error.
#[derive(Debug, Error)]
pub enum DomainError {
    /// The coordinate type does not match the array coordinates type.
    #[error("coordinate datatype {0} does not match the array coordinates type {1}")]
    DatatypeMismatch(Datatype, Datatype),
    /// An unexpected number of coordinate values.
    #[error("expected {expected} coordinate values, got {got}")]
    CountMismatch {
        /// The expected count.
        expected: usize,
        /// The actual count.
        got: usize,
    },
    /// Coordinates or a subarray lie outside the array domain.
    #[error("coordinates lie outside the array domain")]
    OutOfDomain,
    /// An operation that requires regular tiles on an irregular array.
    #[error("operation requires regular tiles")]
    IrregularTiles,
    /// An operation on metadata without a hyperspace.
    #[error("array metadata has no hyperspace")]
    MissingHyperspace,
}

/// An array metadata validation or deserialization error.
#[derive(Debug, Error)]
pub enum ArrayMetadataError {
    /// An invalid hyperspace.
    #[error(transparent)]
    Hyperspace(#[from] HyperspaceError),
    /// An invalid attribute.
    #[error(transparent)]
    Attribute(#[from] AttributeError),
    /// A buffer read error.
    #[error(transparent)]
    Buffer(#[from] BufferError),
    /// An invalid enumeration tag.
    #[error(transparent)]
    InvalidTag(#[from] InvalidTagError),
    /// The metadata has no hyperspace.
    #[error("array metadata has no hyperspace")]
    MissingHyperspace,
    /// The metadata has no attributes.
    #[error("array metadata has no attributes")]
    NoAttributes,
    /// A duplicate attribute name.
    #[error("duplicate attribute name `{0}`")]
    DuplicateAttributeName(String),
    /// An attribute uses the reserved coordinates name.
    #[error("attribute name `{COORDS_NAME}` is reserved")]
    ReservedAttributeName,
    /// A zero sparse tile capacity.
    #[error("capacity must be positive")]
    ZeroCapacity,
    /// An operation that requires an initialized metadata object.
    #[error("array metadata is not initialized")]
    NotInitialized,
    /// An attribute that does not exist.
    #[error("attribute `{0}` does not exist")]
    AttributeNotFound(String),
}

/// The kind of overlap between two subarrays.
///
/// See [`ArrayMetadata::subarray_overlap`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OverlapKind {
    /// The subarrays are disjoint.
    None,
    /// The first subarray fully covers the second.
    Full,
    /// Partial overlap, non-contiguous along the tile order.
    Partial,
    /// Partial overlap, contiguous along the tile order.
    PartialContiguous,
}

/// The schema of an array plus the geometry derived from it.
#[derive(Clone, Debug, PartialEq)]
pub struct ArrayMetadata {
    array_uri: URI,
    array_type: ArrayType,
    attributes: Vec<Attribute>,
    capacity: u64,
    cell_order: Layout,
    tile_order: Layout,
    coords_compression: Compressor,
    coords_compression_level: i32,
    hyperspace: Option<Hyperspace>,

    // Derived by `init`.
    initialized: bool,
    cell_num_per_tile: u64,
    cell_sizes: Vec<u64>,
    coords_size: u64,
    tile_domain: Option<DomainValues>,
    tile_offsets_row: Vec<u64>,
    tile_offsets_col: Vec<u64>,
}

impl ArrayMetadata {
    /// Create empty metadata for the array at `array_uri`.
    #[must_use]
    pub fn new(array_uri: URI) -> Self {
        Self {
            array_uri,
            array_type: ArrayType::Dense,
            attributes: Vec::new(),
            capacity: DEFAULT_CAPACITY,
            cell_order: Layout::RowMajor,
            tile_order: Layout::RowMajor,
            coords_compression: Compressor::NoCompression,
            coords_compression_level: -1,
            hyperspace: None,
            initialized: false,
            cell_num_per_tile: 0,
            cell_sizes: Vec::new(),
            coords_size: 0,
            tile_domain: None,
            tile_offsets_row: Vec::new(),
            tile_offsets_col: Vec::new(),
        }
    }

    /// The array URI.
    #[must_use]
    pub fn array_uri(&self) -> &URI {
        &self.array_uri
    }

    /// The array type.
    #[must_use]
    pub fn array_type(&self) -> ArrayType {
        self.array_type
    }

    /// Whether the array is dense.
    #[must_use]
    pub fn dense(&self) -> bool {
        self.array_type == ArrayType::Dense
    }

    /// The number of attributes (excluding the coordinates).
    #[must_use]
    pub fn attribute_num(&self) -> usize {
        self.attributes.len()
    }

    /// The attributes.
    #[must_use]
    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    /// The attribute with index `index`, where index `attribute_num` names
    /// the coordinates.
    #[must_use]
    pub fn attribute(&self, index: usize) -> Option<&Attribute> {
        self.attributes.get(index)
    }

    /// The name of the attribute with index `index` (the coordinates name
    /// for index `attribute_num`).
    #[must_use]
    pub fn attribute_name(&self, index: usize) -> Option<&str> {
        if index == self.attribute_num() {
            Some(COORDS_NAME)
        } else {
            self.attributes.get(index).map(Attribute::name)
        }
    }

    /// The index of the attribute named `name`.
    ///
    /// The reserved coordinates name resolves to index `attribute_num`.
    pub fn attribute_index(&self, name: &str) -> Result<usize, ArrayMetadataError> {
        if name == COORDS_NAME {
            return Ok(self.attribute_num());
        }
        self.attributes
            .iter()
            .position(|a| a.name() == name)
            .ok_or_else(|| ArrayMetadataError::AttributeNotFound(name.to_string()))
    }

    /// The indexes of the attributes named in `names`.
    pub fn attribute_indexes(&self, names: &[&str]) -> Result<Vec<usize>, ArrayMetadataError> {
        names
            .iter()
            .map(|name| self.attribute_index(name))
            .collect()
    }

    /// The sparse tile capacity.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// The cell order.
    #[must_use]
    pub fn cell_order(&self) -> Layout {
        self.cell_order
    }

    /// The tile order.
    #[must_use]
    pub fn tile_order(&self) -> Layout {
        self.tile_order
    }

    /// The coordinates compressor.
    #[must_use]
    pub fn coords_compression(&self) -> Compressor {
        self.coords_compression
    }

    /// The coordinates compression level.
    #[must_use]
    pub fn coords_compression_level(&self) -> i32 {
        self.coords_compression_level
    }

    /// The hyperspace, if set.
    #[must_use]
    pub fn hyperspace(&self) -> Option<&Hyperspace> {
        self.hyperspace.as_ref()
    }

    /// The number of dimensions (`0` before a hyperspace is set).
    #[must_use]
    pub fn dim_num(&self) -> usize {
        self.hyperspace.as_ref().map_or(0, Hyperspace::dim_num)
    }

    /// The coordinate datatype.
    ///
    /// # Panics
    /// Panics if no hyperspace has been set.
    #[must_use]
    pub fn coords_type(&self) -> Datatype {
        self.hyperspace.as_ref().expect("hyperspace is set").datatype()
    }

    /// The array domain: interleaved `[lo, hi]` pairs.
    ///
    /// # Panics
    /// Panics if no hyperspace has been set.
    #[must_use]
    pub fn domain(&self) -> &DomainValues {
        self.hyperspace.as_ref().expect("hyperspace is set").domain()
    }

    /// The tile extents, [`None`] for irregular tiles.
    #[must_use]
    pub fn tile_extents(&self) -> Option<&DomainValues> {
        self.hyperspace.as_ref().and_then(Hyperspace::tile_extents)
    }

    /// The number of cells per tile. Meaningful only for dense arrays.
    #[must_use]
    pub fn cell_num_per_tile(&self) -> u64 {
        self.cell_num_per_tile
    }

    /// The size in bytes of one cell of attribute `index`, [`VAR_SIZE`] for
    /// variable-sized attributes, the coordinates size for index
    /// `attribute_num`.
    #[must_use]
    pub fn cell_size(&self, index: usize) -> u64 {
        if index == self.attribute_num() {
            self.coords_size
        } else {
            self.cell_sizes.get(index).copied().unwrap_or(VAR_SIZE)
        }
    }

    /// The number of values per cell of attribute `index`.
    #[must_use]
    pub fn cell_val_num(&self, index: usize) -> Option<u32> {
        self.attributes.get(index).map(Attribute::cell_val_num)
    }

    /// Whether attribute `index` is variable-sized.
    #[must_use]
    pub fn var_size(&self, index: usize) -> bool {
        self.attributes.get(index).is_some_and(Attribute::var_size)
    }

    /// The size in bytes of one coordinates tuple.
    #[must_use]
    pub fn coords_size(&self) -> u64 {
        self.coords_size
    }

    /// Set the array type.
    pub fn set_array_type(&mut self, array_type: ArrayType) {
        debug_assert!(!self.initialized);
        self.array_type = array_type;
    }

    /// Set the sparse tile capacity.
    pub fn set_capacity(&mut self, capacity: u64) {
        debug_assert!(!self.initialized);
        self.capacity = capacity;
    }

    /// Set the cell order.
    pub fn set_cell_order(&mut self, cell_order: Layout) {
        debug_assert!(!self.initialized);
        self.cell_order = cell_order;
    }

    /// Set the tile order.
    pub fn set_tile_order(&mut self, tile_order: Layout) {
        debug_assert!(!self.initialized);
        self.tile_order = tile_order;
    }

    /// Set the coordinates compressor and compression level.
    pub fn set_coords_compression(&mut self, compressor: Compressor, level: i32) {
        debug_assert!(!self.initialized);
        self.coords_compression = compressor;
        self.coords_compression_level = level;
    }

    /// Set the hyperspace.
    pub fn set_hyperspace(&mut self, hyperspace: Hyperspace) {
        debug_assert!(!self.initialized);
        self.hyperspace = Some(hyperspace);
    }

    /// Add an attribute.
    pub fn add_attribute(&mut self, attribute: Attribute) {
        debug_assert!(!self.initialized);
        self.attributes.push(attribute);
    }

    /// Verify the schema invariants.
    pub fn check(&self) -> Result<(), ArrayMetadataError> {
        let hyperspace = self
            .hyperspace
            .as_ref()
            .ok_or(ArrayMetadataError::MissingHyperspace)?;
        hyperspace.check(self.array_type)?;
        if self.attributes.is_empty() {
            return Err(ArrayMetadataError::NoAttributes);
        }
        for (i, attribute) in self.attributes.iter().enumerate() {
            if attribute.name() == COORDS_NAME {
                return Err(ArrayMetadataError::ReservedAttributeName);
            }
            if self.attributes[..i].iter().any(|a| a.name() == attribute.name()) {
                return Err(ArrayMetadataError::DuplicateAttributeName(
                    attribute.name().to_string(),
                ));
            }
        }
        if self.capacity == 0 {
            return Err(ArrayMetadataError::ZeroCapacity);
        }
        Ok(())
    }

    /// Compute the derived geometry and verify the schema invariants,
    /// freezing the object.
    pub fn init(&mut self) -> Result<(), ArrayMetadataError> {
        let hyperspace = self
            .hyperspace
            .as_ref()
            .ok_or(ArrayMetadataError::MissingHyperspace)?;

        self.coords_size = hyperspace.dim_num() as u64 * hyperspace.datatype().size();
        self.cell_sizes = self
            .attributes
            .iter()
            .map(|a| a.cell_size().unwrap_or(VAR_SIZE))
            .collect();

        let tile_counts = self.compute_tile_counts();
        if let Some(tile_counts) = &tile_counts {
            self.cell_num_per_tile = self.compute_cell_num_per_tile();
            self.tile_domain = Some(self.compute_tile_domain(tile_counts));
            self.tile_offsets_row = compute_tile_offsets(tile_counts, Layout::RowMajor);
            self.tile_offsets_col = compute_tile_offsets(tile_counts, Layout::ColMajor);
        } else {
            self.cell_num_per_tile = 0;
            self.tile_domain = None;
            self.tile_offsets_row = Vec::new();
            self.tile_offsets_col = Vec::new();
        }

        self.check()?;
        self.initialized = true;
        Ok(())
    }

    /// The number of tiles per dimension, [`None`] for irregular tiles.
    fn compute_tile_counts(&self) -> Option<Vec<u64>> {
        let hyperspace = self.hyperspace.as_ref()?;
        let tile_extents = hyperspace.tile_extents()?;
        coords_dispatch!(hyperspace.datatype(), T => {
            let domain = hyperspace.domain().typed::<T>().unwrap();
            let extents = tile_extents.typed::<T>().unwrap();
            Some(
                izip!(domain.chunks_exact(2), extents)
                    .map(|(bounds, extent)| {
                        ((bounds[1] - bounds[0] + T::one()) / *extent)
                            .to_u64()
                            .unwrap()
                    })
                    .collect(),
            )
        })
    }

    fn compute_cell_num_per_tile(&self) -> u64 {
        let Some(tile_extents) = self.tile_extents() else {
            return 0;
        };
        coords_dispatch!(tile_extents.datatype(), T => {
            tile_extents
                .typed::<T>()
                .unwrap()
                .iter()
                .map(|extent| extent.to_u64().unwrap())
                .product()
        })
    }

    fn compute_tile_domain(&self, tile_counts: &[u64]) -> DomainValues {
        coords_dispatch!(self.coords_type(), T => {
            let mut tile_domain: Vec<T> = Vec::with_capacity(2 * tile_counts.len());
            for count in tile_counts {
                tile_domain.push(T::zero());
                tile_domain.push(num::cast(count - 1).unwrap());
            }
            T::into_domain_values(tile_domain)
        })
    }

    // ------------------------------------------------------------------
    // Coordinate algorithms
    // ------------------------------------------------------------------

    /// The typed domain and tile extents, verifying that `T` matches the
    /// coordinate datatype.
    fn typed_geometry<T: CoordType>(&self) -> Result<(&[T], Option<&[T]>), DomainError> {
        let hyperspace = self
            .hyperspace
            .as_ref()
            .ok_or(DomainError::MissingHyperspace)?;
        let domain = hyperspace
            .domain()
            .typed::<T>()
            .ok_or_else(|| DomainError::DatatypeMismatch(T::DATATYPE, hyperspace.datatype()))?;
        let tile_extents = hyperspace.tile_extents().map(|e| e.typed::<T>().unwrap());
        Ok((domain, tile_extents))
    }

    /// Compare two coordinate tuples in the array cell order.
    ///
    /// In the presence of a regular tile grid this assumes both tuples lie
    /// in the same tile.
    #[must_use]
    pub fn cell_order_cmp<T: CoordType>(&self, coords_a: &[T], coords_b: &[T]) -> Ordering {
        match self.cell_order {
            Layout::RowMajor => lexicographic_cmp(coords_a.iter(), coords_b.iter()),
            Layout::ColMajor => lexicographic_cmp(coords_a.iter().rev(), coords_b.iter().rev()),
        }
    }

    /// Compare the tile positions of two coordinate tuples in the array
    /// tile order. Always [`Ordering::Equal`] for irregular tiles.
    #[must_use]
    pub fn tile_order_cmp<T: CoordType>(&self, coords_a: &[T], coords_b: &[T]) -> Ordering {
        let Ok((domain, Some(tile_extents))) = self.typed_geometry::<T>() else {
            return Ordering::Equal;
        };
        let tile_index = |d: usize, c: T| {
            ((c - domain[2 * d]) / tile_extents[d]).to_u64().unwrap()
        };
        let dims: Vec<usize> = match self.tile_order {
            Layout::RowMajor => (0..coords_a.len()).collect(),
            Layout::ColMajor => (0..coords_a.len()).rev().collect(),
        };
        for d in dims {
            match tile_index(d, coords_a[d]).cmp(&tile_index(d, coords_b[d])) {
                Ordering::Equal => {}
                other => return other,
            }
        }
        Ordering::Equal
    }

    /// Compare two coordinate tuples, tile order first, cell order as the
    /// tiebreak.
    #[must_use]
    pub fn tile_cell_order_cmp<T: CoordType>(&self, coords_a: &[T], coords_b: &[T]) -> Ordering {
        self.tile_order_cmp(coords_a, coords_b)
            .then_with(|| self.cell_order_cmp(coords_a, coords_b))
    }

    /// The id of the tile that `cell_coords` falls into, under the array
    /// tile order. Returns `0` for irregular tiles.
    #[must_use]
    pub fn tile_id<T: CoordType>(&self, cell_coords: &[T]) -> u64 {
        let Ok((domain, Some(tile_extents))) = self.typed_geometry::<T>() else {
            return 0;
        };
        let tile_offsets = match self.tile_order {
            Layout::RowMajor => &self.tile_offsets_row,
            Layout::ColMajor => &self.tile_offsets_col,
        };
        izip!(cell_coords, domain.chunks_exact(2), tile_extents, tile_offsets)
            .map(|(c, bounds, extent, offset)| {
                ((*c - bounds[0]) / *extent).to_u64().unwrap() * offset
            })
            .sum()
    }

    /// The position of `coords` within its tile, in the array cell order.
    /// Applicable only to dense arrays.
    ///
    /// # Errors
    /// Returns a [`DomainError`] if `coords` lies outside the array domain
    /// or the array has irregular tiles.
    pub fn get_cell_pos<T: CoordType>(&self, coords: &[T]) -> Result<u64, DomainError> {
        let (domain, tile_extents) = self.typed_geometry::<T>()?;
        let tile_extents = tile_extents.ok_or(DomainError::IrregularTiles)?;
        if coords.len() != tile_extents.len() {
            return Err(DomainError::CountMismatch {
                expected: tile_extents.len(),
                got: coords.len(),
            });
        }
        for (c, bounds) in izip!(coords, domain.chunks_exact(2)) {
            if *c < bounds[0] || *c > bounds[1] {
                return Err(DomainError::OutOfDomain);
            }
        }

        let dim_num = coords.len();
        let extent_u64 = |d: usize| tile_extents[d].to_u64().unwrap();
        let mut pos = 0;
        for d in 0..dim_num {
            let stride: u64 = match self.cell_order {
                Layout::RowMajor => (d + 1..dim_num).map(extent_u64).product(),
                Layout::ColMajor => (0..d).map(extent_u64).product(),
            };
            let in_tile = ((coords[d] - domain[2 * d]) % tile_extents[d])
                .to_u64()
                .unwrap();
            pos += in_tile * stride;
        }
        Ok(pos)
    }

    /// Advance `cell_coords` to the next coordinates in the array cell
    /// order within `domain` (interleaved `[lo, hi]` pairs), disregarding
    /// tiling. Returns `false` when the domain is exhausted.
    pub fn get_next_cell_coords<T: CoordType>(&self, domain: &[T], cell_coords: &mut [T]) -> bool {
        match self.cell_order {
            Layout::RowMajor => advance_row_major(domain, cell_coords),
            Layout::ColMajor => advance_col_major(domain, cell_coords),
        }
    }

    /// Retreat `cell_coords` to the previous coordinates in the array cell
    /// order within `domain`, disregarding tiling.
    pub fn get_previous_cell_coords<T: CoordType>(&self, domain: &[T], cell_coords: &mut [T]) {
        match self.cell_order {
            Layout::RowMajor => retreat_row_major(domain, cell_coords),
            Layout::ColMajor => retreat_col_major(domain, cell_coords),
        }
    }

    /// Advance `tile_coords` to the next tile coordinates in the array tile
    /// order within the tile domain `domain`. Returns `false` when the
    /// domain is exhausted.
    pub fn get_next_tile_coords<T: CoordType>(&self, domain: &[T], tile_coords: &mut [T]) -> bool {
        match self.tile_order {
            Layout::RowMajor => advance_row_major(domain, tile_coords),
            Layout::ColMajor => advance_col_major(domain, tile_coords),
        }
    }

    /// The position of `tile_coords` in the array tile order within the
    /// array tile domain.
    #[must_use]
    pub fn get_tile_pos<T: CoordType>(&self, tile_coords: &[T]) -> u64 {
        let tile_offsets = match self.tile_order {
            Layout::RowMajor => &self.tile_offsets_row,
            Layout::ColMajor => &self.tile_offsets_col,
        };
        izip!(tile_coords, tile_offsets)
            .map(|(c, offset)| c.to_u64().unwrap() * offset)
            .sum()
    }

    /// The position of `tile_coords` in the array tile order within the
    /// supplied tile domain (which may be a subdomain of the array's).
    #[must_use]
    pub fn get_tile_pos_in_domain<T: CoordType>(&self, domain: &[T], tile_coords: &[T]) -> u64 {
        let dim_num = tile_coords.len();
        let span_u64 = |d: usize| {
            (domain[2 * d + 1] - domain[2 * d] + T::one())
                .to_u64()
                .unwrap()
        };
        (0..dim_num)
            .map(|d| {
                let stride: u64 = match self.tile_order {
                    Layout::RowMajor => (d + 1..dim_num).map(span_u64).product(),
                    Layout::ColMajor => (0..d).map(span_u64).product(),
                };
                (tile_coords[d] - domain[2 * d]).to_u64().unwrap() * stride
            })
            .sum()
    }

    /// The cell subarray covered by the tile at `tile_coords`, as
    /// interleaved `[lo, hi]` pairs.
    ///
    /// # Errors
    /// Returns a [`DomainError`] for irregular tiles or a coordinate type
    /// mismatch.
    pub fn get_tile_subarray<T: CoordType>(&self, tile_coords: &[T]) -> Result<Vec<T>, DomainError> {
        let (domain, tile_extents) = self.typed_geometry::<T>()?;
        let tile_extents = tile_extents.ok_or(DomainError::IrregularTiles)?;
        let mut subarray = Vec::with_capacity(2 * tile_coords.len());
        for (c, bounds, extent) in izip!(tile_coords, domain.chunks_exact(2), tile_extents) {
            subarray.push(bounds[0] + *c * *extent);
            subarray.push(bounds[0] + (*c + T::one()) * *extent - T::one());
        }
        Ok(subarray)
    }

    /// Map the cell subarray `subarray` to tile coordinates: returns the
    /// array tile domain and the subarray expressed in tile coordinates,
    /// both as interleaved `[lo, hi]` pairs, inclusive on both ends.
    ///
    /// # Errors
    /// Returns a [`DomainError`] for irregular tiles or a coordinate type
    /// mismatch.
    pub fn get_subarray_tile_domain<T: CoordType>(
        &self,
        subarray: &[T],
    ) -> Result<(Vec<T>, Vec<T>), DomainError> {
        let (domain, tile_extents) = self.typed_geometry::<T>()?;
        let tile_extents = tile_extents.ok_or(DomainError::IrregularTiles)?;
        let mut tile_domain = Vec::with_capacity(subarray.len());
        let mut subarray_in_tile_domain = Vec::with_capacity(subarray.len());
        for (d, (bounds, extent)) in izip!(domain.chunks_exact(2), tile_extents).enumerate() {
            let tiles = (bounds[1] - bounds[0] + T::one()) / *extent;
            tile_domain.push(T::zero());
            tile_domain.push(tiles - T::one());
            subarray_in_tile_domain.push((subarray[2 * d] - bounds[0]) / *extent);
            subarray_in_tile_domain.push((subarray[2 * d + 1] - bounds[0]) / *extent);
        }
        Ok((tile_domain, subarray_in_tile_domain))
    }

    /// Whether `range` is fully contained in a single row of tiles, i.e.
    /// its first dimension spans at most one tile. `false` for irregular
    /// tiles.
    #[must_use]
    pub fn is_contained_in_tile_slab_row<T: CoordType>(&self, range: &[T]) -> bool {
        self.range_dim_in_one_tile(range, 0)
    }

    /// Whether `range` is fully contained in a single column of tiles, i.e.
    /// its last dimension spans at most one tile. `false` for irregular
    /// tiles.
    #[must_use]
    pub fn is_contained_in_tile_slab_col<T: CoordType>(&self, range: &[T]) -> bool {
        self.range_dim_in_one_tile(range, self.dim_num().saturating_sub(1))
    }

    fn range_dim_in_one_tile<T: CoordType>(&self, range: &[T], d: usize) -> bool {
        let Ok((domain, Some(tile_extents))) = self.typed_geometry::<T>() else {
            return false;
        };
        let lo_tile = (range[2 * d] - domain[2 * d]) / tile_extents[d];
        let hi_tile = (range[2 * d + 1] - domain[2 * d]) / tile_extents[d];
        lo_tile.to_u64().unwrap() == hi_tile.to_u64().unwrap()
    }

    /// Compute the overlap of `subarray_a` with `subarray_b`.
    ///
    /// Returns the kind of overlap and the intersection region (meaningful
    /// unless the kind is [`OverlapKind::None`]).
    #[must_use]
    pub fn subarray_overlap<T: CoordType>(
        &self,
        subarray_a: &[T],
        subarray_b: &[T],
    ) -> (OverlapKind, Vec<T>) {
        let dim_num = subarray_a.len() / 2;
        let mut overlap = Vec::with_capacity(2 * dim_num);
        for d in 0..dim_num {
            overlap.push(partial_max(subarray_a[2 * d], subarray_b[2 * d]));
            overlap.push(partial_min(subarray_a[2 * d + 1], subarray_b[2 * d + 1]));
        }

        for d in 0..dim_num {
            if overlap[2 * d] > overlap[2 * d + 1] {
                return (OverlapKind::None, overlap);
            }
        }

        if overlap.as_slice() == subarray_b {
            return (OverlapKind::Full, overlap);
        }

        // Partial overlap is contiguous along the tile order iff every
        // dimension other than the slowest-varying one is fully covered.
        let contiguous_dims: Box<dyn Iterator<Item = usize>> = match self.tile_order {
            Layout::RowMajor => Box::new(1..dim_num),
            Layout::ColMajor => Box::new(0..dim_num.saturating_sub(1)),
        };
        for d in contiguous_dims {
            if overlap[2 * d] != subarray_b[2 * d] || overlap[2 * d + 1] != subarray_b[2 * d + 1] {
                return (OverlapKind::Partial, overlap);
            }
        }
        (OverlapKind::PartialContiguous, overlap)
    }

    /// The number of tiles in the array domain. `0` for irregular tiles.
    #[must_use]
    pub fn tile_num(&self) -> u64 {
        let tile_offsets = match self.tile_order {
            Layout::RowMajor => &self.tile_offsets_row,
            Layout::ColMajor => &self.tile_offsets_col,
        };
        if tile_offsets.is_empty() {
            return 0;
        }
        let Some(tile_domain) = &self.tile_domain else {
            return 0;
        };
        coords_dispatch!(tile_domain.datatype(), T => {
            let tile_domain = tile_domain.typed::<T>().unwrap();
            tile_domain
                .chunks_exact(2)
                .map(|bounds| (bounds[1] - bounds[0] + T::one()).to_u64().unwrap())
                .product()
        })
    }

    /// The number of tiles in the supplied cell `domain`, which must be
    /// partitioned into regular tiles the same way as the array domain.
    #[must_use]
    pub fn tile_num_in_domain<T: CoordType>(&self, domain: &[T]) -> u64 {
        let Ok((_, Some(tile_extents))) = self.typed_geometry::<T>() else {
            return 0;
        };
        izip!(domain.chunks_exact(2), tile_extents)
            .map(|(bounds, extent)| {
                ((bounds[1] - bounds[0] + T::one()) / *extent).to_u64().unwrap()
            })
            .product()
    }

    /// The number of tiles overlapping `range`. `0` for irregular tiles.
    #[must_use]
    pub fn tile_num_in_range<T: CoordType>(&self, range: &[T]) -> u64 {
        let Ok((domain, Some(tile_extents))) = self.typed_geometry::<T>() else {
            return 0;
        };
        izip!(range.chunks_exact(2), domain.chunks_exact(2), tile_extents)
            .map(|(bounds, dim_bounds, extent)| {
                let lo_tile = ((bounds[0] - dim_bounds[0]) / *extent).to_u64().unwrap();
                let hi_tile = ((bounds[1] - dim_bounds[0]) / *extent).to_u64().unwrap();
                hi_tile - lo_tile + 1
            })
            .product()
    }

    /// The number of cells in `range` (interleaved `[lo, hi]` pairs).
    #[must_use]
    pub fn cell_num_in_range<T: CoordType>(&self, range: &[T]) -> u64 {
        range
            .chunks_exact(2)
            .map(|bounds| (bounds[1] - bounds[0] + T::one()).to_u64().unwrap())
            .product()
    }

    /// Expand `domain` outward so it coincides with tile boundaries. A
    /// no-op for irregular tiles.
    pub fn expand_domain<T: CoordType>(&self, domain: &mut [T]) {
        let Ok((array_domain, Some(tile_extents))) = self.typed_geometry::<T>() else {
            return;
        };
        for (d, (bounds, extent)) in izip!(array_domain.chunks_exact(2), tile_extents).enumerate() {
            let lo = bounds[0];
            domain[2 * d] = ((domain[2 * d] - lo) / *extent) * *extent + lo;
            domain[2 * d + 1] =
                ((domain[2 * d + 1] - lo) / *extent + T::one()) * *extent - T::one() + lo;
        }
    }

    /// The number of cells in a row tile slab of `subarray`: the subarray
    /// clipped to the tile row containing its first-dimension lower bound.
    #[must_use]
    pub fn tile_slab_row_cell_num<T: CoordType>(&self, subarray: &[T]) -> u64 {
        self.tile_slab_cell_num(subarray, 0)
    }

    /// The number of cells in a column tile slab of `subarray`: the
    /// subarray clipped to the tile column containing its last-dimension
    /// lower bound.
    #[must_use]
    pub fn tile_slab_col_cell_num<T: CoordType>(&self, subarray: &[T]) -> u64 {
        self.tile_slab_cell_num(subarray, self.dim_num().saturating_sub(1))
    }

    fn tile_slab_cell_num<T: CoordType>(&self, subarray: &[T], clip_dim: usize) -> u64 {
        let Ok((domain, Some(tile_extents))) = self.typed_geometry::<T>() else {
            return 0;
        };
        let dim_num = subarray.len() / 2;
        (0..dim_num)
            .map(|d| {
                let hi = if d == clip_dim {
                    // End of the tile containing the lower bound.
                    let lo = domain[2 * d];
                    let tile_end = ((subarray[2 * d] - lo) / tile_extents[d] + T::one())
                        * tile_extents[d]
                        - T::one()
                        + lo;
                    partial_min(subarray[2 * d + 1], tile_end)
                } else {
                    subarray[2 * d + 1]
                };
                (hi - subarray[2 * d] + T::one()).to_u64().unwrap()
            })
            .product()
    }

    /// Verify that `subarray` (interleaved `[lo, hi]` pairs) lies inside
    /// the array domain.
    pub fn check_subarray<T: CoordType>(&self, subarray: &[T]) -> Result<(), DomainError> {
        let (domain, _) = self.typed_geometry::<T>()?;
        if subarray.len() != domain.len() {
            return Err(DomainError::CountMismatch {
                expected: domain.len(),
                got: subarray.len(),
            });
        }
        for (bounds, dim_bounds) in izip!(subarray.chunks_exact(2), domain.chunks_exact(2)) {
            if bounds[0] < dim_bounds[0] || bounds[1] > dim_bounds[1] || bounds[0] > bounds[1] {
                return Err(DomainError::OutOfDomain);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Codec
    // ------------------------------------------------------------------

    /// Serialize the schema into `buffer`.
    ///
    /// # Errors
    /// Returns [`ArrayMetadataError::NotInitialized`] before [`Self::init`].
    pub fn serialize(&self, buffer: &mut Buffer) -> Result<(), ArrayMetadataError> {
        if !self.initialized {
            return Err(ArrayMetadataError::NotInitialized);
        }
        let hyperspace = self
            .hyperspace
            .as_ref()
            .ok_or(ArrayMetadataError::MissingHyperspace)?;
        buffer.write_value(self.array_type.wire_tag());
        buffer.write_value(u32::try_from(hyperspace.dim_num()).unwrap());
        hyperspace.serialize(buffer);
        buffer.write_value(self.cell_order.wire_tag());
        buffer.write_value(self.tile_order.wire_tag());
        buffer.write_value(self.capacity);
        buffer.write_value(self.coords_compression.wire_tag());
        buffer.write_value(self.coords_compression_level);
        buffer.write_value(u32::try_from(self.attributes.len()).unwrap());
        for attribute in &self.attributes {
            attribute.serialize(buffer);
        }
        Ok(())
    }

    /// Deserialize the schema of the array at `array_uri` from `buffer`.
    ///
    /// The returned metadata is not initialized; call [`Self::init`].
    pub fn deserialize(
        array_uri: URI,
        buffer: &mut ConstBuffer<'_>,
    ) -> Result<Self, ArrayMetadataError> {
        let array_type = ArrayType::from_wire_tag(buffer.read_value()?)?;
        let dim_num = buffer.read_value::<u32>()? as usize;
        if dim_num == 0 {
            return Err(ArrayMetadataError::MissingHyperspace);
        }
        let hyperspace = Hyperspace::deserialize(dim_num, buffer)?;
        let cell_order = Layout::from_wire_tag(buffer.read_value()?)?;
        let tile_order = Layout::from_wire_tag(buffer.read_value()?)?;
        let capacity = buffer.read_value()?;
        let coords_compression = Compressor::from_wire_tag(buffer.read_value()?)?;
        let coords_compression_level = buffer.read_value()?;
        let attribute_num = buffer.read_value::<u32>()? as usize;
        let mut attributes = Vec::with_capacity(attribute_num);
        for _ in 0..attribute_num {
            attributes.push(Attribute::deserialize(buffer)?);
        }

        let mut metadata = Self::new(array_uri);
        metadata.array_type = array_type;
        metadata.attributes = attributes;
        metadata.capacity = capacity;
        metadata.cell_order = cell_order;
        metadata.tile_order = tile_order;
        metadata.coords_compression = coords_compression;
        metadata.coords_compression_level = coords_compression_level;
        metadata.hyperspace = Some(hyperspace);
        Ok(metadata)
    }

    /// Dump the schema in ASCII format.
    pub fn dump<W: io::Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(out, "- Array name: {}", self.array_uri)?;
        writeln!(out, "- Array type: {}", self.array_type)?;
        writeln!(out, "- Cell order: {}", self.cell_order)?;
        writeln!(out, "- Tile order: {}", self.tile_order)?;
        writeln!(out, "- Capacity: {}", self.capacity)?;
        writeln!(
            out,
            "- Coordinates compressor: {} (level {})",
            self.coords_compression, self.coords_compression_level
        )?;
        if let Some(hyperspace) = &self.hyperspace {
            for (d, name) in hyperspace.dim_names().iter().enumerate() {
                writeln!(out)?;
                writeln!(out, "### Dimension ###")?;
                writeln!(out, "- Name: {name}")?;
                writeln!(out, "- Type: {}", hyperspace.datatype())?;
                coords_dispatch!(hyperspace.datatype(), T => {
                    let domain = hyperspace.domain().typed::<T>().unwrap();
                    writeln!(out, "- Domain: [{}, {}]", domain[2 * d], domain[2 * d + 1])?;
                    match hyperspace.tile_extents() {
                        Some(tile_extents) => {
                            let tile_extents = tile_extents.typed::<T>().unwrap();
                            writeln!(out, "- Tile extent: {}", tile_extents[d])?;
                        }
                        None => writeln!(out, "- Tile extent: none")?,
                    }
                });
            }
        }
        for attribute in &self.attributes {
            writeln!(out)?;
            writeln!(out, "### Attribute ###")?;
            writeln!(out, "- Name: {}", attribute.name())?;
            writeln!(out, "- Type: {}", attribute.datatype())?;
            if attribute.var_size() {
                writeln!(out, "- Cell val num: var")?;
            } else {
                writeln!(out, "- Cell val num: {}", attribute.cell_val_num())?;
            }
            writeln!(
                out,
                "- Compressor: {} (level {})",
                attribute.compressor(),
                attribute.compression_level()
            )?;
        }
        Ok(())
    }
}

/// Row-/column-major strides over per-dimension tile counts.
fn compute_tile_offsets(tile_counts: &[u64], layout: Layout) -> Vec<u64> {
    let dim_num = tile_counts.len();
    let mut offsets = vec![1; dim_num];
    match layout {
        Layout::RowMajor => {
            for d in (0..dim_num.saturating_sub(1)).rev() {
                offsets[d] = offsets[d + 1] * tile_counts[d + 1];
            }
        }
        Layout::ColMajor => {
            for d in 1..dim_num {
                offsets[d] = offsets[d - 1] * tile_counts[d - 1];
            }
        }
    }
    offsets
}

fn lexicographic_cmp<'a, T: CoordType>(
    a: impl Iterator<Item = &'a T>,
    b: impl Iterator<Item = &'a T>,
) -> Ordering {
    for (x, y) in izip!(a, b) {
        match x.partial_cmp(y).unwrap_or(Ordering::Equal) {
            Ordering::Equal => {}
            other => return other,
        }
    }
    Ordering::Equal
}

fn partial_max<T: CoordType>(x: T, y: T) -> T {
    if x < y {
        y
    } else {
        x
    }
}

fn partial_min<T: CoordType>(x: T, y: T) -> T {
    if x > y {
        y
    } else {
        x
    }
}

/// Advance `coords` within `domain` with the last dimension varying
/// fastest. Returns `false` when the domain is exhausted.
fn advance_row_major<T: CoordType>(domain: &[T], coords: &mut [T]) -> bool {
    let mut d = coords.len() - 1;
    coords[d] = coords[d] + T::one();
    while d > 0 && coords[d] > domain[2 * d + 1] {
        coords[d] = domain[2 * d];
        d -= 1;
        coords[d] = coords[d] + T::one();
    }
    coords[0] <= domain[1]
}

/// Advance `coords` within `domain` with the first dimension varying
/// fastest. Returns `false` when the domain is exhausted.
fn advance_col_major<T: CoordType>(domain: &[T], coords: &mut [T]) -> bool {
    let last = coords.len() - 1;
    let mut d = 0;
    coords[d] = coords[d] + T::one();
    while d < last && coords[d] > domain[2 * d + 1] {
        coords[d] = domain[2 * d];
        d += 1;
        coords[d] = coords[d] + T::one();
    }
    coords[last] <= domain[2 * last + 1]
}

fn retreat_row_major<T: CoordType>(domain: &[T], coords: &mut [T]) {
    let mut d = coords.len() - 1;
    coords[d] = coords[d] - T::one();
    while d > 0 && coords[d] < domain[2 * d] {
        coords[d] = domain[2 * d + 1];
        d -= 1;
        coords[d] = coords[d] - T::one();
    }
}

fn retreat_col_major<T: CoordType>(domain: &[T], coords: &mut [T]) {
    let last = coords.len() - 1;
    let mut d = 0;
    coords[d] = coords[d] - T::one();
    while d < last && coords[d] < domain[2 * d] {
        coords[d] = domain[2 * d + 1];
        d += 1;
        coords[d] = coords[d] - T::one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::Datatype;

    /// Schema: 2-D `[0,3]x[0,3]`, `2x2` tiles, one `i32` attribute.
    fn dense_2d(cell_order: Layout, tile_order: Layout) -> ArrayMetadata {
        let mut metadata = ArrayMetadata::new(URI::new("mem://arrays/dense_2d").unwrap());
        metadata.set_array_type(ArrayType::Dense);
        metadata.set_cell_order(cell_order);
        metadata.set_tile_order(tile_order);
        metadata.set_hyperspace(
            Hyperspace::new(
                vec!["rows".to_string(), "cols".to_string()],
                DomainValues::from_typed(vec![0_i64, 3, 0, 3]),
                Some(DomainValues::from_typed(vec![2_i64, 2])),
            )
            .unwrap(),
        );
        metadata.add_attribute(Attribute::new("v", Datatype::Int32));
        metadata.init().unwrap();
        metadata
    }

    #[test]
    fn array_metadata_derived_geometry() {
        let metadata = dense_2d(Layout::RowMajor, Layout::RowMajor);
        assert_eq!(metadata.cell_num_per_tile(), 4);
        assert_eq!(metadata.coords_size(), 16);
        assert_eq!(metadata.cell_size(0), 4);
        assert_eq!(metadata.cell_size(1), 16); // coordinates
        assert_eq!(metadata.tile_num(), 4);
    }

    #[test]
    fn cell_pos_row_major() {
        let metadata = dense_2d(Layout::RowMajor, Layout::RowMajor);
        assert_eq!(metadata.get_cell_pos(&[0_i64, 0]).unwrap(), 0);
        assert_eq!(metadata.get_cell_pos(&[0_i64, 1]).unwrap(), 1);
        assert_eq!(metadata.get_cell_pos(&[1_i64, 1]).unwrap(), 3);
        assert!(matches!(
            metadata.get_cell_pos(&[4_i64, 0]),
            Err(DomainError::OutOfDomain)
        ));
    }

    #[test]
    fn cell_pos_col_major() {
        let metadata = dense_2d(Layout::ColMajor, Layout::RowMajor);
        assert_eq!(metadata.get_cell_pos(&[1_i64, 0]).unwrap(), 1);
        assert_eq!(metadata.get_cell_pos(&[0_i64, 1]).unwrap(), 2);
    }

    #[test]
    fn tile_id_row_major() {
        let metadata = dense_2d(Layout::RowMajor, Layout::RowMajor);
        assert_eq!(metadata.tile_id(&[0_i64, 0]), 0);
        assert_eq!(metadata.tile_id(&[0_i64, 2]), 1);
        assert_eq!(metadata.tile_id(&[2_i64, 0]), 2);
        assert_eq!(metadata.tile_id(&[3_i64, 3]), 3);
    }

    #[test]
    fn next_cell_coords_walks_domain_once() {
        let metadata = dense_2d(Layout::RowMajor, Layout::RowMajor);
        let domain = [0_i64, 3, 0, 3];
        let mut coords = [0_i64, 0];
        let mut visited = vec![coords.to_vec()];
        while metadata.get_next_cell_coords(&domain, &mut coords) {
            visited.push(coords.to_vec());
        }
        assert_eq!(visited.len(), 16);
        visited.dedup();
        assert_eq!(visited.len(), 16);
        assert_eq!(visited[1], vec![0, 1]);
        assert_eq!(visited[15], vec![3, 3]);
    }

    #[test]
    fn previous_cell_coords_inverts_next() {
        let metadata = dense_2d(Layout::RowMajor, Layout::RowMajor);
        let domain = [0_i64, 3, 0, 3];
        let mut coords = [1_i64, 0];
        metadata.get_previous_cell_coords(&domain, &mut coords);
        assert_eq!(coords, [0, 3]);
    }

    #[test]
    fn expand_domain_tile_aligns() {
        let metadata = dense_2d(Layout::RowMajor, Layout::RowMajor);
        let mut domain = [1_i64, 2, 0, 1];
        metadata.expand_domain(&mut domain);
        assert_eq!(domain, [0, 3, 0, 1]);
    }

    #[test]
    fn subarray_overlap_kinds() {
        let metadata = dense_2d(Layout::RowMajor, Layout::RowMajor);
        let full = [0_i64, 3, 0, 3];

        let (kind, region) = metadata.subarray_overlap(&full, &[1_i64, 2, 1, 2]);
        assert_eq!(kind, OverlapKind::Full);
        assert_eq!(region, vec![1, 2, 1, 2]);

        let (kind, _) = metadata.subarray_overlap(&[0_i64, 1, 0, 1], &[2_i64, 3, 2, 3]);
        assert_eq!(kind, OverlapKind::None);

        // Covers all of b's columns, half its rows: contiguous along the
        // row-major tile order.
        let (kind, region) = metadata.subarray_overlap(&[0_i64, 1, 0, 3], &[0_i64, 3, 0, 3]);
        assert_eq!(kind, OverlapKind::PartialContiguous);
        assert_eq!(region, vec![0, 1, 0, 3]);

        let (kind, _) = metadata.subarray_overlap(&[0_i64, 1, 0, 1], &[0_i64, 3, 0, 3]);
        assert_eq!(kind, OverlapKind::Partial);

        // The intersection region is symmetric in the arguments.
        let (_, region_ab) = metadata.subarray_overlap(&[0_i64, 1, 0, 3], &full);
        let (_, region_ba) = metadata.subarray_overlap(&full, &[0_i64, 1, 0, 3]);
        assert_eq!(region_ab, region_ba);
    }

    #[test]
    fn tile_slab_predicates_are_distinct() {
        let metadata = dense_2d(Layout::RowMajor, Layout::RowMajor);
        // Spans one tile of rows but two tiles of columns.
        let range = [0_i64, 1, 0, 3];
        assert!(metadata.is_contained_in_tile_slab_row(&range));
        assert!(!metadata.is_contained_in_tile_slab_col(&range));
        // And the transpose.
        let range = [0_i64, 3, 2, 3];
        assert!(!metadata.is_contained_in_tile_slab_row(&range));
        assert!(metadata.is_contained_in_tile_slab_col(&range));
    }

    #[test]
    fn tile_slab_cell_nums() {
        let metadata = dense_2d(Layout::RowMajor, Layout::RowMajor);
        let subarray = [0_i64, 3, 0, 3];
        assert_eq!(metadata.tile_slab_row_cell_num(&subarray), 8);
        assert_eq!(metadata.tile_slab_col_cell_num(&subarray), 8);
    }

    #[test]
    fn tile_nums() {
        let metadata = dense_2d(Layout::RowMajor, Layout::RowMajor);
        assert_eq!(metadata.tile_num_in_domain(&[0_i64, 3, 0, 1]), 2);
        assert_eq!(metadata.tile_num_in_range(&[1_i64, 2, 0, 1]), 2);
        assert_eq!(metadata.cell_num_in_range(&[0_i64, 3, 0, 3]), 16);
    }

    #[test]
    fn tile_pos_in_subdomain() {
        let metadata = dense_2d(Layout::RowMajor, Layout::RowMajor);
        let tile_domain = [0_i64, 1, 0, 1];
        assert_eq!(metadata.get_tile_pos_in_domain(&tile_domain, &[0_i64, 1]), 1);
        assert_eq!(metadata.get_tile_pos_in_domain(&tile_domain, &[1_i64, 0]), 2);
        assert_eq!(metadata.get_tile_pos(&[1_i64, 1]), 3);
    }

    #[test]
    fn tile_subarray_and_tile_domain() {
        let metadata = dense_2d(Layout::RowMajor, Layout::RowMajor);
        assert_eq!(
            metadata.get_tile_subarray(&[1_i64, 0]).unwrap(),
            vec![2, 3, 0, 1]
        );
        let (tile_domain, sub_in_tiles) = metadata
            .get_subarray_tile_domain(&[1_i64, 2, 0, 1])
            .unwrap();
        assert_eq!(tile_domain, vec![0, 1, 0, 1]);
        assert_eq!(sub_in_tiles, vec![0, 1, 0, 0]);
    }

    #[test]
    fn order_comparators() {
        let metadata = dense_2d(Layout::RowMajor, Layout::RowMajor);
        assert_eq!(
            metadata.cell_order_cmp(&[0_i64, 1], &[0_i64, 2]),
            Ordering::Less
        );
        assert_eq!(
            metadata.tile_order_cmp(&[0_i64, 0], &[1_i64, 1]),
            Ordering::Equal
        );
        assert_eq!(
            metadata.tile_order_cmp(&[0_i64, 0], &[2_i64, 0]),
            Ordering::Less
        );
        assert_eq!(
            metadata.tile_cell_order_cmp(&[1_i64, 1], &[0_i64, 2]),
            Ordering::Less
        );

        let metadata = dense_2d(Layout::ColMajor, Layout::RowMajor);
        assert_eq!(
            metadata.cell_order_cmp(&[1_i64, 0], &[0_i64, 1]),
            Ordering::Less
        );
    }

    #[test]
    fn codec_round_trip_is_bit_exact() {
        let metadata = dense_2d(Layout::RowMajor, Layout::ColMajor);
        let mut buffer = Buffer::new();
        metadata.serialize(&mut buffer).unwrap();

        let mut cursor = ConstBuffer::new(buffer.data());
        let mut decoded =
            ArrayMetadata::deserialize(metadata.array_uri().clone(), &mut cursor).unwrap();
        assert!(cursor.end());
        decoded.init().unwrap();
        assert_eq!(decoded, metadata);

        let mut reencoded = Buffer::new();
        decoded.serialize(&mut reencoded).unwrap();
        assert_eq!(reencoded.data(), buffer.data());
    }

    #[test]
    fn check_rejects_reserved_and_duplicate_attributes() {
        let mut metadata = ArrayMetadata::new(URI::new("mem://arrays/bad").unwrap());
        metadata.set_hyperspace(
            Hyperspace::new(
                vec!["d".to_string()],
                DomainValues::from_typed(vec![0_i64, 9]),
                Some(DomainValues::from_typed(vec![5_i64])),
            )
            .unwrap(),
        );
        metadata.add_attribute(Attribute::new(COORDS_NAME, Datatype::Int32));
        assert!(matches!(
            metadata.check(),
            Err(ArrayMetadataError::ReservedAttributeName)
        ));

        let mut metadata = ArrayMetadata::new(URI::new("mem://arrays/bad2").unwrap());
        metadata.set_hyperspace(
            Hyperspace::new(
                vec!["d".to_string()],
                DomainValues::from_typed(vec![0_i64, 9]),
                Some(DomainValues::from_typed(vec![5_i64])),
            )
            .unwrap(),
        );
        metadata.add_attribute(Attribute::new("v", Datatype::Int32));
        metadata.add_attribute(Attribute::new("v", Datatype::Float32));
        assert!(matches!(
            metadata.check(),
            Err(ArrayMetadataError::DuplicateAttributeName(_))
        ));
    }

    #[test]
    fn check_subarray_bounds() {
        let metadata = dense_2d(Layout::RowMajor, Layout::RowMajor);
        assert!(metadata.check_subarray(&[0_i64, 3, 1, 2]).is_ok());
        assert!(metadata.check_subarray(&[0_i64, 4, 0, 3]).is_err());
        assert!(metadata.check_subarray(&[2_i64, 1, 0, 3]).is_err());
    }

    #[test]
    fn dump_renders_schema() {
        let metadata = dense_2d(Layout::RowMajor, Layout::RowMajor);
        let mut out = Vec::new();
        metadata.dump(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("- Array type: dense"));
        assert!(text.contains("- Name: rows"));
        assert!(text.contains("- Tile extent: 2"));
    }
}
