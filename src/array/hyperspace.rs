//! The array hyperspace: dimensions, domain, and tile extents.

use itertools::Itertools;
use thiserror::Error;

use crate::buffer::{Buffer, BufferError, ConstBuffer};

use super::attribute::COORDS_NAME;
use super::data_type::{coords_dispatch, CoordType, Datatype, DomainValues};
use super::{ArrayType, InvalidTagError};

/// Wire tag marking a dimension with a tile extent.
const TILE_EXTENT_TAG: u8 = 0x01;
/// Wire tag marking a dimension without a tile extent.
const NO_TILE_EXTENT_TAG: u8 = 0xFF;

/// A hyperspace validation or deserialization error.
#[derive(Debug, Error)]
pub enum HyperspaceError {
    /// Mismatched dimension, domain, or tile extent counts.
    #[error("expected {expected} {what}, got {got}")]
    CountMismatch {
        /// What was counted.
        what: &'static str,
        /// The expected count.
        expected: usize,
        /// The actual count.
        got: usize,
    },
    /// The domain or tile extent datatype does not match the dimensions.
    #[error("domain datatype {0} does not match dimension datatype {1}")]
    DatatypeMismatch(Datatype, Datatype),
    /// A hyperspace must have at least one dimension.
    #[error("a hyperspace must have at least one dimension")]
    NoDimensions,
    /// A duplicate dimension name.
    #[error("duplicate dimension name `{0}`")]
    DuplicateDimensionName(String),
    /// A dimension uses the reserved coordinates name.
    #[error("dimension name `{COORDS_NAME}` is reserved")]
    ReservedDimensionName,
    /// A domain lower bound exceeds its upper bound.
    #[error("dimension {0} domain has lower bound greater than upper bound")]
    InvalidDomainBound(usize),
    /// A tile extent is not positive.
    #[error("dimension {0} tile extent is not positive")]
    InvalidTileExtent(usize),
    /// A dense array dimension is missing its tile extent.
    #[error("dense arrays require a tile extent on every dimension")]
    MissingTileExtents,
    /// A dense array with a non-integer coordinate datatype.
    #[error("dense arrays require an integer coordinate datatype, got {0}")]
    NonIntegerDenseDomain(Datatype),
    /// A tile extent that does not divide its dimension span.
    #[error("dimension {0} tile extent does not divide the domain span")]
    TileExtentNotDividing(usize),
    /// A buffer read error.
    #[error(transparent)]
    Buffer(#[from] BufferError),
    /// An invalid enumeration tag.
    #[error(transparent)]
    InvalidTag(#[from] InvalidTagError),
    /// A dimension name that is not valid UTF-8.
    #[error("dimension name is not valid UTF-8")]
    InvalidName,
}

/// The dimensions of an array: names, a shared coordinate [`Datatype`], an
/// inclusive `[lo, hi]` domain per dimension, and optional tile extents.
#[derive(Clone, Debug, PartialEq)]
pub struct Hyperspace {
    dim_names: Vec<String>,
    datatype: Datatype,
    domain: DomainValues,
    tile_extents: Option<DomainValues>,
}

impl Hyperspace {
    /// Create a hyperspace.
    ///
    /// `domain` interleaves `[lo, hi]` pairs, one per dimension;
    /// `tile_extents`, if present, holds one extent per dimension.
    ///
    /// # Errors
    /// Returns a [`HyperspaceError`] if the counts or datatypes are
    /// inconsistent.
    pub fn new(
        dim_names: Vec<String>,
        domain: DomainValues,
        tile_extents: Option<DomainValues>,
    ) -> Result<Self, HyperspaceError> {
        if dim_names.is_empty() {
            return Err(HyperspaceError::NoDimensions);
        }
        let datatype = domain.datatype();
        if domain.len() != 2 * dim_names.len() {
            return Err(HyperspaceError::CountMismatch {
                what: "domain values",
                expected: 2 * dim_names.len(),
                got: domain.len(),
            });
        }
        if let Some(tile_extents) = &tile_extents {
            if tile_extents.datatype() != datatype {
                return Err(HyperspaceError::DatatypeMismatch(
                    tile_extents.datatype(),
                    datatype,
                ));
            }
            if tile_extents.len() != dim_names.len() {
                return Err(HyperspaceError::CountMismatch {
                    what: "tile extents",
                    expected: dim_names.len(),
                    got: tile_extents.len(),
                });
            }
        }
        Ok(Self {
            dim_names,
            datatype,
            domain,
            tile_extents,
        })
    }

    /// The number of dimensions.
    #[must_use]
    pub fn dim_num(&self) -> usize {
        self.dim_names.len()
    }

    /// The coordinate datatype, shared by all dimensions.
    #[must_use]
    pub fn datatype(&self) -> Datatype {
        self.datatype
    }

    /// The dimension names.
    #[must_use]
    pub fn dim_names(&self) -> &[String] {
        &self.dim_names
    }

    /// The domain: interleaved `[lo, hi]` pairs, one per dimension.
    #[must_use]
    pub fn domain(&self) -> &DomainValues {
        &self.domain
    }

    /// The tile extents, [`None`] for irregular tiles.
    #[must_use]
    pub fn tile_extents(&self) -> Option<&DomainValues> {
        self.tile_extents.as_ref()
    }

    /// Verify the hyperspace invariants for an array of type `array_type`.
    pub fn check(&self, array_type: ArrayType) -> Result<(), HyperspaceError> {
        if let Some(name) = self.dim_names.iter().duplicates().next() {
            return Err(HyperspaceError::DuplicateDimensionName(name.clone()));
        }
        if self.dim_names.iter().any(|name| name == COORDS_NAME) {
            return Err(HyperspaceError::ReservedDimensionName);
        }
        if array_type == ArrayType::Dense {
            if self.tile_extents.is_none() {
                return Err(HyperspaceError::MissingTileExtents);
            }
            if !self.datatype.is_integer() {
                return Err(HyperspaceError::NonIntegerDenseDomain(self.datatype));
            }
        }
        coords_dispatch!(self.datatype, T => self.check_bounds::<T>(array_type))
    }

    fn check_bounds<T: CoordType>(&self, array_type: ArrayType) -> Result<(), HyperspaceError> {
        let domain = self.domain.typed::<T>().unwrap();
        for (d, bounds) in domain.chunks_exact(2).enumerate() {
            if bounds[0] > bounds[1] {
                return Err(HyperspaceError::InvalidDomainBound(d));
            }
        }
        if let Some(tile_extents) = &self.tile_extents {
            let tile_extents = tile_extents.typed::<T>().unwrap();
            for (d, extent) in tile_extents.iter().enumerate() {
                if *extent <= T::zero() {
                    return Err(HyperspaceError::InvalidTileExtent(d));
                }
                if array_type == ArrayType::Dense && self.datatype.is_integer() {
                    let span = domain[2 * d + 1] - domain[2 * d] + T::one();
                    if span % *extent != T::zero() {
                        return Err(HyperspaceError::TileExtentNotDividing(d));
                    }
                }
            }
        }
        Ok(())
    }

    pub(crate) fn serialize(&self, buffer: &mut Buffer) {
        coords_dispatch!(self.datatype, T => {
            let domain = self.domain.typed::<T>().unwrap();
            let tile_extents = self.tile_extents.as_ref().map(|e| e.typed::<T>().unwrap());
            for (d, name) in self.dim_names.iter().enumerate() {
                buffer.write_value(u32::try_from(name.len()).unwrap());
                buffer.write_bytes(name.as_bytes());
                buffer.write_value(self.datatype.wire_tag());
                buffer.write_value(domain[2 * d]);
                buffer.write_value(domain[2 * d + 1]);
                match tile_extents {
                    Some(tile_extents) => {
                        buffer.write_value(TILE_EXTENT_TAG);
                        buffer.write_value(tile_extents[d]);
                    }
                    None => buffer.write_value(NO_TILE_EXTENT_TAG),
                }
            }
        });
    }

    pub(crate) fn deserialize(
        dim_num: usize,
        buffer: &mut ConstBuffer<'_>,
    ) -> Result<Self, HyperspaceError> {
        let mut dim_names = Vec::with_capacity(dim_num);
        let mut datatype = None;
        let mut domain: Option<DomainValues> = None;
        let mut tile_extents: Option<DomainValues> = None;

        for d in 0..dim_num {
            let name_len = buffer.read_value::<u32>()? as usize;
            let name = std::str::from_utf8(buffer.read_bytes(name_len)?)
                .map_err(|_| HyperspaceError::InvalidName)?
                .to_string();
            dim_names.push(name);

            let dim_datatype = Datatype::from_wire_tag(buffer.read_value()?)?;
            match datatype {
                None => datatype = Some(dim_datatype),
                Some(datatype) if datatype != dim_datatype => {
                    return Err(HyperspaceError::DatatypeMismatch(dim_datatype, datatype))
                }
                Some(_) => {}
            }

            coords_dispatch!(dim_datatype, T => {
                let lo: T = buffer.read_value()?;
                let hi: T = buffer.read_value()?;
                let values = domain.get_or_insert_with(|| DomainValues::new_empty(dim_datatype));
                let mut typed: Vec<T> = values.typed().unwrap().to_vec();
                typed.extend([lo, hi]);
                *values = T::into_domain_values(typed);
                match buffer.read_value::<u8>()? {
                    TILE_EXTENT_TAG => {
                        let extent: T = buffer.read_value()?;
                        if d > 0 && tile_extents.is_none() {
                            return Err(HyperspaceError::CountMismatch {
                                what: "tile extents",
                                expected: dim_num,
                                got: 1,
                            });
                        }
                        let values = tile_extents
                            .get_or_insert_with(|| DomainValues::new_empty(dim_datatype));
                        let mut typed: Vec<T> = values.typed().unwrap().to_vec();
                        typed.push(extent);
                        *values = T::into_domain_values(typed);
                    }
                    NO_TILE_EXTENT_TAG => {
                        if tile_extents.is_some() {
                            return Err(HyperspaceError::CountMismatch {
                                what: "tile extents",
                                expected: dim_num,
                                got: d,
                            });
                        }
                    }
                    tag => return Err(InvalidTagError("tile extent", tag).into()),
                }
            });
        }

        Self::new(
            dim_names,
            domain.expect("dim_num >= 1 is checked by the caller"),
            tile_extents,
        )
    }
}
