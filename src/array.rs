//! TileDB arrays.
//!
//! An array is a dense or sparse N-dimensional grid of cells identified by
//! a [`URI`](crate::uri::URI). Its schema and derived geometry are held in
//! an [`ArrayMetadata`]; each immutable write batch is a *fragment*
//! described by a [`FragmentMetadata`].

pub mod array_metadata;
pub mod attribute;
pub mod data_type;
pub mod fragment_metadata;
pub mod hyperspace;

use derive_more::Display;
use thiserror::Error;

pub use array_metadata::{ArrayMetadata, ArrayMetadataError, DomainError, OverlapKind, VAR_SIZE};
pub use attribute::{Attribute, AttributeError, COORDS_NAME};
pub use data_type::{CoordType, Compressor, Datatype, DomainValues, VAR_NUM};
pub use fragment_metadata::{FragmentMetadata, FragmentMetadataError, FragmentName};
pub use hyperspace::{Hyperspace, HyperspaceError};

/// An invalid enumeration tag in serialized metadata.
#[derive(Debug, Error)]
#[error("invalid {0} tag {1} in serialized metadata")]
pub struct InvalidTagError(pub(crate) &'static str, pub(crate) u8);

/// The array type.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, Hash)]
pub enum ArrayType {
    /// Cells cover the whole domain; tiles have regular extents.
    #[display("dense")]
    Dense,
    /// Cells are explicitly materialised; tiles hold a fixed cell capacity.
    #[display("sparse")]
    Sparse,
}

impl ArrayType {
    pub(crate) fn wire_tag(self) -> u8 {
        match self {
            Self::Dense => 0,
            Self::Sparse => 1,
        }
    }

    pub(crate) fn from_wire_tag(tag: u8) -> Result<Self, InvalidTagError> {
        match tag {
            0 => Ok(Self::Dense),
            1 => Ok(Self::Sparse),
            _ => Err(InvalidTagError("array type", tag)),
        }
    }
}

/// A tile or cell ordering.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, Hash)]
pub enum Layout {
    /// The last dimension varies fastest.
    #[display("row-major")]
    RowMajor,
    /// The first dimension varies fastest.
    #[display("col-major")]
    ColMajor,
}

impl Layout {
    pub(crate) fn wire_tag(self) -> u8 {
        match self {
            Self::RowMajor => 0,
            Self::ColMajor => 1,
        }
    }

    pub(crate) fn from_wire_tag(tag: u8) -> Result<Self, InvalidTagError> {
        match tag {
            0 => Ok(Self::RowMajor),
            1 => Ok(Self::ColMajor),
            _ => Err(InvalidTagError("layout", tag)),
        }
    }
}

