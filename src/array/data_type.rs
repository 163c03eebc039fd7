//! Cell and coordinate data types.

use derive_more::Display;

use crate::buffer::{Buffer, BufferError, ConstBuffer, FixedValue};

use super::InvalidTagError;

/// The `cell_val_num` sentinel for variable-sized attribute values.
pub const VAR_NUM: u32 = u32::MAX;

/// A cell or coordinate data type.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, Hash)]
pub enum Datatype {
    /// `i8`
    #[display("int8")]
    Int8,
    /// `u8`
    #[display("uint8")]
    UInt8,
    /// `i16`
    #[display("int16")]
    Int16,
    /// `u16`
    #[display("uint16")]
    UInt16,
    /// `i32`
    #[display("int32")]
    Int32,
    /// `u32`
    #[display("uint32")]
    UInt32,
    /// `i64`
    #[display("int64")]
    Int64,
    /// `u64`
    #[display("uint64")]
    UInt64,
    /// `f32`
    #[display("float32")]
    Float32,
    /// `f64`
    #[display("float64")]
    Float64,
}

impl Datatype {
    /// The size of one value in bytes.
    #[must_use]
    pub fn size(self) -> u64 {
        match self {
            Self::Int8 | Self::UInt8 => 1,
            Self::Int16 | Self::UInt16 => 2,
            Self::Int32 | Self::UInt32 | Self::Float32 => 4,
            Self::Int64 | Self::UInt64 | Self::Float64 => 8,
        }
    }

    /// Whether this is an integer type.
    #[must_use]
    pub fn is_integer(self) -> bool {
        !matches!(self, Self::Float32 | Self::Float64)
    }

    pub(crate) fn wire_tag(self) -> u8 {
        match self {
            Self::Int8 => 0,
            Self::UInt8 => 1,
            Self::Int16 => 2,
            Self::UInt16 => 3,
            Self::Int32 => 4,
            Self::UInt32 => 5,
            Self::Int64 => 6,
            Self::UInt64 => 7,
            Self::Float32 => 8,
            Self::Float64 => 9,
        }
    }

    pub(crate) fn from_wire_tag(tag: u8) -> Result<Self, InvalidTagError> {
        match tag {
            0 => Ok(Self::Int8),
            1 => Ok(Self::UInt8),
            2 => Ok(Self::Int16),
            3 => Ok(Self::UInt16),
            4 => Ok(Self::Int32),
            5 => Ok(Self::UInt32),
            6 => Ok(Self::Int64),
            7 => Ok(Self::UInt64),
            8 => Ok(Self::Float32),
            9 => Ok(Self::Float64),
            _ => Err(InvalidTagError("datatype", tag)),
        }
    }
}

/// An attribute or coordinate compressor.
///
/// The compressor choice is recorded schema state consumed by the tile
/// filter pipeline; it does not affect the metadata codecs.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, Hash)]
pub enum Compressor {
    /// No compression.
    #[display("no compression")]
    NoCompression,
    /// Gzip (DEFLATE).
    #[display("gzip")]
    Gzip,
    /// Zstandard.
    #[display("zstd")]
    Zstd,
    /// LZ4.
    #[display("lz4")]
    Lz4,
    /// Blosc.
    #[display("blosc")]
    Blosc,
    /// Run-length encoding.
    #[display("rle")]
    Rle,
    /// Bzip2.
    #[display("bzip2")]
    Bzip2,
    /// Double-delta encoding.
    #[display("double delta")]
    DoubleDelta,
}

impl Compressor {
    pub(crate) fn wire_tag(self) -> u8 {
        match self {
            Self::NoCompression => 0,
            Self::Gzip => 1,
            Self::Zstd => 2,
            Self::Lz4 => 3,
            Self::Blosc => 4,
            Self::Rle => 5,
            Self::Bzip2 => 6,
            Self::DoubleDelta => 7,
        }
    }

    pub(crate) fn from_wire_tag(tag: u8) -> Result<Self, InvalidTagError> {
        match tag {
            0 => Ok(Self::NoCompression),
            1 => Ok(Self::Gzip),
            2 => Ok(Self::Zstd),
            3 => Ok(Self::Lz4),
            4 => Ok(Self::Blosc),
            5 => Ok(Self::Rle),
            6 => Ok(Self::Bzip2),
            7 => Ok(Self::DoubleDelta),
            _ => Err(InvalidTagError("compressor", tag)),
        }
    }
}


/// A coordinate type over which the geometry algorithms are monomorphised.
///
/// Implemented for the ten [`Datatype`] primitives. The associated
/// functions tie a primitive to its [`DomainValues`] variant so generic
/// code can move between the tagged and typed representations.
pub trait CoordType:
    Copy
    + PartialOrd
    + std::fmt::Debug
    + std::fmt::Display
    + num::Num
    + num::NumCast
    + num::ToPrimitive
    + FixedValue
    + Send
    + Sync
    + 'static
{
    /// The corresponding [`Datatype`].
    const DATATYPE: Datatype;

    /// Wrap typed values in the matching [`DomainValues`] variant.
    fn into_domain_values(values: Vec<Self>) -> DomainValues;

    /// View the typed values of `values`, or [`None`] on a type mismatch.
    fn domain_slice(values: &DomainValues) -> Option<&[Self]>;
}

/// Typed per-dimension values tagged by [`Datatype`].
///
/// Used for domains (`[lo, hi]` pairs per dimension), tile extents (one
/// value per dimension), subarrays, and coordinate tuples.
#[derive(Clone, Debug, PartialEq)]
pub enum DomainValues {
    /// `i8` values.
    Int8(Vec<i8>),
    /// `u8` values.
    UInt8(Vec<u8>),
    /// `i16` values.
    Int16(Vec<i16>),
    /// `u16` values.
    UInt16(Vec<u16>),
    /// `i32` values.
    Int32(Vec<i32>),
    /// `u32` values.
    UInt32(Vec<u32>),
    /// `i64` values.
    Int64(Vec<i64>),
    /// `u64` values.
    UInt64(Vec<u64>),
    /// `f32` values.
    Float32(Vec<f32>),
    /// `f64` values.
    Float64(Vec<f64>),
}

macro_rules! impl_coord_type {
    ($($t:ty => $variant:ident),*) => {
        $(
            impl CoordType for $t {
                const DATATYPE: Datatype = Datatype::$variant;

                fn into_domain_values(values: Vec<Self>) -> DomainValues {
                    DomainValues::$variant(values)
                }

                fn domain_slice(values: &DomainValues) -> Option<&[Self]> {
                    match values {
                        DomainValues::$variant(values) => Some(values),
                        _ => None,
                    }
                }
            }
        )*
    };
}

impl_coord_type!(
    i8 => Int8, u8 => UInt8, i16 => Int16, u16 => UInt16, i32 => Int32,
    u32 => UInt32, i64 => Int64, u64 => UInt64, f32 => Float32, f64 => Float64
);

/// Dispatch `$body` with `$t` bound to the primitive type of `$datatype`.
macro_rules! coords_dispatch {
    ($datatype:expr, $t:ident => $body:expr) => {
        match $datatype {
            $crate::array::Datatype::Int8 => {
                type $t = i8;
                $body
            }
            $crate::array::Datatype::UInt8 => {
                type $t = u8;
                $body
            }
            $crate::array::Datatype::Int16 => {
                type $t = i16;
                $body
            }
            $crate::array::Datatype::UInt16 => {
                type $t = u16;
                $body
            }
            $crate::array::Datatype::Int32 => {
                type $t = i32;
                $body
            }
            $crate::array::Datatype::UInt32 => {
                type $t = u32;
                $body
            }
            $crate::array::Datatype::Int64 => {
                type $t = i64;
                $body
            }
            $crate::array::Datatype::UInt64 => {
                type $t = u64;
                $body
            }
            $crate::array::Datatype::Float32 => {
                type $t = f32;
                $body
            }
            $crate::array::Datatype::Float64 => {
                type $t = f64;
                $body
            }
        }
    };
}

pub(crate) use coords_dispatch;

impl DomainValues {
    /// Create an empty value vector of `datatype`.
    #[must_use]
    pub fn new_empty(datatype: Datatype) -> Self {
        coords_dispatch!(datatype, T => T::into_domain_values(Vec::new()))
    }

    /// The [`Datatype`] of the values.
    #[must_use]
    pub fn datatype(&self) -> Datatype {
        match self {
            Self::Int8(_) => Datatype::Int8,
            Self::UInt8(_) => Datatype::UInt8,
            Self::Int16(_) => Datatype::Int16,
            Self::UInt16(_) => Datatype::UInt16,
            Self::Int32(_) => Datatype::Int32,
            Self::UInt32(_) => Datatype::UInt32,
            Self::Int64(_) => Datatype::Int64,
            Self::UInt64(_) => Datatype::UInt64,
            Self::Float32(_) => Datatype::Float32,
            Self::Float64(_) => Datatype::Float64,
        }
    }

    /// The number of values.
    #[must_use]
    pub fn len(&self) -> usize {
        coords_dispatch!(self.datatype(), T => {
            T::domain_slice(self).map_or(0, <[T]>::len)
        })
    }

    /// Whether there are no values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The typed values, or [`None`] if `T` does not match the datatype.
    #[must_use]
    pub fn typed<T: CoordType>(&self) -> Option<&[T]> {
        T::domain_slice(self)
    }

    /// Create from typed values.
    #[must_use]
    pub fn from_typed<T: CoordType>(values: Vec<T>) -> Self {
        T::into_domain_values(values)
    }

    /// Serialize the values little-endian into `buffer` (without a count).
    pub(crate) fn serialize(&self, buffer: &mut Buffer) {
        coords_dispatch!(self.datatype(), T => {
            if let Some(values) = T::domain_slice(self) {
                for value in values {
                    buffer.write_value(*value);
                }
            }
        });
    }

    /// Deserialize `len` values of `datatype` from `buffer`.
    pub(crate) fn deserialize(
        datatype: Datatype,
        len: usize,
        buffer: &mut ConstBuffer<'_>,
    ) -> Result<Self, BufferError> {
        coords_dispatch!(datatype, T => {
            let mut values: Vec<T> = Vec::with_capacity(len);
            for _ in 0..len {
                values.push(buffer.read_value()?);
            }
            Ok(T::into_domain_values(values))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datatype_sizes() {
        assert_eq!(Datatype::Int8.size(), 1);
        assert_eq!(Datatype::UInt32.size(), 4);
        assert_eq!(Datatype::Float64.size(), 8);
        assert!(Datatype::Int64.is_integer());
        assert!(!Datatype::Float32.is_integer());
    }

    #[test]
    fn datatype_wire_tags_round_trip() {
        for tag in 0..10 {
            let datatype = Datatype::from_wire_tag(tag).unwrap();
            assert_eq!(datatype.wire_tag(), tag);
        }
        assert!(Datatype::from_wire_tag(10).is_err());
    }

    #[test]
    fn domain_values_typed_access() {
        let values = DomainValues::from_typed(vec![0_i64, 3, 0, 3]);
        assert_eq!(values.datatype(), Datatype::Int64);
        assert_eq!(values.len(), 4);
        assert_eq!(values.typed::<i64>(), Some([0_i64, 3, 0, 3].as_slice()));
        assert_eq!(values.typed::<i32>(), None);
    }

    #[test]
    fn domain_values_codec_round_trip() -> Result<(), BufferError> {
        let values = DomainValues::from_typed(vec![-1.5_f64, 7.25]);
        let mut buffer = Buffer::new();
        values.serialize(&mut buffer);
        let mut cursor = ConstBuffer::new(buffer.data());
        let decoded = DomainValues::deserialize(Datatype::Float64, 2, &mut cursor)?;
        assert_eq!(decoded, values);
        assert!(cursor.end());
        Ok(())
    }
}
