//! Array attributes.

use thiserror::Error;

use crate::buffer::{Buffer, BufferError, ConstBuffer};

use super::data_type::{Compressor, Datatype, VAR_NUM};
use super::InvalidTagError;

/// The reserved name of the coordinates pseudo-attribute.
pub const COORDS_NAME: &str = "__coords";

/// An attribute deserialization error.
#[derive(Debug, Error)]
pub enum AttributeError {
    /// A buffer read error.
    #[error(transparent)]
    Buffer(#[from] BufferError),
    /// An invalid enumeration tag.
    #[error(transparent)]
    InvalidTag(#[from] InvalidTagError),
    /// An attribute name that is not valid UTF-8.
    #[error("attribute name is not valid UTF-8")]
    InvalidName,
}

/// A named, typed value stored per array cell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attribute {
    name: String,
    datatype: Datatype,
    cell_val_num: u32,
    compressor: Compressor,
    compression_level: i32,
}

impl Attribute {
    /// Create an attribute with one value per cell and no compression.
    #[must_use]
    pub fn new(name: &str, datatype: Datatype) -> Self {
        Self {
            name: name.to_string(),
            datatype,
            cell_val_num: 1,
            compressor: Compressor::NoCompression,
            compression_level: -1,
        }
    }

    /// Create the coordinates pseudo-attribute of a `dim_num`-dimensional
    /// array.
    #[must_use]
    pub fn coords(dim_num: u32, datatype: Datatype, compressor: Compressor, level: i32) -> Self {
        Self {
            name: COORDS_NAME.to_string(),
            datatype,
            cell_val_num: dim_num,
            compressor,
            compression_level: level,
        }
    }

    /// The attribute name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The value datatype.
    #[must_use]
    pub fn datatype(&self) -> Datatype {
        self.datatype
    }

    /// The number of values per cell, [`VAR_NUM`] if variable.
    #[must_use]
    pub fn cell_val_num(&self) -> u32 {
        self.cell_val_num
    }

    /// The compressor.
    #[must_use]
    pub fn compressor(&self) -> Compressor {
        self.compressor
    }

    /// The compression level (`-1` for the compressor default).
    #[must_use]
    pub fn compression_level(&self) -> i32 {
        self.compression_level
    }

    /// Whether the attribute stores a variable number of values per cell.
    #[must_use]
    pub fn var_size(&self) -> bool {
        self.cell_val_num == VAR_NUM
    }

    /// The fixed cell size in bytes, or [`None`] for variable-sized cells.
    #[must_use]
    pub fn cell_size(&self) -> Option<u64> {
        (!self.var_size()).then(|| u64::from(self.cell_val_num) * self.datatype.size())
    }

    /// Set the number of values per cell.
    pub fn set_cell_val_num(&mut self, cell_val_num: u32) {
        self.cell_val_num = cell_val_num;
    }

    /// Set the compressor and compression level.
    pub fn set_compressor(&mut self, compressor: Compressor, level: i32) {
        self.compressor = compressor;
        self.compression_level = level;
    }

    pub(crate) fn serialize(&self, buffer: &mut Buffer) {
        buffer.write_value(u32::try_from(self.name.len()).unwrap());
        buffer.write_bytes(self.name.as_bytes());
        buffer.write_value(self.datatype.wire_tag());
        buffer.write_value(self.cell_val_num);
        buffer.write_value(self.compressor.wire_tag());
        buffer.write_value(self.compression_level);
    }

    pub(crate) fn deserialize(buffer: &mut ConstBuffer<'_>) -> Result<Self, AttributeError> {
        let name_len = buffer.read_value::<u32>()? as usize;
        let name = std::str::from_utf8(buffer.read_bytes(name_len)?)
            .map_err(|_| AttributeError::InvalidName)?
            .to_string();
        let datatype = Datatype::from_wire_tag(buffer.read_value()?)?;
        let cell_val_num = buffer.read_value()?;
        let compressor = Compressor::from_wire_tag(buffer.read_value()?)?;
        let compression_level = buffer.read_value()?;
        Ok(Self {
            name,
            datatype,
            cell_val_num,
            compressor,
            compression_level,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attribute_cell_size() {
        let mut attribute = Attribute::new("v", Datatype::Int32);
        assert_eq!(attribute.cell_size(), Some(4));
        attribute.set_cell_val_num(3);
        assert_eq!(attribute.cell_size(), Some(12));
        attribute.set_cell_val_num(VAR_NUM);
        assert!(attribute.var_size());
        assert_eq!(attribute.cell_size(), None);
    }

    #[test]
    fn attribute_codec_round_trip() -> Result<(), AttributeError> {
        let mut attribute = Attribute::new("humidity", Datatype::Float32);
        attribute.set_compressor(Compressor::Gzip, 6);
        let mut buffer = Buffer::new();
        attribute.serialize(&mut buffer);
        let decoded = Attribute::deserialize(&mut ConstBuffer::new(buffer.data()))?;
        assert_eq!(decoded, attribute);
        Ok(())
    }
}
