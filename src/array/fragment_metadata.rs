//! Fragment metadata: per-fragment bounds and tile index.
//!
//! A fragment is an immutable write batch stored in its own directory
//! named `<timestamp>_<pid>`. Readers observe fragments in ascending
//! timestamp order with ties broken by pid, so later writes mask earlier
//! ones.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::buffer::{Buffer, BufferError, ConstBuffer};
use crate::uri::URI;

use super::array_metadata::ArrayMetadata;
use super::data_type::DomainValues;

/// A fragment metadata error.
#[derive(Debug, Error)]
pub enum FragmentMetadataError {
    /// A buffer read error.
    #[error(transparent)]
    Buffer(#[from] BufferError),
    /// A fragment directory name that is not `<timestamp>_<pid>`.
    #[error("`{0}` is not a valid fragment name")]
    InvalidName(String),
    /// An attribute index outside `0..=attribute_num`.
    #[error("attribute index {0} out of range")]
    AttributeIndexOutOfRange(usize),
}

/// A parsed `<timestamp>_<pid>` fragment name.
///
/// The ordering is the canonical fragment order: ascending timestamp,
/// ties broken by ascending pid.
#[derive(Copy, Clone, Debug, derive_more::Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display("{timestamp}_{pid}")]
pub struct FragmentName {
    timestamp: u64,
    pid: u32,
}

impl FragmentName {
    /// Parse a fragment directory name.
    ///
    /// # Errors
    /// Returns [`FragmentMetadataError::InvalidName`] if `name` is not of
    /// the form `<timestamp>_<pid>`.
    pub fn parse(name: &str) -> Result<Self, FragmentMetadataError> {
        let invalid = || FragmentMetadataError::InvalidName(name.to_string());
        let (timestamp, pid) = name.split_once('_').ok_or_else(invalid)?;
        Ok(Self {
            timestamp: timestamp.parse().map_err(|_| invalid())?,
            pid: pid.parse().map_err(|_| invalid())?,
        })
    }

    /// Generate a fresh name from the wall clock and the current process
    /// id. Timestamps are strictly monotonic within the process.
    #[must_use]
    pub fn generate() -> Self {
        static LAST_TIMESTAMP: AtomicU64 = AtomicU64::new(0);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        let timestamp = LAST_TIMESTAMP
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .map_or(now, |last| now.max(last + 1));
        Self {
            timestamp,
            pid: std::process::id(),
        }
    }

    /// The fragment timestamp in milliseconds.
    #[must_use]
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// The id of the process that wrote the fragment.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }
}


/// The metadata of one fragment: its non-empty domain (the tightest
/// bounding box of written cells), per-tile MBRs and bounding coordinates,
/// and per-attribute tile byte offsets and sizes.
///
/// The per-attribute vectors carry `attribute_num + 1` entries with the
/// coordinates entry last. Immutable once loaded.
#[derive(Clone, Debug, PartialEq)]
pub struct FragmentMetadata {
    array_metadata: Arc<ArrayMetadata>,
    fragment_uri: URI,
    name: FragmentName,
    dense: bool,
    non_empty_domain: Option<DomainValues>,
    mbrs: Vec<DomainValues>,
    bounding_coords: Vec<DomainValues>,
    tile_offsets: Vec<Vec<u64>>,
    tile_sizes: Vec<Vec<u64>>,
}

impl FragmentMetadata {
    /// Create empty metadata for the fragment at `fragment_uri`.
    ///
    /// # Errors
    /// Returns a [`FragmentMetadataError`] if the last path segment of
    /// `fragment_uri` is not a valid fragment name.
    pub fn new(
        array_metadata: Arc<ArrayMetadata>,
        fragment_uri: URI,
        dense: bool,
    ) -> Result<Self, FragmentMetadataError> {
        let name = FragmentName::parse(fragment_uri.last_path_part())?;
        let entries = array_metadata.attribute_num() + 1;
        Ok(Self {
            array_metadata,
            fragment_uri,
            name,
            dense,
            non_empty_domain: None,
            mbrs: Vec::new(),
            bounding_coords: Vec::new(),
            tile_offsets: vec![Vec::new(); entries],
            tile_sizes: vec![Vec::new(); entries],
        })
    }

    /// The fragment URI.
    #[must_use]
    pub fn fragment_uri(&self) -> &URI {
        &self.fragment_uri
    }

    /// The parsed fragment name.
    #[must_use]
    pub fn name(&self) -> FragmentName {
        self.name
    }

    /// The fragment timestamp in milliseconds.
    #[must_use]
    pub fn timestamp(&self) -> u64 {
        self.name.timestamp()
    }

    /// The id of the process that wrote the fragment.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.name.pid()
    }

    /// Whether the fragment is dense.
    #[must_use]
    pub fn dense(&self) -> bool {
        self.dense
    }

    /// The array metadata the fragment belongs to.
    #[must_use]
    pub fn array_metadata(&self) -> &Arc<ArrayMetadata> {
        &self.array_metadata
    }

    /// The tightest bounding box of the written cells, as interleaved
    /// `[lo, hi]` pairs.
    #[must_use]
    pub fn non_empty_domain(&self) -> Option<&DomainValues> {
        self.non_empty_domain.as_ref()
    }

    /// The per-tile minimum bounding rectangles (sparse fragments).
    #[must_use]
    pub fn mbrs(&self) -> &[DomainValues] {
        &self.mbrs
    }

    /// The per-tile first and last coordinates (sparse fragments).
    #[must_use]
    pub fn bounding_coords(&self) -> &[DomainValues] {
        &self.bounding_coords
    }

    /// The tile byte offsets of attribute `index` (the coordinates for
    /// index `attribute_num`).
    #[must_use]
    pub fn tile_offsets(&self, index: usize) -> Option<&[u64]> {
        self.tile_offsets.get(index).map(Vec::as_slice)
    }

    /// The tile byte sizes of attribute `index` (the coordinates for index
    /// `attribute_num`).
    #[must_use]
    pub fn tile_sizes(&self, index: usize) -> Option<&[u64]> {
        self.tile_sizes.get(index).map(Vec::as_slice)
    }

    /// The number of cells in the tile at `tile_pos`.
    #[must_use]
    pub fn cell_num(&self, _tile_pos: u64) -> u64 {
        if self.dense {
            self.array_metadata.cell_num_per_tile()
        } else {
            self.array_metadata.capacity()
        }
    }

    /// Set the non-empty domain of a write fragment.
    pub fn set_non_empty_domain(&mut self, non_empty_domain: DomainValues) {
        self.non_empty_domain = Some(non_empty_domain);
    }

    /// Append the MBR of the next tile.
    pub fn append_mbr(&mut self, mbr: DomainValues) {
        self.mbrs.push(mbr);
    }

    /// Append the bounding coordinates (first and last) of the next tile.
    pub fn append_bounding_coords(&mut self, bounding_coords: DomainValues) {
        self.bounding_coords.push(bounding_coords);
    }

    /// Append the byte offset of the next tile of attribute `index`.
    pub fn append_tile_offset(
        &mut self,
        index: usize,
        offset: u64,
    ) -> Result<(), FragmentMetadataError> {
        self.tile_offsets
            .get_mut(index)
            .ok_or(FragmentMetadataError::AttributeIndexOutOfRange(index))?
            .push(offset);
        Ok(())
    }

    /// Append the byte size of the next tile of attribute `index`.
    pub fn append_tile_size(
        &mut self,
        index: usize,
        size: u64,
    ) -> Result<(), FragmentMetadataError> {
        self.tile_sizes
            .get_mut(index)
            .ok_or(FragmentMetadataError::AttributeIndexOutOfRange(index))?
            .push(size);
        Ok(())
    }

    /// Serialize the fragment metadata into `buffer`.
    pub fn serialize(&self, buffer: &mut Buffer) {
        let coords_num = 2 * self.array_metadata.dim_num();
        buffer.write_value(u8::from(self.dense));
        match &self.non_empty_domain {
            Some(non_empty_domain) => {
                buffer.write_value(1_u8);
                debug_assert_eq!(non_empty_domain.len(), coords_num);
                non_empty_domain.serialize(buffer);
            }
            None => buffer.write_value(0_u8),
        }
        buffer.write_value(self.mbrs.len() as u64);
        for mbr in &self.mbrs {
            mbr.serialize(buffer);
        }
        buffer.write_value(self.bounding_coords.len() as u64);
        for bounding_coords in &self.bounding_coords {
            bounding_coords.serialize(buffer);
        }
        for offsets in &self.tile_offsets {
            buffer.write_value(offsets.len() as u64);
            for offset in offsets {
                buffer.write_value(*offset);
            }
        }
        for sizes in &self.tile_sizes {
            buffer.write_value(sizes.len() as u64);
            for size in sizes {
                buffer.write_value(*size);
            }
        }
    }

    /// Deserialize the metadata of the fragment at `fragment_uri`.
    pub fn deserialize(
        array_metadata: Arc<ArrayMetadata>,
        fragment_uri: URI,
        buffer: &mut ConstBuffer<'_>,
    ) -> Result<Self, FragmentMetadataError> {
        let coords_type = array_metadata.coords_type();
        let coords_num = 2 * array_metadata.dim_num();
        let mut metadata = Self::new(array_metadata, fragment_uri, false)?;

        metadata.dense = buffer.read_value::<u8>()? != 0;
        if buffer.read_value::<u8>()? != 0 {
            metadata.non_empty_domain = Some(DomainValues::deserialize(
                coords_type,
                coords_num,
                buffer,
            )?);
        }
        let mbr_num = buffer.read_value::<u64>()? as usize;
        metadata.mbrs = (0..mbr_num)
            .map(|_| DomainValues::deserialize(coords_type, coords_num, buffer))
            .collect::<Result<_, _>>()?;
        let bounding_num = buffer.read_value::<u64>()? as usize;
        metadata.bounding_coords = (0..bounding_num)
            .map(|_| DomainValues::deserialize(coords_type, coords_num, buffer))
            .collect::<Result<_, _>>()?;
        for offsets in &mut metadata.tile_offsets {
            let len = buffer.read_value::<u64>()? as usize;
            *offsets = (0..len)
                .map(|_| buffer.read_value())
                .collect::<Result<_, _>>()?;
        }
        for sizes in &mut metadata.tile_sizes {
            let len = buffer.read_value::<u64>()? as usize;
            *sizes = (0..len)
                .map(|_| buffer.read_value())
                .collect::<Result<_, _>>()?;
        }
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{
        Attribute, ArrayType, Datatype, DomainValues, Hyperspace, Layout,
    };

    fn dense_2d() -> Arc<ArrayMetadata> {
        let mut metadata = ArrayMetadata::new(URI::new("mem://arrays/a").unwrap());
        metadata.set_array_type(ArrayType::Dense);
        metadata.set_cell_order(Layout::RowMajor);
        metadata.set_tile_order(Layout::RowMajor);
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
        Arc::new(metadata)
    }

    #[test]
    fn fragment_name_ordering() {
        let names = ["10_100", "10_50", "11_100"]
            .map(|name| FragmentName::parse(name).unwrap());
        let mut sorted = names;
        sorted.sort();
        assert_eq!(
            sorted.map(|name| name.to_string()),
            ["10_50".to_string(), "10_100".to_string(), "11_100".to_string()]
        );
    }

    #[test]
    fn fragment_name_parse_rejects_garbage() {
        assert!(FragmentName::parse("not-a-fragment").is_err());
        assert!(FragmentName::parse("12x_3").is_err());
        assert!(FragmentName::parse("_3").is_err());
    }

    #[test]
    fn fragment_name_generate_is_monotonic() {
        let a = FragmentName::generate();
        let b = FragmentName::generate();
        assert!(b.timestamp() > a.timestamp());
        assert_eq!(a.pid(), std::process::id());
    }

    #[test]
    fn fragment_metadata_codec_round_trip() -> Result<(), FragmentMetadataError> {
        let array_metadata = dense_2d();
        let uri = URI::new("mem://arrays/a/17_42").unwrap();
        let mut metadata =
            FragmentMetadata::new(array_metadata.clone(), uri.clone(), true)?;
        metadata.set_non_empty_domain(DomainValues::from_typed(vec![0_i64, 1, 0, 3]));
        metadata.append_tile_offset(0, 0)?;
        metadata.append_tile_offset(0, 32)?;
        metadata.append_tile_size(0, 32)?;
        metadata.append_tile_size(0, 32)?;

        let mut buffer = Buffer::new();
        metadata.serialize(&mut buffer);
        let mut cursor = ConstBuffer::new(buffer.data());
        let decoded = FragmentMetadata::deserialize(array_metadata, uri, &mut cursor)?;
        assert!(cursor.end());
        assert_eq!(decoded, metadata);
        assert_eq!(decoded.timestamp(), 17);
        assert_eq!(decoded.pid(), 42);
        Ok(())
    }
}
