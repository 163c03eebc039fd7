//! `tiledbrs` is a Rust storage engine for the [TileDB](https://tiledb.com)
//! multidimensional-array format.
//!
//! An array is a dense or sparse N-dimensional grid of typed cells stored
//! on a hierarchical object namespace (a local or remote filesystem behind
//! the [`vfs`] abstraction). A single array is physically a set of
//! immutable *fragments*, one per write batch; reads transparently merge
//! fragments in the canonical `<timestamp>_<pid>` order and the
//! consolidator merges them back into one.
//!
//! The [`storage_manager::StorageManager`] is the central coordinator: it
//! owns the catalog of open arrays, enforces array-level shared/exclusive
//! locking, schedules synchronous and asynchronous queries on dedicated
//! worker threads, mediates all persistent I/O through the virtual
//! filesystem, and orchestrates consolidation.
//!
//! ## Example
//! ```rust
//! use tiledbrs::array::{
//!     ArrayMetadata, ArrayType, Attribute, Datatype, DomainValues, Hyperspace,
//! };
//! use tiledbrs::storage_manager::StorageManager;
//! use tiledbrs::uri::URI;
//!
//! let storage_manager = StorageManager::new()?;
//!
//! // A dense 4x4 array with 2x2 tiles and one int32 attribute.
//! let mut metadata = ArrayMetadata::new(URI::new("mem://arrays/example")?);
//! metadata.set_array_type(ArrayType::Dense);
//! metadata.set_hyperspace(Hyperspace::new(
//!     vec!["rows".to_string(), "cols".to_string()],
//!     DomainValues::from_typed(vec![0_i64, 3, 0, 3]),
//!     Some(DomainValues::from_typed(vec![2_i64, 2])),
//! )?);
//! metadata.add_attribute(Attribute::new("v", Datatype::Int32));
//! metadata.init()?;
//!
//! storage_manager.array_create(&metadata)?;
//! let loaded = storage_manager.load("mem://arrays/example")?;
//! assert_eq!(loaded, metadata);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod array;
pub mod buffer;
pub mod config;
pub mod query;
pub mod storage_manager;
pub mod uri;
pub mod vfs;
