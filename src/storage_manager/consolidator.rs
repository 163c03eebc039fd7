//! Fragment consolidation.
//!
//! Consolidation merges all fragments of an array into a single new
//! fragment and removes the originals. The exclusive array lock is held
//! throughout, so no concurrent reader observes a half-consolidated
//! state; the read and write queries issued here therefore skip the
//! shared lock.

use tracing::{debug, info};

use crate::array::array_metadata::VAR_SIZE;
use crate::array::data_type::coords_dispatch;
use crate::array::fragment_metadata::FragmentName;
use crate::query::{Query, QueryError, QueryType};
use crate::uri::URI;

use super::{ObjectType, StorageManager, StorageManagerError};

/// Consolidate the fragments of the array named `array_name`.
///
/// On success the array holds exactly one fragment; on failure the array
/// is left exactly as before (the partial target fragment is removed).
pub(crate) fn consolidate(
    storage_manager: &StorageManager,
    array_name: &str,
) -> Result<(), StorageManagerError> {
    let array_uri = URI::new(array_name)?;
    if storage_manager.object_type(&array_uri) != ObjectType::Array {
        return Err(StorageManagerError::ArrayNotFound(array_uri.to_string()));
    }

    storage_manager.array_lock(&array_uri, false)?;
    let result = consolidate_locked(storage_manager, &array_uri);
    let unlocked = storage_manager.array_unlock(&array_uri, false);
    result.and(unlocked)
}

fn consolidate_locked(
    storage_manager: &StorageManager,
    array_uri: &URI,
) -> Result<(), StorageManagerError> {
    let metadata = storage_manager.load(array_uri.as_str())?;
    if !metadata.dense() {
        return Err(QueryError::Unsupported(
            "sparse consolidation is handled by the execution engine",
        )
        .into());
    }

    let subarray = metadata.domain().clone();
    let cell_num = coords_dispatch!(metadata.coords_type(), T => {
        metadata.cell_num_in_range(subarray.typed::<T>().unwrap())
    });
    let attributes: Vec<String> = metadata
        .attributes()
        .iter()
        .map(|a| a.name().to_string())
        .collect();
    let attribute_refs: Vec<&str> = attributes.iter().map(String::as_str).collect();
    let mut buffers = Vec::with_capacity(attributes.len());
    for index in 0..attributes.len() {
        let cell_size = metadata.cell_size(index);
        if cell_size == VAR_SIZE {
            return Err(QueryError::Unsupported(
                "variable-sized attribute consolidation is handled by the execution engine",
            )
            .into());
        }
        buffers.push(vec![0_u8; usize::try_from(cell_num * cell_size).unwrap()]);
    }

    // Read the whole domain through the regular merge path.
    let mut read_query = Query::new(QueryType::Read, metadata.cell_order());
    storage_manager.query_init_internal(
        &mut read_query,
        array_uri.as_str(),
        QueryType::Read,
        metadata.cell_order(),
        Some(subarray.clone()),
        &attribute_refs,
        buffers,
        None,
    )?;
    let old_fragment_uris: Vec<URI> = read_query
        .fragment_metadata()
        .iter()
        .map(|fragment| fragment.fragment_uri().clone())
        .collect();
    if old_fragment_uris.len() < 2 {
        debug!(%array_uri, "nothing to consolidate");
        storage_manager.query_finalize(&mut read_query)?;
        return Ok(());
    }
    if let Err(e) = storage_manager.query_submit(&mut read_query) {
        let _ = storage_manager.query_finalize(&mut read_query);
        return Err(e);
    }
    storage_manager.query_finalize(&mut read_query)?;
    let buffers = read_query.into_buffers();

    // Write the merged cells into the consolidation target fragment.
    let target_uri = array_uri.join(&FragmentName::generate().to_string());
    let mut write_query = Query::new(QueryType::Write, metadata.cell_order());
    storage_manager.query_init_internal(
        &mut write_query,
        array_uri.as_str(),
        QueryType::Write,
        metadata.cell_order(),
        Some(subarray),
        &attribute_refs,
        buffers,
        Some(target_uri.clone()),
    )?;
    let submitted = storage_manager.query_submit(&mut write_query);
    let finalized = storage_manager.query_finalize(&mut write_query);
    if let Err(e) = submitted.and(finalized) {
        // The write query removes its partial fragment itself; make sure.
        if storage_manager.vfs().is_dir(&target_uri) {
            let _ = storage_manager.vfs().remove_path(&target_uri);
        }
        return Err(e);
    }

    for fragment_uri in &old_fragment_uris {
        storage_manager.delete_fragment(fragment_uri)?;
    }
    info!(
        %array_uri,
        consolidated = old_fragment_uris.len(),
        target = %target_uri,
        "consolidated fragments"
    );
    Ok(())
}
