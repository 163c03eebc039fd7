//! Storage manager scenarios: object lifecycle, locking, the async
//! scheduler, fragment ordering, and consolidation.

use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use tiledbrs::array::{
    ArrayMetadata, ArrayType, Attribute, Datatype, DomainValues, Hyperspace, Layout,
};
use tiledbrs::query::{Query, QueryStatus, QueryType};
use tiledbrs::storage_manager::{ObjectType, StorageManager, StorageManagerError};
use tiledbrs::uri::URI;
use tiledbrs::vfs::{MemoryFilesystem, Vfs, VfsBackend, VfsError};

fn dense_2d(uri: &str) -> ArrayMetadata {
    let mut metadata = ArrayMetadata::new(URI::new(uri).unwrap());
    metadata.set_array_type(ArrayType::Dense);
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

fn write_cells(
    storage_manager: &StorageManager,
    array: &str,
    subarray: Vec<i64>,
    values: &[i32],
) -> Result<(), Box<dyn Error>> {
    let buffer: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    let mut query = Query::new(QueryType::Write, Layout::RowMajor);
    storage_manager.query_init(
        &mut query,
        array,
        QueryType::Write,
        Layout::RowMajor,
        Some(DomainValues::from_typed(subarray)),
        &["v"],
        vec![buffer],
        None,
    )?;
    storage_manager.query_submit(&mut query)?;
    storage_manager.query_finalize(&mut query)?;
    Ok(())
}

fn read_cells(
    storage_manager: &StorageManager,
    array: &str,
    subarray: Vec<i64>,
    cell_num: usize,
) -> Result<Vec<i32>, Box<dyn Error>> {
    let mut query = Query::new(QueryType::Read, Layout::RowMajor);
    storage_manager.query_init(
        &mut query,
        array,
        QueryType::Read,
        Layout::RowMajor,
        Some(DomainValues::from_typed(subarray)),
        &["v"],
        vec![vec![0_u8; cell_num * 4]],
        None,
    )?;
    storage_manager.query_submit(&mut query)?;
    storage_manager.query_finalize(&mut query)?;
    assert_eq!(query.buffer_sizes(), &[(cell_num * 4) as u64]);
    let data = query.into_buffers().remove(0);
    Ok(data
        .chunks_exact(4)
        .map(|bytes| i32::from_le_bytes(bytes.try_into().unwrap()))
        .collect())
}

#[test]
fn write_then_read_round_trip() -> Result<(), Box<dyn Error>> {
    let storage_manager = StorageManager::new()?;
    let array = "mem://arrays/rw";
    storage_manager.array_create(&dense_2d(array))?;

    let values: Vec<i32> = (0..16).collect();
    write_cells(&storage_manager, array, vec![0, 3, 0, 3], &values)?;
    assert_eq!(
        read_cells(&storage_manager, array, vec![0, 3, 0, 3], 16)?,
        values
    );
    // A subarray read picks out the right cells.
    assert_eq!(
        read_cells(&storage_manager, array, vec![1, 2, 1, 2], 4)?,
        vec![5, 6, 9, 10]
    );
    Ok(())
}

#[test]
fn later_fragments_mask_earlier_ones() -> Result<(), Box<dyn Error>> {
    let storage_manager = StorageManager::new()?;
    let array = "mem://arrays/mask";
    storage_manager.array_create(&dense_2d(array))?;

    write_cells(&storage_manager, array, vec![0, 3, 0, 3], &[1; 16])?;
    write_cells(&storage_manager, array, vec![0, 1, 0, 1], &[9; 4])?;

    let cells = read_cells(&storage_manager, array, vec![0, 3, 0, 3], 16)?;
    let expected: Vec<i32> = (0..4)
        .flat_map(|r| (0..4).map(move |c| if r < 2 && c < 2 { 9 } else { 1 }))
        .collect();
    assert_eq!(cells, expected);
    Ok(())
}

#[test]
fn fragment_uris_in_canonical_order() -> Result<(), Box<dyn Error>> {
    let storage_manager = StorageManager::new()?;
    let array_uri = URI::new("mem://arrays/order")?;
    storage_manager.array_create(&dense_2d(array_uri.as_str()))?;

    for name in ["10_100", "10_50", "11_100"] {
        storage_manager.create_dir(&array_uri.join(name))?;
    }
    let fragment_uris = storage_manager.get_fragment_uris(&array_uri)?;
    let names: Vec<&str> = fragment_uris.iter().map(URI::last_path_part).collect();
    assert_eq!(names, vec!["10_50", "10_100", "11_100"]);
    Ok(())
}

#[test]
fn object_lifecycle() -> Result<(), Box<dyn Error>> {
    let storage_manager = StorageManager::new()?;
    let group_uri = URI::new("mem://groups/g")?;
    storage_manager.group_create(group_uri.as_str())?;
    assert_eq!(storage_manager.object_type(&group_uri), ObjectType::Group);
    assert!(matches!(
        storage_manager.group_create(group_uri.as_str()),
        Err(StorageManagerError::AlreadyExists(_))
    ));

    let array_uri = URI::new("mem://groups/g/a")?;
    storage_manager.array_create(&dense_2d(array_uri.as_str()))?;
    assert_eq!(storage_manager.object_type(&array_uri), ObjectType::Array);
    assert!(matches!(
        storage_manager.array_create(&dense_2d(array_uri.as_str())),
        Err(StorageManagerError::AlreadyExists(_))
    ));

    write_cells(&storage_manager, array_uri.as_str(), vec![0, 3, 0, 3], &[0; 16])?;
    let fragment_uri = storage_manager.get_fragment_uris(&array_uri)?.remove(0);
    assert_eq!(
        storage_manager.object_type(&fragment_uri),
        ObjectType::Fragment
    );

    // Moves refuse an existing target unless forced; move is invertible.
    let moved_uri = URI::new("mem://groups/g/b")?;
    storage_manager.move_path(&array_uri, &moved_uri, false)?;
    assert_eq!(storage_manager.object_type(&moved_uri), ObjectType::Array);
    storage_manager.array_create(&dense_2d(array_uri.as_str()))?;
    assert!(matches!(
        storage_manager.move_path(&moved_uri, &array_uri, false),
        Err(StorageManagerError::AlreadyExists(_))
    ));
    storage_manager.move_path(&moved_uri, &array_uri, true)?;
    assert_eq!(storage_manager.object_type(&array_uri), ObjectType::Array);

    // Paths that are not TileDB objects are refused.
    let plain_uri = URI::new("mem://groups/plain")?;
    storage_manager.create_dir(&plain_uri)?;
    assert!(matches!(
        storage_manager.remove_path(&plain_uri),
        Err(StorageManagerError::UnrecognizedObject(_))
    ));
    storage_manager.remove_path(&array_uri)?;
    assert_eq!(storage_manager.object_type(&array_uri), ObjectType::Invalid);
    Ok(())
}

#[test]
fn query_lifecycle_errors() -> Result<(), Box<dyn Error>> {
    let storage_manager = StorageManager::new()?;
    let array = "mem://arrays/lifecycle";
    storage_manager.array_create(&dense_2d(array))?;

    // Submit before init.
    let mut query = Query::new(QueryType::Read, Layout::RowMajor);
    assert!(matches!(
        storage_manager.query_submit(&mut query),
        Err(StorageManagerError::InvalidState(_))
    ));

    // Unknown attribute.
    let mut query = Query::new(QueryType::Read, Layout::RowMajor);
    assert!(storage_manager
        .query_init(
            &mut query,
            array,
            QueryType::Read,
            Layout::RowMajor,
            Some(DomainValues::from_typed(vec![0_i64, 3, 0, 3])),
            &["missing"],
            vec![Vec::new()],
            None,
        )
        .is_err());

    // Subarray outside the domain.
    let mut query = Query::new(QueryType::Read, Layout::RowMajor);
    assert!(storage_manager
        .query_init(
            &mut query,
            array,
            QueryType::Read,
            Layout::RowMajor,
            Some(DomainValues::from_typed(vec![0_i64, 5, 0, 3])),
            &["v"],
            vec![Vec::new()],
            None,
        )
        .is_err());

    // Double finalize.
    let mut query = Query::new(QueryType::Write, Layout::RowMajor);
    storage_manager.query_init(
        &mut query,
        array,
        QueryType::Write,
        Layout::RowMajor,
        Some(DomainValues::from_typed(vec![0_i64, 3, 0, 3])),
        &["v"],
        vec![vec![0_u8; 64]],
        None,
    )?;
    storage_manager.query_submit(&mut query)?;
    storage_manager.query_finalize(&mut query)?;
    assert!(matches!(
        storage_manager.query_finalize(&mut query),
        Err(StorageManagerError::InvalidState(_))
    ));

    // Unlocking an array that is not locked.
    assert!(matches!(
        storage_manager.array_unlock(&URI::new(array)?, true),
        Err(StorageManagerError::Lock(_))
    ));
    Ok(())
}

#[test]
fn exclusive_lock_requests_are_not_starved() -> Result<(), Box<dyn Error>> {
    let storage_manager = Arc::new(StorageManager::new()?);
    let array_uri = URI::new("mem://arrays/fairness")?;
    let events = Arc::new(StdMutex::new(Vec::new()));

    // S1 holds a shared lock.
    storage_manager.array_lock(&array_uri, true)?;

    let exclusive = {
        let storage_manager = storage_manager.clone();
        let array_uri = array_uri.clone();
        let events = events.clone();
        std::thread::spawn(move || {
            storage_manager.array_lock(&array_uri, false).unwrap();
            events.lock().unwrap().push("E1");
            storage_manager.array_unlock(&array_uri, false).unwrap();
        })
    };
    std::thread::sleep(Duration::from_millis(100));

    // S2 requests a shared lock while E1 is waiting: it must also wait.
    let shared = {
        let storage_manager = storage_manager.clone();
        let array_uri = array_uri.clone();
        let events = events.clone();
        std::thread::spawn(move || {
            storage_manager.array_lock(&array_uri, true).unwrap();
            events.lock().unwrap().push("S2");
            storage_manager.array_unlock(&array_uri, true).unwrap();
        })
    };
    std::thread::sleep(Duration::from_millis(100));
    assert!(events.lock().unwrap().is_empty());

    // Releasing S1 lets E1 proceed before S2.
    storage_manager.array_unlock(&array_uri, true)?;
    exclusive.join().unwrap();
    shared.join().unwrap();
    assert_eq!(*events.lock().unwrap(), vec!["E1", "S2"]);
    Ok(())
}

#[test]
fn async_queries_complete_in_fifo_order() -> Result<(), Box<dyn Error>> {
    let storage_manager = StorageManager::new()?;
    let array = "mem://arrays/fifo";
    storage_manager.array_create(&dense_2d(array))?;

    let completed: Arc<StdMutex<Vec<usize>>> = Arc::new(StdMutex::new(Vec::new()));
    let mut queries = Vec::new();
    for i in 1..=5 {
        let mut query = Query::new(QueryType::Write, Layout::RowMajor);
        storage_manager.query_init(
            &mut query,
            array,
            QueryType::Write,
            Layout::RowMajor,
            Some(DomainValues::from_typed(vec![0_i64, 3, 0, 3])),
            &["v"],
            vec![vec![i as u8; 64]],
            None,
        )?;
        let query = Arc::new(Mutex::new(query));
        let completed = completed.clone();
        storage_manager.query_submit_async(
            query.clone(),
            Some(Box::new(move || completed.lock().unwrap().push(i))),
        )?;
        queries.push(query);
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    while completed.lock().unwrap().len() < 5 {
        assert!(Instant::now() < deadline, "async queries did not complete");
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(*completed.lock().unwrap(), vec![1, 2, 3, 4, 5]);

    for query in &queries {
        let mut guard = query.lock();
        assert_eq!(guard.status(), QueryStatus::Completed);
        storage_manager.query_finalize(&mut guard)?;
    }
    assert_eq!(storage_manager.get_fragment_uris(&URI::new(array)?)?.len(), 5);
    Ok(())
}

#[test]
fn consolidate_merges_fragments() -> Result<(), Box<dyn Error>> {
    let storage_manager = StorageManager::new()?;
    let array = "mem://arrays/consolidate";
    let array_uri = URI::new(array)?;
    storage_manager.array_create(&dense_2d(array))?;

    write_cells(&storage_manager, array, vec![0, 3, 0, 3], &[1; 16])?;
    write_cells(&storage_manager, array, vec![0, 1, 0, 1], &[9; 4])?;
    assert_eq!(storage_manager.get_fragment_uris(&array_uri)?.len(), 2);

    storage_manager.array_consolidate(array)?;
    assert_eq!(storage_manager.get_fragment_uris(&array_uri)?.len(), 1);

    let cells = read_cells(&storage_manager, array, vec![0, 3, 0, 3], 16)?;
    let expected: Vec<i32> = (0..4)
        .flat_map(|r| (0..4).map(move |c| if r < 2 && c < 2 { 9 } else { 1 }))
        .collect();
    assert_eq!(cells, expected);
    Ok(())
}

/// A memory filesystem whose writes can be made to fail on demand.
#[derive(Debug)]
struct FailingWrites {
    inner: MemoryFilesystem,
    fail_writes: AtomicBool,
}

impl FailingWrites {
    fn new() -> Self {
        Self {
            inner: MemoryFilesystem::new(),
            fail_writes: AtomicBool::new(false),
        }
    }

    fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl VfsBackend for FailingWrites {
    fn create_dir(&self, uri: &URI) -> Result<(), VfsError> {
        self.inner.create_dir(uri)
    }
    fn create_file(&self, uri: &URI) -> Result<(), VfsError> {
        self.inner.create_file(uri)
    }
    fn is_dir(&self, uri: &URI) -> bool {
        self.inner.is_dir(uri)
    }
    fn is_file(&self, uri: &URI) -> bool {
        self.inner.is_file(uri)
    }
    fn file_size(&self, uri: &URI) -> Result<u64, VfsError> {
        self.inner.file_size(uri)
    }
    fn read(&self, uri: &URI, offset: u64, buffer: &mut [u8]) -> Result<(), VfsError> {
        self.inner.read(uri, offset, buffer)
    }
    fn write(&self, uri: &URI, data: &[u8]) -> Result<(), VfsError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(VfsError::Io {
                path: uri.to_string(),
                source: std::io::Error::other("injected write failure"),
            });
        }
        self.inner.write(uri, data)
    }
    fn sync(&self, uri: &URI) -> Result<(), VfsError> {
        self.inner.sync(uri)
    }
    fn remove_path(&self, uri: &URI) -> Result<(), VfsError> {
        self.inner.remove_path(uri)
    }
    fn move_path(&self, old_uri: &URI, new_uri: &URI, force: bool) -> Result<(), VfsError> {
        self.inner.move_path(old_uri, new_uri, force)
    }
    fn ls(&self, uri: &URI) -> Result<Vec<URI>, VfsError> {
        self.inner.ls(uri)
    }
}

#[test]
fn consolidate_failure_leaves_array_untouched() -> Result<(), Box<dyn Error>> {
    let backend = Arc::new(FailingWrites::new());
    let vfs = Vfs::new();
    vfs.register("mem", backend.clone());
    let storage_manager = StorageManager::with_vfs(vfs)?;

    let array = "mem://arrays/consolidate_fail";
    let array_uri = URI::new(array)?;
    storage_manager.array_create(&dense_2d(array))?;
    write_cells(&storage_manager, array, vec![0, 3, 0, 3], &[1; 16])?;
    write_cells(&storage_manager, array, vec![0, 1, 0, 1], &[9; 4])?;
    let fragments_before = storage_manager.get_fragment_uris(&array_uri)?;
    assert_eq!(fragments_before.len(), 2);

    backend.fail_writes(true);
    assert!(storage_manager.array_consolidate(array).is_err());
    backend.fail_writes(false);

    // The original fragments survive and no stray target is left behind.
    let fragments_after = storage_manager.get_fragment_uris(&array_uri)?;
    assert_eq!(fragments_after, fragments_before);

    let cells = read_cells(&storage_manager, array, vec![0, 3, 0, 3], 16)?;
    let expected: Vec<i32> = (0..4)
        .flat_map(|r| (0..4).map(move |c| if r < 2 && c < 2 { 9 } else { 1 }))
        .collect();
    assert_eq!(cells, expected);
    Ok(())
}

#[test]
fn posix_backend_end_to_end() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let storage_manager = StorageManager::new()?;
    let array_path = dir.path().join("array");
    let array = array_path.to_string_lossy().to_string();

    storage_manager.array_create(&dense_2d(&array))?;
    let values: Vec<i32> = (100..116).collect();
    write_cells(&storage_manager, &array, vec![0, 3, 0, 3], &values)?;
    assert_eq!(
        read_cells(&storage_manager, &array, vec![0, 3, 0, 3], 16)?,
        values
    );

    let loaded = storage_manager.load(&array)?;
    assert_eq!(loaded.attribute_num(), 1);
    assert!(array_path.join("__array_metadata.tdb").is_file());
    Ok(())
}
