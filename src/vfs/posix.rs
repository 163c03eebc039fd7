//! The `file` scheme backend.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use walkdir::WalkDir;

use crate::uri::URI;

use super::{VfsBackend, VfsError};

/// A POSIX filesystem backend.
///
/// Concurrent accesses to the same file are serialised through a per-file
/// reader-writer lock.
#[derive(Debug, Default)]
pub struct PosixFilesystem {
    files: Mutex<HashMap<PathBuf, Arc<RwLock<()>>>>,
}

impl PosixFilesystem {
    /// Create a POSIX filesystem backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn file_lock(&self, path: &PathBuf) -> Arc<RwLock<()>> {
        let mut files = self.files.lock();
        files.entry(path.clone()).or_default().clone()
    }
}

impl VfsBackend for PosixFilesystem {
    fn create_dir(&self, uri: &URI) -> Result<(), VfsError> {
        std::fs::create_dir_all(uri.to_path()).map_err(|e| VfsError::io(uri, e))
    }

    fn create_file(&self, uri: &URI) -> Result<(), VfsError> {
        let path = uri.to_path();
        let lock = self.file_lock(&path);
        let _guard = lock.write();
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map(|_| ())
            .map_err(|e| VfsError::io(uri, e))
    }

    fn is_dir(&self, uri: &URI) -> bool {
        uri.to_path().is_dir()
    }

    fn is_file(&self, uri: &URI) -> bool {
        uri.to_path().is_file()
    }

    fn file_size(&self, uri: &URI) -> Result<u64, VfsError> {
        std::fs::metadata(uri.to_path())
            .map(|metadata| metadata.len())
            .map_err(|e| VfsError::io(uri, e))
    }

    fn read(&self, uri: &URI, offset: u64, buffer: &mut [u8]) -> Result<(), VfsError> {
        let path = uri.to_path();
        let lock = self.file_lock(&path);
        let _guard = lock.read();
        let mut file = File::open(&path).map_err(|e| VfsError::io(uri, e))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| VfsError::io(uri, e))?;
        file.read_exact(buffer).map_err(|e| VfsError::io(uri, e))
    }

    fn write(&self, uri: &URI, data: &[u8]) -> Result<(), VfsError> {
        let path = uri.to_path();
        let lock = self.file_lock(&path);
        let _guard = lock.write();
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|e| VfsError::io(uri, e))?;
        file.write_all(data).map_err(|e| VfsError::io(uri, e))
    }

    fn sync(&self, uri: &URI) -> Result<(), VfsError> {
        let path = uri.to_path();
        if path.is_dir() {
            #[cfg(unix)]
            {
                let dir = File::open(&path).map_err(|e| VfsError::io(uri, e))?;
                dir.sync_all().map_err(|e| VfsError::io(uri, e))?;
            }
            Ok(())
        } else {
            let lock = self.file_lock(&path);
            let _guard = lock.write();
            let file = OpenOptions::new()
                .write(true)
                .open(&path)
                .map_err(|e| VfsError::io(uri, e))?;
            file.sync_all().map_err(|e| VfsError::io(uri, e))
        }
    }

    fn remove_path(&self, uri: &URI) -> Result<(), VfsError> {
        let path = uri.to_path();
        if path.is_dir() {
            std::fs::remove_dir_all(&path).map_err(|e| VfsError::io(uri, e))
        } else if path.is_file() {
            std::fs::remove_file(&path).map_err(|e| VfsError::io(uri, e))
        } else {
            Err(VfsError::NotFound(uri.to_string()))
        }
    }

    fn move_path(&self, old_uri: &URI, new_uri: &URI, force: bool) -> Result<(), VfsError> {
        let new_path = new_uri.to_path();
        if new_path.exists() {
            if !force {
                return Err(VfsError::AlreadyExists(new_uri.to_string()));
            }
            self.remove_path(new_uri)?;
        }
        std::fs::rename(old_uri.to_path(), new_path).map_err(|e| VfsError::io(old_uri, e))
    }

    fn ls(&self, uri: &URI) -> Result<Vec<URI>, VfsError> {
        let mut children = Vec::new();
        for entry in WalkDir::new(uri.to_path())
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| VfsError::Io {
                path: uri.to_string(),
                source: e.into(),
            })?;
            children.push(uri.join(&entry.file_name().to_string_lossy()));
        }
        Ok(children)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_uri(path: &std::path::Path) -> URI {
        URI::new(&path.to_string_lossy()).unwrap()
    }

    #[test]
    fn posix_file_round_trip() -> Result<(), VfsError> {
        let dir = tempfile::tempdir().unwrap();
        let fs = PosixFilesystem::new();
        let uri = file_uri(&dir.path().join("data.tdb"));

        fs.write(&uri, &[1, 2, 3])?;
        fs.write(&uri, &[4, 5])?;
        assert!(fs.is_file(&uri));
        assert_eq!(fs.file_size(&uri)?, 5);

        let mut buffer = [0_u8; 2];
        fs.read(&uri, 3, &mut buffer)?;
        assert_eq!(buffer, [4, 5]);
        fs.sync(&uri)?;
        fs.remove_path(&uri)?;
        assert!(!fs.is_file(&uri));
        Ok(())
    }

    #[test]
    fn posix_move_refuses_existing_target_unless_forced() -> Result<(), VfsError> {
        let dir = tempfile::tempdir().unwrap();
        let fs = PosixFilesystem::new();
        let old = file_uri(&dir.path().join("old"));
        let new = file_uri(&dir.path().join("new"));
        fs.write(&old, &[1])?;
        fs.write(&new, &[2])?;
        assert!(matches!(
            fs.move_path(&old, &new, false),
            Err(VfsError::AlreadyExists(_))
        ));
        fs.move_path(&old, &new, true)?;
        assert!(!fs.is_file(&old));
        assert_eq!(fs.file_size(&new)?, 1);
        Ok(())
    }

    #[test]
    fn posix_ls_sorted() -> Result<(), VfsError> {
        let dir = tempfile::tempdir().unwrap();
        let fs = PosixFilesystem::new();
        let base = file_uri(dir.path());
        fs.create_dir(&base.join("b"))?;
        fs.create_dir(&base.join("a"))?;
        fs.create_file(&base.join("c"))?;
        let children = fs.ls(&base)?;
        assert_eq!(
            children,
            vec![base.join("a"), base.join("b"), base.join("c")]
        );
        Ok(())
    }
}
