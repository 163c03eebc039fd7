//! The `mem` scheme backend: an in-memory filesystem.

use std::collections::{BTreeMap, BTreeSet};
use std::io;

use parking_lot::RwLock;

use crate::uri::URI;

use super::{VfsBackend, VfsError};

#[derive(Debug, Default)]
struct Inner {
    dirs: BTreeSet<String>,
    files: BTreeMap<String, Vec<u8>>,
}

/// An in-memory filesystem backend, primarily for tests and examples.
#[derive(Debug, Default)]
pub struct MemoryFilesystem {
    inner: RwLock<Inner>,
}

impl MemoryFilesystem {
    /// Create an empty in-memory filesystem.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl VfsBackend for MemoryFilesystem {
    fn create_dir(&self, uri: &URI) -> Result<(), VfsError> {
        let mut inner = self.inner.write();
        let mut path = String::new();
        for segment in uri.path().split('/') {
            if !path.is_empty() {
                path.push('/');
            }
            path.push_str(segment);
            inner.dirs.insert(path.clone());
        }
        Ok(())
    }

    fn create_file(&self, uri: &URI) -> Result<(), VfsError> {
        self.inner
            .write()
            .files
            .entry(uri.path().to_string())
            .or_default();
        Ok(())
    }

    fn is_dir(&self, uri: &URI) -> bool {
        self.inner.read().dirs.contains(uri.path())
    }

    fn is_file(&self, uri: &URI) -> bool {
        self.inner.read().files.contains_key(uri.path())
    }

    fn file_size(&self, uri: &URI) -> Result<u64, VfsError> {
        self.inner
            .read()
            .files
            .get(uri.path())
            .map(|data| data.len() as u64)
            .ok_or_else(|| VfsError::NotFound(uri.to_string()))
    }

    fn read(&self, uri: &URI, offset: u64, buffer: &mut [u8]) -> Result<(), VfsError> {
        let inner = self.inner.read();
        let data = inner
            .files
            .get(uri.path())
            .ok_or_else(|| VfsError::NotFound(uri.to_string()))?;
        let offset = usize::try_from(offset).unwrap();
        if offset + buffer.len() > data.len() {
            return Err(VfsError::io(
                uri,
                io::Error::new(io::ErrorKind::UnexpectedEof, "read past end of file"),
            ));
        }
        buffer.copy_from_slice(&data[offset..offset + buffer.len()]);
        Ok(())
    }

    fn write(&self, uri: &URI, data: &[u8]) -> Result<(), VfsError> {
        self.inner
            .write()
            .files
            .entry(uri.path().to_string())
            .or_default()
            .extend_from_slice(data);
        Ok(())
    }

    fn sync(&self, _uri: &URI) -> Result<(), VfsError> {
        Ok(())
    }

    fn remove_path(&self, uri: &URI) -> Result<(), VfsError> {
        let mut inner = self.inner.write();
        let path = uri.path().to_string();
        let prefix = format!("{path}/");
        let mut removed = inner.dirs.remove(&path);
        removed |= inner.files.remove(&path).is_some();
        let nested_dirs: Vec<String> = inner
            .dirs
            .iter()
            .filter(|d| d.starts_with(&prefix))
            .cloned()
            .collect();
        for dir in nested_dirs {
            inner.dirs.remove(&dir);
            removed = true;
        }
        let nested_files: Vec<String> = inner
            .files
            .keys()
            .filter(|f| f.starts_with(&prefix))
            .cloned()
            .collect();
        for file in nested_files {
            inner.files.remove(&file);
            removed = true;
        }
        if removed {
            Ok(())
        } else {
            Err(VfsError::NotFound(uri.to_string()))
        }
    }

    fn move_path(&self, old_uri: &URI, new_uri: &URI, force: bool) -> Result<(), VfsError> {
        let mut inner = self.inner.write();
        let old_path = old_uri.path().to_string();
        let new_path = new_uri.path().to_string();
        let prefix = format!("{old_path}/");
        let rekey = |path: &str| {
            if path == old_path {
                Some(new_path.clone())
            } else {
                path.strip_prefix(&prefix)
                    .map(|rest| format!("{new_path}/{rest}"))
            }
        };

        if !inner.dirs.contains(&old_path) && !inner.files.contains_key(&old_path) {
            return Err(VfsError::NotFound(old_uri.to_string()));
        }
        if inner.dirs.contains(&new_path) || inner.files.contains_key(&new_path) {
            if !force {
                return Err(VfsError::AlreadyExists(new_uri.to_string()));
            }
            let new_prefix = format!("{new_path}/");
            inner
                .dirs
                .retain(|dir| dir != &new_path && !dir.starts_with(&new_prefix));
            inner
                .files
                .retain(|file, _| file != &new_path && !file.starts_with(&new_prefix));
        }
        inner.dirs = inner
            .dirs
            .iter()
            .map(|dir| rekey(dir).unwrap_or_else(|| dir.clone()))
            .collect();
        inner.files = inner
            .files
            .iter()
            .map(|(file, data)| (rekey(file).unwrap_or_else(|| file.clone()), data.clone()))
            .collect();
        Ok(())
    }

    fn ls(&self, uri: &URI) -> Result<Vec<URI>, VfsError> {
        let inner = self.inner.read();
        let prefix = format!("{}/", uri.path());
        let mut children = BTreeSet::new();
        for path in inner.dirs.iter().chain(inner.files.keys()) {
            if let Some(rest) = path.strip_prefix(&prefix) {
                if !rest.is_empty() && !rest.contains('/') {
                    children.insert(rest.to_string());
                }
            }
        }
        Ok(children.iter().map(|name| uri.join(name)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_file_round_trip() -> Result<(), VfsError> {
        let fs = MemoryFilesystem::new();
        let uri = URI::new("mem://arrays/a/data.tdb").unwrap();
        fs.write(&uri, &[1, 2, 3])?;
        fs.write(&uri, &[4, 5])?;
        assert_eq!(fs.file_size(&uri)?, 5);
        let mut buffer = [0_u8; 2];
        fs.read(&uri, 3, &mut buffer)?;
        assert_eq!(buffer, [4, 5]);
        assert!(fs.read(&uri, 4, &mut buffer).is_err());
        Ok(())
    }

    #[test]
    fn memory_ls_and_remove() -> Result<(), VfsError> {
        let fs = MemoryFilesystem::new();
        let base = URI::new("mem://arrays/a").unwrap();
        fs.create_dir(&base)?;
        fs.create_dir(&base.join("1_10"))?;
        fs.create_file(&base.join("__array_metadata.tdb"))?;
        fs.write(&base.join("1_10").join("v.tdb"), &[0])?;

        assert_eq!(
            fs.ls(&base)?,
            vec![base.join("1_10"), base.join("__array_metadata.tdb")]
        );

        fs.remove_path(&base.join("1_10"))?;
        assert!(!fs.is_dir(&base.join("1_10")));
        assert!(!fs.is_file(&base.join("1_10").join("v.tdb")));
        assert!(fs.remove_path(&base.join("1_10")).is_err());
        Ok(())
    }

    #[test]
    fn memory_move_renames_children() -> Result<(), VfsError> {
        let fs = MemoryFilesystem::new();
        let old = URI::new("mem://arrays/a").unwrap();
        let new = URI::new("mem://arrays/b").unwrap();
        fs.create_dir(&old)?;
        fs.write(&old.join("f"), &[7])?;
        fs.move_path(&old, &new, false)?;
        assert!(!fs.is_dir(&old));
        assert!(fs.is_dir(&new));
        assert_eq!(fs.file_size(&new.join("f"))?, 1);
        Ok(())
    }

    #[test]
    fn memory_move_refuses_existing_target_unless_forced() -> Result<(), VfsError> {
        let fs = MemoryFilesystem::new();
        let old = URI::new("mem://arrays/a").unwrap();
        let new = URI::new("mem://arrays/b").unwrap();
        fs.create_dir(&old)?;
        fs.write(&old.join("f"), &[7])?;
        fs.create_dir(&new)?;
        fs.write(&new.join("stale"), &[0])?;

        assert!(matches!(
            fs.move_path(&old, &new, false),
            Err(VfsError::AlreadyExists(_))
        ));
        fs.move_path(&old, &new, true)?;
        assert!(!fs.is_dir(&old));
        assert!(fs.is_file(&new.join("f")));
        assert!(!fs.is_file(&new.join("stale")));
        Ok(())
    }
}
