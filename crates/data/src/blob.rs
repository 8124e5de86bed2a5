//! Blob storage abstraction.
//!
//! The serving core only consumes this capability set; cloud-provider
//! clients (S3, GCS) implement the same trait out of tree. The in-tree
//! variant reads a local directory, which is also what tests use.

use crate::reader::DeltaStream;
use crate::DataError;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Read/list/write access to a flat namespace of immutable blobs.
pub trait BlobStorageClient: Send + Sync {
    /// Open an independent seekable reader over `name`.
    fn get_reader(&self, name: &str) -> Result<Box<dyn DeltaStream>, DataError>;

    fn put(&self, name: &str, data: &[u8]) -> Result<(), DataError>;

    fn delete(&self, name: &str) -> Result<(), DataError>;

    /// Names starting with `prefix`, in no guaranteed order.
    fn list(&self, prefix: &str) -> Result<Vec<String>, DataError>;
}

/// Local-directory blob client.
#[derive(Debug, Clone)]
pub struct FileBlobClient {
    root: PathBuf,
}

impl FileBlobClient {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, DataError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, DataError> {
        if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
            return Err(DataError::InvalidFormat(format!("invalid blob name: {name}")));
        }
        Ok(self.root.join(name))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl BlobStorageClient for FileBlobClient {
    fn get_reader(&self, name: &str) -> Result<Box<dyn DeltaStream>, DataError> {
        let path = self.path_for(name)?;
        match fs::File::open(&path) {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(DataError::NotFound(name.to_string()))
            }
            Err(e) => Err(DataError::Io(e)),
        }
    }

    fn put(&self, name: &str, data: &[u8]) -> Result<(), DataError> {
        let path = self.path_for(name)?;
        // Write-then-rename so a concurrent list never observes a partial
        // blob.
        let tmp = self.root.join(format!(".tmp-{name}"));
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<(), DataError> {
        let path = self.path_for(name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(DataError::NotFound(name.to_string()))
            }
            Err(e) => Err(DataError::Io(e)),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, DataError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Ok(name) = entry.file_name().into_string() {
                if name.starts_with(prefix) {
                    names.push(name);
                }
            }
        }
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;

    #[test]
    fn test_put_get_round_trip() {
        let dir = TempDir::new().unwrap();
        let client = FileBlobClient::new(dir.path()).unwrap();

        client.put("DELTA_0001", b"payload").unwrap();
        let mut reader = client.get_reader("DELTA_0001").unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"payload");
    }

    #[test]
    fn test_get_missing_blob_is_not_found() {
        let dir = TempDir::new().unwrap();
        let client = FileBlobClient::new(dir.path()).unwrap();
        assert!(matches!(
            client.get_reader("DELTA_missing"),
            Err(DataError::NotFound(_))
        ));
    }

    #[test]
    fn test_list_filters_by_prefix() {
        let dir = TempDir::new().unwrap();
        let client = FileBlobClient::new(dir.path()).unwrap();
        client.put("DELTA_0001", b"a").unwrap();
        client.put("DELTA_0002", b"b").unwrap();
        client.put("SNAPSHOT_0001", b"c").unwrap();

        let mut names = client.list("DELTA_").unwrap();
        names.sort();
        assert_eq!(names, vec!["DELTA_0001", "DELTA_0002"]);
    }

    #[test]
    fn test_delete() {
        let dir = TempDir::new().unwrap();
        let client = FileBlobClient::new(dir.path()).unwrap();
        client.put("DELTA_0001", b"a").unwrap();
        client.delete("DELTA_0001").unwrap();
        assert!(client.list("DELTA_").unwrap().is_empty());
        assert!(matches!(
            client.delete("DELTA_0001"),
            Err(DataError::NotFound(_))
        ));
    }

    #[test]
    fn test_rejects_path_traversal_names() {
        let dir = TempDir::new().unwrap();
        let client = FileBlobClient::new(dir.path()).unwrap();
        assert!(client.get_reader("../escape").is_err());
        assert!(client.put("a/b", b"x").is_err());
    }
}
