//! Key-value blob storage for the mesh and the playlist

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{WarpError, WarpResult};

pub const MESH_KEY: &str = "mesh";
pub const PLAYLIST_KEY: &str = "playlist";

pub trait BlobStore: Send {
    /// Read a blob; `Ok(None)` when it was never written
    fn get(&self, key: &str) -> WarpResult<Option<Vec<u8>>>;

    fn put(&self, key: &str, data: &[u8]) -> WarpResult<()>;
}

/// One `<key>.json` file per blob inside a directory
pub struct FileBlobStore {
    dir: PathBuf,
}

impl FileBlobStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

impl BlobStore for FileBlobStore {
    fn get(&self, key: &str) -> WarpResult<Option<Vec<u8>>> {
        let path = self.path(key);
        match std::fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(WarpError::persistence(format!("reading {:?}: {}", path, e))),
        }
    }

    fn put(&self, key: &str, data: &[u8]) -> WarpResult<()> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| WarpError::persistence(format!("creating {:?}: {}", self.dir, e)))?;

        // Write then rename so a crash never leaves a half-written blob
        let path = self.path(key);
        let tmp = self.dir.join(format!("{}.json.tmp", key));
        std::fs::write(&tmp, data)
            .map_err(|e| WarpError::persistence(format!("writing {:?}: {}", tmp, e)))?;
        std::fs::rename(&tmp, &path)
            .map_err(|e| WarpError::persistence(format!("renaming to {:?}: {}", path, e)))?;

        tracing::debug!("Stored {} ({} bytes) at {:?}", key, data.len(), path);
        Ok(())
    }
}

/// Volatile store, used in tests and when running without a storage dir
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for MemoryBlobStore {
    fn get(&self, key: &str) -> WarpResult<Option<Vec<u8>>> {
        Ok(self.blobs.lock().get(key).cloned())
    }

    fn put(&self, key: &str, data: &[u8]) -> WarpResult<()> {
        self.blobs.lock().insert(key.to_string(), data.to_vec());
        Ok(())
    }
}
