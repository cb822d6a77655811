//! Content-addressed local blob storage
//!
//! Blobs the provider side serves from. Kept in memory for serving and
//! mirrored to disk (one file per blob, named by hex hash) for
//! durability across restarts.

use anyhow::Result;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tollgate_core::{chunk, hash_to_hex, hex_to_hash, ContentHash};

pub struct BlobStore {
    dir: PathBuf,
    blobs: Mutex<HashMap<ContentHash, Bytes>>,
}

impl BlobStore {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            blobs: Mutex::new(HashMap::new()),
        }
    }

    /// Add a blob, returning its content address
    pub fn add_bytes(&self, data: Vec<u8>) -> Result<ContentHash> {
        let hash = chunk::content_hash(&data);
        let size = data.len();

        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(hash_to_hex(&hash));
        if !path.exists() {
            std::fs::write(&path, &data)?;
        }

        self.blobs.lock().unwrap().insert(hash, Bytes::from(data));
        tracing::debug!("stored blob {} ({} bytes)", hash_to_hex(&hash), size);
        Ok(hash)
    }

    /// Add a file's contents as a blob
    pub fn add_file(&self, path: &Path) -> Result<(ContentHash, u64)> {
        let data = std::fs::read(path)?;
        let size = data.len() as u64;
        let hash = self.add_bytes(data)?;
        Ok((hash, size))
    }

    /// Get a blob by its content address
    pub fn get(&self, hash: &ContentHash) -> Option<Bytes> {
        self.blobs.lock().unwrap().get(hash).cloned()
    }

    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.blobs.lock().unwrap().contains_key(hash)
    }

    /// Load all blobs from the storage directory, skipping files whose
    /// contents no longer match their name
    pub fn load_all(&self) -> Result<usize> {
        if !self.dir.exists() {
            std::fs::create_dir_all(&self.dir)?;
            return Ok(0);
        }

        let mut count = 0;
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Ok(hash) = hex_to_hash(&name.to_string_lossy()) else {
                continue;
            };
            let data = std::fs::read(entry.path())?;
            if !chunk::verify_content(&data, &hash) {
                tracing::warn!("blob file {} fails verification, skipping", name.to_string_lossy());
                continue;
            }
            self.blobs.lock().unwrap().insert(hash, Bytes::from(data));
            count += 1;
        }
        Ok(count)
    }

    /// List stored blobs as (hash, size) pairs
    pub fn list(&self) -> Vec<(ContentHash, u64)> {
        self.blobs
            .lock()
            .unwrap()
            .iter()
            .map(|(hash, data)| (*hash, data.len() as u64))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_add_and_get() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::new(dir.path().join("blobs"));

        let hash = store.add_bytes(b"some media bytes".to_vec()).unwrap();
        assert!(store.contains(&hash));
        assert_eq!(&store.get(&hash).unwrap()[..], b"some media bytes");
        assert!(store.get(&[0u8; 32]).is_none());
    }

    #[test]
    fn test_load_all_verifies_contents() {
        let dir = TempDir::new().unwrap();
        let blobs_dir = dir.path().join("blobs");

        let hash;
        {
            let store = BlobStore::new(blobs_dir.clone());
            hash = store.add_bytes(b"persistent blob".to_vec()).unwrap();
        }

        // A corrupted file must not be loaded under its claimed hash
        std::fs::write(blobs_dir.join(hash_to_hex(&[9u8; 32])), b"junk").unwrap();

        let store = BlobStore::new(blobs_dir);
        assert_eq!(store.load_all().unwrap(), 1);
        assert_eq!(&store.get(&hash).unwrap()[..], b"persistent blob");
        assert!(!store.contains(&[9u8; 32]));
    }
}
