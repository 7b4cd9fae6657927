//! Content-addressed blob storage for attachment bytes.
//!
//! Blobs are named by the BLAKE3 hex digest of their content and stored
//! under a two-character fan-out directory (`root/ab/abcdef…`). Writes go
//! through a temp file and an atomic rename, so a crash mid-write never
//! leaves a partially written blob under its final name.
//!
//! Deduplication falls out of the addressing: putting the same bytes twice
//! is a no-op that returns the same id. Liveness (which blobs are still
//! referenced) is tracked by the file store's refcounts, not here.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// A blob identifier — the BLAKE3 hex digest of the content.
pub type BlobId = String;

#[derive(Debug, Error)]
pub enum CasError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("content hash mismatch for {id}: stored bytes hash to {actual}")]
    HashMismatch { id: String, actual: String },
}

/// Hash bytes the way the store addresses them.
pub fn hash_bytes(data: &[u8]) -> String {
    hex::encode(blake3::hash(data).as_bytes())
}

/// On-disk content-addressed blob store.
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CasError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// The store's root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store bytes, returning their content id.
    ///
    /// Idempotent: identical content maps to the same id and is written at
    /// most once.
    pub fn put(&self, data: &[u8]) -> Result<BlobId, CasError> {
        let id = hash_bytes(data);
        let path = self.blob_path(&id);
        if path.exists() {
            return Ok(id);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write to a unique temp name, then rename into place.
        let tmp = self
            .root
            .join(format!(".tmp-{}", uuid::Uuid::new_v4().as_simple()));
        let mut file = fs::File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);

        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            // A concurrent put of the same content may have won the rename.
            if path.exists() {
                return Ok(id);
            }
            return Err(e.into());
        }

        Ok(id)
    }

    /// Read a blob back, verifying its content against the id.
    pub fn get(&self, id: &str) -> Result<Vec<u8>, CasError> {
        let path = self.blob_path(id);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CasError::NotFound(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let actual = hash_bytes(&data);
        if actual != id {
            return Err(CasError::HashMismatch {
                id: id.to_string(),
                actual,
            });
        }
        Ok(data)
    }

    /// Check whether a blob exists.
    pub fn contains(&self, id: &str) -> bool {
        self.blob_path(id).exists()
    }

    /// Delete a blob.
    pub fn delete(&self, id: &str) -> Result<(), CasError> {
        let path = self.blob_path(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CasError::NotFound(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// `root/ab/abcdef…` — two-character fan-out keeps directories small.
    fn blob_path(&self, id: &str) -> PathBuf {
        let prefix = if id.len() >= 2 { &id[..2] } else { id };
        self.root.join(prefix).join(id)
    }
}
