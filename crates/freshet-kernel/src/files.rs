//! Deduplicated file store with reference counting and orphan collection.
//!
//! Attachment bytes live in the content-addressed blob store; this module
//! owns the metadata: one record per (hash, filename), a refcount that
//! tracks how many saved messages reference the file, and a paginated
//! garbage collector for records nothing references anymore.
//!
//! A fresh upload starts at refcount 0 — being uploaded is not liveness;
//! being attached to a saved message is. Records only become GC-eligible
//! after sitting unreferenced and untouched for a retention window, which
//! gives an in-progress compose flow time to attach the file it just
//! uploaded.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use freshet_cas::{hash_bytes, BlobStore, CasError};
use freshet_types::{now_millis, FileId};

use crate::db::{FileDeleteOutcome, FilePage, FileRecord, StreamError};
use crate::store::DbHandle;

/// How long an unreferenced record must sit untouched before collection.
pub const FILE_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Records examined per GC page.
pub const GC_PAGE_SIZE: usize = 100;

#[derive(Debug, Error)]
pub enum FileStoreError {
    #[error("file not found: {0}")]
    NotFound(FileId),

    #[error(transparent)]
    Cas(#[from] CasError),

    #[error(transparent)]
    Store(#[from] StreamError),
}

/// Result of [`FileStore::add_file`].
#[derive(Debug, Clone)]
pub struct AddedFile {
    pub file_id: FileId,
    pub blob_id: String,
    pub hash: String,
    /// True when the upload matched an existing (hash, filename) record.
    pub deduplicated: bool,
}

/// Metadata layer over the blob store.
pub struct FileStore {
    db: DbHandle,
    blobs: Arc<BlobStore>,
}

impl FileStore {
    /// Create a file store sharing the chat database connection.
    pub fn new(db: DbHandle, blobs: BlobStore) -> Self {
        Self {
            db,
            blobs: Arc::new(blobs),
        }
    }

    /// Store an upload.
    ///
    /// The blob write is idempotent (content addressing), so a duplicate
    /// upload costs no extra storage. An existing (hash, filename) record
    /// gets its refcount bumped and is returned as-is; a new record starts
    /// at refcount 0.
    pub fn add_file(
        &self,
        data: &[u8],
        filename: Option<&str>,
        mime_type: &str,
    ) -> Result<AddedFile, FileStoreError> {
        let hash = hash_bytes(data);
        let blob_id = self.blobs.put(data)?;
        let (file_id, blob_id, existed) =
            self.db
                .lock()
                .add_file_record(&hash, filename, mime_type, &blob_id)?;
        Ok(AddedFile {
            file_id,
            blob_id,
            hash,
            deduplicated: existed,
        })
    }

    /// Re-resolve a file the caller already holds a reference to. Touches
    /// the record but does not bump its refcount.
    pub fn use_existing_file(
        &self,
        hash: &str,
        filename: Option<&str>,
    ) -> Result<Option<FileId>, FileStoreError> {
        Ok(self.db.lock().probe_file(hash, filename)?)
    }

    /// Take an additional reference (message fork/reuse).
    pub fn copy_file(&self, file_id: FileId) -> Result<(), FileStoreError> {
        if self.db.lock().copy_file_record(file_id)? {
            Ok(())
        } else {
            Err(FileStoreError::NotFound(file_id))
        }
    }

    /// Fetch a record by id.
    pub fn get_file(&self, file_id: FileId) -> Result<FileRecord, FileStoreError> {
        self.db
            .lock()
            .get_file_record(file_id)?
            .ok_or(FileStoreError::NotFound(file_id))
    }

    /// Read a file's bytes back from the blob store.
    pub fn read(&self, file_id: FileId) -> Result<Vec<u8>, FileStoreError> {
        let record = self.get_file(file_id)?;
        Ok(self.blobs.get(&record.blob_id)?)
    }

    /// One page of unreferenced records, ordered for stable continuation.
    pub fn get_files_to_delete(
        &self,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<FilePage, FileStoreError> {
        Ok(self.db.lock().files_to_delete(cursor, page_size)?)
    }

    /// Delete records by id. Skips (with a warning) records that are
    /// missing or still referenced unless `force` is set — the refcount
    /// re-check happens at delete time, so this is safe to call
    /// speculatively from the GC sweep even if a file was concurrently
    /// re-referenced. Returns how many records were deleted.
    pub fn delete_files(&self, file_ids: &[FileId], force: bool) -> Result<usize, FileStoreError> {
        let mut deleted = 0;
        for &file_id in file_ids {
            let outcome = self.db.lock().delete_file_row(file_id, force)?;
            match outcome {
                FileDeleteOutcome::Deleted { blob_id } => {
                    deleted += 1;
                    // The row goes first: a crash here leaves an orphaned
                    // blob on disk, never a record pointing at nothing.
                    if !self.db.lock().blob_in_use(&blob_id)? {
                        match self.blobs.delete(&blob_id) {
                            Ok(()) | Err(CasError::NotFound(_)) => {}
                            Err(e) => return Err(e.into()),
                        }
                    }
                }
                FileDeleteOutcome::StillReferenced { refcount } => {
                    tracing::warn!(
                        file_id = %file_id,
                        refcount,
                        "skipping delete of referenced file"
                    );
                }
                FileDeleteOutcome::Missing => {
                    tracing::warn!(file_id = %file_id, "skipping delete of missing file");
                }
            }
        }
        Ok(deleted)
    }

    /// Collect unreferenced records older than `retention`.
    ///
    /// Pages through the refcount-zero scan with the page-then-done
    /// structure, so each page's deletions are bounded; records touched
    /// within the retention window are kept no matter how many sweeps run.
    pub fn cleanup_orphaned_files(&self, retention: Duration) -> Result<usize, FileStoreError> {
        let cutoff = now_millis().saturating_sub(retention.as_millis() as u64);
        let mut cursor: Option<String> = None;
        let mut deleted = 0;

        loop {
            let page = self.get_files_to_delete(cursor.as_deref(), GC_PAGE_SIZE)?;
            let aged: Vec<FileId> = page
                .files
                .iter()
                .filter(|f| f.last_touched_at <= cutoff)
                .map(|f| f.id)
                .collect();
            deleted += self.delete_files(&aged, false)?;

            if page.is_done {
                break;
            }
            cursor = page.continue_cursor;
        }

        if deleted > 0 {
            tracing::info!(deleted, "collected orphaned files");
        }
        Ok(deleted)
    }
}
