//! Chunked uploader – keeps the session id and offset of one upload
//! session and sends every call through the retry policy.

use chrono::{DateTime, Utc};
use tracing::info;

use streamvault_common::protocol::{CommitInfo, FileMetadata, UploadSessionCursor};

use crate::retry::RetryPolicy;
use crate::storage::{RemoteStorage, StorageError};

/// Upload session of one segment.
///
/// The offset is advanced only after the server acknowledged a chunk, so a
/// retried call is always sent with the same offset as the first attempt.
pub struct ChunkedUploader<'a, S> {
    storage: &'a S,
    retry: RetryPolicy,
    session_id: Option<String>,
    offset: u64,
    chunks: u32,
}

impl<'a, S: RemoteStorage> ChunkedUploader<'a, S> {
    pub fn new(storage: &'a S, retry: RetryPolicy) -> Self {
        Self {
            storage,
            retry,
            session_id: None,
            offset: 0,
            chunks: 0,
        }
    }

    /// Bytes acknowledged by the server so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Chunks sent through start or append.
    pub fn chunks(&self) -> u32 {
        self.chunks
    }

    /// Send one chunk, opening the session on the first one.
    pub async fn upload_chunk(&mut self, bytes: &[u8]) -> Result<(), StorageError> {
        if self.session_id.is_none() {
            self.start_session(bytes).await?;
        } else {
            self.append_session(bytes).await?;
        }
        Ok(())
    }

    /// Open the session with its first chunk.
    pub async fn start_session(&mut self, bytes: &[u8]) -> Result<&str, StorageError> {
        debug_assert!(self.session_id.is_none(), "session already started");
        let storage = self.storage;
        let session_id = self
            .retry
            .retry("upload_session/start", || storage.upload_session_start(bytes))
            .await?;
        info!("Upload session {session_id} started with {} bytes", bytes.len());
        self.acknowledge(bytes.len());
        Ok(self.session_id.insert(session_id).as_str())
    }

    /// Append a chunk at the current offset.
    pub async fn append_session(&mut self, bytes: &[u8]) -> Result<(), StorageError> {
        let cursor = self.cursor().ok_or(StorageError::NoSession)?;
        let storage = self.storage;
        self.retry
            .retry("upload_session/append", || {
                storage.upload_session_append(&cursor, false, bytes)
            })
            .await?;
        self.acknowledge(bytes.len());
        Ok(())
    }

    /// Commit the file with the last bytes.  Without a session nothing was
    /// ever uploaded and no file is created.
    pub async fn finish_session(
        self,
        path: &str,
        bytes: &[u8],
        modified: DateTime<Utc>,
    ) -> Result<Option<FileMetadata>, StorageError> {
        let Some(cursor) = self.cursor() else {
            return Ok(None);
        };
        let commit = CommitInfo::overwrite(path, modified);
        let storage = self.storage;
        let file = self
            .retry
            .retry("upload_session/finish", || {
                storage.upload_session_finish(&cursor, &commit, bytes)
            })
            .await?;
        info!(
            "Committed {} ({} bytes in {} chunks + {} trailing bytes)",
            path,
            cursor.offset,
            self.chunks,
            bytes.len()
        );
        Ok(Some(file))
    }

    fn cursor(&self) -> Option<UploadSessionCursor> {
        self.session_id.as_ref().map(|id| UploadSessionCursor {
            session_id: id.clone(),
            offset: self.offset,
        })
    }

    fn acknowledge(&mut self, len: usize) {
        self.offset += len as u64;
        self.chunks += 1;
    }
}

// ─── tests ───────────────────────────────────────────────────────────────
