//! Remote storage interface.
//!
//! The segment pipeline and the janitor only talk to this trait; the
//! HTTP implementation lives in [`crate::dropbox`].

use std::future::Future;

use streamvault_common::protocol::{
    CommitInfo, DeleteBatchJobStatus, DeleteBatchLaunch, FileMetadata, ListFolderResult,
    UploadSessionCursor,
};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("HTTP request to {endpoint} failed: {source}")]
    Http {
        endpoint: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{endpoint} returned {status}: {summary}")]
    Api {
        endpoint: &'static str,
        status: u16,
        summary: String,
    },
    #[error("cannot encode request for {endpoint}: {source}")]
    Encode {
        endpoint: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("append issued before the upload session was started")]
    NoSession,
}

impl StorageError {
    /// The target of a folder creation already exists.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Api { status: 409, summary, .. } if summary.starts_with("path/conflict"))
    }
}

/// Operations the recorder needs from the remote object store.
pub trait RemoteStorage: Send + Sync + 'static {
    fn create_folder(&self, path: &str) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// First page of a (recursive) folder listing.
    fn list_folder(
        &self,
        path: &str,
        limit: u32,
    ) -> impl Future<Output = Result<ListFolderResult, StorageError>> + Send;

    fn list_folder_continue(
        &self,
        cursor: &str,
    ) -> impl Future<Output = Result<ListFolderResult, StorageError>> + Send;

    fn delete_batch(
        &self,
        paths: &[String],
    ) -> impl Future<Output = Result<DeleteBatchLaunch, StorageError>> + Send;

    fn delete_batch_check(
        &self,
        job_id: &str,
    ) -> impl Future<Output = Result<DeleteBatchJobStatus, StorageError>> + Send;

    /// Open an upload session with its first chunk; returns the session id.
    fn upload_session_start(
        &self,
        body: &[u8],
    ) -> impl Future<Output = Result<String, StorageError>> + Send;

    fn upload_session_append(
        &self,
        cursor: &UploadSessionCursor,
        close: bool,
        body: &[u8],
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Upload the last chunk and commit the file.
    fn upload_session_finish(
        &self,
        cursor: &UploadSessionCursor,
        commit: &CommitInfo,
        body: &[u8],
    ) -> impl Future<Output = Result<FileMetadata, StorageError>> + Send;
}
