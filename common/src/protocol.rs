//! Wire types of the remote storage HTTP API (Dropbox v2 `files/*`).
//!
//! Only the fields the recorder reads or writes are modelled; everything
//! else in the responses is ignored by serde.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── folders & listing ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct CreateFolderArg {
    pub path: String,
    pub autorename: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListFolderArg {
    pub path: String,
    pub recursive: bool,
    pub limit: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListFolderContinueArg {
    pub cursor: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListFolderResult {
    pub entries: Vec<Metadata>,
    pub cursor: String,
    pub has_more: bool,
}

/// One listing entry.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = ".tag", rename_all = "snake_case")]
pub enum Metadata {
    File(FileMetadata),
    Folder(FolderMetadata),
    Deleted(DeletedMetadata),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub name: String,
    #[serde(default)]
    pub path_lower: Option<String>,
    #[serde(default)]
    pub path_display: Option<String>,
    /// Last time the file was modified on the server.
    pub server_modified: DateTime<Utc>,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FolderMetadata {
    pub name: String,
    #[serde(default)]
    pub path_lower: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeletedMetadata {
    pub name: String,
    #[serde(default)]
    pub path_lower: Option<String>,
}

// ── batch delete ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct DeleteArg {
    pub path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteBatchArg {
    pub entries: Vec<DeleteArg>,
}

/// Response of `delete_batch`: either done already or an async job to poll.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = ".tag", rename_all = "snake_case")]
pub enum DeleteBatchLaunch {
    Complete,
    AsyncJobId { async_job_id: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Serialize)]
pub struct PollArg {
    pub async_job_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = ".tag", rename_all = "snake_case")]
pub enum DeleteBatchJobStatus {
    InProgress,
    Complete,
    Failed,
    #[serde(other)]
    Other,
}

impl DeleteBatchJobStatus {
    pub fn is_in_progress(&self) -> bool {
        matches!(self, Self::InProgress)
    }
}

// ── upload sessions ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct UploadSessionStartArg {
    pub close: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadSessionStartResult {
    pub session_id: String,
}

/// Position inside an upload session.  `offset` is the number of bytes the
/// server has already acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadSessionCursor {
    pub session_id: String,
    pub offset: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadSessionAppendArg {
    pub cursor: UploadSessionCursor,
    pub close: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    Add,
    Overwrite,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommitInfo {
    pub path: String,
    pub mode: WriteMode,
    pub autorename: bool,
    /// Formatted as `%Y-%m-%dT%H:%M:%SZ`; the API rejects fractional seconds.
    pub client_modified: String,
    pub mute: bool,
}

impl CommitInfo {
    /// Commit that replaces whatever is stored at `path`.
    pub fn overwrite(path: impl Into<String>, modified: DateTime<Utc>) -> Self {
        Self {
            path: path.into(),
            mode: WriteMode::Overwrite,
            autorename: false,
            client_modified: modified.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            mute: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadSessionFinishArg {
    pub cursor: UploadSessionCursor,
    pub commit: CommitInfo,
}

// ── errors ───────────────────────────────────────────────────────────────

/// Body of a 409 response.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    pub error_summary: String,
}

// ─── tests ───────────────────────────────────────────────────────────────
