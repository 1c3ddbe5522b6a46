//! In-memory stand-ins for the remote store and the capture process.

use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use streamvault_common::protocol::{
    CommitInfo, DeleteBatchJobStatus, DeleteBatchLaunch, FileMetadata, ListFolderResult, Metadata,
    UploadSessionCursor,
};

use crate::capture::{Capture, CaptureError, CaptureLauncher};
use crate::ingest::IngestBuffer;
use crate::storage::{RemoteStorage, StorageError};

/// Listing entry for a file in `dir` (which ends with `/`).
pub fn file_entry(dir: &str, name: &str, modified: DateTime<Utc>) -> Metadata {
    Metadata::File(FileMetadata {
        name: name.to_string(),
        path_lower: Some(format!("{dir}{name}").to_lowercase()),
        path_display: Some(format!("{dir}{name}")),
        server_modified: modified,
        size: 1024,
    })
}

/// Fresh, empty directory under the system temp dir.
pub fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("streamvault_{}_{name}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

// ── storage ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageCall {
    CreateFolder { path: String },
    List { path: String },
    ListContinue { cursor: String },
    DeleteBatch { paths: Vec<String> },
    DeleteCheck { job_id: String },
    Start { len: usize },
    Append { offset: u64, len: usize },
    Finish { offset: u64, len: usize, path: String },
}

impl StorageCall {
    fn is_upload(&self) -> bool {
        matches!(self, Self::Start { .. } | Self::Append { .. } | Self::Finish { .. })
    }
}

#[derive(Default)]
struct StorageState {
    attempts: Vec<StorageCall>,
    succeeded: Vec<StorageCall>,
    violations: Vec<String>,
    sessions: u32,
    /// Bytes of the open session, if any.
    session: Option<(String, Vec<u8>)>,
    committed: Vec<(String, Vec<u8>)>,
    listing: Vec<Vec<Metadata>>,
    listing_fails: bool,
    append_failures: u32,
    job_polls: Option<u32>,
    deleted: Vec<Vec<String>>,
}

/// Remote store that keeps everything in memory and checks the upload
/// session protocol on every call.
#[derive(Default)]
pub struct FakeStorage {
    state: Mutex<StorageState>,
}

fn injected(endpoint: &'static str) -> StorageError {
    StorageError::Api {
        endpoint,
        status: 503,
        summary: "injected".into(),
    }
}

impl FakeStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pages returned by `list_folder` and `list_folder_continue`.
    pub fn set_listing(&self, pages: Vec<Vec<Metadata>>) {
        self.lock().listing = pages;
    }

    pub fn fail_listing(&self) {
        self.lock().listing_fails = true;
    }

    /// Make `delete_batch` answer with a job that stays in progress for
    /// `polls` status checks.
    pub fn set_delete_job(&self, polls: u32) {
        self.lock().job_polls = Some(polls);
    }

    pub fn fail_next_appends(&self, n: u32) {
        self.lock().append_failures = n;
    }

    /// Every call, including the failed ones.
    pub fn attempts(&self) -> Vec<StorageCall> {
        self.lock().attempts.clone()
    }

    /// Successful upload session calls, in order.
    pub fn upload_calls(&self) -> Vec<StorageCall> {
        self.lock()
            .succeeded
            .iter()
            .filter(|c| c.is_upload())
            .cloned()
            .collect()
    }

    pub fn violations(&self) -> Vec<String> {
        self.lock().violations.clone()
    }

    /// Committed files with their full content.
    pub fn committed(&self) -> Vec<(String, Vec<u8>)> {
        self.lock().committed.clone()
    }

    pub fn deleted(&self) -> Vec<Vec<String>> {
        self.lock().deleted.clone()
    }

    fn lock(&self) -> MutexGuard<'_, StorageState> {
        self.state.lock().unwrap()
    }

    fn page(state: &StorageState, index: usize) -> ListFolderResult {
        ListFolderResult {
            entries: state.listing.get(index).cloned().unwrap_or_default(),
            cursor: format!("cursor-{}", index + 1),
            has_more: index + 1 < state.listing.len(),
        }
    }
}

impl StorageState {
    /// Check `cursor` against the open session; records a violation when
    /// the offset is not the number of bytes stored so far.
    fn check_cursor(&mut self, cursor: &UploadSessionCursor) -> Result<(), StorageError> {
        let stored = match &self.session {
            Some((id, bytes)) if *id == cursor.session_id => bytes.len() as u64,
            _ => {
                self.violations
                    .push(format!("unknown session {}", cursor.session_id));
                return Err(injected("upload_session"));
            }
        };
        if stored != cursor.offset {
            self.violations
                .push(format!("offset {} but {stored} bytes stored", cursor.offset));
            return Err(StorageError::Api {
                endpoint: "upload_session",
                status: 409,
                summary: "incorrect_offset".into(),
            });
        }
        Ok(())
    }
}

impl RemoteStorage for FakeStorage {
    async fn create_folder(&self, path: &str) -> Result<(), StorageError> {
        let mut state = self.lock();
        let call = StorageCall::CreateFolder { path: path.into() };
        state.attempts.push(call.clone());
        state.succeeded.push(call);
        Err(StorageError::Api {
            endpoint: "files/create_folder_v2",
            status: 409,
            summary: "path/conflict/folder/".into(),
        })
    }

    async fn list_folder(&self, path: &str, _limit: u32) -> Result<ListFolderResult, StorageError> {
        let mut state = self.lock();
        let call = StorageCall::List { path: path.into() };
        state.attempts.push(call.clone());
        if state.listing_fails {
            return Err(injected("files/list_folder"));
        }
        state.succeeded.push(call);
        Ok(Self::page(&state, 0))
    }

    async fn list_folder_continue(&self, cursor: &str) -> Result<ListFolderResult, StorageError> {
        let mut state = self.lock();
        let call = StorageCall::ListContinue {
            cursor: cursor.into(),
        };
        state.attempts.push(call.clone());
        state.succeeded.push(call);
        let index = cursor
            .strip_prefix("cursor-")
            .and_then(|n| n.parse().ok())
            .unwrap_or(usize::MAX);
        Ok(Self::page(&state, index))
    }

    async fn delete_batch(&self, paths: &[String]) -> Result<DeleteBatchLaunch, StorageError> {
        let mut state = self.lock();
        let call = StorageCall::DeleteBatch {
            paths: paths.to_vec(),
        };
        state.attempts.push(call.clone());
        state.succeeded.push(call);
        state.deleted.push(paths.to_vec());
        Ok(match state.job_polls {
            Some(_) => DeleteBatchLaunch::AsyncJobId {
                async_job_id: "job-1".into(),
            },
            None => DeleteBatchLaunch::Complete,
        })
    }

    async fn delete_batch_check(&self, job_id: &str) -> Result<DeleteBatchJobStatus, StorageError> {
        let mut state = self.lock();
        let call = StorageCall::DeleteCheck {
            job_id: job_id.into(),
        };
        state.attempts.push(call.clone());
        state.succeeded.push(call);
        match state.job_polls.as_mut() {
            Some(n) if *n > 0 => {
                *n -= 1;
                Ok(DeleteBatchJobStatus::InProgress)
            }
            _ => Ok(DeleteBatchJobStatus::Complete),
        }
    }

    async fn upload_session_start(&self, body: &[u8]) -> Result<String, StorageError> {
        let mut state = self.lock();
        let call = StorageCall::Start { len: body.len() };
        state.attempts.push(call.clone());
        if state.session.is_some() {
            state.violations.push("session started twice".into());
        }
        state.sessions += 1;
        let id = format!("session-{}", state.sessions);
        state.session = Some((id.clone(), body.to_vec()));
        state.succeeded.push(call);
        Ok(id)
    }

    async fn upload_session_append(
        &self,
        cursor: &UploadSessionCursor,
        _close: bool,
        body: &[u8],
    ) -> Result<(), StorageError> {
        let mut state = self.lock();
        let call = StorageCall::Append {
            offset: cursor.offset,
            len: body.len(),
        };
        state.attempts.push(call.clone());
        if state.append_failures > 0 {
            state.append_failures -= 1;
            return Err(injected("files/upload_session/append_v2"));
        }
        state.check_cursor(cursor)?;
        if let Some((_, bytes)) = state.session.as_mut() {
            bytes.extend_from_slice(body);
        }
        state.succeeded.push(call);
        Ok(())
    }

    async fn upload_session_finish(
        &self,
        cursor: &UploadSessionCursor,
        commit: &CommitInfo,
        body: &[u8],
    ) -> Result<FileMetadata, StorageError> {
        let mut state = self.lock();
        let call = StorageCall::Finish {
            offset: cursor.offset,
            len: body.len(),
            path: commit.path.clone(),
        };
        state.attempts.push(call.clone());
        state.check_cursor(cursor)?;
        let Some((_, mut bytes)) = state.session.take() else {
            return Err(StorageError::NoSession);
        };
        bytes.extend_from_slice(body);
        let size = bytes.len() as u64;
        state.committed.push((commit.path.clone(), bytes));
        state.succeeded.push(call);

        let name = commit.path.rsplit('/').next().unwrap_or_default().to_string();
        Ok(FileMetadata {
            name,
            path_lower: Some(commit.path.to_lowercase()),
            path_display: Some(commit.path.clone()),
            server_modified: Utc::now(),
            size,
        })
    }
}

// ── capture ──────────────────────────────────────────────────────────────

/// When a scripted capture process exits.
#[derive(Debug, Clone, Copy)]
pub enum ExitMode {
    /// Exits this long after the quit character arrives.
    OnSignal(Duration),
    /// Exits on its own this long after launch.
    At(Duration),
    /// Ignores the quit character; only a kill ends it.
    IgnoreSignal,
}

/// Output schedule of one fake capture: bytes written at offsets from launch.
#[derive(Debug, Clone)]
pub struct CaptureScript {
    pub output: Vec<(Duration, Vec<u8>)>,
    pub exit: ExitMode,
}

/// Control events seen by a fake capture, shared with the test.
#[derive(Debug, Default, Clone)]
pub struct Timeline {
    pub launched_at: Option<Instant>,
    pub signalled_at: Option<Instant>,
    pub killed_at: Option<Instant>,
    pub exited_at: Option<Instant>,
}

pub type SharedTimeline = Arc<Mutex<Timeline>>;

pub struct FakeCapture {
    payload: Arc<IngestBuffer>,
    diagnostics: Arc<IngestBuffer>,
    feeder: JoinHandle<()>,
    exited: CancellationToken,
    exit: ExitMode,
    timeline: SharedTimeline,
}

impl FakeCapture {
    pub fn start(script: CaptureScript, timeline: SharedTimeline) -> Self {
        let launched_at = Instant::now();
        timeline.lock().unwrap().launched_at = Some(launched_at);

        let payload = Arc::new(IngestBuffer::new());
        let diagnostics = Arc::new(IngestBuffer::new());
        let exited = CancellationToken::new();

        if let ExitMode::At(after) = script.exit {
            exit_later(exited.clone(), timeline.clone(), after);
        }

        let feeder = {
            let payload = payload.clone();
            let diagnostics = diagnostics.clone();
            let exited = exited.clone();
            tokio::spawn(async move {
                for (at, bytes) in script.output {
                    tokio::select! {
                        _ = exited.cancelled() => return,
                        _ = tokio::time::sleep_until(launched_at + at) => {}
                    }
                    payload.append(&bytes);
                    diagnostics.append(format!("wrote {} bytes\n", bytes.len()).as_bytes());
                }
            })
        };

        Self {
            payload,
            diagnostics,
            feeder,
            exited,
            exit: script.exit,
            timeline,
        }
    }
}

fn exit_later(exited: CancellationToken, timeline: SharedTimeline, after: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        mark_exited(&exited, &timeline);
    });
}

fn mark_exited(exited: &CancellationToken, timeline: &SharedTimeline) {
    if !exited.is_cancelled() {
        timeline.lock().unwrap().exited_at = Some(Instant::now());
        exited.cancel();
    }
}

impl Capture for FakeCapture {
    fn payload(&self) -> &IngestBuffer {
        &self.payload
    }

    fn diagnostics(&self) -> &IngestBuffer {
        &self.diagnostics
    }

    fn has_exited(&mut self) -> bool {
        self.exited.is_cancelled() && self.feeder.is_finished()
    }

    async fn wait_for_exit(&mut self) {
        self.exited.cancelled().await;
    }

    async fn signal_graceful_stop(&mut self) -> io::Result<()> {
        if self.exited.is_cancelled() {
            return Ok(());
        }
        self.timeline.lock().unwrap().signalled_at = Some(Instant::now());
        if let ExitMode::OnSignal(delay) = self.exit {
            exit_later(self.exited.clone(), self.timeline.clone(), delay);
        }
        Ok(())
    }

    async fn kill(&mut self) {
        if !self.exited.is_cancelled() {
            self.timeline.lock().unwrap().killed_at = Some(Instant::now());
        }
        mark_exited(&self.exited, &self.timeline);
    }

    fn stop_readers(&self) {
        self.feeder.abort();
    }
}

/// Hands out scripted captures in order; launches fail once the scripts
/// run out.
#[derive(Default)]
pub struct FakeLauncher {
    scripts: Mutex<VecDeque<CaptureScript>>,
    timelines: Mutex<Vec<SharedTimeline>>,
    launches: Mutex<u32>,
}

impl FakeLauncher {
    pub fn new(scripts: Vec<CaptureScript>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            ..Self::default()
        }
    }

    /// A launcher whose every launch fails.
    pub fn failing() -> Self {
        Self::default()
    }

    pub fn launches(&self) -> u32 {
        *self.launches.lock().unwrap()
    }

    pub fn timeline(&self, index: usize) -> Timeline {
        self.timelines.lock().unwrap()[index].lock().unwrap().clone()
    }
}

impl CaptureLauncher for FakeLauncher {
    type Capture = FakeCapture;

    fn launch(&self) -> Result<FakeCapture, CaptureError> {
        *self.launches.lock().unwrap() += 1;
        let script = self.scripts.lock().unwrap().pop_front();
        let Some(script) = script else {
            return Err(CaptureError::Spawn {
                exe: "fake-ffmpeg".into(),
                source: io::Error::new(io::ErrorKind::NotFound, "no script left"),
            });
        };
        let timeline = SharedTimeline::default();
        self.timelines.lock().unwrap().push(timeline.clone());
        Ok(FakeCapture::start(script, timeline))
    }
}
