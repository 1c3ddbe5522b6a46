//! Segment pipeline – one capture process recorded into one encrypted
//! archive, uploaded chunk by chunk and mirrored to a local backup file.
//!
//! Phases: `Starting → Recording → GracefulExit → Finalizing → Done`, with
//! `Failed` reachable from any of them.  When a segment decides to wind
//! down it hands the cleanup state to the supervisor, which starts the next
//! segment right away; the two overlap until this one has finalized.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Local, Utc};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use streamvault_common::config::Config;
use streamvault_common::protocol::FileMetadata;

use crate::archive::{ArchiveOptions, EncryptedArchive};
use crate::bridge::StreamBridge;
use crate::capture::{last_line, startup_wait, Capture, CaptureError, CaptureLauncher};
use crate::janitor::{CleanupState, RemoteJanitor};
use crate::retry::RetryPolicy;
use crate::storage::{RemoteStorage, StorageError};
use crate::uploader::ChunkedUploader;

/// Room for zip headers on top of a full chunk.
const BRIDGE_SLACK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentPhase {
    Starting,
    Recording,
    GracefulExit,
    Finalizing,
    Done,
    Failed,
}

impl fmt::Display for SegmentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::Recording => "recording",
            Self::GracefulExit => "graceful-exit",
            Self::Finalizing => "finalizing",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SegmentError {
    #[error("capture terminated abnormally during startup")]
    AbnormalStart,
    #[error(transparent)]
    Launch(#[from] CaptureError),
    #[error("archive: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("backup file: {0}")]
    Io(#[from] io::Error),
    #[error("upload: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug)]
pub struct SegmentSummary {
    /// Bytes read from the capture.
    pub captured: u64,
    /// The remote file, absent when nothing was captured.
    pub committed: Option<FileMetadata>,
}

/// What a finished segment tells the supervisor.
#[derive(Debug)]
pub struct SegmentReport {
    pub file_name: String,
    pub cleanup: CleanupState,
    pub outcome: Result<SegmentSummary, SegmentError>,
}

pub struct Segment<S, L> {
    config: Arc<Config>,
    storage: Arc<S>,
    launcher: Arc<L>,
    retry: RetryPolicy,
    cleanup: CleanupState,
    handoff: Option<oneshot::Sender<CleanupState>>,
    phase: SegmentPhase,
    /// Archive name, e.g. `video20240615103000.zip`.
    file_name: String,
    backup_path: PathBuf,
    started: Instant,
    /// Set once the capture was asked to stop.
    signalled_at: Option<Instant>,
}

impl<S: RemoteStorage, L: CaptureLauncher> Segment<S, L> {
    pub fn new(
        config: Arc<Config>,
        storage: Arc<S>,
        launcher: Arc<L>,
        retry: RetryPolicy,
        cleanup: CleanupState,
        handoff: oneshot::Sender<CleanupState>,
    ) -> Self {
        let stem = format!("video{}", Local::now().format("%Y%m%d%H%M%S"));
        let file_name = format!("{stem}{}", config.archive_extension);
        let backup_path = config.backup_dir.join(format!("{stem}.mkv"));
        Self {
            config,
            storage,
            launcher,
            retry,
            cleanup,
            handoff: Some(handoff),
            phase: SegmentPhase::Starting,
            file_name,
            backup_path,
            started: Instant::now(),
            signalled_at: None,
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    #[cfg(test)]
    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    /// Record the segment to the end.  Never panics on I/O errors; they end
    /// up in the report.
    pub async fn run(mut self) -> SegmentReport {
        info!("Starting new recording {}", self.file_name);
        let outcome = match self.launcher.launch() {
            Ok(mut capture) => {
                let outcome = self.record(&mut capture).await;
                if outcome.is_err() {
                    if !capture.has_exited() {
                        capture.kill().await;
                    }
                    capture.stop_readers();
                }
                outcome
            }
            Err(e) => Err(e.into()),
        };

        match &outcome {
            Ok(_) => self.set_phase(SegmentPhase::Done),
            Err(_) => self.set_phase(SegmentPhase::Failed),
        }
        SegmentReport {
            file_name: self.file_name,
            cleanup: self.cleanup,
            outcome,
        }
    }

    async fn record(&mut self, capture: &mut L::Capture) -> Result<SegmentSummary, SegmentError> {
        let config = Arc::clone(&self.config);
        let storage = Arc::clone(&self.storage);
        let rotation = &config.rotation;

        // ── starting ─────────────────────────────────────────────────
        let janitor = RemoteJanitor::new(
            &*storage,
            self.retry,
            &config.cleanup,
            config.remote_folder(),
            &config.archive_extension,
        );
        self.cleanup = janitor.run_if_due(self.cleanup).await;

        let wait = startup_wait(rotation.startup_window, self.started.elapsed());
        if timeout(wait, capture.wait_for_exit()).await.is_ok() {
            return Err(SegmentError::AbnormalStart);
        }

        let reserved = config.reserved_path();
        let mut backup = open_backup(&reserved, &self.backup_path).await?;
        let bridge = StreamBridge::with_capacity(rotation.chunk_size + BRIDGE_SLACK);
        let mut archive =
            EncryptedArchive::create(bridge.clone(), &ArchiveOptions::new(config.password.as_str()))?;
        let mut uploader = ChunkedUploader::new(&*storage, self.retry);
        self.set_phase(SegmentPhase::Recording);

        // ── recording ────────────────────────────────────────────────
        let mut scratch = Vec::new();
        let mut diagnostics = Vec::new();
        let mut captured = 0u64;
        let mut waiting_from = Instant::now();

        while !capture.has_exited() || capture.payload().is_data_available() {
            let pause = if self.signalled_at.is_some() {
                rotation.signalled_interval
            } else {
                rotation.min_chunk_interval
            };
            sleep(pause).await;

            // wait for a full chunk, but not forever
            while capture.payload().len() < rotation.chunk_size
                && waiting_from.elapsed() < rotation.max_chunk_interval
                && !capture.has_exited()
                && self.signalled_at.is_none()
            {
                sleep(rotation.poll_interval).await;
                self.exit_check(capture).await;
            }

            loop {
                self.exit_check(capture).await;
                let read = capture.payload().drain(&mut scratch);
                if read == 0 {
                    break;
                }
                debug!("Processing {read} bytes of {}", self.backup_path.display());
                captured += read as u64;
                process_chunk(&scratch, &mut archive, &bridge, &mut backup, &mut uploader).await?;
                if capture.payload().len() < rotation.chunk_size {
                    break;
                }
            }

            waiting_from = Instant::now();
            log_diagnostics(capture, &mut diagnostics);
        }

        // ── finalizing ───────────────────────────────────────────────
        self.set_phase(SegmentPhase::Finalizing);
        archive.finish()?;
        let trailer = bridge.take();
        let path = format!("{}{}", config.remote_dir, self.file_name);
        debug!(
            "Finishing {path}: session {:?}, {} chunks, offset {}",
            uploader.session_id(),
            uploader.chunks(),
            uploader.offset()
        );
        let committed = uploader.finish_session(&path, &trailer, Utc::now()).await?;
        if committed.is_none() {
            info!("Nothing captured, no remote file for {}", self.file_name);
        }

        drop(backup);
        info!("Recording successfully finished, releasing {}", self.backup_path.display());
        release_backup(&reserved, &self.backup_path).await;

        Ok(SegmentSummary {
            captured,
            committed,
        })
    }

    /// Decide whether to ask the capture to stop, or to kill it.
    async fn exit_check(&mut self, capture: &mut L::Capture) {
        let rotation = &self.config.rotation;
        let (max_age, grace, handoff_delay) = (
            rotation.max_segment_duration,
            rotation.grace_period,
            rotation.handoff_delay,
        );

        match self.signalled_at {
            None => {
                let age = self.started.elapsed();
                if age > max_age || !capture.payload().is_data_available() {
                    info!("Signalling exit to capture after {:.1}s", age.as_secs_f64());
                    self.set_phase(SegmentPhase::GracefulExit);
                    self.hand_off();
                    sleep(handoff_delay).await;
                    if let Err(e) = capture.signal_graceful_stop().await {
                        warn!("Cannot signal capture: {e}");
                    }
                    self.signalled_at = Some(Instant::now());
                }
            }
            Some(at) if at.elapsed() >= grace && !capture.has_exited() => {
                warn!(
                    "Capture still running {:.1}s after the stop request, killing it",
                    at.elapsed().as_secs_f64()
                );
                capture.kill().await;
            }
            Some(_) => {}
        }
    }

    /// Let the supervisor start the next segment.  Happens at most once.
    fn hand_off(&mut self) {
        if let Some(tx) = self.handoff.take() {
            if tx.send(self.cleanup).is_err() {
                debug!("Nobody waits for the hand-off of {}", self.file_name);
            }
        }
    }

    fn set_phase(&mut self, phase: SegmentPhase) {
        if self.phase != phase {
            info!("Segment {}: {} -> {}", self.file_name, self.phase, phase);
            self.phase = phase;
        }
    }
}

/// Push one drained block through the archive, mirror it to the backup
/// file and upload whatever the archive produced.
async fn process_chunk<S: RemoteStorage>(
    data: &[u8],
    archive: &mut EncryptedArchive,
    bridge: &StreamBridge,
    backup: &mut File,
    uploader: &mut ChunkedUploader<'_, S>,
) -> Result<(), SegmentError> {
    archive.append(data)?;

    backup.write_all(data).await?;
    backup.flush().await?;
    backup.sync_data().await?;

    let chunk = bridge.take();
    if !chunk.is_empty() {
        uploader.upload_chunk(&chunk).await?;
    }
    bridge.rebind(chunk);
    Ok(())
}

fn log_diagnostics<C: Capture>(capture: &C, scratch: &mut Vec<u8>) {
    if capture.diagnostics().drain(scratch) > 0 {
        if let Some(line) = last_line(scratch) {
            debug!("capture: {line}");
        }
    }
}

// ── local backup ─────────────────────────────────────────────────────────

/// Open the backup file, overwriting the reserved placeholder when there is
/// one so earlier recordings do not linger on disk.
pub async fn open_backup(reserved: &Path, path: &Path) -> io::Result<File> {
    match reuse_reserved(reserved, path).await {
        Ok(file) => {
            info!("Overwriting reserved file as {}", path.display());
            Ok(file)
        }
        Err(e) => {
            debug!("Cannot reuse {}: {e}", reserved.display());
            info!("Creating backup file {}", path.display());
            File::create(path).await
        }
    }
}

async fn reuse_reserved(reserved: &Path, path: &Path) -> io::Result<File> {
    fs::rename(reserved, path).await?;
    let file = OpenOptions::new().read(true).write(true).open(path).await?;
    file.set_len(0).await?;
    Ok(file)
}

/// Turn a finished backup into the placeholder, or delete it when a
/// placeholder already exists.
pub async fn release_backup(reserved: &Path, path: &Path) {
    let reserved_exists = fs::try_exists(reserved).await.unwrap_or(true);
    if !reserved_exists {
        match fs::rename(path, reserved).await {
            Ok(()) => {
                info!("Marked {} for overwriting", path.display());
                return;
            }
            Err(e) => info!("Cannot mark {} for overwriting ({e}), deleting it", path.display()),
        }
    }
    if let Err(e) = fs::remove_file(path).await {
        warn!("Cannot delete backup {}: {e}", path.display());
    }
}

// ─── tests ───────────────────────────────────────────────────────────────
