//! Video capture – runs the external capture tool (ffmpeg) as a child
//! process and pumps its output into ingest buffers.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use streamvault_common::config::Config;

use crate::ingest::{self, IngestBuffer};

/// What a segment needs from a running capture.
pub trait Capture: Send {
    /// Container bytes produced by the capture.
    fn payload(&self) -> &IngestBuffer;

    /// Diagnostic output, kept only for logging.
    fn diagnostics(&self) -> &IngestBuffer;

    /// True once the process is gone and its payload is fully ingested.
    fn has_exited(&mut self) -> bool;

    /// Resolves when the process exits.
    fn wait_for_exit(&mut self) -> impl Future<Output = ()> + Send;

    /// Ask the capture to finish its output and stop.
    fn signal_graceful_stop(&mut self) -> impl Future<Output = io::Result<()>> + Send;

    /// Terminate the process; failures are swallowed.
    fn kill(&mut self) -> impl Future<Output = ()> + Send;

    /// Stop ingesting new output.
    fn stop_readers(&self);
}

/// Starts a fresh capture for each segment.
pub trait CaptureLauncher: Send + Sync + 'static {
    type Capture: Capture + 'static;

    fn launch(&self) -> Result<Self::Capture, CaptureError>;
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("cannot spawn {exe}: {source}")]
    Spawn {
        exe: String,
        #[source]
        source: io::Error,
    },
    #[error("capture process has no {0} pipe")]
    MissingPipe(&'static str),
}

// ── ffmpeg ───────────────────────────────────────────────────────────────

/// Arguments for a remux of `url` to matroska on stdout, without re-encoding.
pub fn capture_args(url: &str) -> Vec<String> {
    [
        "-rtsp_transport",
        "tcp",
        "-i",
        url,
        "-f",
        "matroska",
        "-c:v",
        "copy",
        "-c:a",
        "copy",
        "-",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Launches the configured capture executable against the stream URL.
#[derive(Debug, Clone)]
pub struct FfmpegLauncher {
    exe: PathBuf,
    args: Vec<String>,
    read_buffer_size: usize,
}

impl FfmpegLauncher {
    pub fn new(config: &Config) -> Self {
        Self {
            exe: config.capture_exe.clone(),
            args: capture_args(&config.stream_url),
            read_buffer_size: config.read_buffer_size,
        }
    }
}

impl CaptureLauncher for FfmpegLauncher {
    type Capture = CaptureProcess;

    fn launch(&self) -> Result<CaptureProcess, CaptureError> {
        CaptureProcess::spawn(&self.exe, &self.args, self.read_buffer_size)
    }
}

/// Handle that owns one capture child process and its two readers.
pub struct CaptureProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    payload: Arc<IngestBuffer>,
    diagnostics: Arc<IngestBuffer>,
    payload_reader: JoinHandle<()>,
    stop_reading: CancellationToken,
    started_at: Instant,
    exit_status: Option<ExitStatus>,
}

impl CaptureProcess {
    pub fn spawn(
        exe: &Path,
        args: &[String],
        read_buffer_size: usize,
    ) -> Result<Self, CaptureError> {
        let mut cmd = Command::new(exe);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| CaptureError::Spawn {
            exe: exe.display().to_string(),
            source,
        })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take().ok_or(CaptureError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(CaptureError::MissingPipe("stderr"))?;

        let stop_reading = CancellationToken::new();
        let payload = Arc::new(IngestBuffer::new());
        let diagnostics = Arc::new(IngestBuffer::new());

        let payload_reader = spawn_reader(
            "stdout",
            stdout,
            payload.clone(),
            read_buffer_size,
            stop_reading.clone(),
        );
        // Draining stderr keeps the pipe from filling up and blocking ffmpeg.
        spawn_reader(
            "stderr",
            stderr,
            diagnostics.clone(),
            read_buffer_size,
            stop_reading.clone(),
        );

        info!(
            "Capture started (pid={}): {} {}",
            child.id().unwrap_or_default(),
            exe.display(),
            args.join(" ")
        );

        Ok(Self {
            child,
            stdin,
            payload,
            diagnostics,
            payload_reader,
            stop_reading,
            started_at: Instant::now(),
            exit_status: None,
        })
    }

    /// Check the child without blocking; records and logs the exit once.
    fn poll_exit(&mut self) -> bool {
        if self.exit_status.is_some() {
            return true;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.on_exit(status);
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!("Cannot check capture status: {e}");
                false
            }
        }
    }

    fn on_exit(&mut self, status: ExitStatus) {
        info!(
            "Capture exited with {status} after {:.1}s",
            self.started_at.elapsed().as_secs_f64()
        );
        self.exit_status = Some(status);
        self.stdin = None;
        self.stop_reading.cancel();
    }
}

impl Capture for CaptureProcess {
    fn payload(&self) -> &IngestBuffer {
        &self.payload
    }

    fn diagnostics(&self) -> &IngestBuffer {
        &self.diagnostics
    }

    fn has_exited(&mut self) -> bool {
        self.poll_exit() && self.payload_reader.is_finished()
    }

    async fn wait_for_exit(&mut self) {
        if self.exit_status.is_some() {
            return;
        }
        // stdin lives outside `child`, so waiting does not close it.
        match self.child.wait().await {
            Ok(status) => self.on_exit(status),
            Err(e) => warn!("Cannot wait for capture: {e}"),
        }
    }

    async fn signal_graceful_stop(&mut self) -> io::Result<()> {
        if self.poll_exit() {
            return Ok(());
        }
        if let Some(stdin) = self.stdin.as_mut() {
            stdin.write_all(b"q").await?;
            stdin.flush().await?;
        }
        Ok(())
    }

    async fn kill(&mut self) {
        self.stop_reading.cancel();
        if self.poll_exit() {
            return;
        }
        if let Err(e) = self.child.kill().await {
            debug!("Killing capture failed: {e}");
        }
        self.poll_exit();
    }

    fn stop_readers(&self) {
        self.stop_reading.cancel();
    }
}

impl Drop for CaptureProcess {
    fn drop(&mut self) {
        self.stop_reading.cancel();
    }
}

fn spawn_reader<R>(
    name: &'static str,
    source: R,
    buffer: Arc<IngestBuffer>,
    read_buffer_size: usize,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        match ingest::pump(source, &buffer, read_buffer_size, cancel).await {
            Ok(total) => debug!("Capture {name} reader stopped after {total} bytes"),
            Err(e) => warn!("Capture {name} reader failed: {e}"),
        }
    })
}

/// Time left of the startup window, never less than 1 ms.
pub fn startup_wait(window: Duration, elapsed: Duration) -> Duration {
    window.saturating_sub(elapsed).max(Duration::from_millis(1))
}

/// Last non-empty line of a diagnostics chunk.
pub fn last_line(bytes: &[u8]) -> Option<String> {
    String::from_utf8_lossy(bytes)
        .split(['\r', '\n'])
        .map(str::trim)
        .rev()
        .find(|l| !l.is_empty())
        .map(str::to_string)
}

// ─── tests ───────────────────────────────────────────────────────────────
