//! Supervisor – keeps segments running back to back, forever.
//!
//! Each segment runs as its own task.  The supervisor waits for its
//! hand-off and starts the successor at once, so recording has no gap.  A
//! segment that ends without handing off either finished on its own (the
//! next one starts immediately) or failed (the next one starts after the
//! failure cooldown).

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

use streamvault_common::config::Config;

use crate::capture::CaptureLauncher;
use crate::janitor::CleanupState;
use crate::retry::RetryPolicy;
use crate::segment::{Segment, SegmentReport};
use crate::storage::RemoteStorage;

pub struct Supervisor<S, L> {
    config: Arc<Config>,
    storage: Arc<S>,
    launcher: Arc<L>,
    retry: RetryPolicy,
}

impl<S: RemoteStorage, L: CaptureLauncher> Supervisor<S, L> {
    pub fn new(config: Config, storage: S, launcher: L) -> Self {
        Self {
            config: Arc::new(config),
            storage: Arc::new(storage),
            launcher: Arc::new(launcher),
            retry: RetryPolicy::default(),
        }
    }

    /// Run segments until the process is stopped.
    pub async fn run(&self) {
        let mut cleanup = CleanupState::default();
        loop {
            let (tx, rx) = oneshot::channel();
            let segment = Segment::new(
                self.config.clone(),
                self.storage.clone(),
                self.launcher.clone(),
                self.retry,
                cleanup,
                tx,
            );
            let name = segment.file_name().to_string();
            let task = tokio::spawn(segment.run());

            match rx.await {
                Ok(state) => {
                    // the old segment keeps finalizing in the background
                    cleanup = state;
                    tokio::spawn(watch(name, task));
                }
                Err(_) => match task.await {
                    Ok(report) => {
                        cleanup = report.cleanup;
                        if !log_report(report) {
                            info!("Restarting in {:?}", self.config.failure_cooldown);
                            tokio::time::sleep(self.config.failure_cooldown).await;
                        }
                    }
                    Err(e) => {
                        error!("Segment {name} aborted: {e}");
                        tokio::time::sleep(self.config.failure_cooldown).await;
                    }
                },
            }
        }
    }
}

/// Log the outcome of a segment that already handed off.
async fn watch(name: String, task: JoinHandle<SegmentReport>) {
    match task.await {
        Ok(report) => {
            log_report(report);
        }
        Err(e) => error!("Segment {name} aborted: {e}"),
    }
}

/// Returns whether the segment succeeded.
fn log_report(report: SegmentReport) -> bool {
    match report.outcome {
        Ok(summary) => {
            info!(
                "Segment {} done: {} bytes captured, {}",
                report.file_name,
                summary.captured,
                match &summary.committed {
                    Some(file) => format!("{} bytes committed", file.size),
                    None => "nothing committed".to_string(),
                }
            );
            true
        }
        Err(e) => {
            error!("Segment {} failed: {e:#}", report.file_name);
            false
        }
    }
}

// ─── tests ───────────────────────────────────────────────────────────────
