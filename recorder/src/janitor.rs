//! Remote janitor – deletes archives that outlived the retention window.
//!
//! A pass runs at most once per retention window.  Every failure is logged
//! and ends the pass; it never reaches the recording.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use streamvault_common::config::CleanupPolicy;
use streamvault_common::protocol::{DeleteBatchLaunch, Metadata};

use crate::retry::RetryPolicy;
use crate::storage::{RemoteStorage, StorageError};

/// When the last successful cleanup happened.  Passed between segments by
/// value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupState {
    pub last_cleanup: Option<DateTime<Utc>>,
}

impl CleanupState {
    pub fn is_due(&self, now: DateTime<Utc>, retention: Duration) -> bool {
        match self.last_cleanup {
            None => true,
            Some(last) => (now - last).to_std().map_or(false, |age| age > retention),
        }
    }
}

pub struct RemoteJanitor<'a, S> {
    storage: &'a S,
    retry: RetryPolicy,
    policy: &'a CleanupPolicy,
    /// Directory to clean, without trailing `/`.
    folder: &'a str,
    /// `folder` with its trailing `/`, stripped from listed paths.
    prefix: String,
    extension: &'a str,
}

impl<'a, S: RemoteStorage> RemoteJanitor<'a, S> {
    pub fn new(
        storage: &'a S,
        retry: RetryPolicy,
        policy: &'a CleanupPolicy,
        folder: &'a str,
        extension: &'a str,
    ) -> Self {
        Self {
            storage,
            retry,
            policy,
            folder,
            prefix: format!("{folder}/"),
            extension,
        }
    }

    /// Run a pass if the last one is older than the retention window and
    /// return the updated state.
    pub async fn run_if_due(&self, state: CleanupState) -> CleanupState {
        let now = Utc::now();
        if !state.is_due(now, self.policy.retention) {
            return state;
        }

        info!("Cleaning up {}", self.folder);
        match self.sweep(now).await {
            Ok(deleted) => {
                info!("Cleanup finished, {} archive(s) deleted", deleted.len());
                CleanupState {
                    last_cleanup: Some(Utc::now()),
                }
            }
            Err(e) => {
                warn!("Ignoring cleanup error: {e:#}");
                state
            }
        }
    }

    /// Delete every expired archive; returns the deleted paths.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<Vec<String>, StorageError> {
        self.ensure_folder().await;

        let expired = self.collect_expired(now).await?;
        if expired.is_empty() {
            return Ok(expired);
        }

        info!("Deleting files:\n{}", expired.join("\n"));
        let storage = self.storage;
        let launch = self
            .retry
            .retry("delete_batch", || storage.delete_batch(&expired))
            .await?;

        if let DeleteBatchLaunch::AsyncJobId { async_job_id } = launch {
            self.wait_for_job(&async_job_id).await?;
        }
        Ok(expired)
    }

    async fn ensure_folder(&self) {
        let folder = self.folder;
        match self.storage.create_folder(folder).await {
            Ok(()) => info!("Created remote folder {folder}"),
            Err(e) if e.is_conflict() => {}
            Err(e) => warn!("Cannot create remote folder {folder}: {e}"),
        }
    }

    /// Walk all listing pages and pick the expired archives.
    async fn collect_expired(&self, now: DateTime<Utc>) -> Result<Vec<String>, StorageError> {
        let storage = self.storage;
        let folder = self.folder;
        let limit = self.policy.page_size;

        let mut marked = BTreeSet::new();
        let mut page = self
            .retry
            .retry("list_folder", || storage.list_folder(folder, limit))
            .await?;
        loop {
            marked.extend(expired_archives(
                &page.entries,
                &self.prefix,
                self.extension,
                self.policy.retention,
                now,
            ));
            if !page.has_more {
                break;
            }
            let cursor = page.cursor;
            page = self
                .retry
                .retry("list_folder/continue", || storage.list_folder_continue(&cursor))
                .await?;
        }
        Ok(marked.into_iter().collect())
    }

    async fn wait_for_job(&self, job_id: &str) -> Result<(), StorageError> {
        let storage = self.storage;
        loop {
            let status = self
                .retry
                .retry("delete_batch/check", || storage.delete_batch_check(job_id))
                .await?;
            if !status.is_in_progress() {
                info!("Delete job {job_id} finished: {status:?}");
                return Ok(());
            }
            tokio::time::sleep(self.policy.job_poll_interval).await;
        }
    }
}

/// Paths of the archives in `entries` that are at least `retention` old.
///
/// Only the part of the path below `prefix` (the folder with its trailing
/// `/`) is matched against the extension, so a dotted directory name cannot
/// make a file look like an archive.
pub fn expired_archives(
    entries: &[Metadata],
    prefix: &str,
    extension: &str,
    retention: Duration,
    now: DateTime<Utc>,
) -> Vec<String> {
    let prefix = prefix.to_lowercase();
    let extension = extension.to_lowercase();

    entries
        .iter()
        .filter_map(|entry| match entry {
            Metadata::File(file) => Some(file),
            _ => None,
        })
        .filter_map(|file| {
            let path = file
                .path_lower
                .clone()
                .unwrap_or_else(|| format!("{prefix}{}", file.name.to_lowercase()));
            let relative = path.strip_prefix(&prefix).unwrap_or(&path);
            if !relative.ends_with(&extension) {
                return None;
            }
            let age = (now - file.server_modified).to_std().ok()?;
            (age >= retention).then_some(path)
        })
        .collect()
}

// ─── tests ───────────────────────────────────────────────────────────────
