//! streamvault recorder – records a live stream into encrypted archives
//! and uploads them to Dropbox while they are being written.
//!
//! This binary:
//! 1. Reads the six positional arguments (plus an optional tuning file
//!    named by `STREAMVAULT_CONF`)
//! 2. Runs ffmpeg against the stream, one process per segment
//! 3. Streams every segment into an AES-encrypted zip, uploaded in chunks
//!    and mirrored to a local backup file
//! 4. Deletes remote archives older than the retention window

mod archive;
mod bridge;
mod capture;
mod dropbox;
mod ingest;
mod janitor;
mod retry;
mod segment;
mod storage;
mod supervisor;
mod uploader;

#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use tracing::{error, info};

use streamvault_common::config::Config;

use crate::capture::FfmpegLauncher;
use crate::dropbox::DropboxClient;
use crate::supervisor::Supervisor;

#[tokio::main]
async fn main() -> Result<()> {
    // fmt writes to stdout; errors included
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    if let Err(e) = run().await {
        error!("{e:#}");
        return Err(e);
    }
    Ok(())
}

async fn run() -> Result<()> {
    // ── load config ──────────────────────────────────────────────────
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut config = Config::from_args(&args)?;
    if let Some(path) = Config::tuning_path() {
        config.apply_tuning_file(&path)?;
    }

    info!(
        "streamvault recorder starting (stream={}, remote={}, backups={})",
        config.stream_url,
        config.remote_dir,
        config.backup_dir.display()
    );

    std::fs::create_dir_all(&config.backup_dir).with_context(|| {
        format!("Cannot create backup directory {}", config.backup_dir.display())
    })?;

    // ── ctrl-c ───────────────────────────────────────────────────────
    ctrlc::set_handler(move || {
        info!("Shutdown signal received");
        std::process::exit(0);
    })
    .context("Cannot set Ctrl-C handler")?;

    // ── record ───────────────────────────────────────────────────────
    let storage = DropboxClient::new(config.token.clone()).context("Cannot build HTTP client")?;
    let launcher = FfmpegLauncher::new(&config);
    Supervisor::new(config, storage, launcher).run().await;

    Ok(())
}
