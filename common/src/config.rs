//! Configuration – six positional arguments plus an optional `KEY=VALUE`
//! tuning file for the rotation and cleanup policies.
//!
//! The tuning file is a plain shell-style `KEY=VALUE` file:
//! `#` comments, optional double quotes, unknown keys ignored.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

/// Environment variable naming the optional tuning file.
pub const TUNING_ENV: &str = "STREAMVAULT_CONF";

/// Name of the placeholder file reused for local backups.
pub const RESERVED_FILE_NAME: &str = "reserved.tmp";

const MIB: usize = 1024 * 1024;

/// Positional arguments, in order.
const ARGUMENTS: [&str; 6] = [
    "token",
    "stream-url",
    "remote-dir",
    "password",
    "capture-exe",
    "backup-dir",
];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing argument #{position} <{name}>; usage: streamvault-recorder <token> <stream-url> <remote-dir> <password> <capture-exe> <backup-dir>")]
    MissingArgument { position: usize, name: &'static str },
}

/// When segments rotate and how often their buffers are drained.
#[derive(Debug, Clone, PartialEq)]
pub struct RotationPolicy {
    /// Segment age after which a graceful exit is requested.
    pub max_segment_duration: Duration,
    /// Minimum pause between two drain passes.
    pub min_chunk_interval: Duration,
    /// Longest wait for a full chunk before draining anyway.
    pub max_chunk_interval: Duration,
    /// Bytes that count as a full chunk.
    pub chunk_size: usize,
    /// Pause between drain passes once a graceful exit was signalled.
    pub signalled_interval: Duration,
    /// How long a signalled process may take before it is killed.
    pub grace_period: Duration,
    /// The capture must survive this long after the segment started.
    pub startup_window: Duration,
    /// Delay between starting the successor and signalling the capture.
    pub handoff_delay: Duration,
    /// Granularity of the wait-for-chunk loop.
    pub poll_interval: Duration,
}

impl RotationPolicy {
    /// Short segments, small chunks: minimal loss when the uplink drops.
    pub fn short_cycle() -> Self {
        Self {
            max_segment_duration: Duration::from_secs(60),
            min_chunk_interval: Duration::from_secs(5),
            max_chunk_interval: Duration::from_secs(30),
            chunk_size: 2 * MIB,
            signalled_interval: Duration::from_secs(1),
            grace_period: Duration::from_secs(5),
            startup_window: Duration::from_secs(10),
            handoff_delay: Duration::from_secs(1),
            poll_interval: Duration::from_millis(100),
        }
    }

    /// Drain on a fixed interval: fewer, larger requests.
    pub fn fixed_interval() -> Self {
        Self {
            max_segment_duration: Duration::from_secs(120),
            min_chunk_interval: Duration::from_secs(35),
            max_chunk_interval: Duration::from_secs(35),
            chunk_size: MIB,
            ..Self::short_cycle()
        }
    }
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self::short_cycle()
    }
}

/// Retention of remote archives.
#[derive(Debug, Clone, PartialEq)]
pub struct CleanupPolicy {
    /// Archives older than this are deleted; also the minimum pause between passes.
    pub retention: Duration,
    /// Entries requested per listing page.
    pub page_size: u32,
    /// Pause between two status checks of an asynchronous delete job.
    pub job_poll_interval: Duration,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(3600),
            page_size: 2000,
            job_poll_interval: Duration::from_secs(5),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    // ── remote storage ───────────────────────────────────────────────
    pub token: String,
    /// Remote directory, always ending with `/`.
    pub remote_dir: String,
    pub password: String,

    // ── capture ──────────────────────────────────────────────────────
    pub stream_url: String,
    pub capture_exe: PathBuf,
    /// Size of the read buffer used by each capture output reader.
    pub read_buffer_size: usize,

    // ── local fallback ───────────────────────────────────────────────
    pub backup_dir: PathBuf,

    // ── policies ─────────────────────────────────────────────────────
    pub rotation: RotationPolicy,
    pub cleanup: CleanupPolicy,
    pub failure_cooldown: Duration,
    /// Extension of the uploaded archives, including the dot.
    pub archive_extension: String,
}

impl Config {
    /// Build a config from the positional arguments (program name excluded).
    pub fn from_args(args: &[String]) -> Result<Self, ConfigError> {
        let arg = |position: usize| -> Result<String, ConfigError> {
            args.get(position)
                .cloned()
                .ok_or(ConfigError::MissingArgument {
                    position: position + 1,
                    name: ARGUMENTS[position],
                })
        };

        Ok(Self {
            token: arg(0)?,
            stream_url: arg(1)?,
            remote_dir: normalize_remote_dir(&arg(2)?),
            password: arg(3)?,
            capture_exe: PathBuf::from(arg(4)?),
            backup_dir: PathBuf::from(arg(5)?),
            read_buffer_size: 10 * MIB,
            rotation: RotationPolicy::default(),
            cleanup: CleanupPolicy::default(),
            failure_cooldown: Duration::from_secs(60),
            archive_extension: ".zip".into(),
        })
    }

    /// Tuning file path from [`TUNING_ENV`], if set.
    pub fn tuning_path() -> Option<PathBuf> {
        std::env::var_os(TUNING_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
    }

    /// Read a `KEY=VALUE` tuning file and apply it on top of the defaults.
    pub fn apply_tuning_file(&mut self, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read tuning file: {}", path.display()))?;
        self.apply_tuning(&parse_conf(&text));
        info!("Loaded tuning from {}", path.display());
        Ok(())
    }

    /// Apply tuning keys.  Invalid values are reported and the previous
    /// value is kept.
    pub fn apply_tuning(&mut self, map: &HashMap<String, String>) {
        let get = |key: &str| -> Option<&str> { map.get(key).map(String::as_str) };
        let parse_u64 = |key: &str| -> Option<u64> {
            let raw = get(key)?;
            match raw.parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!("Ignoring invalid {key}={raw}");
                    None
                }
            }
        };
        let secs = |key: &str| parse_u64(key).map(Duration::from_secs);

        // The preset goes first so individual keys can refine it.
        match get("ROTATION_POLICY") {
            Some("short") => self.rotation = RotationPolicy::short_cycle(),
            Some("interval") => self.rotation = RotationPolicy::fixed_interval(),
            Some(other) => warn!("Unknown ROTATION_POLICY={other}, keeping current policy"),
            None => {}
        }

        let r = &mut self.rotation;
        if let Some(v) = secs("SEGMENT_SECONDS") {
            r.max_segment_duration = v;
        }
        if let Some(v) = secs("CHUNK_MIN_INTERVAL_SECS") {
            r.min_chunk_interval = v;
        }
        if let Some(v) = secs("CHUNK_MAX_INTERVAL_SECS") {
            r.max_chunk_interval = v;
        }
        if let Some(v) = parse_u64("CHUNK_SIZE") {
            r.chunk_size = v as usize;
        }
        if let Some(v) = secs("GRACE_PERIOD_SECS") {
            r.grace_period = v;
        }
        if let Some(v) = secs("STARTUP_WINDOW_SECS") {
            r.startup_window = v;
        }
        if let Some(v) = parse_u64("HANDOFF_DELAY_MS") {
            r.handoff_delay = Duration::from_millis(v);
        }

        if let Some(v) = parse_u64("READ_BUFFER_SIZE").filter(|v| *v > 0) {
            self.read_buffer_size = v as usize;
        }
        if let Some(v) = secs("RETENTION_SECS") {
            self.cleanup.retention = v;
        }
        if let Some(v) = parse_u64("LIST_PAGE_SIZE") {
            self.cleanup.page_size = v.clamp(1, 2000) as u32;
        }
        if let Some(v) = secs("FAILURE_COOLDOWN_SECS") {
            self.failure_cooldown = v;
        }
        if let Some(ext) = get("ARCHIVE_EXTENSION").filter(|s| !s.is_empty()) {
            self.archive_extension = if ext.starts_with('.') {
                ext.to_string()
            } else {
                format!(".{ext}")
            };
        }
    }

    /// Remote directory without its trailing separator, as folder
    /// operations expect it.
    pub fn remote_folder(&self) -> &str {
        self.remote_dir.trim_end_matches('/')
    }

    /// Placeholder file reused between segments.
    pub fn reserved_path(&self) -> PathBuf {
        self.backup_dir.join(RESERVED_FILE_NAME)
    }
}

/// Make sure the remote directory ends with exactly one `/`.
pub fn normalize_remote_dir(dir: &str) -> String {
    let mut dir = dir.replace('\\', "/");
    if !dir.ends_with('/') {
        dir.push('/');
    }
    dir
}

/// Parse `KEY=VALUE` lines into a map, stripping optional double-quotes.
pub fn parse_conf(text: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, val)) = line.split_once('=') {
            let key = key.trim();
            let val = val.trim().trim_matches('"');
            map.insert(key.to_string(), val.to_string());
        }
    }
    map
}

// ─── tests ───────────────────────────────────────────────────────────────
