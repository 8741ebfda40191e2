// SPDX-License-Identifier: MIT
//! Client configuration — created once, immutable for the process lifetime.
//!
//! `XrayConfig::new(api_key, project_id)` installs the documented defaults;
//! the `with_*` builders override individual knobs. Validation happens in
//! [`crate::Xray::init`] — the one place this crate is allowed to return an
//! error to the host.

use std::path::PathBuf;
use std::time::Duration;

/// Default flush period for the event batcher.
pub const DEFAULT_BATCH_INTERVAL: Duration = Duration::from_millis(1000);
/// Default flush threshold (events per batch).
pub const DEFAULT_MAX_BATCH_SIZE: usize = 50;
/// Default disk spool quota: 500 MiB.
pub const DEFAULT_MAX_DISK_SIZE: u64 = 500 * 1024 * 1024;
/// Default memory spool quota: 50 MiB.
pub const DEFAULT_MAX_MEMORY_SIZE: u64 = 50 * 1024 * 1024;
/// Default serializer pool size.
pub const DEFAULT_WORKER_POOL_SIZE: usize = 2;

/// Errors surfaced by [`crate::Xray::init`].
///
/// This is the only error type that ever crosses the public boundary; every
/// method past construction is infallible by signature.
#[derive(Debug, thiserror::Error)]
pub enum XrayError {
    #[error("apiKey is required")]
    MissingApiKey,
    #[error("projectId is required")]
    MissingProjectId,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Tracer configuration.
///
/// | Option | Default |
/// |---|---|
/// | `api_key` | required |
/// | `project_id` | required |
/// | `enabled` | `true` |
/// | `debug` | `false` |
/// | `base_url` | env `XRAY_BASE_URL`, else `http://localhost:3000` |
/// | `temp_dir` | auto-detected (see [`XrayConfig::spool_root`]) |
/// | `max_disk_size` | 500 MiB |
/// | `max_memory_size` | 50 MiB |
/// | `batch_interval` | 1000 ms |
/// | `max_batch_size` | 50 events |
/// | `worker_pool_size` | 2 |
#[derive(Debug, Clone)]
pub struct XrayConfig {
    /// Sent as `x-api-key` on every ingest/presign request.
    pub api_key: String,
    /// Prefix of every `traceId`, echoed into every event.
    pub project_id: String,
    /// When false, every user-facing method is a no-op.
    pub enabled: bool,
    /// When true, the diagnostic sink emits at debug/info/warn/error.
    pub debug: bool,
    /// Ingest service root, e.g. `https://ingest.example.com`.
    pub base_url: String,
    /// Spool root directory. `None` means auto-detect.
    pub temp_dir: Option<PathBuf>,
    /// Disk spool quota in bytes.
    pub max_disk_size: u64,
    /// Memory spool quota in bytes (fallback backend).
    pub max_memory_size: u64,
    /// Event batcher flush period.
    pub batch_interval: Duration,
    /// Event batcher flush threshold.
    pub max_batch_size: usize,
    /// Number of serializer pool workers.
    pub worker_pool_size: usize,
}

impl XrayConfig {
    /// Build a config with the documented defaults.
    pub fn new(api_key: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            project_id: project_id.into(),
            enabled: true,
            debug: false,
            base_url: default_base_url(),
            temp_dir: None,
            max_disk_size: DEFAULT_MAX_DISK_SIZE,
            max_memory_size: DEFAULT_MAX_MEMORY_SIZE,
            batch_interval: DEFAULT_BATCH_INTERVAL,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_temp_dir(mut self, temp_dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(temp_dir.into());
        self
    }

    pub fn with_max_disk_size(mut self, bytes: u64) -> Self {
        self.max_disk_size = bytes;
        self
    }

    pub fn with_max_memory_size(mut self, bytes: u64) -> Self {
        self.max_memory_size = bytes;
        self
    }

    pub fn with_batch_interval(mut self, interval: Duration) -> Self {
        self.batch_interval = interval;
        self
    }

    pub fn with_max_batch_size(mut self, events: usize) -> Self {
        self.max_batch_size = events;
        self
    }

    pub fn with_worker_pool_size(mut self, workers: usize) -> Self {
        self.worker_pool_size = workers;
        self
    }

    /// Check required fields and reject nonsensical values.
    pub(crate) fn validate(&self) -> Result<(), XrayError> {
        if self.api_key.trim().is_empty() {
            return Err(XrayError::MissingApiKey);
        }
        if self.project_id.trim().is_empty() {
            return Err(XrayError::MissingProjectId);
        }
        if self.max_batch_size == 0 {
            return Err(XrayError::InvalidConfig(
                "maxBatchSize must be at least 1".into(),
            ));
        }
        if self.batch_interval.is_zero() {
            return Err(XrayError::InvalidConfig(
                "batchInterval must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Resolve the spool root: the configured `temp_dir`, or an
    /// auto-detected location.
    pub(crate) fn spool_root(&self) -> PathBuf {
        match &self.temp_dir {
            Some(dir) => dir.clone(),
            None => detect_spool_root(),
        }
    }
}

fn default_base_url() -> String {
    std::env::var("XRAY_BASE_URL").unwrap_or_else(|_| "http://localhost:3000".to_string())
}

/// Pick a spool root when the host did not supply one.
///
/// Default is the OS temp directory plus `xray`. On Linux, if the temp mount
/// is RAM-backed (tmpfs) *and* available memory is below 512 MiB, a path
/// under the user's home directory is preferred so the spool does not compete
/// with the host for RAM. Detection is advisory; any failure falls back to
/// the OS temp directory.
fn detect_spool_root() -> PathBuf {
    let tmp = std::env::temp_dir().join("xray");

    #[cfg(target_os = "linux")]
    {
        const LOW_MEMORY_BYTES: u64 = 512 * 1024 * 1024;
        if temp_is_tmpfs(&tmp) && available_memory_bytes().is_some_and(|b| b < LOW_MEMORY_BYTES) {
            if let Ok(home) = std::env::var("HOME") {
                return PathBuf::from(home).join(".xray").join("spool");
            }
        }
    }

    tmp
}

/// Whether the filesystem holding `path` is tmpfs, per `/proc/mounts`.
///
/// The longest mount point that prefixes `path` wins.
#[cfg(target_os = "linux")]
fn temp_is_tmpfs(path: &std::path::Path) -> bool {
    let Ok(mounts) = std::fs::read_to_string("/proc/mounts") else {
        return false;
    };
    let mut best: Option<(usize, &str)> = None;
    for line in mounts.lines() {
        let mut fields = line.split_whitespace();
        let (Some(_dev), Some(mount), Some(fstype)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if path.starts_with(mount) {
            match best {
                Some((len, _)) if mount.len() <= len => {}
                _ => best = Some((mount.len(), fstype)),
            }
        }
    }
    matches!(best, Some((_, "tmpfs")))
}

/// `MemAvailable` from `/proc/meminfo`, in bytes.
#[cfg(target_os = "linux")]
fn available_memory_bytes() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemAvailable:") {
            let kb: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}
