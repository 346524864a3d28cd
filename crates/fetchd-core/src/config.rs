//! Service configuration.
//!
//! One flat struct covers every tunable the core recognizes. All fields
//! have working defaults; `validated` is the single gate a deployment's
//! settings pass through at startup.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ServiceError;

/// Default C5 worker pool size.
pub const DEFAULT_WORKER_COUNT: usize = 2;
/// Default cap on simultaneously running downloads.
pub const DEFAULT_MAX_CONCURRENT: usize = 3;
/// Default per-job wall-clock timeout, seconds.
pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 3600;
/// Default progress-stall timeout, seconds.
pub const DEFAULT_STALL_TIMEOUT_SECS: u64 = 300;
/// Default artifact retention, hours.
pub const DEFAULT_RETENTION_HOURS: f64 = 1.0;
/// Default webhook per-request timeout, seconds.
pub const DEFAULT_WEBHOOK_TIMEOUT_SECS: u64 = 10;
/// Default webhook attempt budget (first try included).
pub const DEFAULT_WEBHOOK_MAX_ATTEMPTS: u32 = 3;
/// Default per-job minimum interval between progress webhooks, seconds.
pub const DEFAULT_PROGRESS_THROTTLE_SECS: f64 = 1.0;
/// Default batch size ceiling.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;

/// Configuration for the whole execution plane.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Base directory of all artifact I/O. Created at startup if missing.
    pub storage_root: PathBuf,
    /// Prefix for public artifact URLs. Empty disables public URLs.
    pub public_base_url: String,
    /// C5 worker pool size (>= 1).
    pub worker_count: usize,
    /// Cap on simultaneously running downloads (>= 1).
    pub max_concurrent_downloads: usize,
    /// Default per-job wall-clock timeout, seconds.
    pub default_job_timeout_secs: u64,
    /// Fail a job when no progress arrives within this window, seconds.
    pub progress_stall_timeout_secs: u64,
    /// Hours completed artifacts are kept before deletion. 0 keeps forever.
    pub file_retention_hours: f64,
    /// Webhook per-request timeout, seconds (1..=60).
    pub webhook_timeout_secs: u64,
    /// Webhook attempt budget including the first try (1..=10).
    pub webhook_max_attempts: u32,
    /// Master switch for webhook delivery.
    pub webhook_enabled: bool,
    /// Ceiling on batch size after deduplication.
    pub max_batch_size: usize,
    /// Per-job minimum interval between progress webhooks, seconds.
    pub progress_throttle_secs: f64,
    /// HMAC key for webhook signing. Opaque bytes.
    pub signing_secret: String,
    /// Downloader binary to invoke.
    pub downloader_bin: PathBuf,
    /// Directory of stored cookie jars, looked up by `cookie_id`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cookies_dir: Option<PathBuf>,
    /// User-Agent header for webhook deliveries.
    pub user_agent: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("./storage"),
            public_base_url: String::new(),
            worker_count: DEFAULT_WORKER_COUNT,
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT,
            default_job_timeout_secs: DEFAULT_JOB_TIMEOUT_SECS,
            progress_stall_timeout_secs: DEFAULT_STALL_TIMEOUT_SECS,
            file_retention_hours: DEFAULT_RETENTION_HOURS,
            webhook_timeout_secs: DEFAULT_WEBHOOK_TIMEOUT_SECS,
            webhook_max_attempts: DEFAULT_WEBHOOK_MAX_ATTEMPTS,
            webhook_enabled: true,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            progress_throttle_secs: DEFAULT_PROGRESS_THROTTLE_SECS,
            signing_secret: String::new(),
            downloader_bin: PathBuf::from("yt-dlp"),
            cookies_dir: None,
            user_agent: concat!("fetchd/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl ServiceConfig {
    /// Validate ranges, consuming and returning the config.
    pub fn validated(self) -> Result<Self, ServiceError> {
        if self.worker_count == 0 {
            return Err(ServiceError::validation("worker_count must be >= 1"));
        }
        if self.max_concurrent_downloads == 0 {
            return Err(ServiceError::validation(
                "max_concurrent_downloads must be >= 1",
            ));
        }
        if self.default_job_timeout_secs == 0 {
            return Err(ServiceError::validation(
                "default_job_timeout_secs must be >= 1",
            ));
        }
        if self.progress_stall_timeout_secs == 0 {
            return Err(ServiceError::validation(
                "progress_stall_timeout_secs must be >= 1",
            ));
        }
        if self.file_retention_hours < 0.0 || !self.file_retention_hours.is_finite() {
            return Err(ServiceError::validation(
                "file_retention_hours must be a finite value >= 0",
            ));
        }
        if !(1..=60).contains(&self.webhook_timeout_secs) {
            return Err(ServiceError::validation(
                "webhook_timeout_secs must be in 1..=60",
            ));
        }
        if !(1..=10).contains(&self.webhook_max_attempts) {
            return Err(ServiceError::validation(
                "webhook_max_attempts must be in 1..=10",
            ));
        }
        if self.max_batch_size == 0 {
            return Err(ServiceError::validation("max_batch_size must be >= 1"));
        }
        if self.progress_throttle_secs < 0.0 || !self.progress_throttle_secs.is_finite() {
            return Err(ServiceError::validation(
                "progress_throttle_secs must be a finite value >= 0",
            ));
        }
        Ok(self)
    }

    /// Per-job wall-clock timeout as a `Duration`.
    #[must_use]
    pub const fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.default_job_timeout_secs)
    }

    /// Progress-stall timeout as a `Duration`.
    #[must_use]
    pub const fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.progress_stall_timeout_secs)
    }

    /// Webhook per-request timeout as a `Duration`.
    #[must_use]
    pub const fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_secs)
    }

    /// Progress throttle as a `Duration`.
    #[must_use]
    pub fn progress_throttle(&self) -> Duration {
        Duration::from_secs_f64(self.progress_throttle_secs)
    }

    /// Artifact retention as a `Duration`, `None` when retention is off.
    #[must_use]
    pub fn retention(&self) -> Option<Duration> {
        if self.file_retention_hours > 0.0 {
            Some(Duration::from_secs_f64(self.file_retention_hours * 3600.0))
        } else {
            None
        }
    }

    /// The submission ceiling of the execution queue.
    #[must_use]
    pub const fn queue_capacity(&self) -> usize {
        2 * self.max_concurrent_downloads
    }
}
