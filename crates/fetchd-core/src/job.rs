//! Core domain types for jobs.
//!
//! Pure data types with no I/O dependencies. The registry in the engine
//! crate owns every `JobRecord`; everything here is value-shaped so records
//! can be snapshotted out from under the registry lock.

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ServiceError;
use crate::options::DownloadOptions;

/// Canonical identifier for a job.
///
/// Opaque string. Batch children use the deterministic form
/// `{batch_id}:{index}` so a child can be located from its batch alone.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Wrap an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mint a fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Derive the deterministic id of a batch child.
    #[must_use]
    pub fn batch_child(batch_id: &crate::batch::BatchId, index: usize) -> Self {
        Self(format!("{batch_id}:{index}"))
    }

    /// Borrow the raw id string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for JobId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Status of a job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a worker.
    Queued,
    /// A worker is executing the download.
    Running,
    /// Finished with an artifact.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled before completion.
    Cancelled,
}

impl JobStatus {
    /// Convert to the stable string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse from the string representation.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            // "queued" or unknown values default to Queued
            _ => Self::Queued,
        }
    }

    /// Whether this status admits no further transitions.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the status DAG admits a transition to `next`.
    ///
    /// Legal edges: queued→running, queued→cancelled,
    /// running→{completed, failed, cancelled}. Nothing leaves a terminal
    /// state and self-transitions are rejected.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        match (self, next) {
            (Self::Queued, Self::Running | Self::Cancelled) => true,
            (Self::Running, Self::Completed | Self::Failed | Self::Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a job log line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// One timestamped line of a job's log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// When the line was appended.
    pub at: DateTime<Utc>,
    /// Severity.
    pub level: LogLevel,
    /// Message text.
    pub message: String,
}

/// Default per-job log capacity.
pub const JOB_LOG_CAPACITY: usize = 500;

/// Bounded append-only job log.
///
/// A ring buffer: once `capacity` lines are held, the oldest line is
/// evicted on each append. Appends are O(1).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLog {
    entries: VecDeque<LogEntry>,
    #[serde(default = "default_log_capacity")]
    capacity: usize,
}

const fn default_log_capacity() -> usize {
    JOB_LOG_CAPACITY
}

impl JobLog {
    /// Create an empty log with the given capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Append a line, evicting the oldest if the buffer is full.
    pub fn push(&mut self, level: LogLevel, message: impl Into<String>) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(LogEntry {
            at: Utc::now(),
            level,
            message: message.into(),
        });
    }

    /// Number of retained lines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log holds no lines.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over retained lines, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }
}

impl Default for JobLog {
    fn default() -> Self {
        Self::with_capacity(JOB_LOG_CAPACITY)
    }
}

/// One progress observation from the downloader.
///
/// This is the callback payload; the registry folds frames into the job's
/// cumulative [`JobProgress`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressFrame {
    /// Bytes downloaded so far.
    pub downloaded_bytes: u64,
    /// Total bytes, if the downloader knows it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
    /// Instantaneous speed in bytes per second.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed_bps: Option<f64>,
    /// Estimated seconds remaining.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<f64>,
    /// Name of the file currently being written.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

/// Cumulative progress of a job.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    /// Percent complete, 0.0..=100.0.
    pub percent: f64,
    /// Bytes downloaded. Monotone within a running span.
    pub downloaded_bytes: u64,
    /// Total bytes, once known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
    /// Last observed speed in bytes per second.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed_bps: Option<f64>,
    /// Last observed ETA in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<f64>,
    /// When the last frame was applied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl JobProgress {
    /// Fold one frame into the cumulative progress.
    ///
    /// Byte counts never regress: a frame reporting fewer bytes than
    /// already recorded keeps the recorded count (the downloader may
    /// restart a fragment, but observers only see forward motion).
    pub fn apply(&mut self, frame: &ProgressFrame) {
        self.downloaded_bytes = self.downloaded_bytes.max(frame.downloaded_bytes);
        if frame.total_bytes.is_some() {
            self.total_bytes = frame.total_bytes;
        }
        self.speed_bps = frame.speed_bps;
        self.eta_seconds = frame.eta_seconds;
        #[allow(clippy::cast_precision_loss)]
        if let Some(total) = self.total_bytes {
            if total > 0 {
                self.percent = (self.downloaded_bytes as f64 / total as f64 * 100.0).min(100.0);
            }
        }
        self.updated_at = Some(Utc::now());
    }

    /// Mark the job fully downloaded.
    pub fn finish(&mut self, size_bytes: u64) {
        self.downloaded_bytes = self.downloaded_bytes.max(size_bytes);
        self.total_bytes = Some(self.downloaded_bytes);
        self.percent = 100.0;
        self.eta_seconds = Some(0.0);
        self.updated_at = Some(Utc::now());
    }
}

/// The file a completed job produced, plus extracted metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Final filename (basename of `path`).
    pub filename: String,
    /// Absolute path under the storage root.
    pub path: PathBuf,
    /// Size in bytes.
    pub size_bytes: u64,
    /// Public URL through which the file is served.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
    /// Media title extracted by the downloader.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Uploader/channel name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uploader: Option<String>,
    /// Duration in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
}

/// Terminal failure descriptor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    /// Stable error kind string (see `ServiceError::kind`).
    pub kind: String,
    /// Human-readable message.
    pub message: String,
}

impl JobFailure {
    /// Build a failure descriptor from a service error.
    #[must_use]
    pub fn from_error(err: &ServiceError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// Where a batch child came from, for output-template tokens.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOrigin {
    /// Playlist title, when expanded from a playlist.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub playlist: Option<String>,
    /// 1-based position within the playlist.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub playlist_index: Option<usize>,
    /// Channel name, when expanded from a channel.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

/// The full lifecycle record of one job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobRecord {
    /// Unique id.
    pub id: JobId,
    /// The URL the job was submitted with.
    pub url: String,
    /// The typed option set, validated at submission.
    pub options: DownloadOptions,
    /// Current lifecycle status.
    pub status: JobStatus,
    /// Cumulative progress.
    pub progress: JobProgress,
    /// Bounded log.
    pub log: JobLog,
    /// Present iff the job completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,
    /// Present iff the job failed or was cancelled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<JobFailure>,
    /// Owning batch, if this job is a batch child.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<crate::batch::BatchId>,
    /// Expansion origin, if this job came from a channel or playlist.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<JobOrigin>,
    /// Submission time.
    pub created_at: DateTime<Utc>,
    /// When a worker picked the job up.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Create a fresh queued record.
    #[must_use]
    pub fn new(id: JobId, url: impl Into<String>, options: DownloadOptions) -> Self {
        Self {
            id,
            url: url.into(),
            options,
            status: JobStatus::Queued,
            progress: JobProgress::default(),
            log: JobLog::default(),
            artifact: None,
            failure: None,
            batch_id: None,
            origin: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}
