//! Port definitions crossed by the engine.
//!
//! The engine drives the downloader and the event sink exclusively through
//! these traits so tests can substitute in-memory fakes, and so the
//! webhook crate never becomes a build dependency of the engine's logic.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::ServiceError;
use crate::events::WebhookEvent;
use crate::job::{JobId, LogLevel, ProgressFrame};
use crate::listing::RemoteEntry;
use crate::options::DownloadOptions;

/// Everything a downloader needs to execute one job.
#[derive(Clone)]
pub struct FetchRequest {
    /// The job this fetch belongs to.
    pub job_id: JobId,
    /// The media URL.
    pub url: String,
    /// Validated option set.
    pub options: DownloadOptions,
    /// Private working directory under the storage root. Exists before
    /// the call; everything the downloader writes lands here.
    pub workdir: PathBuf,
    /// Cookie jar file resolved from the job's `cookie_id`, if any.
    pub cookies_file: Option<PathBuf>,
    /// Cooperative cancellation. Checked at progress boundaries.
    pub cancel: CancellationToken,
    /// Overall wall-clock budget.
    pub timeout: Duration,
    /// Budget between two progress observations.
    pub stall_timeout: Duration,
    /// Receiver of downloader output lines for the job log.
    pub log: LogSink,
}

/// What a successful fetch produced, before the file manager places it.
#[derive(Clone, Debug, PartialEq)]
pub struct FetchedMedia {
    /// Path of the produced file inside the working directory.
    pub path: PathBuf,
    /// Basename of the produced file.
    pub filename: String,
    /// Size in bytes.
    pub size_bytes: u64,
    /// Extracted media title.
    pub title: Option<String>,
    /// Uploader/channel name.
    pub uploader: Option<String>,
    /// Duration in seconds.
    pub duration_secs: Option<f64>,
}

/// Progress callback handed to the downloader.
///
/// Returns `Err` when the observer could not apply the frame; the driver
/// counts consecutive failures and aborts the job on a storm.
pub type ProgressSink = Arc<dyn Fn(ProgressFrame) -> Result<(), ServiceError> + Send + Sync>;

/// Log callback: downloader output lines destined for the job log.
pub type LogSink = Arc<dyn Fn(LogLevel, String) + Send + Sync>;

/// A log sink that discards everything.
#[must_use]
pub fn null_log_sink() -> LogSink {
    Arc::new(|_, _| {})
}

/// The downloader the engine drives.
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Execute one download to completion, streaming progress frames into
    /// `progress`. Must return promptly after `request.cancel` fires.
    async fn fetch(
        &self,
        request: FetchRequest,
        progress: ProgressSink,
    ) -> Result<FetchedMedia, ServiceError>;

    /// Metadata-only probe of a channel or playlist URL, returning the
    /// flat listing without downloading any media.
    async fn probe(&self, url: &str) -> Result<Vec<RemoteEntry>, ServiceError>;
}

/// Receiver of lifecycle and progress events.
///
/// Lifecycle events are awaited by the caller; progress dispatch returns
/// immediately and must never block the download path.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Deliver a started/completed/failed event. Failures are the sink's
    /// problem; callers never see them.
    async fn lifecycle(&self, url: &str, event: WebhookEvent);

    /// Hand off a progress event, fire-and-forget. The sink may drop it
    /// (rate caps, shutdown).
    fn progress(&self, url: &str, event: WebhookEvent);

    /// Drop per-job throttle state once the job is terminal.
    fn release(&self, job_id: &JobId);
}

/// An event sink that drops everything. Used when webhooks are disabled
/// and as a test default.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn lifecycle(&self, _url: &str, _event: WebhookEvent) {}

    fn progress(&self, _url: &str, _event: WebhookEvent) {}

    fn release(&self, _job_id: &JobId) {}
}
