//! Service facade.
//!
//! Composes the registry, queue, file manager, batch coordinator, and
//! expander behind the operations an external request layer calls. All
//! construction goes through [`Service::new`] so tests can stand up a
//! fresh instance with a fake downloader and event sink.

use std::sync::Arc;
use std::time::Duration;

use fetchd_core::batch::{BatchId, BatchRecord};
use fetchd_core::config::ServiceConfig;
use fetchd_core::error::ServiceError;
use fetchd_core::job::{JobId, JobOrigin, JobRecord, JobStatus};
use fetchd_core::listing::{ListingFilter, ListingSort, PlaylistSelection, RemoteEntry};
use fetchd_core::options::DownloadOptions;
use fetchd_core::ports::{Downloader, EventSink};
use fetchd_store::{DeletionScheduler, FileManager};

use crate::batch::{BatchCoordinator, ChildSpec};
use crate::executor::JobExecutor;
use crate::expander::Expander;
use crate::queue::{ExecutionQueue, QueueStats};
use crate::registry::{JobRegistry, RegistryStats};

/// How long `shutdown(wait = true)` lets active jobs finish.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Aggregate counters for health/stats endpoints.
#[derive(Clone, Copy, Debug)]
pub struct ServiceStats {
    /// Job counts per status.
    pub jobs: RegistryStats,
    /// Queue counters.
    pub queue: QueueStats,
    /// Batches currently tracked.
    pub batches: usize,
    /// Deletions scheduled and not yet executed.
    pub pending_deletions: usize,
}

/// The assembled execution plane.
pub struct Service {
    config: ServiceConfig,
    registry: Arc<JobRegistry>,
    queue: Arc<ExecutionQueue>,
    files: Arc<FileManager>,
    executor: Arc<JobExecutor>,
    batches: Arc<BatchCoordinator>,
    expander: Expander,
}

impl Service {
    /// Validate the configuration and wire every component.
    pub fn new(
        config: ServiceConfig,
        driver: Arc<dyn Downloader>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, ServiceError> {
        let config = config.validated()?;

        let reaper = Arc::new(DeletionScheduler::new());
        let files = Arc::new(FileManager::new(
            &config.storage_root,
            &config.public_base_url,
            reaper,
        )?);
        let registry = Arc::new(JobRegistry::new());
        let queue = Arc::new(ExecutionQueue::new(
            &config,
            Arc::clone(&registry),
            Arc::clone(&files),
            Arc::clone(&events),
        ));
        let executor = Arc::new(JobExecutor::new(
            config.clone(),
            Arc::clone(&registry),
            Arc::clone(&queue),
            Arc::clone(&files),
            Arc::clone(&driver),
            events,
        ));
        let batches = Arc::new(BatchCoordinator::new(
            Arc::clone(&executor),
            config.max_batch_size,
        ));
        let expander = Expander::new(driver);

        Ok(Self {
            config,
            registry,
            queue,
            files,
            executor,
            batches,
            expander,
        })
    }

    /// The validated configuration.
    #[must_use]
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// The file manager (the request layer resolves public paths
    /// through it before streaming artifacts).
    #[must_use]
    pub fn files(&self) -> &Arc<FileManager> {
        &self.files
    }

    /// Submit a single URL.
    pub fn submit(
        &self,
        url: impl Into<String>,
        options: DownloadOptions,
    ) -> Result<JobId, ServiceError> {
        let url = url.into();
        validate_media_url(&url)?;
        let options = options.validated()?;

        let job_id = JobId::generate();
        self.executor
            .create_job(job_id.clone(), url, options, None, None)?;

        match self.executor.launch(&job_id) {
            Ok(_waiter) => Ok(job_id),
            Err(e) => {
                // Do not leave a queued record behind for a rejected
                // submission.
                let _ = self.registry.remove(&job_id);
                Err(e)
            }
        }
    }

    /// Submit a batch of URLs.
    pub fn submit_batch(
        &self,
        urls: Vec<String>,
        options: DownloadOptions,
        concurrency: usize,
        stop_on_error: bool,
    ) -> Result<(BatchId, Vec<JobId>), ServiceError> {
        for url in &urls {
            validate_media_url(url)?;
        }
        let options = options.validated()?;
        let specs = urls.into_iter().map(ChildSpec::from).collect();
        self.batches.create(specs, options, concurrency, stop_on_error)
    }

    /// Expand a channel and submit the selection as a batch.
    #[allow(clippy::too_many_arguments)]
    pub async fn submit_channel(
        &self,
        url: &str,
        filter: &ListingFilter,
        sort: ListingSort,
        cap: usize,
        options: DownloadOptions,
        concurrency: usize,
        stop_on_error: bool,
    ) -> Result<(BatchId, Vec<JobId>), ServiceError> {
        validate_media_url(url)?;
        let options = options.validated()?;

        let entries = self.expander.expand_channel(url, filter, sort, cap).await?;
        let specs = entries
            .into_iter()
            .map(|entry| ChildSpec::from(entry.url))
            .collect();
        self.batches.create(specs, options, concurrency, stop_on_error)
    }

    /// Expand a playlist and submit the selection as a batch.
    pub async fn submit_playlist(
        &self,
        url: &str,
        selection: Option<&PlaylistSelection>,
        options: DownloadOptions,
        concurrency: usize,
        stop_on_error: bool,
    ) -> Result<(BatchId, Vec<JobId>), ServiceError> {
        validate_media_url(url)?;
        let options = options.validated()?;

        let entries = self.expander.expand_playlist(url, selection).await?;
        let specs = entries
            .into_iter()
            .enumerate()
            .map(|(index, entry)| playlist_spec(index, entry))
            .collect();
        self.batches.create(specs, options, concurrency, stop_on_error)
    }

    /// Snapshot a job record.
    pub fn job(&self, job_id: &JobId) -> Result<JobRecord, ServiceError> {
        self.registry.get(job_id)
    }

    /// Cancel a job; returns its status after the cancel was applied or
    /// signalled.
    pub async fn cancel_job(&self, job_id: &JobId) -> Result<JobStatus, ServiceError> {
        // Existence check first so unknown ids are NotFound, not a silent
        // no-op.
        let record = self.registry.get(job_id)?;
        if record.status.is_terminal() {
            return Ok(record.status);
        }
        self.executor.cancel(job_id).await;
        Ok(self.registry.get(job_id)?.status)
    }

    /// Snapshot a batch record plus its children.
    pub fn batch(&self, batch_id: &BatchId) -> Result<(BatchRecord, Vec<JobRecord>), ServiceError> {
        self.batches.status(batch_id)
    }

    /// Cancel a batch; returns how many children were cancelled.
    pub async fn cancel_batch(&self, batch_id: &BatchId) -> Result<usize, ServiceError> {
        self.batches.cancel(batch_id).await
    }

    /// Aggregate counters.
    #[must_use]
    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            jobs: self.registry.stats(),
            queue: self.queue.stats(),
            batches: self.batches.len(),
            pending_deletions: self.files.reaper().pending_count(),
        }
    }

    /// Whether the execution plane accepts work.
    #[must_use]
    pub fn healthy(&self) -> bool {
        self.queue.healthy()
    }

    /// Evict terminal jobs and batches older than `older_than`.
    pub fn reap(&self, older_than: chrono::Duration) -> (usize, usize) {
        let jobs = self.registry.reap_terminal(older_than);
        let batches = self.batches.reap(older_than);
        (jobs, batches)
    }

    /// Wind the execution plane down.
    ///
    /// With `wait`, active jobs get a bounded grace period before their
    /// tokens are cancelled. Pending deletions are discarded, not drained;
    /// artifacts on disk outlive the process either way.
    pub async fn shutdown(&self, wait: bool) {
        self.queue.shutdown(wait, SHUTDOWN_GRACE).await;
        self.files.reaper().shutdown(false).await;
    }
}

/// Submitted URLs must be http(s); anything else is `InvalidUrl`.
fn validate_media_url(raw: &str) -> Result<(), ServiceError> {
    match url::Url::parse(raw) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
        _ => Err(ServiceError::invalid_url(raw)),
    }
}

fn playlist_spec(index: usize, entry: RemoteEntry) -> ChildSpec {
    ChildSpec {
        url: entry.url,
        origin: Some(JobOrigin {
            playlist: None,
            playlist_index: Some(index + 1),
            channel: None,
        }),
    }
}
