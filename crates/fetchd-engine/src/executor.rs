//! Job execution wiring.
//!
//! The executor turns a job record into the work function the queue runs:
//! working-directory setup, the progress and log sinks, the driver call,
//! and final artifact placement. Both single submissions and batch
//! children launch through here, so the pipeline is identical for every
//! job in the system.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use fetchd_core::batch::BatchId;
use fetchd_core::config::ServiceConfig;
use fetchd_core::error::ServiceError;
use fetchd_core::events::WebhookEvent;
use fetchd_core::job::{Artifact, JobId, JobOrigin, JobRecord};
use fetchd_core::options::DownloadOptions;
use fetchd_core::ports::{Downloader, EventSink, FetchRequest, LogSink, ProgressSink};
use fetchd_store::{DEFAULT_TEMPLATE, FileManager, TemplateContext, sanitize_filename};

use crate::queue::{ExecutionQueue, TerminalWaiter};
use crate::registry::JobRegistry;

/// Shared dependencies of the execution pipeline.
pub struct JobExecutor {
    config: ServiceConfig,
    registry: Arc<JobRegistry>,
    queue: Arc<ExecutionQueue>,
    files: Arc<FileManager>,
    driver: Arc<dyn Downloader>,
    events: Arc<dyn EventSink>,
}

impl JobExecutor {
    /// Bundle the pipeline dependencies.
    #[must_use]
    pub fn new(
        config: ServiceConfig,
        registry: Arc<JobRegistry>,
        queue: Arc<ExecutionQueue>,
        files: Arc<FileManager>,
        driver: Arc<dyn Downloader>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            registry,
            queue,
            files,
            driver,
            events,
        }
    }

    /// The job registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// The execution queue.
    #[must_use]
    pub fn queue(&self) -> &Arc<ExecutionQueue> {
        &self.queue
    }

    /// Create a job record.
    pub fn create_job(
        &self,
        id: JobId,
        url: impl Into<String>,
        options: DownloadOptions,
        batch_id: Option<BatchId>,
        origin: Option<JobOrigin>,
    ) -> Result<JobRecord, ServiceError> {
        let url = url.into();
        let record = self.registry.create(id.clone(), url, options)?;
        if batch_id.is_some() || origin.is_some() {
            return self.registry.update(&id, |record| {
                record.batch_id = batch_id;
                record.origin = origin;
            });
        }
        Ok(record)
    }

    /// Hand an existing queued job to the execution queue.
    pub fn launch(&self, job_id: &JobId) -> Result<TerminalWaiter, ServiceError> {
        let record = self.registry.get(job_id)?;
        let work_ctx = WorkContext {
            registry: Arc::clone(&self.registry),
            files: Arc::clone(&self.files),
            driver: Arc::clone(&self.driver),
            events: Arc::clone(&self.events),
            record,
            timeout: self.job_timeout(job_id)?,
            stall_timeout: self.config.stall_timeout(),
            cookies_file: self.resolve_cookies(job_id)?,
        };

        let work: crate::queue::JobWork = Box::new(move |cancel| {
            let fut: crate::queue::JobFuture = Box::pin(work_ctx.run(cancel));
            fut
        });
        self.queue.submit(job_id.clone(), work)
    }

    /// Cancel a job through the queue.
    pub async fn cancel(&self, job_id: &JobId) -> bool {
        self.queue.cancel(job_id).await
    }

    /// Commit a job `Cancelled` without it ever reaching the queue.
    ///
    /// Used by the batch driver for children parked behind the batch
    /// semaphore when the stop signal fires.
    pub async fn mark_cancelled_without_run(&self, job_id: &JobId) {
        self.mark_terminal_without_run(job_id, &ServiceError::Cancelled)
            .await;
    }

    /// Commit a job `Failed` without it ever reaching the queue.
    pub async fn mark_failed_without_run(&self, job_id: &JobId, error: &ServiceError) {
        self.mark_terminal_without_run(job_id, error).await;
    }

    async fn mark_terminal_without_run(&self, job_id: &JobId, error: &ServiceError) {
        let record = match self.registry.commit_failed(job_id, error) {
            Ok(record) => record,
            Err(e) => {
                tracing::debug!(
                    target: "fetchd.batch",
                    id = %job_id,
                    error = %e,
                    "Terminal commit lost a race"
                );
                return;
            }
        };
        if let Some(url) = &record.options.webhook_url {
            let event = WebhookEvent::failed(job_id.clone(), error.kind(), error.to_string());
            self.events.lifecycle(url, event).await;
        }
        self.events.release(job_id);
    }

    fn job_timeout(&self, job_id: &JobId) -> Result<Duration, ServiceError> {
        let record = self.registry.get(job_id)?;
        Ok(record
            .options
            .timeout_secs
            .map_or_else(|| self.config.job_timeout(), Duration::from_secs))
    }

    /// Resolve a job's cookie reference to a jar file, if configured.
    fn resolve_cookies(&self, job_id: &JobId) -> Result<Option<std::path::PathBuf>, ServiceError> {
        let record = self.registry.get(job_id)?;
        let (Some(cookie_id), Some(dir)) = (&record.options.cookie_id, &self.config.cookies_dir)
        else {
            return Ok(None);
        };
        let safe = sanitize_filename(cookie_id);
        if safe.is_empty() {
            return Err(ServiceError::validation("cookie id sanitizes to nothing"));
        }
        let path = dir.join(format!("{safe}.txt"));
        if path.is_file() {
            Ok(Some(path))
        } else {
            Err(ServiceError::not_found(format!("cookie jar {cookie_id}")))
        }
    }
}

/// Everything one job's work function needs, owned by value.
struct WorkContext {
    registry: Arc<JobRegistry>,
    files: Arc<FileManager>,
    driver: Arc<dyn Downloader>,
    events: Arc<dyn EventSink>,
    record: JobRecord,
    timeout: Duration,
    stall_timeout: Duration,
    cookies_file: Option<std::path::PathBuf>,
}

impl WorkContext {
    async fn run(
        self,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Result<Artifact, ServiceError> {
        let job_id = self.record.id.clone();
        let workdir = self.files.workdir(job_id.as_str())?;

        let progress = self.progress_sink();
        let log = self.log_sink();

        let request = FetchRequest {
            job_id: job_id.clone(),
            url: self.record.url.clone(),
            options: self.record.options.clone(),
            workdir,
            cookies_file: self.cookies_file.clone(),
            cancel,
            timeout: self.timeout,
            stall_timeout: self.stall_timeout,
            log,
        };

        let media = self.driver.fetch(request, progress).await?;
        self.place(&job_id, media)
    }

    /// Progress frames update the registry and feed the throttled
    /// progress webhook.
    fn progress_sink(&self) -> ProgressSink {
        let registry = Arc::clone(&self.registry);
        let events = Arc::clone(&self.events);
        let job_id = self.record.id.clone();
        let webhook_url = self.record.options.webhook_url.clone();
        let sequence = AtomicU64::new(0);

        Arc::new(move |frame| {
            let progress = registry.update_progress(&job_id, &frame)?;
            if let Some(url) = &webhook_url {
                let seq = sequence.fetch_add(1, Ordering::Relaxed) + 1;
                events.progress(url, WebhookEvent::progress(job_id.clone(), &progress, seq));
            }
            Ok(())
        })
    }

    /// Downloader output lines land in the job's bounded log.
    fn log_sink(&self) -> LogSink {
        let registry = Arc::clone(&self.registry);
        let job_id = self.record.id.clone();
        Arc::new(move |level, message| {
            let _ = registry.append_log(&job_id, level, message);
        })
    }

    /// Move the staged file to its templated location and build the
    /// artifact descriptor.
    fn place(
        &self,
        job_id: &JobId,
        media: fetchd_core::ports::FetchedMedia,
    ) -> Result<Artifact, ServiceError> {
        let template = self
            .record
            .options
            .output_template
            .as_deref()
            .unwrap_or(DEFAULT_TEMPLATE);

        let mut ctx = TemplateContext::new(job_id.as_str());
        ctx.title.clone_from(&media.title);
        ctx.uploader.clone_from(&media.uploader);
        ctx.ext = media
            .path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_string);
        ctx.batch_id = self.record.batch_id.as_ref().map(|b| b.as_str().to_string());
        if let Some(origin) = &self.record.origin {
            ctx.playlist.clone_from(&origin.playlist);
            ctx.playlist_index = origin.playlist_index;
            ctx.channel.clone_from(&origin.channel);
        }

        let (absolute, relative) = self.files.place(&media.path, template, &ctx)?;
        self.files.remove_workdir(job_id.as_str());

        let filename = absolute
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&media.filename)
            .to_string();
        Ok(Artifact {
            filename,
            public_url: self.files.public_url(&relative),
            path: absolute,
            size_bytes: media.size_bytes,
            title: media.title,
            uploader: media.uploader,
            duration_secs: media.duration_secs,
        })
    }
}
