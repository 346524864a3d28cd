//! Batch coordination.
//!
//! A batch expands a multi-URL request into child jobs and drives them
//! through the execution queue behind its own concurrency semaphore. The
//! coordinator owns only the batch records; child lifecycle records live
//! in the job registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use fetchd_core::batch::{
    BatchId, BatchRecord, BatchStatus, BatchSummary, MAX_BATCH_CONCURRENCY, MIN_BATCH_CONCURRENCY,
};
use fetchd_core::error::ServiceError;
use fetchd_core::job::{JobId, JobOrigin, JobRecord, JobStatus};
use fetchd_core::options::DownloadOptions;

use crate::executor::JobExecutor;
use crate::registry::JobFilter;

/// One child of a batch request: a URL plus optional expansion context.
#[derive(Clone, Debug)]
pub struct ChildSpec {
    /// The media URL.
    pub url: String,
    /// Playlist/channel context for output-template tokens.
    pub origin: Option<JobOrigin>,
}

impl From<String> for ChildSpec {
    fn from(url: String) -> Self {
        Self { url, origin: None }
    }
}

impl From<&str> for ChildSpec {
    fn from(url: &str) -> Self {
        Self {
            url: url.to_string(),
            origin: None,
        }
    }
}

struct BatchEntry {
    record: BatchRecord,
    stop: CancellationToken,
    externally_cancelled: Arc<AtomicBool>,
}

/// Coordinator of all live batch records.
pub struct BatchCoordinator {
    executor: Arc<JobExecutor>,
    max_batch_size: usize,
    batches: Mutex<HashMap<BatchId, BatchEntry>>,
}

impl BatchCoordinator {
    /// Create a coordinator driving batches through `executor`.
    #[must_use]
    pub fn new(executor: Arc<JobExecutor>, max_batch_size: usize) -> Self {
        Self {
            executor,
            max_batch_size,
            batches: Mutex::new(HashMap::new()),
        }
    }

    /// Create a batch: validate, register children, spawn the driver.
    ///
    /// URLs are deduplicated preserving first occurrence. The batch must
    /// hold between 1 and `max_batch_size` children after dedup.
    pub fn create(
        self: &Arc<Self>,
        specs: Vec<ChildSpec>,
        options: DownloadOptions,
        concurrency: usize,
        stop_on_error: bool,
    ) -> Result<(BatchId, Vec<JobId>), ServiceError> {
        if !(MIN_BATCH_CONCURRENCY..=MAX_BATCH_CONCURRENCY).contains(&concurrency) {
            return Err(ServiceError::validation(format!(
                "batch concurrency must be in {MIN_BATCH_CONCURRENCY}..={MAX_BATCH_CONCURRENCY}"
            )));
        }

        let specs = dedup_by_url(specs);
        if specs.is_empty() {
            return Err(ServiceError::validation("batch contains no URLs"));
        }
        if specs.len() > self.max_batch_size {
            return Err(ServiceError::validation(format!(
                "batch exceeds {} URLs after deduplication",
                self.max_batch_size
            )));
        }

        let batch_id = BatchId::generate();
        let mut child_ids = Vec::with_capacity(specs.len());
        for (index, spec) in specs.iter().enumerate() {
            let child_id = JobId::batch_child(&batch_id, index);
            self.executor.create_job(
                child_id.clone(),
                spec.url.clone(),
                options.clone(),
                Some(batch_id.clone()),
                spec.origin.clone(),
            )?;
            child_ids.push(child_id);
        }

        let mut record = BatchRecord::new(
            batch_id.clone(),
            child_ids.clone(),
            concurrency,
            stop_on_error,
        );
        record.started_at = Some(Utc::now());

        let stop = CancellationToken::new();
        let externally_cancelled = Arc::new(AtomicBool::new(false));
        {
            let mut batches = self.lock_batches();
            batches.insert(
                batch_id.clone(),
                BatchEntry {
                    record,
                    stop: stop.clone(),
                    externally_cancelled: Arc::clone(&externally_cancelled),
                },
            );
        }

        tracing::info!(
            target: "fetchd.batch",
            batch = %batch_id,
            children = child_ids.len(),
            concurrency,
            stop_on_error,
            "Batch created"
        );

        let this = Arc::clone(self);
        let driver_children = child_ids.clone();
        let driver_batch = batch_id.clone();
        tokio::spawn(async move {
            this.drive(driver_batch, driver_children, concurrency, stop_on_error, stop)
                .await;
        });

        Ok((batch_id, child_ids))
    }

    /// Snapshot a batch record together with its child records.
    pub fn status(&self, batch_id: &BatchId) -> Result<(BatchRecord, Vec<JobRecord>), ServiceError> {
        let record = {
            let batches = self.lock_batches();
            batches
                .get(batch_id)
                .map(|entry| entry.record.clone())
                .ok_or_else(|| ServiceError::not_found(format!("batch {batch_id}")))?
        };

        let mut children = self.executor.registry().list(&JobFilter {
            batch_id: Some(batch_id.clone()),
            ..JobFilter::default()
        });
        // Registry order is creation order, which matches child index.
        children.sort_by_key(|r| {
            record
                .child_ids
                .iter()
                .position(|id| *id == r.id)
                .unwrap_or(usize::MAX)
        });
        Ok((record, children))
    }

    /// Cancel a batch: flip the stop signal and cancel every child that
    /// has not finished. Returns how many children were cancelled.
    pub async fn cancel(&self, batch_id: &BatchId) -> Result<usize, ServiceError> {
        let (stop, child_ids) = {
            let batches = self.lock_batches();
            let entry = batches
                .get(batch_id)
                .ok_or_else(|| ServiceError::not_found(format!("batch {batch_id}")))?;
            entry.externally_cancelled.store(true, Ordering::SeqCst);
            (entry.stop.clone(), entry.record.child_ids.clone())
        };
        stop.cancel();

        let mut cancelled = 0usize;
        for child_id in &child_ids {
            let terminal = self
                .executor
                .registry()
                .get(child_id)
                .map(|r| r.status.is_terminal())
                .unwrap_or(true);
            if terminal {
                continue;
            }
            cancelled += 1;
            // Children the driver has not submitted yet are picked up by
            // the stop signal; submitted ones go through the queue.
            self.executor.cancel(child_id).await;
        }

        tracing::info!(
            target: "fetchd.batch",
            batch = %batch_id,
            cancelled,
            "Batch cancelled"
        );
        Ok(cancelled)
    }

    /// Evict terminal batches older than `older_than`. Returns the count.
    pub fn reap(&self, older_than: chrono::Duration) -> usize {
        let cutoff = Utc::now() - older_than;
        let mut batches = self.lock_batches();
        let before = batches.len();
        batches.retain(|_, entry| {
            !(entry.record.is_terminal()
                && entry.record.completed_at.is_some_and(|t| t < cutoff))
        });
        before - batches.len()
    }

    /// Number of batches currently tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock_batches().len()
    }

    /// Whether no batches are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The per-batch driver: submit children behind the semaphore, watch
    /// them to terminal state, then aggregate.
    async fn drive(
        self: Arc<Self>,
        batch_id: BatchId,
        child_ids: Vec<JobId>,
        concurrency: usize,
        stop_on_error: bool,
        stop: CancellationToken,
    ) {
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut watchers: JoinSet<()> = JoinSet::new();

        for child_id in &child_ids {
            if stop.is_cancelled() {
                self.executor.mark_cancelled_without_run(child_id).await;
                continue;
            }

            let permit = tokio::select! {
                biased;

                () = stop.cancelled() => {
                    self.executor.mark_cancelled_without_run(child_id).await;
                    continue;
                }

                permit = Arc::clone(&semaphore).acquire_owned() => {
                    match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    }
                }
            };

            match self.executor.launch(child_id) {
                Ok(waiter) => {
                    let stop = stop.clone();
                    let child = child_id.clone();
                    watchers.spawn(async move {
                        let status = waiter.wait().await;
                        // Flip the stop signal before releasing the
                        // permit, so a parked child cannot win the freed
                        // slot against the stop check.
                        if status == Some(JobStatus::Failed) && stop_on_error {
                            tracing::info!(
                                target: "fetchd.batch",
                                child = %child,
                                "Child failed, stopping batch"
                            );
                            stop.cancel();
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    // Submission refused (queue full, shut down): the
                    // child fails without running.
                    self.executor.mark_failed_without_run(child_id, &e).await;
                    if stop_on_error {
                        stop.cancel();
                    }
                    drop(permit);
                }
            }
        }

        while watchers.join_next().await.is_some() {}
        self.finalize(&batch_id, &child_ids);
    }

    /// Aggregate child outcomes into the batch's terminal state.
    fn finalize(&self, batch_id: &BatchId, child_ids: &[JobId]) {
        let mut summary = BatchSummary::default();
        for child_id in child_ids {
            match self.executor.registry().get(child_id).map(|r| r.status) {
                Ok(JobStatus::Completed) => summary.completed += 1,
                Ok(JobStatus::Cancelled) => summary.cancelled += 1,
                // Still-queued records mean bookkeeping went wrong; count
                // them as failures rather than hanging the batch.
                Ok(_) | Err(_) => summary.failed += 1,
            }
        }

        let mut batches = self.lock_batches();
        let Some(entry) = batches.get_mut(batch_id) else {
            return;
        };

        let all_completed = summary.completed == child_ids.len();
        let externally_cancelled = entry.externally_cancelled.load(Ordering::SeqCst);
        let status = if all_completed {
            BatchStatus::Completed
        } else if externally_cancelled || (entry.record.stop_on_error && summary.failed > 0) {
            BatchStatus::Failed
        } else {
            // Continue-on-error: the batch completes and carries the
            // per-child failure counts.
            BatchStatus::Completed
        };

        entry.record.summary = summary;
        entry.record.status = status;
        entry.record.message = Some(summary.describe());
        entry.record.completed_at = Some(Utc::now());

        tracing::info!(
            target: "fetchd.batch",
            batch = %batch_id,
            status = %status,
            outcome = %summary.describe(),
            "Batch finished"
        );
    }

    fn lock_batches(&self) -> std::sync::MutexGuard<'_, HashMap<BatchId, BatchEntry>> {
        self.batches
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Stable dedup by URL, keeping the first occurrence.
fn dedup_by_url(specs: Vec<ChildSpec>) -> Vec<ChildSpec> {
    let mut seen = std::collections::HashSet::new();
    specs
        .into_iter()
        .filter(|spec| seen.insert(spec.url.clone()))
        .collect()
}
