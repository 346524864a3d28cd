//! Bounded execution queue.
//!
//! A fixed pool of workers consumes submissions in FIFO order; a counting
//! semaphore caps how many jobs run simultaneously, independently of pool
//! size. Each accepted job gets a cancellation token and a terminal-state
//! watch channel.
//!
//! Lock discipline: the queue state mutex guards the slot map and the
//! counters only; nothing awaits while holding it.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, Semaphore, mpsc, watch};
use tokio_util::sync::CancellationToken;

use fetchd_core::config::ServiceConfig;
use fetchd_core::error::ServiceError;
use fetchd_core::events::WebhookEvent;
use fetchd_core::job::{Artifact, JobId, JobStatus};
use fetchd_core::ports::EventSink;
use fetchd_store::FileManager;

use crate::registry::JobRegistry;

/// The future a work function returns.
pub type JobFuture = Pin<Box<dyn Future<Output = Result<Artifact, ServiceError>> + Send>>;

/// A unit of work: given the job's cancellation token, produce the
/// committed artifact or a classified error.
pub type JobWork = Box<dyn FnOnce(CancellationToken) -> JobFuture + Send>;

/// Counters exposed by [`ExecutionQueue::stats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Jobs accepted and not yet picked up.
    pub queued: usize,
    /// Jobs currently executing.
    pub running: usize,
    /// Jobs that reached a terminal state through this queue.
    pub finished: u64,
    /// Submission ceiling (queued + running).
    pub capacity: usize,
}

/// Observer for one job's terminal state.
pub struct TerminalWaiter {
    rx: watch::Receiver<Option<JobStatus>>,
}

impl TerminalWaiter {
    /// Wait until the job reaches a terminal status.
    pub async fn wait(mut self) -> Option<JobStatus> {
        loop {
            if let Some(status) = *self.rx.borrow_and_update() {
                return Some(status);
            }
            if self.rx.changed().await.is_err() {
                return *self.rx.borrow();
            }
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    Queued,
    Running,
}

struct Slot {
    cancel: CancellationToken,
    terminal_tx: watch::Sender<Option<JobStatus>>,
    phase: Phase,
}

#[derive(Default)]
struct QueueState {
    slots: HashMap<JobId, Slot>,
    queued: usize,
    running: usize,
}

struct WorkItem {
    job_id: JobId,
    work: JobWork,
}

struct Shared {
    registry: Arc<JobRegistry>,
    files: Arc<FileManager>,
    events: Arc<dyn EventSink>,
    retention: Option<Duration>,
    capacity: usize,
    semaphore: Arc<Semaphore>,
    state: Mutex<QueueState>,
    accepting: AtomicBool,
    finished: AtomicU64,
    idle: Notify,
}

/// The bounded worker pool.
pub struct ExecutionQueue {
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<WorkItem>,
}

impl ExecutionQueue {
    /// Create the queue and spawn its workers.
    #[must_use]
    pub fn new(
        config: &ServiceConfig,
        registry: Arc<JobRegistry>,
        files: Arc<FileManager>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let shared = Arc::new(Shared {
            registry,
            files,
            events,
            retention: config.retention(),
            capacity: config.queue_capacity(),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_downloads)),
            state: Mutex::new(QueueState::default()),
            accepting: AtomicBool::new(true),
            finished: AtomicU64::new(0),
            idle: Notify::new(),
        });

        for worker in 0..config.worker_count.max(1) {
            let shared = Arc::clone(&shared);
            let rx = Arc::clone(&rx);
            tokio::spawn(async move {
                run_worker(worker, shared, rx).await;
            });
        }

        Self { shared, tx }
    }

    /// Submit a job's work function.
    ///
    /// The job must already exist in the registry with status `Queued`.
    /// Rejects with `QueueFull` once queued-plus-running hits the ceiling,
    /// and with `Conflict` after shutdown.
    pub fn submit(&self, job_id: JobId, work: JobWork) -> Result<TerminalWaiter, ServiceError> {
        if !self.shared.accepting.load(Ordering::SeqCst) {
            return Err(ServiceError::conflict("execution queue is shut down"));
        }

        let (terminal_tx, terminal_rx) = watch::channel(None);
        {
            let mut state = self.shared.lock_state();
            if state.queued + state.running >= self.shared.capacity {
                #[allow(clippy::cast_possible_truncation)]
                return Err(ServiceError::queue_full(self.shared.capacity as u32));
            }
            if state.slots.contains_key(&job_id) {
                return Err(ServiceError::conflict(format!(
                    "job {job_id} already submitted"
                )));
            }
            state.slots.insert(
                job_id.clone(),
                Slot {
                    cancel: CancellationToken::new(),
                    terminal_tx,
                    phase: Phase::Queued,
                },
            );
            state.queued += 1;
        }

        if self.tx.send(WorkItem { job_id: job_id.clone(), work }).is_err() {
            let mut state = self.shared.lock_state();
            if state.slots.remove(&job_id).is_some() {
                state.queued = state.queued.saturating_sub(1);
            }
            return Err(ServiceError::conflict("execution queue workers are gone"));
        }

        tracing::debug!(target: "fetchd.queue", id = %job_id, "Job submitted");
        Ok(TerminalWaiter { rx: terminal_rx })
    }

    /// Cancel a job.
    ///
    /// A queued job is committed `Cancelled` without ever running. A
    /// running job has its token flipped; the driver observes it at the
    /// next progress boundary. Returns `false` for unknown/terminal jobs.
    pub async fn cancel(&self, job_id: &JobId) -> bool {
        enum Action {
            CancelQueued(watch::Sender<Option<JobStatus>>),
            Signalled,
            Unknown,
        }

        let action = {
            let mut state = self.shared.lock_state();
            let phase = state.slots.get(job_id).map(|slot| slot.phase);
            match phase {
                Some(Phase::Queued) => match state.slots.remove(job_id) {
                    Some(slot) => {
                        state.queued = state.queued.saturating_sub(1);
                        // Flip the token so a worker that already holds
                        // the item drops it on pickup.
                        slot.cancel.cancel();
                        Action::CancelQueued(slot.terminal_tx)
                    }
                    None => Action::Unknown,
                },
                Some(Phase::Running) => {
                    if let Some(slot) = state.slots.get(job_id) {
                        slot.cancel.cancel();
                    }
                    Action::Signalled
                }
                None => Action::Unknown,
            }
        };

        match action {
            Action::CancelQueued(terminal_tx) => {
                self.shared.finish_queued_cancel(job_id).await;
                let _ = terminal_tx.send(Some(JobStatus::Cancelled));
                true
            }
            Action::Signalled => {
                tracing::info!(target: "fetchd.queue", id = %job_id, "Cancel signalled");
                true
            }
            Action::Unknown => false,
        }
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let state = self.shared.lock_state();
        QueueStats {
            queued: state.queued,
            running: state.running,
            finished: self.shared.finished.load(Ordering::Relaxed),
            capacity: self.shared.capacity,
        }
    }

    /// Whether the queue still accepts work.
    #[must_use]
    pub fn healthy(&self) -> bool {
        self.shared.accepting.load(Ordering::SeqCst) && !self.tx.is_closed()
    }

    /// Stop accepting work and wind down.
    ///
    /// With `wait`, active jobs get up to `grace` to finish before their
    /// tokens are cancelled; without it everything is cancelled at once.
    /// Queued jobs are cancelled in both modes.
    pub async fn shutdown(&self, wait: bool, grace: Duration) {
        self.shared.accepting.store(false, Ordering::SeqCst);

        // Queued jobs never start once shutdown begins.
        let queued_ids: Vec<JobId> = {
            let state = self.shared.lock_state();
            state
                .slots
                .iter()
                .filter(|(_, slot)| slot.phase == Phase::Queued)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in queued_ids {
            self.cancel(&id).await;
        }

        if wait {
            let deadline = tokio::time::Instant::now() + grace;
            loop {
                if self.shared.lock_state().running == 0 {
                    return;
                }
                if tokio::time::timeout_at(deadline, self.shared.idle.notified())
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }

        // Force out whatever is left.
        let state = self.shared.lock_state();
        for slot in state.slots.values() {
            slot.cancel.cancel();
        }
    }
}

impl Shared {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Registry/webhook bookkeeping for a job cancelled while queued.
    async fn finish_queued_cancel(&self, job_id: &JobId) {
        let record = match self.registry.commit_failed(job_id, &ServiceError::Cancelled) {
            Ok(record) => record,
            Err(e) => {
                tracing::debug!(
                    target: "fetchd.queue",
                    id = %job_id,
                    error = %e,
                    "Queued cancel lost a commit race"
                );
                return;
            }
        };
        tracing::info!(target: "fetchd.queue", id = %job_id, "Cancelled before running");

        if let Some(url) = &record.options.webhook_url {
            let event = WebhookEvent::failed(job_id.clone(), "cancelled", "Cancelled");
            self.events.lifecycle(url, event).await;
        }
        self.events.release(job_id);
        self.finished.fetch_add(1, Ordering::Relaxed);
        self.idle.notify_waiters();
    }
}

/// Worker loop: pull items, respect the concurrency semaphore, run the
/// work, commit the outcome.
async fn run_worker(
    index: usize,
    shared: Arc<Shared>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<WorkItem>>>,
) {
    tracing::debug!(target: "fetchd.queue", worker = index, "Worker started");
    loop {
        let item = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(item) = item else {
            // Channel closed: the queue handle is gone.
            break;
        };
        process_item(&shared, item).await;
    }
    tracing::debug!(target: "fetchd.queue", worker = index, "Worker stopped");
}

async fn process_item(shared: &Arc<Shared>, item: WorkItem) {
    let WorkItem { job_id, work } = item;

    // The slot vanishes when the job was cancelled while queued.
    let Some(cancel) = ({
        let state = shared.lock_state();
        state.slots.get(&job_id).map(|slot| slot.cancel.clone())
    }) else {
        return;
    };

    // Respect the concurrency cap; a cancel while waiting skips the run.
    let permit = tokio::select! {
        biased;

        () = cancel.cancelled() => {
            let removed = {
                let mut state = shared.lock_state();
                state.slots.remove(&job_id).map(|slot| {
                    state.queued = state.queued.saturating_sub(1);
                    slot
                })
            };
            if let Some(slot) = removed {
                shared.finish_queued_cancel(&job_id).await;
                let _ = slot.terminal_tx.send(Some(JobStatus::Cancelled));
            }
            return;
        }

        permit = Arc::clone(&shared.semaphore).acquire_owned() => {
            match permit {
                Ok(permit) => permit,
                Err(_) => return,
            }
        }
    };

    // Pick up: queued -> running.
    {
        let mut state = shared.lock_state();
        let Some(slot) = state.slots.get_mut(&job_id) else {
            return;
        };
        slot.phase = Phase::Running;
        state.queued = state.queued.saturating_sub(1);
        state.running += 1;
    }

    let record = match shared.registry.set_status(&job_id, JobStatus::Running) {
        Ok(record) => record,
        Err(e) => {
            // Lost a race with an external transition; drop the slot.
            tracing::debug!(target: "fetchd.queue", id = %job_id, error = %e, "Pickup aborted");
            let terminal = shared
                .registry
                .get(&job_id)
                .map_or(JobStatus::Cancelled, |r| r.status);
            finish_slot(shared, &job_id, terminal);
            drop(permit);
            return;
        }
    };
    tracing::info!(target: "fetchd.queue", id = %job_id, "Job running");

    let webhook_url = record.options.webhook_url.clone();
    if let Some(url) = &webhook_url {
        let event = WebhookEvent::started(job_id.clone(), record.url.clone());
        shared.events.lifecycle(url, event).await;
    }

    let result = work(cancel).await;

    let terminal = match result {
        Ok(artifact) => commit_success(shared, &job_id, webhook_url.as_deref(), artifact).await,
        Err(error) => commit_failure(shared, &job_id, webhook_url.as_deref(), &error).await,
    };

    shared.events.release(&job_id);
    finish_slot(shared, &job_id, terminal);
    drop(permit);
}

async fn commit_success(
    shared: &Arc<Shared>,
    job_id: &JobId,
    webhook_url: Option<&str>,
    artifact: Artifact,
) -> JobStatus {
    match shared.registry.commit_completed(job_id, artifact.clone()) {
        Ok(_) => {
            tracing::info!(
                target: "fetchd.queue",
                id = %job_id,
                file = %artifact.filename,
                size = artifact.size_bytes,
                "Job completed"
            );
            if let Some(retention) = shared.retention {
                match shared.files.schedule_deletion(&artifact.path, retention) {
                    Ok((task, fire_at)) => {
                        tracing::debug!(
                            target: "fetchd.queue",
                            id = %job_id,
                            task = %task,
                            fire_at = %fire_at,
                            "Retention scheduled"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(
                            target: "fetchd.queue",
                            id = %job_id,
                            error = %e,
                            "Could not schedule retention"
                        );
                    }
                }
            }
            if let Some(url) = webhook_url {
                let event = WebhookEvent::completed(job_id.clone(), &artifact);
                shared.events.lifecycle(url, event).await;
            }
            JobStatus::Completed
        }
        Err(e) => {
            // The job went terminal under us (tight cancel race); the
            // committed state wins.
            tracing::debug!(target: "fetchd.queue", id = %job_id, error = %e, "Completion lost race");
            shared
                .registry
                .get(job_id)
                .map_or(JobStatus::Failed, |r| r.status)
        }
    }
}

async fn commit_failure(
    shared: &Arc<Shared>,
    job_id: &JobId,
    webhook_url: Option<&str>,
    error: &ServiceError,
) -> JobStatus {
    let terminal = match shared.registry.commit_failed(job_id, error) {
        Ok(record) => {
            if error.is_cancelled() {
                tracing::info!(target: "fetchd.queue", id = %job_id, "Job cancelled");
                // Partial output of a cancelled job is deleted eagerly.
                shared.files.remove_workdir(job_id.as_str());
            } else {
                tracing::warn!(target: "fetchd.queue", id = %job_id, error = %error, "Job failed");
            }
            record.status
        }
        Err(e) => {
            tracing::debug!(target: "fetchd.queue", id = %job_id, error = %e, "Failure lost race");
            shared
                .registry
                .get(job_id)
                .map_or(JobStatus::Failed, |r| r.status)
        }
    };

    if let Some(url) = webhook_url {
        let event = WebhookEvent::failed(job_id.clone(), error.kind(), error.to_string());
        shared.events.lifecycle(url, event).await;
    }
    terminal
}

fn finish_slot(shared: &Arc<Shared>, job_id: &JobId, terminal: JobStatus) {
    let mut state = shared.lock_state();
    if let Some(slot) = state.slots.remove(job_id) {
        if slot.phase == Phase::Running {
            state.running = state.running.saturating_sub(1);
        } else {
            state.queued = state.queued.saturating_sub(1);
        }
        let _ = slot.terminal_tx.send(Some(terminal));
    }
    drop(state);
    shared.finished.fetch_add(1, Ordering::Relaxed);
    shared.idle.notify_waiters();
}
