//! Scheduled artifact deletion.
//!
//! A single background worker consumes a deadline min-heap. Cancellation
//! tombstones a task instead of digging it out of the heap; the worker
//! discards tombstoned entries when they surface.
//!
//! Deletion is best-effort by contract: a file that is already gone counts
//! as success, and any other I/O failure is logged and terminal for that
//! task. Nothing here ever propagates a deletion failure to a caller.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use fetchd_core::error::ServiceError;

/// Identifier of one scheduled deletion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeletionTaskId(u64);

impl std::fmt::Display for DeletionTaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "del-{}", self.0)
    }
}

/// One heap entry. Ordered by deadline, ties broken by id so ordering is
/// total and FIFO among equal deadlines.
#[derive(Debug)]
struct Entry {
    fire_at: tokio::time::Instant,
    id: u64,
    path: PathBuf,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap, we want the earliest deadline
        // on top.
        other
            .fire_at
            .cmp(&self.fire_at)
            .then_with(|| other.id.cmp(&self.id))
    }
}

#[derive(Debug, Default)]
struct ReaperState {
    heap: BinaryHeap<Entry>,
    /// Ids scheduled and not yet executed or cancelled.
    pending: HashSet<u64>,
    /// Cancelled ids still sitting in the heap.
    tombstones: HashSet<u64>,
    next_id: u64,
    closed: bool,
}

impl ReaperState {
    /// Deadline of the earliest live entry, discarding surfaced tombstones.
    fn next_deadline(&mut self) -> Option<tokio::time::Instant> {
        while let Some(entry) = self.heap.peek() {
            if self.tombstones.remove(&entry.id) {
                self.heap.pop();
                continue;
            }
            return Some(entry.fire_at);
        }
        None
    }

    /// Pop every live entry due at `now`.
    fn take_due(&mut self, now: tokio::time::Instant) -> Vec<Entry> {
        let mut due = Vec::new();
        while let Some(head) = self.heap.peek() {
            if self.tombstones.remove(&head.id) {
                self.heap.pop();
                continue;
            }
            if head.fire_at > now {
                break;
            }
            let Some(entry) = self.heap.pop() else { break };
            self.pending.remove(&entry.id);
            due.push(entry);
        }
        due
    }
}

/// The deletion scheduler.
///
/// Must be created inside a tokio runtime; `new` spawns the worker task.
pub struct DeletionScheduler {
    state: Arc<Mutex<ReaperState>>,
    notify: Arc<Notify>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DeletionScheduler {
    /// Create the scheduler and spawn its worker.
    #[must_use]
    pub fn new() -> Self {
        let state = Arc::new(Mutex::new(ReaperState::default()));
        let notify = Arc::new(Notify::new());

        let worker = tokio::spawn(run_worker(Arc::clone(&state), Arc::clone(&notify)));

        Self {
            state,
            notify,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Schedule `path` for deletion after `delay`.
    ///
    /// Returns the task id and the wall-clock firing time.
    pub fn schedule(
        &self,
        path: impl AsRef<Path>,
        delay: Duration,
    ) -> Result<(DeletionTaskId, DateTime<Utc>), ServiceError> {
        let fire_at = tokio::time::Instant::now() + delay;
        let fire_at_wall = Utc::now()
            + chrono::Duration::from_std(delay)
                .map_err(|e| ServiceError::validation(format!("retention delay: {e}")))?;

        let id = {
            let mut state = self.lock_state();
            if state.closed {
                return Err(ServiceError::conflict("deletion scheduler is shut down"));
            }
            let id = state.next_id;
            state.next_id += 1;
            state.pending.insert(id);
            state.heap.push(Entry {
                fire_at,
                id,
                path: path.as_ref().to_path_buf(),
            });
            id
        };

        tracing::debug!(
            target: "fetchd.reaper",
            task = %DeletionTaskId(id),
            path = %path.as_ref().display(),
            delay_secs = delay.as_secs_f64(),
            "Deletion scheduled"
        );
        self.notify.notify_one();
        Ok((DeletionTaskId(id), fire_at_wall))
    }

    /// Cancel a scheduled deletion.
    ///
    /// Returns `true` if the task was still pending. The heap entry stays
    /// where it is and is skipped when it surfaces.
    pub fn cancel(&self, task: DeletionTaskId) -> bool {
        let mut state = self.lock_state();
        if state.pending.remove(&task.0) {
            state.tombstones.insert(task.0);
            tracing::debug!(target: "fetchd.reaper", task = %task, "Deletion cancelled");
            true
        } else {
            false
        }
    }

    /// Number of tasks scheduled and not yet executed or cancelled.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.lock_state().pending.len()
    }

    /// Stop the worker.
    ///
    /// With `drain = true`, tasks that have not fired yet are executed
    /// immediately in deadline order; otherwise they are discarded.
    pub async fn shutdown(&self, drain: bool) {
        let remaining = {
            let mut state = self.lock_state();
            state.closed = true;
            let mut entries = std::mem::take(&mut state.heap).into_vec();
            entries.retain(|e| !state.tombstones.contains(&e.id));
            state.pending.clear();
            state.tombstones.clear();
            // Entry's Ord is reversed for the max-heap; sort ascending by
            // deadline explicitly.
            entries.sort_by(|a, b| a.fire_at.cmp(&b.fire_at).then(a.id.cmp(&b.id)));
            entries
        };

        // notify_one stores a permit, so the worker cannot miss the
        // wakeup even if it is between loop iterations right now.
        self.notify.notify_one();
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        if drain {
            for entry in remaining {
                delete_file(&entry.path).await;
            }
        } else if !remaining.is_empty() {
            tracing::debug!(
                target: "fetchd.reaper",
                discarded = remaining.len(),
                "Shutdown discarded pending deletions"
            );
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ReaperState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for DeletionScheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// The worker loop: sleep until the earliest deadline or a new-task
/// signal, then delete whatever is due.
async fn run_worker(state: Arc<Mutex<ReaperState>>, notify: Arc<Notify>) {
    loop {
        let next = {
            let mut state = state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if state.closed {
                return;
            }
            state.next_deadline()
        };

        tokio::select! {
            () = notify.notified() => {
                // New task, cancellation, or shutdown; recompute.
            }

            () = async {
                match next {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            } => {
                let due = {
                    let mut state = state
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    state.take_due(tokio::time::Instant::now())
                };
                for entry in due {
                    delete_file(&entry.path).await;
                }
            }
        }
    }
}

/// Best-effort file deletion. Missing file is success; anything else is
/// logged and swallowed.
async fn delete_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            tracing::debug!(target: "fetchd.reaper", path = %path.display(), "Deleted artifact");
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(target: "fetchd.reaper", path = %path.display(), "Already gone");
        }
        Err(e) => {
            tracing::warn!(
                target: "fetchd.reaper",
                path = %path.display(),
                error = %e,
                "Failed to delete artifact"
            );
        }
    }
}
