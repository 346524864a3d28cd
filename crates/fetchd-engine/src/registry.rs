//! In-memory job registry.
//!
//! The registry is the single writable shared structure of the execution
//! plane. Every read and write goes through one mutex; mutators run with
//! the lock held and must not perform I/O. Callers get value snapshots,
//! never references into the map.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;

use fetchd_core::error::ServiceError;
use fetchd_core::job::{
    Artifact, JobFailure, JobId, JobProgress, JobRecord, JobStatus, LogLevel, ProgressFrame,
};
use fetchd_core::options::DownloadOptions;

/// Filter for [`JobRegistry::list`].
#[derive(Clone, Debug, Default)]
pub struct JobFilter {
    /// Keep only jobs with this status.
    pub status: Option<JobStatus>,
    /// Keep only children of this batch.
    pub batch_id: Option<fetchd_core::batch::BatchId>,
    /// Cap the snapshot size. 0 means unbounded.
    pub limit: usize,
}

/// Counts per status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl RegistryStats {
    /// Total records held.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.queued + self.running + self.completed + self.failed + self.cancelled
    }
}

#[derive(Default)]
struct RegistryState {
    jobs: HashMap<JobId, JobRecord>,
    /// Creation order, for stable listing.
    order: Vec<JobId>,
}

/// Thread-safe store of every job's lifecycle record.
#[derive(Default)]
pub struct JobRegistry {
    state: Mutex<RegistryState>,
}

impl JobRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a job record. Fails with `Conflict` on a duplicate id.
    pub fn create(
        &self,
        id: JobId,
        url: impl Into<String>,
        options: DownloadOptions,
    ) -> Result<JobRecord, ServiceError> {
        let record = JobRecord::new(id.clone(), url, options);
        let mut state = self.lock();
        if state.jobs.contains_key(&id) {
            return Err(ServiceError::conflict(format!("job {id} already exists")));
        }
        state.jobs.insert(id.clone(), record.clone());
        state.order.push(id);
        Ok(record)
    }

    /// Snapshot a record. Fails with `NotFound` on an unknown id.
    pub fn get(&self, id: &JobId) -> Result<JobRecord, ServiceError> {
        self.lock()
            .jobs
            .get(id)
            .cloned()
            .ok_or_else(|| ServiceError::not_found(format!("job {id}")))
    }

    /// Atomic read-modify-write under the registry lock.
    ///
    /// The mutator must not perform I/O or block; it runs with the lock
    /// held. Returns the post-mutation snapshot.
    pub fn update<F>(&self, id: &JobId, mutate: F) -> Result<JobRecord, ServiceError>
    where
        F: FnOnce(&mut JobRecord),
    {
        let mut state = self.lock();
        let record = state
            .jobs
            .get_mut(id)
            .ok_or_else(|| ServiceError::not_found(format!("job {id}")))?;
        mutate(record);
        Ok(record.clone())
    }

    /// Transition a job's status, enforcing the status DAG.
    ///
    /// Illegal transitions fail with `Conflict` and leave the record
    /// untouched. Started/completed timestamps are stamped here so they
    /// cannot drift from the status they describe.
    pub fn set_status(&self, id: &JobId, next: JobStatus) -> Result<JobRecord, ServiceError> {
        let mut state = self.lock();
        let record = state
            .jobs
            .get_mut(id)
            .ok_or_else(|| ServiceError::not_found(format!("job {id}")))?;

        if !record.status.can_transition_to(next) {
            return Err(ServiceError::conflict(format!(
                "job {id} cannot go {} -> {}",
                record.status, next
            )));
        }

        record.status = next;
        let now = Utc::now();
        match next {
            JobStatus::Running => record.started_at = Some(now),
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => {
                record.completed_at = Some(now);
            }
            JobStatus::Queued => {}
        }
        Ok(record.clone())
    }

    /// Commit a completed job together with its artifact.
    ///
    /// Keeping the two in one critical section preserves the invariant
    /// that a completed job always has an artifact.
    pub fn commit_completed(
        &self,
        id: &JobId,
        artifact: Artifact,
    ) -> Result<JobRecord, ServiceError> {
        let mut state = self.lock();
        let record = state
            .jobs
            .get_mut(id)
            .ok_or_else(|| ServiceError::not_found(format!("job {id}")))?;

        if !record.status.can_transition_to(JobStatus::Completed) {
            return Err(ServiceError::conflict(format!(
                "job {id} cannot complete from {}",
                record.status
            )));
        }

        record.progress.finish(artifact.size_bytes);
        record.status = JobStatus::Completed;
        record.artifact = Some(artifact);
        record.failure = None;
        record.completed_at = Some(Utc::now());
        Ok(record.clone())
    }

    /// Commit a failed or cancelled job.
    ///
    /// `ServiceError::Cancelled` lands the job in `Cancelled`; everything
    /// else in `Failed`. No artifact survives either way.
    pub fn commit_failed(&self, id: &JobId, error: &ServiceError) -> Result<JobRecord, ServiceError> {
        let terminal = if error.is_cancelled() {
            JobStatus::Cancelled
        } else {
            JobStatus::Failed
        };

        let mut state = self.lock();
        let record = state
            .jobs
            .get_mut(id)
            .ok_or_else(|| ServiceError::not_found(format!("job {id}")))?;

        if !record.status.can_transition_to(terminal) {
            return Err(ServiceError::conflict(format!(
                "job {id} cannot go {} -> {terminal}",
                record.status
            )));
        }

        record.status = terminal;
        record.artifact = None;
        record.failure = Some(JobFailure::from_error(error));
        record.completed_at = Some(Utc::now());
        Ok(record.clone())
    }

    /// Fold a progress frame into a job, stamping the update time.
    ///
    /// Returns the cumulative progress after the frame.
    pub fn update_progress(
        &self,
        id: &JobId,
        frame: &ProgressFrame,
    ) -> Result<JobProgress, ServiceError> {
        let mut state = self.lock();
        let record = state
            .jobs
            .get_mut(id)
            .ok_or_else(|| ServiceError::not_found(format!("job {id}")))?;
        record.progress.apply(frame);
        Ok(record.progress.clone())
    }

    /// Append a line to a job's bounded log.
    pub fn append_log(
        &self,
        id: &JobId,
        level: LogLevel,
        message: impl Into<String>,
    ) -> Result<(), ServiceError> {
        let mut state = self.lock();
        let record = state
            .jobs
            .get_mut(id)
            .ok_or_else(|| ServiceError::not_found(format!("job {id}")))?;
        record.log.push(level, message);
        Ok(())
    }

    /// Snapshot records in creation order, applying the filter.
    #[must_use]
    pub fn list(&self, filter: &JobFilter) -> Vec<JobRecord> {
        let state = self.lock();
        let mut out = Vec::new();
        for id in &state.order {
            let Some(record) = state.jobs.get(id) else {
                continue;
            };
            if filter.status.is_some_and(|s| record.status != s) {
                continue;
            }
            if filter
                .batch_id
                .as_ref()
                .is_some_and(|b| record.batch_id.as_ref() != Some(b))
            {
                continue;
            }
            out.push(record.clone());
            if filter.limit > 0 && out.len() == filter.limit {
                break;
            }
        }
        out
    }

    /// Counts per status.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let state = self.lock();
        let mut stats = RegistryStats::default();
        for record in state.jobs.values() {
            match record.status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Remove a record outright.
    pub fn remove(&self, id: &JobId) -> Result<(), ServiceError> {
        let mut state = self.lock();
        if state.jobs.remove(id).is_none() {
            return Err(ServiceError::not_found(format!("job {id}")));
        }
        state.order.retain(|other| other != id);
        Ok(())
    }

    /// Evict terminal records older than `older_than`. Returns the count.
    pub fn reap_terminal(&self, older_than: chrono::Duration) -> usize {
        let cutoff = Utc::now() - older_than;
        let mut state = self.lock();
        let doomed: Vec<JobId> = state
            .jobs
            .values()
            .filter(|r| r.status.is_terminal() && r.completed_at.is_some_and(|t| t < cutoff))
            .map(|r| r.id.clone())
            .collect();
        for id in &doomed {
            state.jobs.remove(id);
        }
        state.order.retain(|id| !doomed.contains(id));
        doomed.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
