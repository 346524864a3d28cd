//! Batch domain types.
//!
//! A batch is an ordered set of jobs submitted together. The batch record
//! holds only ids and aggregate state; the child lifecycle records live in
//! the job registry.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::JobId;

/// Canonical identifier for a batch.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(String);

impl BatchId {
    /// Wrap an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mint a fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Borrow the raw id string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for BatchId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

/// Aggregate status of a batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// At least one child has not reached a terminal status.
    Running,
    /// All children terminal and no failure forced the batch down.
    ///
    /// With `stop_on_error` unset this includes batches with failed
    /// children; the summary carries the per-outcome counts.
    Completed,
    /// A child failed while `stop_on_error` was set, or the batch was
    /// cancelled outright.
    Failed,
}

impl BatchStatus {
    /// Convert to the stable string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-outcome child counts of a finished (or finishing) batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    /// Children that completed with an artifact.
    pub completed: usize,
    /// Children that failed.
    pub failed: usize,
    /// Children cancelled before or during execution.
    pub cancelled: usize,
}

impl BatchSummary {
    /// Total accounted children.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.completed + self.failed + self.cancelled
    }

    /// Render the "3 succeeded, 1 failed, 0 cancelled" summary line.
    #[must_use]
    pub fn describe(&self) -> String {
        format!(
            "{} succeeded, {} failed, {} cancelled",
            self.completed, self.failed, self.cancelled
        )
    }
}

/// Limits on batch shape, enforced at creation.
pub const MIN_BATCH_CONCURRENCY: usize = 1;
/// Upper bound on per-batch parallelism.
pub const MAX_BATCH_CONCURRENCY: usize = 10;

/// The lifecycle record of one batch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchRecord {
    /// Unique id.
    pub id: BatchId,
    /// Ordered, deduplicated child job ids.
    pub child_ids: Vec<JobId>,
    /// Aggregate status.
    pub status: BatchStatus,
    /// Per-outcome counts, populated as children finish.
    pub summary: BatchSummary,
    /// Human-readable outcome line, set when the batch finishes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Per-batch concurrency cap.
    pub concurrency: usize,
    /// Whether the first failed child stops the rest of the batch.
    pub stop_on_error: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When the first child was handed to the queue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When every child reached a terminal status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl BatchRecord {
    /// Create a fresh running record.
    #[must_use]
    pub fn new(id: BatchId, child_ids: Vec<JobId>, concurrency: usize, stop_on_error: bool) -> Self {
        Self {
            id,
            child_ids,
            status: BatchStatus::Running,
            summary: BatchSummary::default(),
            message: None,
            concurrency,
            stop_on_error,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Whether every child has been accounted for.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self.status, BatchStatus::Running)
    }

    /// Derive the terminal status from the summary and the stop flag.
    #[must_use]
    pub const fn derive_terminal_status(&self) -> BatchStatus {
        if self.summary.failed > 0 && self.stop_on_error {
            BatchStatus::Failed
        } else {
            BatchStatus::Completed
        }
    }
}
