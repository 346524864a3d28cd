//! Core domain types and port definitions for fetchd.
//!
//! Everything in this crate is value-shaped and I/O-free: job and batch
//! records, the typed option set, webhook event payloads, remote-listing
//! filters, the error taxonomy, and the ports the engine drives its
//! collaborators through.

pub mod batch;
pub mod config;
pub mod error;
pub mod events;
pub mod job;
pub mod listing;
pub mod options;
pub mod ports;

pub use batch::{BatchId, BatchRecord, BatchStatus, BatchSummary};
pub use config::ServiceConfig;
pub use error::{ServiceError, ServiceResult};
pub use events::{EventData, EventKind, WebhookEvent};
pub use job::{
    Artifact, JobFailure, JobId, JobLog, JobOrigin, JobProgress, JobRecord, JobStatus, LogEntry,
    LogLevel, ProgressFrame,
};
pub use listing::{ListingFilter, ListingSort, PlaylistSelection, RemoteEntry};
pub use options::{Container, DownloadOptions, QualityPreset, SubtitlePolicy};
pub use ports::{
    Downloader, EventSink, FetchRequest, FetchedMedia, LogSink, NullSink, ProgressSink,
    null_log_sink,
};
