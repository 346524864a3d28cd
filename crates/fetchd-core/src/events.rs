//! Webhook event payloads and the wire envelope.
//!
//! Events are built close to where state changes happen and serialized
//! exactly once by the dispatcher; the signature covers the same bytes
//! that go on the wire.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{Artifact, JobId};

/// Kind of a lifecycle event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Started,
    Progress,
    Completed,
    Failed,
}

impl EventKind {
    /// The dotted wire name, e.g. `download.started`.
    #[must_use]
    pub const fn wire_name(&self) -> &'static str {
        match self {
            Self::Started => "download.started",
            Self::Progress => "download.progress",
            Self::Completed => "download.completed",
            Self::Failed => "download.failed",
        }
    }

    /// Whether this kind marks the end of a job's event stream.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Kind-specific payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventData {
    Started {
        /// The URL being downloaded.
        url: String,
    },
    Progress {
        /// Percent complete, 0.0..=100.0.
        percent: f64,
        /// Bytes downloaded so far.
        downloaded_bytes: u64,
        /// Total bytes, if known.
        #[serde(skip_serializing_if = "Option::is_none")]
        total_bytes: Option<u64>,
        /// Current speed in bytes per second.
        #[serde(skip_serializing_if = "Option::is_none")]
        speed_bps: Option<f64>,
        /// Estimated seconds remaining.
        #[serde(skip_serializing_if = "Option::is_none")]
        eta_seconds: Option<f64>,
        /// Monotone per-job sequence; throttled receivers can order what
        /// survives the rate cap.
        sequence: u64,
    },
    Completed {
        /// Final filename.
        filename: String,
        /// Artifact size in bytes.
        size_bytes: u64,
        /// Public URL, when public serving is configured.
        #[serde(skip_serializing_if = "Option::is_none")]
        public_url: Option<String>,
        /// Extracted media title.
        #[serde(skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        /// Uploader/channel name.
        #[serde(skip_serializing_if = "Option::is_none")]
        uploader: Option<String>,
        /// Duration in seconds.
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_secs: Option<f64>,
    },
    Failed {
        /// Stable error kind string. Cancelled jobs report `cancelled`.
        error_kind: String,
        /// Human-readable message.
        message: String,
    },
}

/// One webhook event, ready for envelope serialization.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    /// Event kind.
    pub kind: EventKind,
    /// The job this event belongs to.
    pub job_id: JobId,
    /// Event creation time.
    pub timestamp: DateTime<Utc>,
    /// Kind-specific payload.
    pub data: EventData,
}

impl WebhookEvent {
    /// Build a `download.started` event.
    #[must_use]
    pub fn started(job_id: JobId, url: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Started,
            job_id,
            timestamp: Utc::now(),
            data: EventData::Started { url: url.into() },
        }
    }

    /// Build a `download.progress` event.
    #[must_use]
    pub fn progress(job_id: JobId, progress: &crate::job::JobProgress, sequence: u64) -> Self {
        Self {
            kind: EventKind::Progress,
            job_id,
            timestamp: Utc::now(),
            data: EventData::Progress {
                percent: progress.percent,
                downloaded_bytes: progress.downloaded_bytes,
                total_bytes: progress.total_bytes,
                speed_bps: progress.speed_bps,
                eta_seconds: progress.eta_seconds,
                sequence,
            },
        }
    }

    /// Build a `download.completed` event from the committed artifact.
    #[must_use]
    pub fn completed(job_id: JobId, artifact: &Artifact) -> Self {
        Self {
            kind: EventKind::Completed,
            job_id,
            timestamp: Utc::now(),
            data: EventData::Completed {
                filename: artifact.filename.clone(),
                size_bytes: artifact.size_bytes,
                public_url: artifact.public_url.clone(),
                title: artifact.title.clone(),
                uploader: artifact.uploader.clone(),
                duration_secs: artifact.duration_secs,
            },
        }
    }

    /// Build a `download.failed` event.
    ///
    /// Cancelled jobs also end their stream with this kind; the
    /// `error_kind` field carries `cancelled` so receivers can tell the
    /// two apart.
    #[must_use]
    pub fn failed(job_id: JobId, error_kind: &str, message: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Failed,
            job_id,
            timestamp: Utc::now(),
            data: EventData::Failed {
                error_kind: error_kind.to_string(),
                message: message.into(),
            },
        }
    }

    /// The wire envelope: `{event, timestamp, request_id, data}`.
    #[must_use]
    pub fn envelope(&self) -> serde_json::Value {
        serde_json::json!({
            "event": self.kind.wire_name(),
            "timestamp": self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            "request_id": self.job_id.as_str(),
            "data": self.data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobProgress;

    #[test]
    fn wire_names() {
        assert_eq!(EventKind::Started.wire_name(), "download.started");
        assert_eq!(EventKind::Progress.wire_name(), "download.progress");
        assert_eq!(EventKind::Completed.wire_name(), "download.completed");
        assert_eq!(EventKind::Failed.wire_name(), "download.failed");
        assert!(EventKind::Completed.is_terminal());
        assert!(!EventKind::Progress.is_terminal());
    }

    #[test]
    fn envelope_shape() {
        let mut progress = JobProgress::default();
        progress.apply(&crate::job::ProgressFrame {
            downloaded_bytes: 512,
            total_bytes: Some(1024),
            ..Default::default()
        });

        let event = WebhookEvent::progress(JobId::new("j1"), &progress, 3);
        let envelope = event.envelope();

        assert_eq!(envelope["event"], "download.progress");
        assert_eq!(envelope["request_id"], "j1");
        assert_eq!(envelope["data"]["downloaded_bytes"], 512);
        assert_eq!(envelope["data"]["sequence"], 3);
        // RFC3339 with trailing Z
        let ts = envelope["timestamp"].as_str().unwrap();
        assert!(ts.ends_with('Z'), "timestamp should be Zulu: {ts}");
    }

    #[test]
    fn cancelled_jobs_report_failed_kind_with_cancelled_payload() {
        let event = WebhookEvent::failed(JobId::new("j2"), "cancelled", "Cancelled");
        assert_eq!(event.kind, EventKind::Failed);
        match &event.data {
            EventData::Failed { error_kind, .. } => assert_eq!(error_kind, "cancelled"),
            other => panic!("unexpected payload {other:?}"),
        }
    }
}
