//! Progress protocol parsing.
//!
//! The downloader is asked to print one JSON object per line on stdout.
//! Each line maps 1:1 to a [`ProtocolEvent`] variant.
//!
//! # Protocol Schema
//!
//! All messages are JSON objects with a required `status` field:
//!
//! ```json
//! {"status": "downloading", "downloaded_bytes": 123456, "total_bytes": 789012, "speed": 5000.0, "eta": 133}
//! {"status": "finished", "filename": "video.mp4", "downloaded_bytes": 789012}
//! {"status": "error", "message": "HTTP Error 403"}
//! ```
//!
//! Anything that is not valid protocol JSON is treated as plain output and
//! routed to the job log by the caller.

use serde::Deserialize;
use thiserror::Error;

use fetchd_core::job::ProgressFrame;

/// Errors that can occur when parsing protocol messages.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Missing or invalid 'status' field")]
    InvalidStatus,

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Unknown status: {0}")]
    UnknownStatus(String),
}

/// Events emitted by the downloader's progress stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    /// Transfer in progress.
    Downloading(ProgressFrame),

    /// One file finished writing.
    Finished {
        /// The finished file, if reported.
        filename: Option<String>,
        /// Final byte count, if reported.
        downloaded_bytes: Option<u64>,
    },

    /// The downloader reported an error mid-stream.
    Error {
        /// Human-readable error message.
        message: String,
    },
}

/// Raw JSON envelope for parsing.
#[derive(Deserialize)]
struct RawEnvelope {
    status: Option<String>,
    // Progress fields
    downloaded_bytes: Option<u64>,
    total_bytes: Option<u64>,
    total_bytes_estimate: Option<f64>,
    speed: Option<f64>,
    eta: Option<f64>,
    filename: Option<String>,
    // Error fields
    message: Option<String>,
}

/// Parse a single stdout line into a [`ProtocolEvent`].
pub fn parse_line(line: &str) -> Result<ProtocolEvent, ProtocolError> {
    let envelope: RawEnvelope = serde_json::from_str(line)?;

    let status = envelope.status.ok_or(ProtocolError::InvalidStatus)?;

    match status.as_str() {
        "downloading" => {
            let downloaded_bytes = envelope
                .downloaded_bytes
                .ok_or(ProtocolError::MissingField("downloaded_bytes"))?;

            // Exact total wins over the estimate.
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let total_bytes = envelope.total_bytes.or_else(|| {
                envelope
                    .total_bytes_estimate
                    .filter(|est| est.is_finite() && *est >= 0.0)
                    .map(|est| est as u64)
            });

            Ok(ProtocolEvent::Downloading(ProgressFrame {
                downloaded_bytes,
                total_bytes,
                speed_bps: envelope.speed,
                eta_seconds: envelope.eta,
                filename: envelope.filename,
            }))
        }

        "finished" => Ok(ProtocolEvent::Finished {
            filename: envelope.filename,
            downloaded_bytes: envelope.downloaded_bytes,
        }),

        "error" => {
            let message = envelope
                .message
                .ok_or(ProtocolError::MissingField("message"))?;
            Ok(ProtocolEvent::Error { message })
        }

        other => Err(ProtocolError::UnknownStatus(other.to_string())),
    }
}
