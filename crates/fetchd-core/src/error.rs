//! Service error taxonomy.
//!
//! These errors are designed to be serializable and not depend on external
//! error types like `std::io::Error`. For I/O errors, we capture the
//! message as a string under the `StorageError` kind.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type shared by every component of the execution plane.
///
/// Each variant corresponds to one error kind of the service contract, so
/// an HTTP layer can map a `ServiceError` to a response status without
/// inspecting messages.
#[derive(Clone, Debug, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServiceError {
    /// Request payload failed validation (bad option set, empty batch, ...).
    #[error("Validation failed: {message}")]
    ValidationFailed {
        /// What was rejected and why.
        message: String,
    },

    /// A referenced record (job, batch, deletion task) does not exist.
    #[error("Not found: {what}")]
    NotFound {
        /// Identifier or description of the missing record.
        what: String,
    },

    /// The operation conflicts with current state (duplicate id, illegal
    /// status transition, API use after shutdown).
    #[error("Conflict: {message}")]
    Conflict {
        /// Detailed error message.
        message: String,
    },

    /// The remote platform demanded credentials the job does not have.
    #[error("Authentication failed: {message}")]
    AuthenticationFailed {
        /// Detailed error message.
        message: String,
    },

    /// The remote platform throttled us.
    #[error("Rate limited: {message}")]
    RateLimited {
        /// Detailed error message.
        message: String,
    },

    /// The execution queue refused a submission at capacity.
    #[error("Queue full: {capacity} jobs already waiting or running")]
    QueueFull {
        /// The submission cap that was hit.
        capacity: u32,
    },

    /// A wall-clock or progress-stall deadline expired.
    #[error("Timed out: {message}")]
    Timeout {
        /// Which deadline expired.
        message: String,
    },

    /// The job was cancelled before it could finish.
    #[error("Cancelled")]
    Cancelled,

    /// The submitted URL is not something the downloader can work with.
    #[error("Invalid URL: {url}")]
    InvalidUrl {
        /// The offending URL.
        url: String,
    },

    /// The URL is well-formed but the hosting platform is not supported.
    #[error("Unsupported platform: {message}")]
    UnsupportedPlatform {
        /// Detailed error message.
        message: String,
    },

    /// The media exceeds the configured size ceiling.
    #[error("Size limit exceeded: {message}")]
    SizeLimitExceeded {
        /// Detailed error message.
        message: String,
    },

    /// Metadata extraction failed before any media was transferred.
    #[error("Metadata extraction failed: {message}")]
    MetadataError {
        /// Detailed error message.
        message: String,
    },

    /// The download itself failed (downloader exit status, bad output, ...).
    #[error("Download failed: {message}")]
    DownloadError {
        /// Detailed error message.
        message: String,
    },

    /// Storage-layer failure, including path-traversal rejections.
    #[error("Storage error: {message}")]
    StorageError {
        /// Detailed error message.
        message: String,
    },

    /// Webhook delivery failure. Never surfaces into job state.
    #[error("Webhook delivery failed: {message}")]
    WebhookError {
        /// Detailed error message.
        message: String,
    },
}

impl ServiceError {
    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::ValidationFailed {
            message: message.into(),
        }
    }

    /// Create a not-found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Create a conflict error.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Create an authentication error.
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::AuthenticationFailed {
            message: message.into(),
        }
    }

    /// Create a rate-limited error.
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::RateLimited {
            message: message.into(),
        }
    }

    /// Create a queue-full error.
    #[must_use]
    pub const fn queue_full(capacity: u32) -> Self {
        Self::QueueFull { capacity }
    }

    /// Create a timeout error.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create an invalid-URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Create an unsupported-platform error.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::UnsupportedPlatform {
            message: message.into(),
        }
    }

    /// Create a size-limit error.
    pub fn size_limit(message: impl Into<String>) -> Self {
        Self::SizeLimitExceeded {
            message: message.into(),
        }
    }

    /// Create a metadata-extraction error.
    pub fn metadata(message: impl Into<String>) -> Self {
        Self::MetadataError {
            message: message.into(),
        }
    }

    /// Create a download error.
    pub fn download(message: impl Into<String>) -> Self {
        Self::DownloadError {
            message: message.into(),
        }
    }

    /// Create a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::StorageError {
            message: message.into(),
        }
    }

    /// Create a storage error from a `std::io::Error`, capturing the kind.
    #[must_use]
    pub fn from_io_error(err: &std::io::Error) -> Self {
        Self::StorageError {
            message: format!("{:?}: {err}", err.kind()),
        }
    }

    /// Create a webhook delivery error.
    pub fn webhook(message: impl Into<String>) -> Self {
        Self::WebhookError {
            message: message.into(),
        }
    }

    /// The stable string form of this error's kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ValidationFailed { .. } => "validation_failed",
            Self::NotFound { .. } => "not_found",
            Self::Conflict { .. } => "conflict",
            Self::AuthenticationFailed { .. } => "authentication_failed",
            Self::RateLimited { .. } => "rate_limited",
            Self::QueueFull { .. } => "queue_full",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled => "cancelled",
            Self::InvalidUrl { .. } => "invalid_url",
            Self::UnsupportedPlatform { .. } => "unsupported_platform",
            Self::SizeLimitExceeded { .. } => "size_limit_exceeded",
            Self::MetadataError { .. } => "metadata_error",
            Self::DownloadError { .. } => "download_error",
            Self::StorageError { .. } => "storage_error",
            Self::WebhookError { .. } => "webhook_error",
        }
    }

    /// Suggested HTTP status class for an external request layer.
    #[must_use]
    pub const fn status_class(&self) -> u16 {
        match self {
            Self::ValidationFailed { .. }
            | Self::InvalidUrl { .. }
            | Self::UnsupportedPlatform { .. } => 422,
            Self::NotFound { .. } => 404,
            Self::Conflict { .. } => 409,
            Self::AuthenticationFailed { .. } => 401,
            Self::RateLimited { .. } => 429,
            Self::QueueFull { .. } => 503,
            Self::Timeout { .. } => 408,
            Self::Cancelled => 499,
            Self::SizeLimitExceeded { .. }
            | Self::MetadataError { .. }
            | Self::DownloadError { .. }
            | Self::StorageError { .. }
            | Self::WebhookError { .. } => 500,
        }
    }

    /// Check if this is a cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Convenience result type for service operations.
pub type ServiceResult<T> = Result<T, ServiceError>;
