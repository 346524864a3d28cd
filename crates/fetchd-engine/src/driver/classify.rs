//! Failure classification.
//!
//! Maps downloader stderr output onto the service error taxonomy so the
//! rest of the system (and the HTTP layer above it) can react to the
//! class of a failure instead of grepping messages.

use fetchd_core::error::ServiceError;

/// How many trailing stderr bytes survive into the failure message.
const STDERR_TAIL_BYTES: usize = 600;

/// One stderr pattern and the error it indicates. First match wins.
type Rule = (&'static [&'static str], fn(String) -> ServiceError);

const RULES: &[Rule] = &[
    (
        &["is not a valid URL", "Invalid URL"],
        |m| ServiceError::InvalidUrl { url: m },
    ),
    (
        &["Unsupported URL", "no suitable extractor"],
        ServiceError::unsupported,
    ),
    (
        &["File is larger than max-filesize", "exceeds maximum file size"],
        ServiceError::size_limit,
    ),
    (
        &[
            "Sign in to confirm",
            "This video is only available to",
            "Login required",
            "HTTP Error 401",
        ],
        ServiceError::authentication,
    ),
    (
        &["HTTP Error 429", "rate-limited", "Too Many Requests"],
        ServiceError::rate_limited,
    ),
    (
        &[
            "Unable to extract",
            "Unable to download webpage",
            "Unable to download JSON metadata",
        ],
        ServiceError::metadata,
    ),
];

/// Classify a failed downloader run from its stderr and exit code.
#[must_use]
pub fn classify_failure(stderr: &str, exit_code: Option<i32>) -> ServiceError {
    let tail = stderr_tail(stderr);

    for (needles, build) in RULES {
        if needles.iter().any(|needle| tail.contains(needle)) {
            return build(tail);
        }
    }

    let message = if tail.is_empty() {
        match exit_code {
            Some(code) => format!("downloader exited with status {code}"),
            None => "downloader terminated by signal".to_string(),
        }
    } else {
        tail
    };
    ServiceError::download(message)
}

/// The last `STDERR_TAIL_BYTES` of stderr, trimmed, on a char boundary.
fn stderr_tail(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.len() <= STDERR_TAIL_BYTES {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - STDERR_TAIL_BYTES;
    while start < trimmed.len() && !trimmed.is_char_boundary(start) {
        start += 1;
    }
    trimmed[start..].to_string()
}
