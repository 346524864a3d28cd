//! Webhook delivery.
//!
//! Lifecycle events are awaited by the caller and retried on transient
//! failure with exponential backoff. Progress events are fire-and-forget:
//! the download path never blocks on a slow receiver, and a per-job gate
//! caps them at one per configured interval.
//!
//! Delivery failures never escape this module as anything but a log line;
//! webhook trouble must not influence job state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_TYPE, USER_AGENT};

use fetchd_core::config::ServiceConfig;
use fetchd_core::error::ServiceError;
use fetchd_core::events::WebhookEvent;
use fetchd_core::job::JobId;
use fetchd_core::ports::EventSink;

use crate::sign::{SIGNATURE_HEADER, signature_header};
use crate::throttle::ProgressGate;

/// Tunables for the dispatcher.
#[derive(Clone, Debug)]
pub struct WebhookConfig {
    /// Master switch; when off every dispatch is a no-op.
    pub enabled: bool,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Attempt budget including the first try.
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt.
    pub retry_base: Duration,
    /// HMAC key.
    pub signing_secret: Vec<u8>,
    /// Minimum interval between progress events per job.
    pub progress_min_interval: Duration,
    /// User-Agent header value.
    pub user_agent: String,
}

impl WebhookConfig {
    /// Derive dispatcher settings from the service configuration.
    #[must_use]
    pub fn from_service(config: &ServiceConfig) -> Self {
        Self {
            enabled: config.webhook_enabled,
            timeout: config.webhook_timeout(),
            max_attempts: config.webhook_max_attempts,
            retry_base: Duration::from_secs(1),
            signing_secret: config.signing_secret.as_bytes().to_vec(),
            progress_min_interval: config.progress_throttle(),
            user_agent: config.user_agent.clone(),
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self::from_service(&ServiceConfig::default())
    }
}

/// How one POST attempt went.
enum Attempt {
    Delivered,
    /// 4xx: the receiver rejected the payload; retrying cannot help.
    Rejected(StatusCode),
    /// 5xx or transport failure; worth retrying.
    Transient(String),
}

struct Inner {
    client: reqwest::Client,
    config: WebhookConfig,
    gate: ProgressGate,
}

/// Signed webhook dispatcher. Cheap to clone.
#[derive(Clone)]
pub struct WebhookDispatcher {
    inner: Arc<Inner>,
}

impl WebhookDispatcher {
    /// Build a dispatcher with its own HTTP client.
    pub fn new(config: WebhookConfig) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ServiceError::webhook(format!("cannot build HTTP client: {e}")))?;
        let gate = ProgressGate::new(config.progress_min_interval);
        Ok(Self {
            inner: Arc::new(Inner {
                client,
                config,
                gate,
            }),
        })
    }

    /// Deliver one event, retrying transient failures.
    ///
    /// The envelope is serialized exactly once; the signature covers the
    /// same buffer that goes on the wire.
    pub async fn deliver(&self, url: &str, event: &WebhookEvent) -> Result<(), ServiceError> {
        let body = serde_json::to_vec(&event.envelope())
            .map_err(|e| ServiceError::webhook(format!("cannot serialize event: {e}")))?;
        let signature = signature_header(&self.inner.config.signing_secret, &body);

        let mut delay = self.inner.config.retry_base;
        let max_attempts = self.inner.config.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            match self.post_once(url, body.clone(), &signature).await {
                Attempt::Delivered => {
                    tracing::debug!(
                        target: "fetchd.webhook",
                        event = event.kind.wire_name(),
                        job = %event.job_id,
                        attempt,
                        "Webhook delivered"
                    );
                    return Ok(());
                }
                Attempt::Rejected(status) => {
                    // Permanent: the receiver saw the payload and said no.
                    tracing::debug!(
                        target: "fetchd.webhook",
                        event = event.kind.wire_name(),
                        job = %event.job_id,
                        status = status.as_u16(),
                        "Webhook rejected, not retrying"
                    );
                    return Err(ServiceError::webhook(format!(
                        "receiver returned {status}"
                    )));
                }
                Attempt::Transient(reason) => {
                    if attempt == max_attempts {
                        tracing::warn!(
                            target: "fetchd.webhook",
                            event = event.kind.wire_name(),
                            job = %event.job_id,
                            attempts = max_attempts,
                            reason = %reason,
                            "Webhook delivery failed after retries"
                        );
                        return Err(ServiceError::webhook(format!(
                            "delivery failed after {max_attempts} attempts: {reason}"
                        )));
                    }
                    tracing::debug!(
                        target: "fetchd.webhook",
                        event = event.kind.wire_name(),
                        job = %event.job_id,
                        attempt,
                        delay_secs = delay.as_secs_f64(),
                        reason = %reason,
                        "Webhook attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }

        Err(ServiceError::webhook("attempt budget exhausted"))
    }

    async fn post_once(&self, url: &str, body: Vec<u8>, signature: &str) -> Attempt {
        let result = self
            .inner
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .header(USER_AGENT, &self.inner.config.user_agent)
            .header(SIGNATURE_HEADER, signature)
            .body(body)
            .send()
            .await;

        match result {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    Attempt::Delivered
                } else if status.is_client_error() {
                    Attempt::Rejected(status)
                } else {
                    Attempt::Transient(format!("HTTP {status}"))
                }
            }
            Err(e) => Attempt::Transient(e.to_string()),
        }
    }
}

#[async_trait]
impl EventSink for WebhookDispatcher {
    async fn lifecycle(&self, url: &str, event: WebhookEvent) {
        if !self.inner.config.enabled {
            return;
        }
        // deliver() has already logged; failures stop here.
        let _ = self.deliver(url, &event).await;
    }

    fn progress(&self, url: &str, event: WebhookEvent) {
        if !self.inner.config.enabled {
            return;
        }
        if !self.inner.gate.should_emit(event.job_id.as_str()) {
            // Inside the throttle window; this frame is elided.
            return;
        }
        let this = self.clone();
        let url = url.to_string();
        tokio::spawn(async move {
            if let Err(e) = this.deliver(&url, &event).await {
                tracing::debug!(
                    target: "fetchd.webhook",
                    job = %event.job_id,
                    error = %e,
                    "Progress webhook dropped"
                );
            }
        });
    }

    fn release(&self, job_id: &JobId) {
        self.inner.gate.release(job_id.as_str());
    }
}
