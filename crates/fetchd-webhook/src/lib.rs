//! Signed webhook dispatch for fetchd lifecycle events.
//!
//! Implements the `EventSink` port: HMAC-SHA256 signed payloads, retried
//! lifecycle delivery, throttled fire-and-forget progress delivery.

pub mod dispatcher;
pub mod sign;
pub mod throttle;

pub use dispatcher::{WebhookConfig, WebhookDispatcher};
pub use sign::{SIGNATURE_HEADER, sign, signature_header, verify};
pub use throttle::ProgressGate;
