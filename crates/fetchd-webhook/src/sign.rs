//! Payload signing.
//!
//! The signature covers the exact bytes sent on the wire: the dispatcher
//! serializes the envelope once and both signs and POSTs that buffer.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the signature.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// Prefix of the header value.
const SIGNATURE_PREFIX: &str = "sha256=";

/// Hex HMAC-SHA256 digest of `body` under `secret`.
#[must_use]
pub fn sign(secret: &[u8], body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret).expect("HMAC-SHA256 accepts keys of any length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// The full `X-Webhook-Signature` header value for `body`.
#[must_use]
pub fn signature_header(secret: &[u8], body: &[u8]) -> String {
    format!("{SIGNATURE_PREFIX}{}", sign(secret, body))
}

/// Verify a received signature header against the raw body.
///
/// Comparison happens inside the MAC (constant time); a malformed header
/// simply fails verification.
#[must_use]
pub fn verify(secret: &[u8], body: &[u8], header_value: &str) -> bool {
    let Some(hex_digest) = header_value.strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"topsecret";
    const BODY: &[u8] = br#"{"event":"download.completed"}"#;

    #[test]
    fn sign_is_deterministic() {
        assert_eq!(sign(SECRET, BODY), sign(SECRET, BODY));
        assert_ne!(sign(SECRET, BODY), sign(b"other", BODY));
    }

    #[test]
    fn header_round_trips_through_verify() {
        let header = signature_header(SECRET, BODY);
        assert!(header.starts_with("sha256="));
        assert!(verify(SECRET, BODY, &header));
    }

    #[test]
    fn verify_rejects_tampering() {
        let header = signature_header(SECRET, BODY);
        assert!(!verify(SECRET, b"tampered body", &header));
        assert!(!verify(b"wrong secret", BODY, &header));
    }

    #[test]
    fn verify_rejects_malformed_headers() {
        assert!(!verify(SECRET, BODY, "md5=abcdef"));
        assert!(!verify(SECRET, BODY, "sha256=nothex!"));
        assert!(!verify(SECRET, BODY, ""));
    }
}
