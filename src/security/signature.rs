//! HMAC-SHA256 webhook signature verification.
//!
//! Upstream senders disagree on the header name, so [`extract_signature`]
//! checks every dialect we accept in a fixed order. Values may carry an
//! optional `sha256=` prefix.

use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Recognized signature headers, in lookup order.
pub const SIGNATURE_HEADERS: [&str; 4] = [
    "X-Webhook-Signature",
    "X-Kajabi-Signature",
    "X-Signature",
    "X-Hub-Signature-256",
];

/// Algorithm prefix some senders put in front of the hex digest.
pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Return the first non-empty signature value among [`SIGNATURE_HEADERS`].
///
/// Header name matching is case-insensitive (`HeaderMap` normalizes names).
pub fn extract_signature(headers: &HeaderMap) -> Option<&str> {
    SIGNATURE_HEADERS.iter().find_map(|name| {
        headers
            .get(*name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    })
}

/// Verify `signature` (hex, optionally `sha256=`-prefixed) against the
/// HMAC-SHA256 of `payload` under `secret`.
///
/// Hex digits are accepted in either case. Malformed hex, a digest of the
/// wrong length, or an empty secret all yield `false`. The digest comparison
/// goes through `Mac::verify_slice`, which is constant-time.
pub fn verify_signature(payload: &[u8], signature: &str, secret: &str) -> bool {
    if secret.is_empty() {
        return false;
    }

    let signature = signature.trim();
    let hex_sig = signature.strip_prefix(SIGNATURE_PREFIX).unwrap_or(signature);

    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);

    mac.verify_slice(&expected).is_ok()
}

/// Lowercase hex HMAC-SHA256 of `payload` under `secret`.
pub fn sign_payload(payload: &[u8], secret: &str) -> String {
    // HMAC accepts keys of any length, including empty ones.
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("hmac keys of any length are valid"));
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// `sha256=<hex>` header value for `payload`, as GitHub-style senders emit it.
pub fn signature_header_value(payload: &[u8], secret: &str) -> String {
    format!("{SIGNATURE_PREFIX}{}", sign_payload(payload, secret))
}
