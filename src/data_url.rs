//! Converting binary data to a `data:` URL.

use base64::{Engine as _, prelude::BASE64_STANDARD};

/// Base64-encode binary data for use in a `data:` URL.
///
/// We return the bare payload rather than the full URL, because callers keep
/// the payload around after the request has been built.
pub fn base64_payload(data: &[u8]) -> String {
    BASE64_STANDARD.encode(data)
}

/// Build a `data:` URL from an already-encoded Base64 payload.
///
/// The Base64 data is deliberately not percent-encoded; that breaks several
/// inference servers in practice.
pub fn data_url(mime_type: &str, base64_payload: &str) -> String {
    format!("data:{};base64,{}", mime_type, base64_payload)
}
