//! HMAC-SHA256 payload signing.
//!
//! The signature covers the exact transmitted body bytes and is encoded as
//! lowercase hex. An empty secret never produces a signature.

use hmac::{Hmac, Mac};
use hookline_core::Endpoint;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Signs `payload` with `secret`.
///
/// Returns `None` for an empty secret: the request must then go out
/// unsigned rather than signed with an empty key.
///
/// # Example
///
/// ```
/// use hookline_delivery::signing::sign_payload;
///
/// let sig = sign_payload(br#"{"event":"ticket.created"}"#, "s3cret").unwrap();
/// assert_eq!(sig.len(), 64);
/// assert!(sign_payload(b"{}", "").is_none());
/// ```
pub fn sign_payload(payload: &[u8], secret: &str) -> Option<String> {
    if secret.is_empty() {
        return None;
    }
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(payload);
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Signature for a body about to be sent to `endpoint`, if it has a usable
/// secret.
pub fn signature_for(endpoint: &Endpoint, body: &[u8]) -> Option<String> {
    endpoint.signing_secret().and_then(|secret| sign_payload(body, secret))
}

/// Receiver-side check of a hex signature, in constant time.
pub fn verify_signature(payload: &[u8], signature_hex: &str, secret: &str) -> bool {
    if secret.is_empty() {
        return false;
    }
    let Ok(expected) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}
