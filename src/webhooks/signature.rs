//! Webhook authentication.
//!
//! The WMS signs each delivery with HMAC-SHA256 over the raw request body,
//! using the shared secret, and sends the result in `X-WMS-Signature` as
//! `sha256=<hex>`. Verification happens before the body is parsed; a delivery
//! that fails it is never stored.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the delivery signature.
pub const SIGNATURE_HEADER: &str = "x-wms-signature";

const PREFIX: &str = "sha256=";

/// Decodes the digest from a `sha256=<hex>` header value.
///
/// ```
/// use wms_sync::webhooks::decode_signature;
///
/// assert_eq!(decode_signature("sha256=0aff"), Some(vec![0x0a, 0xff]));
/// assert!(decode_signature("md5=0aff").is_none());
/// assert!(decode_signature("sha256=zz").is_none());
/// ```
pub fn decode_signature(header: &str) -> Option<Vec<u8>> {
    hex::decode(header.trim().strip_prefix(PREFIX)?).ok()
}

/// Produces the header value the WMS would send for `body`.
pub fn sign(body: &[u8], secret: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(body);
    format!("{}{}", PREFIX, hex::encode(mac.finalize().into_bytes()))
}

/// Checks `header` against `body` in constant time.
///
/// A missing, malformed, or mismatching header all return `false`.
pub fn verify(body: &[u8], header: Option<&str>, secret: &[u8]) -> bool {
    let Some(digest) = header.and_then(decode_signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&digest).is_ok()
}
