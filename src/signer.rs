//! HMAC-SHA-256 message authentication for sync payloads.
//!
//! The MAC covers `body || "|" || domain`, so a captured request cannot be
//! replayed against a different target that happens to share the key.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

const DOMAIN_SEPARATOR: &[u8] = b"|";

fn keyed(body: &[u8], secret: &str, domain: &str) -> HmacSha256 {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(body);
    mac.update(DOMAIN_SEPARATOR);
    mac.update(domain.as_bytes());
    mac
}

/// Lowercase hex MAC of `body` bound to `domain`.
pub fn sign(body: &[u8], secret: &str, domain: &str) -> String {
    hex::encode(keyed(body, secret, domain).finalize().into_bytes())
}

/// Check `signature` (hex) in constant time. Malformed hex never verifies.
pub fn verify(body: &[u8], secret: &str, domain: &str, signature: &str) -> bool {
    let Ok(raw) = hex::decode(signature.trim()) else {
        return false;
    };
    keyed(body, secret, domain).verify_slice(&raw).is_ok()
}

/// Constant-time equality for shared keys presented in headers.
pub fn keys_match(presented: &str, configured: &str) -> bool {
    if configured.is_empty() {
        return false;
    }
    presented.as_bytes().ct_eq(configured.as_bytes()).into()
}
