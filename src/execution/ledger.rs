//! Request fingerprinting for the idempotency ledger.
//!
//! The fingerprint is `SHA-256(canonical_json({method, params}))` where
//! `params` is the raw parameter text as received. Whitelisted read-only
//! MCP methods bypass the ledger entirely and are always re-evaluated.

use serde_json::{json, Value};
use sha2::{Digest, Sha256};

/// Methods that must always return current state, never a cached verdict.
const IDEMPOTENCY_EXEMPT: [&str; 5] = [
    "initialize",
    "tools/list",
    "resources/list",
    "prompts/list",
    "ping",
];

/// Whether a method bypasses the ledger.
pub fn is_exempt(method: &str) -> bool {
    IDEMPOTENCY_EXEMPT.contains(&method)
}

/// 256-bit request fingerprint, lowercase hex.
pub fn request_fingerprint(method: &str, params_raw: &str) -> String {
    let canonical = json!({
        "method": method,
        "params": params_raw,
    });
    sha256_hex(canonical.to_string().as_bytes())
}

/// Hash of a serialized result value, lowercase hex.
pub fn result_fingerprint(result: &Value) -> String {
    sha256_hex(result.to_string().as_bytes())
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// The envelope returned when a fingerprint is already decided.
pub fn cached_reply() -> Value {
    json!({
        "cached": true,
        "message": "Request already processed",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exempt_methods() {
        assert!(is_exempt("initialize"));
        assert!(is_exempt("tools/list"));
        assert!(is_exempt("ping"));
        assert!(!is_exempt("tools/call"));
        assert!(!is_exempt("no/such"));
    }

    #[test]
    fn test_fingerprint_is_hex_sha256() {
        let fp = request_fingerprint("tools/call", r#"{"name":"x"}"#);
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_fingerprint_deterministic_and_sensitive() {
        let a = request_fingerprint("tools/call", r#"{"name":"x","arguments":{}}"#);
        let b = request_fingerprint("tools/call", r#"{"name":"x","arguments":{}}"#);
        let c = request_fingerprint("tools/call", r#"{"name":"y","arguments":{}}"#);
        let d = request_fingerprint("tools/list", r#"{"name":"x","arguments":{}}"#);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn test_result_fingerprint_tracks_content() {
        let a = result_fingerprint(&serde_json::json!({"v": 1}));
        let b = result_fingerprint(&serde_json::json!({"v": 1}));
        let c = result_fingerprint(&serde_json::json!({"v": 2}));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_cached_reply_shape() {
        let v = cached_reply();
        assert_eq!(v["cached"], true);
        assert_eq!(v["message"], "Request already processed");
    }
}
