//! HMAC-SHA256 request signing and callback verification.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Lowercase hex HMAC-SHA256 of `data` under `key`.
pub fn sign(key: &str, data: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(data.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a callback MAC (hex, case-insensitive) over the raw payload
/// bytes under the callback key. Comparison is constant-time.
pub fn verify(key: &str, data: &str, mac_hex: &str) -> bool {
    let Ok(expected) = hex::decode(mac_hex) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(data.as_bytes());
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 4231 test case 2.
    #[test]
    fn test_known_vector() {
        assert_eq!(
            sign("Jefe", "what do ya want for nothing?"),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_verify_round_trip() {
        let mac = sign("key2", r#"{"app_trans_id":"251217_28_1765957661610"}"#);
        assert!(verify("key2", r#"{"app_trans_id":"251217_28_1765957661610"}"#, &mac));
        assert!(verify("key2", r#"{"app_trans_id":"251217_28_1765957661610"}"#, &mac.to_uppercase()));
    }

    #[test]
    fn test_verify_rejects_tampered_payload() {
        let mac = sign("key2", "payload");
        assert!(!verify("key2", "payload-tampered", &mac));
        assert!(!verify("other-key", "payload", &mac));
        assert!(!verify("key2", "payload", "not-hex"));
    }
}
