//! # Channel Authentication
//!
//! HMAC-SHA256 over the canonical payload serialization, keyed by the
//! channel's shared secret. Verification uses a constant-time compare.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::envelope::{Request, RequestPayload};
use crate::RpcError;

type HmacSha256 = Hmac<Sha256>;

/// Length of a generated channel secret in bytes.
pub const SECRET_LEN: usize = 32;

/// A fresh random channel secret. Generated once per channel so a
/// request captured before a restart cannot replay into the new channel.
#[must_use]
pub fn generate_secret() -> Vec<u8> {
    let mut secret = vec![0u8; SECRET_LEN];
    rand::thread_rng().fill_bytes(&mut secret);
    secret
}

/// The canonical byte form of a payload: serialized through
/// `serde_json::Value`, whose objects keep keys sorted. Client and
/// server reach identical bytes regardless of map iteration order.
fn canonical_bytes(payload: &RequestPayload) -> Result<Vec<u8>, RpcError> {
    let value = serde_json::to_value(payload)?;
    Ok(serde_json::to_vec(&value)?)
}

/// Compute the authenticator for a payload.
pub fn sign_payload(payload: &RequestPayload, secret: &[u8]) -> Result<Vec<u8>, RpcError> {
    let canonical = canonical_bytes(payload)?;
    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|e| RpcError::Codec(e.to_string()))?;
    mac.update(&canonical);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Build a request carrying a valid authenticator for `payload`.
pub fn signed_request(payload: RequestPayload, secret: &[u8]) -> Result<Request, RpcError> {
    let hash_auth = sign_payload(&payload, secret)?;
    Ok(Request { hash_auth, payload })
}

/// Verify a request's authenticator. Returns `false` on any failure so
/// malformed requests and forged requests are indistinguishable.
#[must_use]
pub fn check_validity(request: &Request, secret: &[u8]) -> bool {
    let Ok(canonical) = canonical_bytes(&request.payload) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(&canonical);
    // Constant-time comparison.
    mac.verify_slice(&request.hash_auth).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::UnEnforcePayload;

    fn payload() -> RequestPayload {
        RequestPayload::UnEnforce(UnEnforcePayload {
            context_id: "svcA".to_string(),
        })
    }

    #[test]
    fn test_sign_and_verify() {
        let secret = generate_secret();
        let request = signed_request(payload(), &secret).unwrap();
        assert!(check_validity(&request, &secret));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let request = signed_request(payload(), &generate_secret()).unwrap();
        assert!(!check_validity(&request, &generate_secret()));
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let secret = generate_secret();
        let mut request = signed_request(payload(), &secret).unwrap();
        request.payload = RequestPayload::UnEnforce(UnEnforcePayload {
            context_id: "other".to_string(),
        });
        assert!(!check_validity(&request, &secret));
    }

    #[test]
    fn test_secrets_are_rotated() {
        assert_ne!(generate_secret(), generate_secret());
    }

    #[test]
    fn test_verification_survives_map_reordering() {
        // Payloads carry maps; the authenticator must hold after a
        // serialization round trip even though map iteration order is
        // not stable.
        use crate::envelope::EnforcePayload;
        use shared_types::{PuInfo, PuPolicy, PuRuntime};

        let mut policy = PuPolicy::default();
        for i in 0..16 {
            policy.identity.insert(format!("key{i}"), format!("v{i}"));
            policy
                .policy_ips
                .insert(format!("ns{i}"), format!("10.0.0.{i}"));
        }
        let pu = PuInfo::new("svcA", PuRuntime::default(), policy);
        let payload = RequestPayload::Enforce(EnforcePayload::from_pu(&pu));

        let secret = generate_secret();
        let request = signed_request(payload, &secret).unwrap();
        let wire = serde_json::to_vec(&request).unwrap();
        let received: Request = serde_json::from_slice(&wire).unwrap();
        assert!(check_validity(&received, &secret));
    }
}
