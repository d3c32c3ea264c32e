//! Signed rendezvous `ref` tokens (spec §4.5, §6).
//!
//! A `ref` correlates a gateway's `flow_authorized` reply back to the
//! client channel that asked for the connection. It carries no secret
//! material of its own — the preshared key and ICE credentials are
//! already known to both endpoints — it just needs to be tamper-evident
//! and routable. Signed with HMAC-SHA256 over a service-wide secret,
//! same shape as the teacher's PASETO/JWT signing, minus the claims
//! machinery this narrower use case doesn't need.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::domain::{ClientId, ResourceId};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RefError {
    #[error("malformed ref token")]
    Malformed,
    #[error("ref signature did not verify")]
    InvalidSignature,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefClaims {
    pub client_channel_id: ClientId,
    pub resource_id: ResourceId,
    pub preshared_key: String,
    pub ice_ufrag: String,
    pub ice_pwd: String,
    pub issued_at: i64,
}

/// Sign `claims` into a `base64url(payload).base64url(hmac)` ref string.
#[must_use]
pub fn encode_ref(secret: &[u8], claims: &RefClaims) -> String {
    let payload = serde_json::to_vec(claims).expect("RefClaims always serializes");
    let payload_b64 = URL_SAFE_NO_PAD.encode(&payload);

    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(payload_b64.as_bytes());
    let signature = mac.finalize().into_bytes();
    let signature_b64 = URL_SAFE_NO_PAD.encode(signature);

    format!("{payload_b64}.{signature_b64}")
}

/// Verify and decode a ref token produced by [`encode_ref`]. Validity
/// has no age component by design — spec §5 notes a stale ref is
/// harmless because the client channel must still be alive to receive
/// `:connect`.
pub fn decode_ref(secret: &[u8], token: &str) -> Result<RefClaims, RefError> {
    let (payload_b64, signature_b64) = token.split_once('.').ok_or(RefError::Malformed)?;

    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(payload_b64.as_bytes());
    let expected = URL_SAFE_NO_PAD
        .decode(signature_b64)
        .map_err(|_| RefError::Malformed)?;
    mac.verify_slice(&expected)
        .map_err(|_| RefError::InvalidSignature)?;

    let payload = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|_| RefError::Malformed)?;
    serde_json::from_slice(&payload).map_err(|_| RefError::Malformed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn claims() -> RefClaims {
        RefClaims {
            client_channel_id: ClientId::new(Uuid::new_v4()),
            resource_id: ResourceId::new(Uuid::new_v4()),
            preshared_key: "psk".into(),
            ice_ufrag: "ufrag".into(),
            ice_pwd: "pwd".into(),
            issued_at: 0,
        }
    }

    #[test]
    fn round_trips() {
        let secret = b"service-wide-secret";
        let original = claims();
        let token = encode_ref(secret, &original);
        let decoded = decode_ref(secret, &token).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn rejects_tampered_payload() {
        let secret = b"service-wide-secret";
        let token = encode_ref(secret, &claims());
        let mut tampered = token.clone();
        tampered.replace_range(0..4, "Xaaa");
        assert_eq!(decode_ref(secret, &tampered), Err(RefError::InvalidSignature));
    }

    #[test]
    fn rejects_wrong_secret() {
        let token = encode_ref(b"secret-one", &claims());
        assert_eq!(
            decode_ref(b"secret-two", &token),
            Err(RefError::InvalidSignature)
        );
    }

    #[test]
    fn rejects_malformed_token() {
        assert_eq!(decode_ref(b"secret", "not-a-valid-ref"), Err(RefError::Malformed));
    }
}
