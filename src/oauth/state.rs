//! Signed OAuth state tokens.
//!
//! The state parameter binds a callback to the session that started the flow.
//! Format: `base64url(json payload) "." base64url(HMAC-SHA256(json payload))`.
//! Tokens are valid for five minutes after signing.

use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::BASE64URL;
use crate::error::StateError;

type HmacSha256 = Hmac<Sha256>;

/// Seconds a state token stays valid.
pub const STATE_MAX_AGE_SECS: i64 = 300;

/// What a state token vouches for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatePayload {
    pub provider: String,
    pub project_name: String,
    pub session_name: String,
    /// Unix seconds at signing.
    pub timestamp: i64,
}

impl StatePayload {
    pub fn new(provider: &str, project: &str, session: &str) -> Self {
        Self {
            provider: provider.to_string(),
            project_name: project.to_string(),
            session_name: session.to_string(),
            timestamp: Utc::now().timestamp(),
        }
    }
}

pub struct StateSigner {
    secret: SecretString,
}

impl StateSigner {
    pub fn new(secret: SecretString) -> Self {
        Self { secret }
    }

    /// `None` when no secret is configured.
    pub fn from_optional(secret: Option<SecretString>) -> Option<Self> {
        secret.map(Self::new)
    }

    fn mac(&self) -> Result<HmacSha256, StateError> {
        HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes())
            .map_err(|e| StateError::Payload(format!("state key rejected: {e}")))
    }

    pub fn sign(&self, payload: &StatePayload) -> Result<String, StateError> {
        let json = serde_json::to_vec(payload).map_err(|e| StateError::Payload(e.to_string()))?;
        let mut mac = self.mac()?;
        mac.update(&json);
        let signature = mac.finalize().into_bytes();
        Ok(format!(
            "{}.{}",
            BASE64URL.encode(&json),
            BASE64URL.encode(signature)
        ))
    }

    pub fn verify(&self, token: &str) -> Result<StatePayload, StateError> {
        self.verify_at(token, Utc::now().timestamp())
    }

    /// Verify as of `now` (Unix seconds).
    pub fn verify_at(&self, token: &str, now: i64) -> Result<StatePayload, StateError> {
        let (payload_b64, signature_b64) = token.split_once('.').ok_or(StateError::Malformed)?;
        if payload_b64.is_empty() || signature_b64.is_empty() || signature_b64.contains('.') {
            return Err(StateError::Malformed);
        }

        let json = BASE64URL
            .decode(payload_b64)
            .map_err(|_| StateError::Encoding { part: "payload" })?;
        let signature = BASE64URL
            .decode(signature_b64)
            .map_err(|_| StateError::Encoding { part: "signature" })?;

        let mut mac = self.mac()?;
        mac.update(&json);
        // Constant-time comparison.
        mac.verify_slice(&signature)
            .map_err(|_| StateError::BadSignature)?;

        let payload: StatePayload =
            serde_json::from_slice(&json).map_err(|e| StateError::Payload(e.to_string()))?;

        let age = now - payload.timestamp;
        if age < 0 {
            return Err(StateError::FutureTimestamp);
        }
        if age > STATE_MAX_AGE_SECS {
            return Err(StateError::Expired { age_secs: age });
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: i64 = 1_760_000_000;

    fn signer() -> StateSigner {
        StateSigner::new(SecretString::from("test-state-secret".to_string()))
    }

    fn payload(ts: i64) -> StatePayload {
        StatePayload {
            provider: "google".into(),
            project_name: "proj-a".into(),
            session_name: "s1".into(),
            timestamp: ts,
        }
    }

    #[test]
    fn test_valid_within_window() {
        let token = signer().sign(&payload(T)).unwrap();
        assert_eq!(signer().verify_at(&token, T).unwrap(), payload(T));
        assert_eq!(signer().verify_at(&token, T + 299).unwrap(), payload(T));
        assert!(signer().verify_at(&token, T + 300).is_ok());
    }

    #[test]
    fn test_expired_after_window() {
        let token = signer().sign(&payload(T)).unwrap();
        assert_eq!(
            signer().verify_at(&token, T + 301),
            Err(StateError::Expired { age_secs: 301 })
        );
    }

    #[test]
    fn test_future_timestamp_rejected() {
        let token = signer().sign(&payload(T + 10)).unwrap();
        assert_eq!(signer().verify_at(&token, T), Err(StateError::FutureTimestamp));
    }

    #[test]
    fn test_any_corrupted_byte_rejected() {
        let token = signer().sign(&payload(T)).unwrap();
        let bytes = token.as_bytes();
        for i in 0..bytes.len() {
            let mut corrupted = bytes.to_vec();
            corrupted[i] = if corrupted[i] == b'A' { b'B' } else { b'A' };
            let corrupted = String::from_utf8(corrupted).unwrap();
            assert!(
                signer().verify_at(&corrupted, T).is_err(),
                "corruption at byte {i} accepted"
            );
        }
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = signer().sign(&payload(T)).unwrap();
        let other = StateSigner::new(SecretString::from("another-secret".to_string()));
        assert_eq!(other.verify_at(&token, T), Err(StateError::BadSignature));
    }

    #[test]
    fn test_structure_rejected() {
        let token = signer().sign(&payload(T)).unwrap();
        assert_eq!(signer().verify_at("nodot", T), Err(StateError::Malformed));
        assert_eq!(
            signer().verify_at(&format!("{token}.extra"), T),
            Err(StateError::Malformed)
        );
        assert_eq!(signer().verify_at(".sig", T), Err(StateError::Malformed));
        assert!(matches!(
            signer().verify_at("!!!.sig", T),
            Err(StateError::Encoding { part: "payload" })
        ));
    }

    #[test]
    fn test_padded_encoding_accepted() {
        let token = signer().sign(&payload(T)).unwrap();
        let (p, s) = token.split_once('.').unwrap();
        let pad = |v: &str| format!("{v}{}", "=".repeat((4 - v.len() % 4) % 4));
        let padded = format!("{}.{}", pad(p), pad(s));
        assert!(signer().verify_at(&padded, T).is_ok());
    }
}
