//! Caller identity and credential utilities
//!
//! Provides:
//! - The resolved [`Identity`] attached to each authenticated request
//! - Credential extraction from `X-API-Key` / `Authorization: Bearer`
//! - Credential fingerprinting for cache keys and logs

use crate::errors::{AppError, Result};
use axum::{
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap},
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Primary credential header
pub const API_KEY_HEADER: &str = "x-api-key";

/// Identity headers injected for backends
pub const CONSUMER_ID_HEADER: &str = "x-consumer-id";
pub const SUBSCRIPTION_ID_HEADER: &str = "x-subscription-id";
pub const API_KEY_ID_HEADER: &str = "x-api-key-id";
pub const API_ID_HEADER: &str = "x-api-id";

/// Per-key request ceilings; `None` or 0 means the window is not enforced
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    #[serde(default)]
    pub per_minute: Option<u64>,
    #[serde(default)]
    pub per_day: Option<u64>,
    #[serde(default)]
    pub per_month: Option<u64>,
}

/// Resolved consumer identity, read-only once attached to a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub consumer_id: String,
    pub subscription_id: String,
    pub credential_id: String,
    pub upstream_api_id: String,
    pub tier_limits: TierLimits,
}

impl Identity {
    /// Header pairs a backend receives in place of the caller's credential
    pub fn forwarding_headers(&self) -> [(&'static str, &str); 4] {
        [
            (CONSUMER_ID_HEADER, self.consumer_id.as_str()),
            (SUBSCRIPTION_ID_HEADER, self.subscription_id.as_str()),
            (API_KEY_ID_HEADER, self.credential_id.as_str()),
            (API_ID_HEADER, self.upstream_api_id.as_str()),
        ]
    }
}

/// Extract a bearer token from an Authorization header value
pub fn extract_bearer(auth_header: &str) -> Option<&str> {
    auth_header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Find the presented credential, preferring `X-API-Key`
pub fn extract_credential(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .or_else(|| {
            headers
                .get(axum::http::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(extract_bearer)
        })
}

/// SHA-256 fingerprint of a credential, safe to keep in memory and logs
pub fn fingerprint(credential: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(credential.as_bytes());
    hex::encode(hasher.finalize())
}

/// Axum extractor for the identity attached by the authentication layer
impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self> {
        parts
            .extensions
            .get::<Identity>()
            .cloned()
            .ok_or(AppError::CredentialMissing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_extract_bearer() {
        assert_eq!(extract_bearer("Bearer pk_123"), Some("pk_123"));
        assert_eq!(extract_bearer("Bearer "), None);
        assert_eq!(extract_bearer("pk_123"), None);
        assert_eq!(extract_bearer("Basic abc"), None);
    }

    #[test]
    fn test_api_key_header_wins_over_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("from-header"));
        headers.insert("authorization", HeaderValue::from_static("Bearer from-bearer"));
        assert_eq!(extract_credential(&headers), Some("from-header"));

        headers.remove("x-api-key");
        assert_eq!(extract_credential(&headers), Some("from-bearer"));

        headers.remove("authorization");
        assert_eq!(extract_credential(&headers), None);
    }

    #[test]
    fn test_blank_api_key_falls_back() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("  "));
        headers.insert("authorization", HeaderValue::from_static("Bearer key"));
        assert_eq!(extract_credential(&headers), Some("key"));
    }

    #[test]
    fn test_fingerprint_is_stable_and_opaque() {
        let a = fingerprint("pk_live_secret");
        assert_eq!(a, fingerprint("pk_live_secret"));
        assert_ne!(a, fingerprint("pk_live_other"));
        assert_eq!(a.len(), 64);
        assert!(!a.contains("secret"));
    }

    #[test]
    fn test_identity_extractor() {
        let identity = Identity {
            consumer_id: "c-1".into(),
            subscription_id: "s-1".into(),
            credential_id: "k-1".into(),
            upstream_api_id: "a-1".into(),
            tier_limits: TierLimits::default(),
        };

        let (mut parts, _) = axum::http::Request::new(()).into_parts();
        let missing = tokio_test::block_on(Identity::from_request_parts(&mut parts, &()));
        assert!(matches!(missing, Err(AppError::CredentialMissing)));

        parts.extensions.insert(identity.clone());
        let found = tokio_test::block_on(Identity::from_request_parts(&mut parts, &()));
        assert_eq!(found.unwrap(), identity);
    }
}
