//! Header rewriting between caller, gateway and backend

use axum::http::{header, HeaderMap, HeaderName, HeaderValue};
use tollgate_common::{identity::API_KEY_HEADER, Identity};

/// Connection-scoped headers that must not cross the proxy
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

pub const FORWARDED_PREFIX_HEADER: &str = "x-forwarded-prefix";

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers named by Connection are connection-scoped too
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::try_from(name.trim()).ok())
        .collect();

    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

/// Build the header set a backend receives.
///
/// Caller credentials are removed and identity headers are overwritten, so
/// a client cannot impersonate another consumer by sending them itself.
pub fn outbound_headers(inbound: &HeaderMap, identity: &Identity, prefix: &str) -> HeaderMap {
    let mut headers = inbound.clone();
    strip_hop_by_hop(&mut headers);
    headers.remove(header::HOST);
    headers.remove(API_KEY_HEADER);
    headers.remove(header::AUTHORIZATION);

    for (name, value) in identity.forwarding_headers() {
        match HeaderValue::from_str(value) {
            Ok(value) => {
                headers.insert(name, value);
            }
            Err(_) => {
                headers.remove(name);
                tracing::warn!(header = name, "Identity value is not a valid header value, omitted");
            }
        }
    }

    if let Ok(prefix) = HeaderValue::from_str(prefix) {
        headers.insert(FORWARDED_PREFIX_HEADER, prefix);
    }

    headers
}

/// Header set returned to the caller from a backend response
pub fn inbound_response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = upstream.clone();
    strip_hop_by_hop(&mut headers);
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use tollgate_common::TierLimits;

    fn identity() -> Identity {
        Identity {
            consumer_id: "consumer-7".into(),
            subscription_id: "sub-9".into(),
            credential_id: "key-3".into(),
            upstream_api_id: "api-2".into(),
            tier_limits: TierLimits::default(),
        }
    }

    #[test]
    fn test_credentials_never_forwarded() {
        let mut inbound = HeaderMap::new();
        inbound.insert("x-api-key", HeaderValue::from_static("pk_secret"));
        inbound.insert("authorization", HeaderValue::from_static("Bearer pk_secret"));
        inbound.insert("accept", HeaderValue::from_static("application/json"));

        let out = outbound_headers(&inbound, &identity(), "/api/acme/weather");

        assert!(out.get("x-api-key").is_none());
        assert!(out.get("authorization").is_none());
        assert_eq!(out["accept"], "application/json");
        assert_eq!(out["x-forwarded-prefix"], "/api/acme/weather");
    }

    #[test]
    fn test_identity_headers_override_client_copies() {
        let mut inbound = HeaderMap::new();
        inbound.insert("x-consumer-id", HeaderValue::from_static("spoofed"));

        let out = outbound_headers(&inbound, &identity(), "/api/acme/weather");

        assert_eq!(out["x-consumer-id"], "consumer-7");
        assert_eq!(out["x-subscription-id"], "sub-9");
        assert_eq!(out["x-api-key-id"], "key-3");
        assert_eq!(out["x-api-id"], "api-2");
    }

    #[test]
    fn test_hop_by_hop_removed() {
        let mut inbound = HeaderMap::new();
        inbound.insert("connection", HeaderValue::from_static("keep-alive, x-session-hint"));
        inbound.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        inbound.insert("x-session-hint", HeaderValue::from_static("abc"));
        inbound.insert("host", HeaderValue::from_static("gateway.example.com"));
        inbound.insert("x-request-id", HeaderValue::from_static("req-1"));

        let out = outbound_headers(&inbound, &identity(), "/api/a/b");

        assert!(out.get("connection").is_none());
        assert!(out.get("keep-alive").is_none());
        assert!(out.get("x-session-hint").is_none());
        assert!(out.get("host").is_none());
        assert_eq!(out["x-request-id"], "req-1");
    }

    #[test]
    fn test_response_headers_keep_content_headers() {
        let mut upstream = HeaderMap::new();
        upstream.insert("content-type", HeaderValue::from_static("application/json"));
        upstream.insert("transfer-encoding", HeaderValue::from_static("chunked"));

        let out = inbound_response_headers(&upstream);
        assert_eq!(out["content-type"], "application/json");
        assert!(out.get("transfer-encoding").is_none());
    }
}
