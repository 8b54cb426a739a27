//! Catch-all proxy handler for `/api/{owner}/{api}/...`

use crate::proxy::ProxyRoute;
use crate::usage::{metered::PendingUsage, MeteredStream, UsageEvent};
use crate::AppState;
use axum::{
    body::Body,
    extract::{Path, Request, State},
    response::Response,
};
use chrono::Utc;
use futures::StreamExt;
use std::time::Instant;
use tollgate_common::{errors::Result, metrics::RequestMetrics, Identity};

use crate::proxy::headers::inbound_response_headers;

/// Latency and status metrics for a request, labelled by the API the key
/// service resolved rather than caller-supplied path segments
fn request_metrics(method: &str, identity: &Identity) -> RequestMetrics {
    RequestMetrics::start(method, &identity.upstream_api_id)
}

/// Forward an authenticated, admitted request and stream the backend's reply
pub async fn forward(
    State(state): State<AppState>,
    Path(route): Path<ProxyRoute>,
    identity: Identity,
    request: Request,
) -> Result<Response> {
    let started = Instant::now();
    let timestamp = Utc::now();
    let method = request.method().to_string();
    let endpoint = request.uri().path().to_string();
    let metrics = request_metrics(&method, &identity);

    let upstream = match state.proxy.forward(&route, request, &identity).await {
        Ok(upstream) => upstream,
        Err(e) => {
            metrics.finish(e.status_code().as_u16());
            return Err(e);
        }
    };

    let status = upstream.response.status();
    let headers = inbound_response_headers(upstream.response.headers());
    let request_bytes = upstream.request_bytes.clone();

    let pending = PendingUsage {
        logger: state.usage.clone(),
        metrics,
        started,
        event: UsageEvent {
            subscription_id: identity.subscription_id,
            api_key_id: identity.credential_id,
            timestamp,
            endpoint,
            method,
            status_code: status.as_u16(),
            response_time_ms: 0,
            request_size_bytes: 0,
            response_size_bytes: 0,
        },
        request_bytes,
    };

    let body = MeteredStream::new(upstream.response.bytes_stream().boxed(), pending);

    let mut response = Response::new(Body::from_stream(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}
