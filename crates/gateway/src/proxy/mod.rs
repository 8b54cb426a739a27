//! Upstream request proxy
//!
//! Resolves the backend for `/api/{owner}/{api}/...`, rewrites the request
//! and streams it out. Nothing is written back to the caller until the
//! backend's response headers have arrived, so a connection failure can
//! still be reported as a clean 502.

pub mod admission;
pub mod headers;

use axum::{body::HttpBody, extract::Request};
use futures::TryStreamExt;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tollgate_common::{
    config::ProxyConfig,
    errors::{AppError, Result},
    metrics, Identity,
};

pub use admission::ContentTypePolicy;

/// Path parameters of the catch-all route
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyRoute {
    pub owner: String,
    pub api: String,
}

impl ProxyRoute {
    /// Routing prefix the backend sits behind
    pub fn prefix(&self) -> String {
        format!("/api/{}/{}", self.owner, self.api)
    }
}

/// Path after `/api/{owner}/{api}`, still percent-encoded, starting with `/`
pub fn sub_path(uri_path: &str) -> String {
    let rest = uri_path
        .trim_start_matches('/')
        .splitn(4, '/')
        .nth(3)
        .unwrap_or_default();
    format!("/{}", rest)
}

/// Maps a route onto a backend base URL
pub trait TargetResolver: Send + Sync {
    fn resolve(&self, owner: &str, api: &str) -> Result<String>;
}

/// Naming-convention resolver: substitutes `{owner}` and `{api}` into a template
#[derive(Debug, Clone)]
pub struct TemplateResolver {
    template: String,
}

impl TemplateResolver {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    fn segment(kind: &str, value: &str) -> Result<String> {
        let valid = !value.is_empty()
            && value.len() <= 63
            && value.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

        if valid {
            Ok(value.to_ascii_lowercase().replace('_', "-"))
        } else {
            Err(AppError::InvalidRoute {
                message: format!("{} must be 1-63 characters of [A-Za-z0-9_-]", kind),
            })
        }
    }
}

impl TargetResolver for TemplateResolver {
    fn resolve(&self, owner: &str, api: &str) -> Result<String> {
        let owner = Self::segment("owner", owner)?;
        let api = Self::segment("api name", api)?;
        Ok(self
            .template
            .replace("{owner}", &owner)
            .replace("{api}", &api)
            .trim_end_matches('/')
            .to_string())
    }
}

/// Backend response with the request-size counter still attached
pub struct UpstreamResponse {
    pub response: reqwest::Response,
    /// Bytes of request body streamed to the backend
    pub request_bytes: Arc<AtomicU64>,
}

pub struct UpstreamProxy {
    client: reqwest::Client,
    resolver: Arc<dyn TargetResolver>,
    response_timeout: Duration,
}

impl UpstreamProxy {
    pub fn new(config: &ProxyConfig, resolver: Arc<dyn TargetResolver>) -> Result<Self> {
        // No overall timeout: response bodies may stream for a long time
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| AppError::Configuration {
                message: format!("Failed to create upstream HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            resolver,
            response_timeout: config.response_timeout(),
        })
    }

    /// Outbound URL for a route and optional query string
    pub fn target_url(&self, route: &ProxyRoute, sub_path: &str, query: Option<&str>) -> Result<String> {
        let base = self.resolver.resolve(&route.owner, &route.api)?;
        let mut url = format!("{}{}", base, sub_path);
        if let Some(query) = query.filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(query);
        }
        Ok(url)
    }

    /// Forward a request and wait for the backend's response headers.
    ///
    /// Dropping the returned response (or this future) releases the
    /// backend connection.
    pub async fn forward(
        &self,
        route: &ProxyRoute,
        request: Request,
        identity: &Identity,
    ) -> Result<UpstreamResponse> {
        let url = self.target_url(route, &sub_path(request.uri().path()), request.uri().query())?;
        let (parts, body) = request.into_parts();
        let headers = headers::outbound_headers(&parts.headers, identity, &route.prefix());

        let request_bytes = Arc::new(AtomicU64::new(0));
        let mut outbound = self
            .client
            .request(parts.method.clone(), &url)
            .headers(headers);

        // Bodiless requests go out without a chunked empty body
        if HttpBody::size_hint(&body).exact() != Some(0) {
            let counter = request_bytes.clone();
            let stream = body.into_data_stream().inspect_ok(move |chunk| {
                counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            });
            outbound = outbound.body(reqwest::Body::wrap_stream(stream));
        }

        let send = outbound.send();

        let response = match tokio::time::timeout(self.response_timeout, send).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                metrics::record_upstream_error(if e.is_connect() { "connect" } else { "request" });
                return Err(AppError::UpstreamUnreachable {
                    message: format!("{} {}: {}", parts.method, url, e.without_url()),
                });
            }
            Err(_) => {
                metrics::record_upstream_error("timeout");
                return Err(AppError::UpstreamTimeout {
                    timeout_ms: self.response_timeout.as_millis() as u64,
                });
            }
        };

        tracing::debug!(
            method = %parts.method,
            url = %url,
            status = response.status().as_u16(),
            "Upstream responded"
        );

        Ok(UpstreamResponse {
            response,
            request_bytes,
        })
    }
}
