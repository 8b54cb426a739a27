//! Key validation client
//!
//! Resolves a presented credential to an [`Identity`] by asking the external
//! key management service. Outages (timeouts, connection failures, 5xx) are
//! reported as `ValidatorUnavailable`, never as a bad credential.

pub mod cache;

use async_trait::async_trait;
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tollgate_common::{
    clock::SharedClock,
    config::ValidatorConfig,
    errors::{AppError, Result},
    identity::{fingerprint, TierLimits},
    metrics, Identity,
};

pub use cache::ResolutionCache;

/// Trait for credential resolution
#[async_trait]
pub trait KeyValidator: Send + Sync {
    /// Resolve a credential presented for `path`
    async fn resolve(&self, credential: &str, path: &str) -> Result<Identity>;
}

#[derive(Serialize)]
struct ValidateRequest<'a> {
    api_key: &'a str,
    path: &'a str,
}

#[derive(Debug, Deserialize)]
struct ValidateResponse {
    valid: bool,
    consumer_id: Option<String>,
    subscription_id: Option<String>,
    api_key_id: Option<String>,
    api_id: Option<String>,
    #[serde(default)]
    rate_limits: TierLimits,
}

impl ValidateResponse {
    fn into_identity(self) -> Result<Identity> {
        if !self.valid {
            return Err(AppError::CredentialInvalid);
        }

        match (self.consumer_id, self.subscription_id, self.api_key_id, self.api_id) {
            (Some(consumer_id), Some(subscription_id), Some(credential_id), Some(upstream_api_id)) => {
                Ok(Identity {
                    consumer_id,
                    subscription_id,
                    credential_id,
                    upstream_api_id,
                    tier_limits: self.rate_limits,
                })
            }
            _ => Err(AppError::ValidatorUnavailable {
                message: "validation response missing identity fields".to_string(),
            }),
        }
    }
}

/// HTTP client for `POST {url}/validate`
pub struct HttpKeyValidator {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpKeyValidator {
    pub fn new(config: &ValidatorConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| AppError::Configuration {
                message: format!("Failed to create validator HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            endpoint: format!("{}/validate", config.url.trim_end_matches('/')),
        })
    }

    async fn call(&self, credential: &str, path: &str) -> Result<Identity> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&ValidateRequest { api_key: credential, path })
            .send()
            .await
            .map_err(|e| AppError::ValidatorUnavailable {
                message: if e.is_timeout() {
                    "request timed out".to_string()
                } else {
                    format!("request failed: {}", e.without_url())
                },
            })?;

        let status = response.status();
        match status {
            StatusCode::NOT_FOUND => return Err(AppError::CredentialNotFound),
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(AppError::CredentialInvalid)
            }
            s if !s.is_success() => {
                return Err(AppError::ValidatorUnavailable {
                    message: format!("validator responded {}", s),
                })
            }
            _ => {}
        }

        let body: ValidateResponse = response.json().await.map_err(|e| AppError::ValidatorUnavailable {
            message: format!("malformed validation response: {}", e.without_url()),
        })?;

        body.into_identity()
    }
}

fn outcome_label(result: &Result<Identity>) -> &'static str {
    match result {
        Ok(_) => "valid",
        Err(AppError::CredentialInvalid) => "invalid",
        Err(AppError::CredentialNotFound) => "not_found",
        Err(_) => "unavailable",
    }
}

#[async_trait]
impl KeyValidator for HttpKeyValidator {
    async fn resolve(&self, credential: &str, path: &str) -> Result<Identity> {
        let start = Instant::now();
        let result = self.call(credential, path).await;
        let outcome = outcome_label(&result);
        metrics::record_validation(start.elapsed().as_secs_f64(), outcome);

        if let Err(AppError::ValidatorUnavailable { message }) = &result {
            tracing::warn!(error = %message, "Key validation service unavailable");
        }
        result
    }
}

/// Validator that reuses successful resolutions for a bounded time
pub struct CachingValidator {
    inner: Arc<dyn KeyValidator>,
    cache: ResolutionCache,
}

impl CachingValidator {
    pub fn new(inner: Arc<dyn KeyValidator>, cache: ResolutionCache) -> Self {
        Self { inner, cache }
    }
}

/// `/api/{owner}/{api}` prefix of a request path
fn api_scope(path: &str) -> &str {
    match path.match_indices('/').nth(3) {
        Some((end, _)) => &path[..end],
        None => path,
    }
}

#[async_trait]
impl KeyValidator for CachingValidator {
    async fn resolve(&self, credential: &str, path: &str) -> Result<Identity> {
        let key = format!("{}:{}", fingerprint(credential), api_scope(path));
        if let Some(identity) = self.cache.get(&key) {
            metrics::record_cache(true, "identity");
            return Ok(identity);
        }
        metrics::record_cache(false, "identity");

        let identity = self.inner.resolve(credential, path).await?;
        self.cache.insert(key, identity.clone());
        Ok(identity)
    }
}

/// Create a validator based on configuration
pub fn create_validator(config: &ValidatorConfig, clock: SharedClock) -> Result<Arc<dyn KeyValidator>> {
    let http: Arc<dyn KeyValidator> = Arc::new(HttpKeyValidator::new(config)?);

    match config.cache_ttl() {
        Some(ttl) => {
            tracing::info!(ttl_secs = ttl.as_secs(), "Identity resolution cache enabled");
            let cache = ResolutionCache::new(ttl, config.cache_max_entries, clock);
            Ok(Arc::new(CachingValidator::new(http, cache)))
        }
        None => Ok(http),
    }
}
