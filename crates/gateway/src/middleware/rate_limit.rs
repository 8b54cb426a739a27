//! Sliding-window rate limiting middleware

use crate::AppState;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tollgate_common::{
    config::StoreFailurePolicy,
    errors::{AppError, Result},
    metrics, Identity,
};

/// Enforce the caller's tier windows; runs after authentication
pub async fn enforce(State(state): State<AppState>, request: Request, next: Next) -> Result<Response> {
    let Some(limiter) = state.limiter.as_ref() else {
        return Ok(next.run(request).await);
    };

    let identity = request
        .extensions()
        .get::<Identity>()
        .cloned()
        .ok_or(AppError::CredentialMissing)?;

    let verdict = match limiter.check(&identity).await {
        Ok(verdict) => verdict,
        Err(e) => match state.config.rate_limit.on_store_failure {
            StoreFailurePolicy::FailClosed => {
                metrics::record_store_error("fail_closed");
                return Err(match e {
                    AppError::RateLimitStoreUnavailable { .. } => e,
                    other => AppError::RateLimitStoreUnavailable {
                        message: other.to_string(),
                    },
                });
            }
            StoreFailurePolicy::FailOpen => {
                metrics::record_store_error("fail_open");
                tracing::error!(
                    error = %e,
                    store = limiter.store_name(),
                    api_key_id = %identity.credential_id,
                    "Rate limit store unavailable, admitting request unchecked"
                );
                return Ok(next.run(request).await);
            }
        },
    };

    if let Some(denied) = verdict.denied() {
        let mut response = AppError::RateLimitExceeded {
            window: denied.window.label(),
            limit: denied.decision.limit,
            retry_after_secs: denied.decision.retry_after_secs(),
        }
        .into_response();
        verdict.apply_headers(response.headers_mut());
        return Ok(response);
    }

    let mut response = next.run(request).await;
    verdict.apply_headers(response.headers_mut());
    Ok(response)
}
