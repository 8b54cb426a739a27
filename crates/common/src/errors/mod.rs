//! Error types for Tollgate services
//!
//! Provides a comprehensive error handling system with:
//! - Distinct error types for each gateway failure mode
//! - HTTP status code mapping
//! - Structured `{error, code}` JSON responses
//! - Stable error codes for client handling

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Error codes for machine-readable error identification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Request errors
    InvalidRoute,
    UnsupportedContentType,

    // Authentication errors
    MissingApiKey,
    InvalidApiKey,
    UnknownApiKey,

    // Rate limiting
    RateLimitExceeded,

    // External service errors
    GatewayError,
    GatewayTimeout,
    ValidatorUnavailable,
    RateLimitStoreUnavailable,

    // Internal errors
    InternalError,
    ConfigurationError,
}

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    // Request errors
    #[error("Invalid route: {message}")]
    InvalidRoute { message: String },

    #[error("Unsupported content type: {content_type}")]
    UnsupportedContentType { content_type: String },

    // Authentication errors
    #[error("API key required: send X-API-Key or Authorization: Bearer <key>")]
    CredentialMissing,

    #[error("Invalid API key")]
    CredentialInvalid,

    #[error("API key not recognized")]
    CredentialNotFound,

    #[error("Key validation service unavailable: {message}")]
    ValidatorUnavailable { message: String },

    // Rate limiting
    #[error("Rate limit exceeded: {limit} requests per {window}")]
    RateLimitExceeded {
        window: &'static str,
        limit: u64,
        retry_after_secs: u64,
    },

    #[error("Rate limit store unavailable: {message}")]
    RateLimitStoreUnavailable { message: String },

    // Upstream errors
    #[error("Upstream service unreachable")]
    UpstreamUnreachable { message: String },

    #[error("Upstream service did not respond within {timeout_ms}ms")]
    UpstreamTimeout { timeout_ms: u64 },

    // Internal errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Internal server error")]
    Internal { message: String },
}

impl AppError {
    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::InvalidRoute { .. } => ErrorCode::InvalidRoute,
            AppError::UnsupportedContentType { .. } => ErrorCode::UnsupportedContentType,
            AppError::CredentialMissing => ErrorCode::MissingApiKey,
            AppError::CredentialInvalid => ErrorCode::InvalidApiKey,
            AppError::CredentialNotFound => ErrorCode::UnknownApiKey,
            AppError::ValidatorUnavailable { .. } => ErrorCode::ValidatorUnavailable,
            AppError::RateLimitExceeded { .. } => ErrorCode::RateLimitExceeded,
            AppError::RateLimitStoreUnavailable { .. } => ErrorCode::RateLimitStoreUnavailable,
            AppError::UpstreamUnreachable { .. } => ErrorCode::GatewayError,
            AppError::UpstreamTimeout { .. } => ErrorCode::GatewayTimeout,
            AppError::Configuration { .. } => ErrorCode::ConfigurationError,
            AppError::Internal { .. } => ErrorCode::InternalError,
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            AppError::InvalidRoute { .. } => StatusCode::BAD_REQUEST,

            // 401 Unauthorized
            AppError::CredentialMissing |
            AppError::CredentialInvalid |
            AppError::CredentialNotFound => StatusCode::UNAUTHORIZED,

            // 415 Unsupported Media Type
            AppError::UnsupportedContentType { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,

            // 429 Too Many Requests
            AppError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,

            // 500 Internal Server Error
            AppError::Configuration { .. } |
            AppError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,

            // 502 Bad Gateway
            AppError::UpstreamUnreachable { .. } => StatusCode::BAD_GATEWAY,

            // 503 Service Unavailable
            AppError::ValidatorUnavailable { .. } |
            AppError::RateLimitStoreUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,

            // 504 Gateway Timeout
            AppError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Check if this error should be logged at error level
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }

    /// Check if this error is a client error
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Operator-facing detail that is logged but never sent to clients
    fn internal_detail(&self) -> Option<&str> {
        match self {
            AppError::UpstreamUnreachable { message } |
            AppError::Internal { message } => Some(message),
            _ => None,
        }
    }
}

/// Structured error response for API
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: ErrorCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();
        let message = self.to_string();

        // Log based on severity
        if self.is_server_error() {
            tracing::error!(
                error = %message,
                detail = self.internal_detail().unwrap_or_default(),
                code = ?code,
                status = status.as_u16(),
                "Server error"
            );
        } else if self.is_client_error() {
            tracing::warn!(
                error = %message,
                code = ?code,
                status = status.as_u16(),
                "Client error"
            );
        }

        let retry_after_secs = match &self {
            AppError::RateLimitExceeded { retry_after_secs, .. } => Some(*retry_after_secs),
            _ => None,
        };

        let body = ErrorResponse {
            error: message,
            code,
            retry_after_secs,
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after_secs {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        AppError::RateLimitStoreUnavailable {
            message: err.to_string(),
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Configuration {
            message: err.to_string(),
        }
    }
}
