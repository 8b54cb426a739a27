//! API key authentication middleware
//!
//! Resolves the presented credential through the key validator and attaches
//! the resulting [`Identity`] to the request for everything downstream.

use crate::AppState;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use tollgate_common::{
    errors::{AppError, Result},
    identity::extract_credential,
};

pub async fn authenticate(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response> {
    let credential = extract_credential(request.headers()).ok_or(AppError::CredentialMissing)?;

    let identity = state
        .validator
        .resolve(credential, request.uri().path())
        .await?;

    tracing::debug!(
        consumer_id = %identity.consumer_id,
        api_key_id = %identity.credential_id,
        "Credential resolved"
    );

    request.extensions_mut().insert(identity);
    Ok(next.run(request).await)
}
