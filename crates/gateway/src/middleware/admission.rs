//! Content-type admission middleware

use crate::AppState;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use tollgate_common::errors::Result;

/// Reject disallowed bodies before any key lookup or window increment
pub async fn admit_content_type(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response> {
    state.admission.check(request.headers())?;
    Ok(next.run(request).await)
}
