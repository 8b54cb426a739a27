//! Content-type admission
//!
//! Early reject of request bodies whose declared media type is outside an
//! allow-list. A cost filter, not a security boundary: bodies are not sniffed.

use axum::http::{header, HeaderMap};
use tollgate_common::errors::{AppError, Result};

#[derive(Debug, Clone, Default)]
pub struct ContentTypePolicy {
    allowed: Vec<String>,
}

impl ContentTypePolicy {
    /// An empty list admits everything
    pub fn new(allowed: &[String]) -> Self {
        Self {
            allowed: allowed.iter().map(|t| t.trim().to_ascii_lowercase()).collect(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.allowed.is_empty()
    }

    /// Requests without a Content-Type header always pass
    pub fn check(&self, headers: &HeaderMap) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }

        let Some(value) = headers.get(header::CONTENT_TYPE) else {
            return Ok(());
        };

        let declared = value.to_str().unwrap_or_default();
        let media_type = declared
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        if self.allowed.iter().any(|allowed| *allowed == media_type) {
            Ok(())
        } else {
            Err(AppError::UnsupportedContentType {
                content_type: if media_type.is_empty() {
                    "<unreadable>".to_string()
                } else {
                    media_type
                },
            })
        }
    }
}
