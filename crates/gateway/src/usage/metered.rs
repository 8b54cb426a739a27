//! Response body wrapper that meters the proxied stream

use super::{UsageEvent, UsageLogger};
use axum::body::Bytes;
use futures::{stream::BoxStream, Stream};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tollgate_common::metrics::RequestMetrics;

/// Everything needed to finish a request's accounting
pub struct PendingUsage {
    pub logger: UsageLogger,
    pub metrics: RequestMetrics,
    pub started: Instant,
    /// Event with timing and byte counts still unset
    pub event: UsageEvent,
    pub request_bytes: Arc<AtomicU64>,
}

impl PendingUsage {
    fn complete(self, response_bytes: u64) {
        let Self {
            logger,
            metrics,
            started,
            mut event,
            request_bytes,
        } = self;

        event.response_time_ms = started.elapsed().as_millis() as u64;
        event.request_size_bytes = request_bytes.load(Ordering::Relaxed);
        event.response_size_bytes = response_bytes;

        metrics.finish(event.status_code);
        logger.record(event);
    }
}

/// Passes backend chunks through and records usage exactly once: when the
/// stream ends, fails, or is dropped by a departing client.
pub struct MeteredStream {
    inner: BoxStream<'static, reqwest::Result<Bytes>>,
    response_bytes: u64,
    pending: Option<PendingUsage>,
}

impl MeteredStream {
    pub fn new(inner: BoxStream<'static, reqwest::Result<Bytes>>, pending: PendingUsage) -> Self {
        Self {
            inner,
            response_bytes: 0,
            pending: Some(pending),
        }
    }

    fn finish(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.complete(self.response_bytes);
        }
    }
}

impl Stream for MeteredStream {
    type Item = reqwest::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.response_bytes += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                let e = e.without_url();
                tracing::warn!(error = %e, "Upstream body aborted mid-stream");
                this.finish();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for MeteredStream {
    fn drop(&mut self) {
        self.finish();
    }
}
