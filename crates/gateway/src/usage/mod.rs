//! Usage metering
//!
//! Requests hand a [`UsageEvent`] to the [`UsageLogger`] and move on. A
//! background dispatcher delivers events to the metering collector with
//! bounded concurrency, so a slow or failing collector never reaches the
//! caller's response path.

pub mod metered;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tollgate_common::{
    config::MeteringConfig,
    errors::{AppError, Result},
    metrics::{self, UsageOutcome},
};

pub use metered::MeteredStream;

/// One completed proxied request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub subscription_id: String,
    pub api_key_id: String,
    pub timestamp: DateTime<Utc>,
    pub endpoint: String,
    pub method: String,
    pub status_code: u16,
    pub response_time_ms: u64,
    pub request_size_bytes: u64,
    pub response_size_bytes: u64,
}

/// Destination for usage events
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn send(&self, event: &UsageEvent) -> anyhow::Result<()>;
}

/// Metering collector reached at `POST {url}/usage`
pub struct HttpUsageSink {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpUsageSink {
    pub fn new(config: &MeteringConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| AppError::Configuration {
                message: format!("Failed to create metering HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            endpoint: format!("{}/usage", config.url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl UsageSink for HttpUsageSink {
    async fn send(&self, event: &UsageEvent) -> anyhow::Result<()> {
        self.client
            .post(&self.endpoint)
            .json(event)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Cheap handle for recording usage; clone freely
#[derive(Clone)]
pub struct UsageLogger {
    tx: mpsc::Sender<UsageEvent>,
}

impl UsageLogger {
    /// Spawn the dispatcher and return the recording handle plus its worker
    pub fn spawn(sink: Arc<dyn UsageSink>, config: &MeteringConfig) -> (Self, UsageWorker) {
        let (tx, rx) = mpsc::channel(config.buffer_size.max(1));
        let (stop_tx, stop_rx) = oneshot::channel();

        let handle = tokio::spawn(dispatch(
            rx,
            stop_rx,
            sink,
            config.max_in_flight.max(1),
            config.timeout(),
        ));

        (
            Self { tx },
            UsageWorker {
                handle,
                stop: stop_tx,
            },
        )
    }

    /// Queue an event without waiting; a full buffer drops it
    pub fn record(&self, event: UsageEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                metrics::record_usage(UsageOutcome::Dropped);
                tracing::warn!(
                    subscription_id = %event.subscription_id,
                    endpoint = %event.endpoint,
                    "Usage buffer full, event dropped"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                metrics::record_usage(UsageOutcome::Dropped);
                tracing::debug!("Usage logger stopped, event dropped");
            }
        }
    }
}

/// Owner of the dispatcher task
pub struct UsageWorker {
    handle: JoinHandle<()>,
    stop: oneshot::Sender<()>,
}

impl UsageWorker {
    /// Stop accepting events and deliver what is buffered, up to `timeout`
    pub async fn shutdown(self, timeout: Duration) {
        let Self { mut handle, stop } = self;
        let _ = stop.send(());

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => tracing::info!("Usage logger drained"),
            Ok(Err(e)) => tracing::error!(error = %e, "Usage dispatcher task failed"),
            Err(_) => {
                handle.abort();
                tracing::warn!(
                    timeout_secs = timeout.as_secs(),
                    "Usage logger did not drain in time, remaining events lost"
                );
            }
        }
    }
}

async fn dispatch(
    mut rx: mpsc::Receiver<UsageEvent>,
    mut stop: oneshot::Receiver<()>,
    sink: Arc<dyn UsageSink>,
    max_in_flight: usize,
    timeout: Duration,
) {
    let permits = Arc::new(Semaphore::new(max_in_flight));
    let mut in_flight = JoinSet::new();
    let mut stopping = false;

    loop {
        let event = tokio::select! {
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = &mut stop, if !stopping => {
                // Buffered events are still delivered after close
                stopping = true;
                rx.close();
                continue;
            }
        };

        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };

        let sink = sink.clone();
        in_flight.spawn(async move {
            let _permit = permit;
            deliver(sink.as_ref(), &event, timeout).await;
        });

        while in_flight.try_join_next().is_some() {}
    }

    while in_flight.join_next().await.is_some() {}
}

async fn deliver(sink: &dyn UsageSink, event: &UsageEvent, timeout: Duration) {
    match tokio::time::timeout(timeout, sink.send(event)).await {
        Ok(Ok(())) => metrics::record_usage(UsageOutcome::Sent),
        Ok(Err(e)) => {
            metrics::record_usage(UsageOutcome::Failed);
            tracing::warn!(
                error = %e,
                subscription_id = %event.subscription_id,
                endpoint = %event.endpoint,
                "Failed to deliver usage event"
            );
        }
        Err(_) => {
            metrics::record_usage(UsageOutcome::Failed);
            tracing::warn!(
                timeout_ms = timeout.as_millis() as u64,
                subscription_id = %event.subscription_id,
                "Usage event delivery timed out"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio_test::{assert_err, assert_ok};

    fn event(endpoint: &str) -> UsageEvent {
        UsageEvent {
            subscription_id: "sub-1".into(),
            api_key_id: "key-1".into(),
            timestamp: Utc::now(),
            endpoint: endpoint.into(),
            method: "GET".into(),
            status_code: 200,
            response_time_ms: 12,
            request_size_bytes: 0,
            response_size_bytes: 42,
        }
    }

    fn config(buffer_size: usize, max_in_flight: usize) -> MeteringConfig {
        MeteringConfig {
            buffer_size,
            max_in_flight,
            timeout_ms: 200,
            ..Default::default()
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<UsageEvent>>,
    }

    #[async_trait]
    impl UsageSink for RecordingSink {
        async fn send(&self, event: &UsageEvent) -> anyhow::Result<()> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    struct SlowSink {
        delay: Duration,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl UsageSink for SlowSink {
        async fn send(&self, _event: &UsageEvent) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl UsageSink for FailingSink {
        async fn send(&self, _event: &UsageEvent) -> anyhow::Result<()> {
            anyhow::bail!("collector returned 500")
        }
    }

    #[tokio::test]
    async fn test_events_delivered_before_shutdown_returns() {
        let sink = Arc::new(RecordingSink::default());
        let (logger, worker) = UsageLogger::spawn(sink.clone(), &config(16, 4));

        logger.record(event("/api/acme/weather/a"));
        logger.record(event("/api/acme/weather/b"));
        worker.shutdown(Duration::from_secs(2)).await;

        let mut endpoints: Vec<String> = sink
            .events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.endpoint.clone())
            .collect();
        endpoints.sort();
        assert_eq!(endpoints, vec!["/api/acme/weather/a", "/api/acme/weather/b"]);
    }

    #[tokio::test]
    async fn test_record_never_waits_on_slow_sink() {
        let sink = Arc::new(SlowSink {
            delay: Duration::from_secs(10),
            calls: AtomicUsize::new(0),
        });
        let (logger, _worker) = UsageLogger::spawn(sink, &config(4, 1));

        let start = std::time::Instant::now();
        for i in 0..100 {
            logger.record(event(&format!("/e/{}", i)));
        }
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_dispatcher() {
        let (logger, worker) = UsageLogger::spawn(Arc::new(FailingSink), &config(8, 2));
        logger.record(event("/a"));
        logger.record(event("/b"));
        worker.shutdown(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_in_flight_deliveries_are_bounded() {
        let sink = Arc::new(SlowSink {
            delay: Duration::from_millis(100),
            calls: AtomicUsize::new(0),
        });
        let mut cfg = config(16, 2);
        cfg.timeout_ms = 5_000;
        let (logger, worker) = UsageLogger::spawn(sink.clone(), &cfg);

        for i in 0..6 {
            logger.record(event(&format!("/e/{}", i)));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.calls.load(Ordering::SeqCst), 2);

        worker.shutdown(Duration::from_secs(5)).await;
        assert_eq!(sink.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_record_after_shutdown_is_dropped() {
        let sink = Arc::new(RecordingSink::default());
        let (logger, worker) = UsageLogger::spawn(sink.clone(), &config(4, 1));
        worker.shutdown(Duration::from_secs(1)).await;

        logger.record(event("/late"));
        assert!(sink.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_http_sink_posts_json() {
        use axum::{routing::post, Json, Router};

        let received = Arc::new(Mutex::new(Vec::<UsageEvent>::new()));
        let store = received.clone();
        let router = Router::new().route(
            "/usage",
            post(move |Json(event): Json<UsageEvent>| {
                let store = store.clone();
                async move {
                    store.lock().unwrap().push(event);
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });

        let sink = HttpUsageSink::new(&MeteringConfig {
            url,
            ..Default::default()
        })
        .unwrap();
        assert_ok!(sink.send(&event("/api/acme/weather")).await);

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].response_size_bytes, 42);
    }

    #[tokio::test]
    async fn test_http_sink_reports_collector_errors() {
        let sink = HttpUsageSink::new(&MeteringConfig {
            url: "http://127.0.0.1:1".into(),
            timeout_ms: 200,
            ..Default::default()
        })
        .unwrap();
        assert_err!(sink.send(&event("/x")).await);
    }
}
