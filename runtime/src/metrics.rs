//! Prometheus metrics for observability and monitoring.
//!
//! Metrics are recorded through the `metrics` facade, so they cost nothing
//! until a recorder is installed. The binary installs one with
//! [`MetricsServer::start`] when metrics are enabled.
//!
//! # Example
//!
//! ```rust,no_run
//! use library_events_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Start metrics server on port 9090
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the global recorder and serve `/metrics` in a background task.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Build`] if the exporter cannot be built or the
    /// address cannot be bound.
    ///
    /// # Note
    ///
    /// If a metrics recorder is already installed (e.g., in tests), the
    /// exporter is discarded with a warning and the existing recorder keeps
    /// collecting.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        if metrics::set_global_recorder(recorder).is_err() {
            tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
            return Ok(());
        }

        tokio::spawn(async move {
            if let Err(e) = exporter.await {
                tracing::error!(error = ?e, "Metrics exporter stopped");
            }
        });

        self.handle = Some(handle);
        tracing::info!(
            addr = %self.addr,
            "Metrics server started - available at http://{}/metrics",
            self.addr
        );
        Ok(())
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    describe_counter!(
        "library_events_received_total",
        "Total number of messages handed to the event processor"
    );
    describe_counter!(
        "library_events_persisted_total",
        "Total number of library events persisted"
    );
    describe_counter!(
        "library_events_requeued_total",
        "Total number of messages published to the retry topic"
    );
    describe_counter!(
        "library_events_dead_lettered_total",
        "Total number of messages published to the dead-letter topic"
    );
    describe_counter!(
        "library_events_persist_retries_total",
        "Total number of in-process upsert retries after transient store failures"
    );
    describe_histogram!(
        "library_events_processing_duration_seconds",
        "Time from receiving a message to its terminal state"
    );
    describe_counter!(
        "library_events_store_upserts_total",
        "Total number of successful upserts by operation"
    );
    describe_counter!(
        "library_events_store_errors_total",
        "Total number of failed upserts by operation"
    );
    describe_histogram!(
        "library_events_store_upsert_duration_seconds",
        "Time taken by one upsert transaction"
    );
}

/// Event processor metrics recorder.
pub struct ProcessorMetrics;

impl ProcessorMetrics {
    /// Record a message handed to the processor.
    pub fn record_received(topic: &str) {
        counter!("library_events_received_total", "topic" => topic.to_string()).increment(1);
    }

    /// Record a persisted event.
    pub fn record_persisted(event_type: &'static str) {
        counter!("library_events_persisted_total", "event_type" => event_type).increment(1);
    }

    /// Record a message sent to the retry topic.
    pub fn record_requeued(error_class: &'static str) {
        counter!("library_events_requeued_total", "error_class" => error_class).increment(1);
    }

    /// Record a message sent to the dead-letter topic.
    pub fn record_dead_lettered(error_class: &'static str) {
        counter!("library_events_dead_lettered_total", "error_class" => error_class).increment(1);
    }

    /// Record in-process upsert retries.
    pub fn record_persist_retries(retries: u32) {
        if retries > 0 {
            counter!("library_events_persist_retries_total").increment(u64::from(retries));
        }
    }

    /// Record the time a message took to reach its terminal state.
    pub fn record_duration(duration: Duration) {
        histogram!("library_events_processing_duration_seconds").record(duration.as_secs_f64());
    }
}
