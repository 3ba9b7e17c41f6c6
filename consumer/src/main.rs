//! Library events consumer.
//!
//! Persists library events from the main topic, re-drives retryable failures
//! through the retry topic and parks the rest on the dead-letter topic.

use anyhow::Context;
use library_events_consumer::config::Config;
use library_events_core::message_bus::{MessageBus, MessageHandler};
use library_events_postgres::PostgresEventRepository;
use library_events_redpanda::RedpandaMessageBus;
use library_events_runtime::metrics::MetricsServer;
use library_events_runtime::{
    DispatcherConfig, ErrorRouter, EventProcessor, IngestDispatcher, RetryDispatcher, RetryPolicy,
    RouterConfig,
};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "library_events=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting library events consumer");

    let config = Config::from_env();
    info!(
        redpanda_brokers = %config.redpanda.brokers,
        topic = %config.topics.main,
        retry_topic = %config.topics.retry,
        dead_letter_topic = %config.topics.dead_letter,
        retry_listener_startup = config.retry.listener_startup,
        max_retries = config.retry.max_retries,
        "Configuration loaded"
    );

    if config.server.metrics_enabled {
        let mut metrics = MetricsServer::new(config.server.metrics_addr);
        metrics.start().context("starting metrics server")?;
        info!(addr = %config.server.metrics_addr, "Metrics server started");
    }

    info!("Connecting to database...");
    let repository = PostgresEventRepository::connect(
        &config.postgres.url,
        config.postgres.max_connections,
        config.postgres.connect_timeout,
    )
    .await
    .context("connecting to database")?;
    repository.migrate().await.context("running migrations")?;
    info!("Database ready");

    let bus: Arc<dyn MessageBus> = Arc::new(
        RedpandaMessageBus::builder()
            .brokers(&config.redpanda.brokers)
            .auto_offset_reset(&config.redpanda.auto_offset_reset)
            .buffer_size(config.redpanda.buffer_size)
            .redelivery_backoff(config.redpanda.redelivery_backoff)
            .build()
            .context("creating Redpanda client")?,
    );

    let router = ErrorRouter::new(
        Arc::clone(&bus),
        RouterConfig {
            retry_topic: config.topics.retry.clone(),
            dead_letter_topic: config.topics.dead_letter.clone(),
            max_retries: config.retry.max_retries,
        },
    );
    let persist_policy = RetryPolicy::builder()
        .max_retries(config.retry.persist_attempts)
        .initial_delay(config.retry.persist_initial_delay)
        .build();
    let processor: Arc<dyn MessageHandler> = Arc::new(
        EventProcessor::new(Arc::new(repository.clone()), router).with_persist_policy(persist_policy),
    );

    let ingest = IngestDispatcher::new(
        Arc::clone(&bus),
        Arc::clone(&processor),
        DispatcherConfig::new(&config.topics.main, &config.topics.main_group),
    );
    let retry = RetryDispatcher::new(
        bus,
        processor,
        DispatcherConfig::new(&config.topics.retry, &config.topics.retry_group),
        config.retry.listener_startup,
    );

    ingest.start().await.context("subscribing to main topic")?;
    retry
        .start_if_enabled()
        .await
        .context("subscribing to retry topic")?;

    info!("Library events consumer running");

    shutdown_signal().await;

    info!(
        timeout_secs = config.server.shutdown_timeout.as_secs(),
        "Stopping dispatchers"
    );
    let stopped = tokio::time::timeout(config.server.shutdown_timeout, async {
        retry.stop().await;
        ingest.stop().await;
    })
    .await;

    match stopped {
        Ok(()) => info!("Dispatchers stopped"),
        Err(_) => warn!("Dispatchers did not stop within timeout, uncommitted messages will be redelivered"),
    }

    repository.pool().close().await;
    info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            },
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C"),
        () = terminate => info!("Received SIGTERM"),
    }
}
