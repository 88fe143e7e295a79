//! Linehaul ingest service
//!
//! Consumes object-created notifications for raw edge access logs and runs
//! the Classifier on each object.
//!
//! # Architecture
//!
//! ```text
//! linehaul.objects -> ObjectNotificationHandler -> Classifier -> result bucket
//! ```
//!
//! Configuration is loaded from `config/ingest`, `/etc/linehaul/ingest` and
//! `INGEST__*` environment variables. See `config.rs` for the options.

use anyhow::{Context, Result};
use linehaul_ingest::{ClassificationOutcome, Classifier, FastlyLineParser, IngestConfig};
use linehaul_pipeline::{
    async_trait, ConsumerError, IncomingMessage, LinehaulConsumer, LinehaulProducer,
    MessageHandler, ObjectNotification,
};
use linehaul_storage::S3ObjectStore;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, instrument, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Runs the Classifier for every object notification
struct ObjectNotificationHandler {
    classifier: Classifier,
}

#[async_trait]
impl MessageHandler for ObjectNotificationHandler {
    #[instrument(skip(self, message), fields(offset = message.metadata.offset))]
    async fn handle(&self, message: IncomingMessage) -> Result<(), ConsumerError> {
        let notification = ObjectNotification::from_json(&message.payload)
            .map_err(|e| ConsumerError::DeserializationError(e.to_string()))?;

        match self
            .classifier
            .process(&notification.bucket, &notification.name)
            .await
        {
            Ok(ClassificationOutcome::Processed(report)) => {
                info!(
                    source = %report.source,
                    total = report.lines.total,
                    partitions = report.partitions.len(),
                    unprocessed = report.lines.unprocessed,
                    "Processed raw log object"
                );
                Ok(())
            }
            Ok(ClassificationOutcome::Skipped) => Ok(()),
            Err(e) => Err(ConsumerError::ProcessingError(e.to_string())),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = IngestConfig::load().context("Failed to load configuration")?;

    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        result_bucket = %config.classifier.result_bucket,
        "Starting Linehaul ingest service"
    );

    config.validate().context("Invalid configuration")?;

    init_metrics(config.service.metrics_port)?;

    let store = Arc::new(S3ObjectStore::new(&config.s3).await);
    let classifier = Classifier::new(
        store,
        Arc::new(FastlyLineParser),
        config.classifier.result_bucket.clone(),
    );

    let dlq_producer = Arc::new(
        LinehaulProducer::new(config.kafka.clone()).context("Failed to create DLQ producer")?,
    );
    let consumer = LinehaulConsumer::new(&config.kafka)
        .context("Failed to create Kafka consumer")?
        .with_dlq_producer(dlq_producer);
    consumer
        .subscribe(&[config.kafka.topics.object_notifications.as_str()])
        .context("Failed to subscribe to object notifications")?;

    let shutdown = consumer.shutdown_handle();
    let handler = Arc::new(ObjectNotificationHandler { classifier });

    let mut consumer_handle = tokio::spawn(async move { consumer.run(handler).await });

    info!("Ingest service started");

    // A consumer that stops on its own (e.g. a failed rewind) takes the
    // service down so it restarts from the last committed offset.
    let consumer_result = tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutting down ingest service");
            if shutdown.send(()).is_err() {
                warn!("Consumer already stopped");
            }
            (&mut consumer_handle).await
        }
        result = &mut consumer_handle => result,
    };

    consumer_result
        .context("Consumer task failed")?
        .context("Kafka consumer stopped")?;

    info!("Ingest service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
