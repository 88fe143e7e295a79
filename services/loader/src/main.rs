//! Linehaul loader service
//!
//! Consumes load triggers and runs one load cycle per trigger. An empty
//! trigger (from the scheduler) loads today with prior-day draining; a
//! trigger with a `partition` header loads that day and, with
//! `continue_publishing`, re-triggers itself until the day is drained.

use anyhow::{Context, Result};
use linehaul_loader::{Loader, LoaderConfig, LoaderSettings, PgWarehouse};
use linehaul_pipeline::{
    async_trait, ConsumerError, IncomingMessage, LinehaulConsumer, LinehaulProducer, LoadTrigger,
    MessageHandler,
};
use linehaul_storage::{ObjectStore, S3ObjectStore};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, instrument, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

struct LoadTriggerHandler {
    loader: Loader,
}

#[async_trait]
impl MessageHandler for LoadTriggerHandler {
    #[instrument(skip(self, message), fields(offset = message.metadata.offset))]
    async fn handle(&self, message: IncomingMessage) -> Result<(), ConsumerError> {
        let trigger = LoadTrigger::from_attributes(message.attributes())
            .map_err(|e| ConsumerError::DeserializationError(e.to_string()))?;

        let report = self
            .loader
            .run(&trigger)
            .await
            .map_err(|e| ConsumerError::ProcessingError(e.to_string()))?;

        for kind in &report.kinds {
            info!(
                kind = %kind.kind,
                day = %kind.day,
                partitions = kind.partitions,
                deleted = kind.deleted,
                datasets = kind.loads.len(),
                "Loaded partitions"
            );
        }

        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = LoaderConfig::load().context("Failed to load configuration")?;

    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        datasets = ?config.warehouse.datasets,
        "Starting Linehaul loader service"
    );

    config.validate().context("Invalid configuration")?;

    init_metrics(config.service.metrics_port)?;

    let store: Arc<dyn ObjectStore> = Arc::new(S3ObjectStore::new(&config.s3).await);
    let warehouse = Arc::new(
        PgWarehouse::connect(&config.warehouse, store.clone())
            .await
            .context("Failed to connect to warehouse")?,
    );
    let producer = Arc::new(
        LinehaulProducer::new(config.kafka.clone()).context("Failed to create Kafka producer")?,
    );

    let settings = LoaderSettings::from_config(&config).context("Invalid loader settings")?;
    let loader = Loader::new(store, warehouse, producer.clone(), settings);

    let consumer = LinehaulConsumer::new(&config.kafka)
        .context("Failed to create Kafka consumer")?
        .with_dlq_producer(producer);
    consumer
        .subscribe(&[config.kafka.topics.load_triggers.as_str()])
        .context("Failed to subscribe to load triggers")?;

    let shutdown = consumer.shutdown_handle();
    let handler = Arc::new(LoadTriggerHandler { loader });

    let mut consumer_handle = tokio::spawn(async move { consumer.run(handler).await });

    info!("Loader service started");

    // A consumer that stops on its own (e.g. a failed rewind) takes the
    // service down so it restarts from the last committed offset.
    let consumer_result = tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutting down loader service");
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

    info!("Loader service stopped");

    Ok(())
}

fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for SIGINT or SIGTERM
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
