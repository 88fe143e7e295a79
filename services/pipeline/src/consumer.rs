//! Kafka consumer wrapper for the Linehaul pipeline.
//!
//! Each message is one invocation of a pipeline stage. Offsets are committed
//! only after the handler succeeds; failed messages are forwarded to the dead
//! letter queue when one is configured so they can be replayed. A failure that
//! could not be dead-lettered rewinds its partition and is retried with backoff,
//! since committing any later offset would skip it for good.

use crate::config::KafkaConfig;
use crate::producer::LinehaulProducer;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Headers, Message as KafkaMessage};
use rdkafka::Offset;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

/// Errors that can occur during message consumption
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Failed to create consumer: {0}")]
    CreationError(String),

    #[error("Failed to subscribe to topics: {0}")]
    SubscriptionError(String),

    #[error("Failed to deserialize message: {0}")]
    DeserializationError(String),

    #[error("Message processing error: {0}")]
    ProcessingError(String),

    #[error("Failed to rewind {topic}/{partition} to offset {offset}: {message}")]
    SeekError {
        topic: String,
        partition: i32,
        offset: i64,
        message: String,
    },
}

const SEEK_TIMEOUT: Duration = Duration::from_secs(10);

/// What to do with a message once its handler has run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    /// Handled, or durably recorded in the DLQ
    Commit,
    /// Nothing recorded the failure; consume the same offset again
    Redeliver,
}

impl Disposition {
    fn after(handled: bool, dead_lettered: bool) -> Self {
        if handled || dead_lettered {
            Disposition::Commit
        } else {
            Disposition::Redeliver
        }
    }
}

/// Delay before redelivering a message that failed without being recorded.
/// Grows per consecutive failure and resets once a message is committed.
struct Redelivery {
    backoff: ExponentialBackoff,
}

impl Redelivery {
    fn new(initial: Duration, max: Duration) -> Self {
        let mut backoff = ExponentialBackoff {
            initial_interval: initial,
            max_interval: max,
            max_elapsed_time: None,
            ..Default::default()
        };
        backoff.reset();
        Self { backoff }
    }

    fn next_delay(&mut self) -> Duration {
        self.backoff.next_backoff().unwrap_or(self.backoff.max_interval)
    }

    fn reset(&mut self) {
        self.backoff.reset();
    }
}

/// Metadata about a received message
#[derive(Debug, Clone)]
pub struct MessageMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub timestamp: Option<i64>,
    /// Message headers (trigger attributes)
    pub headers: HashMap<String, String>,
}

/// A received message with payload and metadata
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub payload: Vec<u8>,
    pub metadata: MessageMetadata,
}

impl IncomingMessage {
    /// Deserialize the payload as JSON
    pub fn decode_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, ConsumerError> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| ConsumerError::DeserializationError(e.to_string()))
    }

    /// Get a header value
    pub fn header(&self, key: &str) -> Option<&str> {
        self.metadata.headers.get(key).map(|s| s.as_str())
    }

    /// Message attributes (headers)
    pub fn attributes(&self) -> &HashMap<String, String> {
        &self.metadata.headers
    }

    fn header_pairs(&self) -> Vec<(String, String)> {
        self.metadata
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Handler trait for processing messages
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process a single message
    async fn handle(&self, message: IncomingMessage) -> Result<(), ConsumerError>;

    /// Called when message processing fails
    async fn on_error(&self, message: &IncomingMessage, error: &ConsumerError) {
        warn!(
            topic = %message.metadata.topic,
            partition = message.metadata.partition,
            offset = message.metadata.offset,
            error = %error,
            "Message processing failed"
        );
    }
}

/// High-level Kafka consumer wrapper
pub struct LinehaulConsumer {
    consumer: StreamConsumer,
    shutdown_tx: broadcast::Sender<()>,
    dlq_producer: Option<Arc<LinehaulProducer>>,
    redelivery_initial: Duration,
    redelivery_max: Duration,
}

impl LinehaulConsumer {
    /// Create a new consumer with the given configuration
    pub fn new(config: &KafkaConfig) -> Result<Self, ConsumerError> {
        info!(
            brokers = %config.bootstrap_servers,
            group = %config.consumer.group_id,
            "Creating Kafka consumer"
        );

        let consumer: StreamConsumer = config
            .build_consumer_config()
            .create()
            .map_err(|e| ConsumerError::CreationError(e.to_string()))?;

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            consumer,
            shutdown_tx,
            dlq_producer: None,
            redelivery_initial: Duration::from_millis(config.consumer.redelivery_initial_ms),
            redelivery_max: Duration::from_millis(config.consumer.redelivery_max_ms),
        })
    }

    /// Set the dead letter queue producer
    pub fn with_dlq_producer(mut self, producer: Arc<LinehaulProducer>) -> Self {
        self.dlq_producer = Some(producer);
        self
    }

    /// Subscribe to the specified topics
    pub fn subscribe(&self, topics: &[&str]) -> Result<(), ConsumerError> {
        info!(?topics, "Subscribing to topics");
        self.consumer
            .subscribe(topics)
            .map_err(|e| ConsumerError::SubscriptionError(e.to_string()))
    }

    /// Get a shutdown handle that stops [`LinehaulConsumer::run`] when signalled
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Consume messages until shutdown, handing each to `handler` in order
    #[instrument(skip(self, handler))]
    pub async fn run<H: MessageHandler>(&self, handler: Arc<H>) -> Result<(), ConsumerError> {
        use tokio_stream::StreamExt;

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut redelivery = Redelivery::new(self.redelivery_initial, self.redelivery_max);
        let stream = self.consumer.stream();
        tokio::pin!(stream);

        info!("Starting message consumption loop");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal");
                    break;
                }
                message_result = stream.next() => {
                    match message_result {
                        Some(Ok(borrowed_message)) => {
                            let incoming = convert_message(&borrowed_message);

                            debug!(
                                topic = %incoming.metadata.topic,
                                partition = incoming.metadata.partition,
                                offset = incoming.metadata.offset,
                                "Received message"
                            );

                            let (handled, dead_lettered) =
                                match handler.handle(incoming.clone()).await {
                                    Ok(()) => (true, false),
                                    Err(e) => {
                                        error!(error = %e, "Message processing failed");
                                        handler.on_error(&incoming, &e).await;
                                        (false, self.dead_letter(&incoming, &e).await)
                                    }
                                };

                            match Disposition::after(handled, dead_lettered) {
                                Disposition::Commit => {
                                    redelivery.reset();
                                    if let Err(e) = self
                                        .consumer
                                        .commit_message(&borrowed_message, CommitMode::Async)
                                    {
                                        warn!(error = %e, "Failed to commit offset");
                                    }
                                }
                                Disposition::Redeliver => {
                                    let delay = redelivery.next_delay();
                                    warn!(
                                        topic = %incoming.metadata.topic,
                                        partition = incoming.metadata.partition,
                                        offset = incoming.metadata.offset,
                                        delay_ms = delay.as_millis() as u64,
                                        "Failure not recorded; redelivering message"
                                    );
                                    tokio::select! {
                                        _ = shutdown_rx.recv() => {
                                            info!("Received shutdown signal");
                                            break;
                                        }
                                        _ = tokio::time::sleep(delay) => {}
                                    }
                                    self.rewind(&incoming.metadata)?;
                                }
                            }
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "Kafka error");
                        }
                        None => {
                            debug!("Stream ended");
                            break;
                        }
                    }
                }
            }
        }

        // No blanket commit of the consumer position here: it would cover
        // failed messages that were never dead-lettered.
        Ok(())
    }

    /// Point the partition back at a message so the stream yields it again
    fn rewind(&self, metadata: &MessageMetadata) -> Result<(), ConsumerError> {
        self.consumer
            .seek(
                &metadata.topic,
                metadata.partition,
                Offset::Offset(metadata.offset),
                SEEK_TIMEOUT,
            )
            .map_err(|e| ConsumerError::SeekError {
                topic: metadata.topic.clone(),
                partition: metadata.partition,
                offset: metadata.offset,
                message: e.to_string(),
            })
    }

    /// Forward a failed message to the DLQ. Returns whether the message is
    /// now durably recorded elsewhere and its offset may be committed.
    async fn dead_letter(&self, incoming: &IncomingMessage, error: &ConsumerError) -> bool {
        let Some(ref dlq) = self.dlq_producer else {
            return false;
        };

        match dlq
            .send_to_dlq(
                &incoming.metadata.topic,
                &incoming.payload,
                &incoming.header_pairs(),
                &error.to_string(),
            )
            .await
        {
            Ok(_) => true,
            Err(dlq_err) => {
                error!(error = %dlq_err, "Failed to send to DLQ");
                false
            }
        }
    }
}

/// Convert a borrowed Kafka message to an owned IncomingMessage
fn convert_message<M: KafkaMessage>(msg: &M) -> IncomingMessage {
    let payload = msg.payload().unwrap_or(&[]).to_vec();
    let key = msg.key().map(|k| k.to_vec());

    let mut headers = HashMap::new();
    if let Some(h) = msg.headers() {
        for header in h.iter() {
            if let Some(value) = header.value {
                if let Ok(v) = String::from_utf8(value.to_vec()) {
                    headers.insert(header.key.to_string(), v);
                }
            }
        }
    }

    IncomingMessage {
        payload,
        metadata: MessageMetadata {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key,
            timestamp: msg.timestamp().to_millis(),
            headers,
        },
    }
}

/// Async trait for message handlers (re-export for convenience)
pub use async_trait::async_trait;
