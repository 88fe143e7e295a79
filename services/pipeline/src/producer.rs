//! Kafka producer wrapper for the Linehaul pipeline.
//!
//! Publishes load triggers (including the Loader's own continuation
//! signals), object notifications and dead-lettered messages.

use crate::config::KafkaConfig;
use crate::trigger::{LoadTrigger, ObjectNotification};
use base64::{engine::general_purpose::STANDARD, Engine};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Errors that can occur during message production
#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("Failed to create producer: {0}")]
    CreationError(String),

    #[error("Failed to serialize message: {0}")]
    SerializationError(String),

    #[error("Failed to send message to topic {topic}: {message}")]
    SendError { topic: String, message: String },

    #[error("Producer timeout after {0:?}")]
    Timeout(Duration),
}

/// Result of a successful message delivery
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// Message to be sent to Kafka
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub topic: String,
    /// Optional message key for partitioning
    pub key: Option<String>,
    pub payload: Vec<u8>,
    /// Attributes, sent as Kafka headers
    pub headers: Vec<(String, String)>,
}

impl OutgoingMessage {
    /// A message carrying only attributes
    pub fn empty(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            payload: Vec::new(),
            headers: Vec::new(),
        }
    }

    /// Create a new outgoing message with a JSON payload
    pub fn new_json<T: serde::Serialize>(
        topic: impl Into<String>,
        message: &T,
    ) -> Result<Self, ProducerError> {
        let payload = serde_json::to_vec(message)
            .map_err(|e| ProducerError::SerializationError(e.to_string()))?;
        Ok(Self {
            payload,
            ..Self::empty(topic)
        })
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    fn owned_headers(&self) -> OwnedHeaders {
        self.headers
            .iter()
            .fold(OwnedHeaders::new_with_capacity(self.headers.len()), |headers, (key, value)| {
                headers.insert(Header {
                    key: key.as_str(),
                    value: Some(value.as_str()),
                })
            })
    }
}

/// High-level Kafka producer wrapper
pub struct LinehaulProducer {
    producer: FutureProducer,
    config: Arc<KafkaConfig>,
    default_timeout: Duration,
}

impl LinehaulProducer {
    /// Create a new producer with the given configuration
    pub fn new(config: KafkaConfig) -> Result<Self, ProducerError> {
        info!(brokers = %config.bootstrap_servers, "Creating Kafka producer");

        let producer: FutureProducer = config
            .build_producer_config()
            .create()
            .map_err(|e| ProducerError::CreationError(e.to_string()))?;

        let default_timeout = config.request_timeout();

        Ok(Self {
            producer,
            config: Arc::new(config),
            default_timeout,
        })
    }

    pub fn config(&self) -> &KafkaConfig {
        &self.config
    }

    /// Send a message and wait for delivery confirmation
    #[instrument(skip(self, message), fields(topic = %message.topic, key = ?message.key))]
    pub async fn send(&self, message: OutgoingMessage) -> Result<DeliveryResult, ProducerError> {
        let mut record = FutureRecord::to(&message.topic)
            .payload(&message.payload)
            .headers(message.owned_headers());

        if let Some(ref key) = message.key {
            record = record.key(key.as_str());
        }

        debug!(size_bytes = message.payload.len(), "Sending message");

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(self.default_timeout))
            .await
            .map_err(|(e, _)| ProducerError::SendError {
                topic: message.topic.clone(),
                message: e.to_string(),
            })?;

        debug!(partition, offset, "Message delivered");

        Ok(DeliveryResult {
            topic: message.topic,
            partition,
            offset,
        })
    }

    /// Publish a load trigger to the load triggers topic
    pub async fn send_load_trigger(
        &self,
        trigger: &LoadTrigger,
    ) -> Result<DeliveryResult, ProducerError> {
        let message = trigger.to_attributes().into_iter().fold(
            OutgoingMessage::empty(&self.config.topics.load_triggers),
            |message, (key, value)| message.with_header(key, value),
        );

        let message = match trigger.partition {
            Some(ref partition) => message.with_key(partition),
            None => message,
        };

        self.send(message).await
    }

    /// Publish an object notification to the object notifications topic
    pub async fn send_object_notification(
        &self,
        notification: &ObjectNotification,
    ) -> Result<DeliveryResult, ProducerError> {
        let message =
            OutgoingMessage::new_json(&self.config.topics.object_notifications, notification)?
                .with_key(&notification.name);
        self.send(message).await
    }

    /// Forward a message that could not be handled to the dead letter queue
    pub async fn send_to_dlq(
        &self,
        original_topic: &str,
        original_message: &[u8],
        original_headers: &[(String, String)],
        error: &str,
    ) -> Result<DeliveryResult, ProducerError> {
        let dlq_message = serde_json::json!({
            "original_topic": original_topic,
            "original_message_base64": STANDARD.encode(original_message),
            "original_headers": original_headers,
            "error": error,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        let message = OutgoingMessage::new_json(&self.config.topics.dead_letter_queue, &dlq_message)?
            .with_key(Uuid::new_v4().to_string())
            .with_header("original-topic", original_topic)
            .with_header("error-reason", error);

        self.send(message).await
    }

    /// Flush all pending messages
    pub fn flush(&self, timeout: Duration) -> Result<(), ProducerError> {
        self.producer
            .flush(Timeout::After(timeout))
            .map_err(|_| ProducerError::Timeout(timeout))
    }
}

impl Drop for LinehaulProducer {
    fn drop(&mut self) {
        if let Err(e) = self.flush(Duration::from_secs(5)) {
            warn!(error = %e, "Failed to flush producer on shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outgoing_message_builder() {
        let message = OutgoingMessage::empty("linehaul.load-triggers")
            .with_key("20210107")
            .with_header("partition", "20210107")
            .with_header("continue_publishing", "true");

        assert_eq!(message.key, Some("20210107".to_string()));
        assert_eq!(message.headers.len(), 2);
        assert!(message.payload.is_empty());
    }

    #[test]
    fn test_json_message() {
        let notification = ObjectNotification {
            bucket: "raw".to_string(),
            name: "a.log.gz".to_string(),
        };
        let message = OutgoingMessage::new_json("linehaul.objects", &notification).unwrap();
        let decoded: ObjectNotification = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(decoded, notification);
    }
}
