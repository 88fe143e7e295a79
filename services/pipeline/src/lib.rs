//! Linehaul Pipeline - Kafka messaging for the Linehaul access-log pipeline
//!
//! Both pipeline stages are invoked by messages:
//!
//! - The Classifier (`linehaul-ingest`) consumes object-created notifications
//!   for raw log objects.
//! - The Loader (`linehaul-loader`) consumes load triggers. A trigger with no
//!   attributes is a scheduled run; `partition` and `continue_publishing`
//!   attributes request a specific day, and the Loader publishes the same
//!   shape back onto the topic to drain backlog across invocations.
//!
//! # Example
//!
//! ```rust,no_run
//! use linehaul_pipeline::{KafkaConfig, LinehaulProducer, LoadTrigger};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = KafkaConfig::from_env()?;
//!     let producer = LinehaulProducer::new(config)?;
//!
//!     // Ask the Loader to drain 2021-01-07 until nothing is left
//!     producer
//!         .send_load_trigger(&LoadTrigger::for_partition("20210107", true))
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod consumer;
pub mod producer;
pub mod trigger;

pub use config::{
    ConfigError, ConsumerConfig, KafkaConfig, ReliabilityConfig, SaslConfig, SecurityProtocol,
    TopicConfig,
};
pub use consumer::{
    async_trait, ConsumerError, IncomingMessage, LinehaulConsumer, MessageHandler,
    MessageMetadata,
};
pub use producer::{DeliveryResult, LinehaulProducer, OutgoingMessage, ProducerError};
pub use trigger::{
    LoadTrigger, ObjectNotification, TriggerError, CONTINUE_PUBLISHING_ATTRIBUTE,
    PARTITION_ATTRIBUTE,
};
