//! Linehaul trigger tool
//!
//! Publishes pipeline invocations onto Kafka. Used by the scheduler for the
//! periodic Loader run and by operators to load or drain a specific day.

use anyhow::{bail, Result};
use linehaul_pipeline::{KafkaConfig, LinehaulProducer, LoadTrigger, ObjectNotification};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const USAGE: &str = "\
Usage: linehaul-trigger <command>

Commands:
  schedule                    Publish a scheduled Loader trigger (today, with prior-day fallback)
  load <YYYYMMDD> [--drain]   Publish a Loader trigger for one day; --drain keeps re-triggering
                              until the day's backlog is empty
  classify <bucket> <name>    Publish an object notification for a raw log object

Environment variables:
  KAFKA_BOOTSTRAP_SERVERS     Kafka broker addresses (default: localhost:9092)
  KAFKA_LOAD_TRIGGERS_TOPIC   Load trigger topic (default: linehaul.load-triggers)
  KAFKA_SECURITY_PROTOCOL     Security protocol (plaintext, ssl, sasl_plaintext, sasl_ssl)
  KAFKA_SASL_USERNAME         SASL username
  KAFKA_SASL_PASSWORD         SASL password";

enum Command {
    Schedule,
    Load { partition: String, drain: bool },
    Classify(ObjectNotification),
}

fn parse_args(args: &[String]) -> Result<Command> {
    match args {
        [cmd] if cmd == "schedule" => Ok(Command::Schedule),
        [cmd, partition] if cmd == "load" => Ok(Command::Load {
            partition: partition.clone(),
            drain: false,
        }),
        [cmd, partition, flag] if cmd == "load" && flag == "--drain" => Ok(Command::Load {
            partition: partition.clone(),
            drain: true,
        }),
        [cmd, bucket, name] if cmd == "classify" => Ok(Command::Classify(ObjectNotification {
            bucket: bucket.clone(),
            name: name.clone(),
        })),
        _ => bail!("{USAGE}"),
    }
}

fn validate_partition(partition: &str) -> Result<()> {
    if partition.len() != 8
        || chrono::NaiveDate::parse_from_str(partition, "%Y%m%d").is_err()
    {
        bail!("invalid partition {partition:?}, expected YYYYMMDD");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_target(false))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = parse_args(&args)?;

    let config = KafkaConfig::from_env()?;
    let producer = LinehaulProducer::new(config)?;

    let delivery = match command {
        Command::Schedule => producer.send_load_trigger(&LoadTrigger::scheduled()).await?,
        Command::Load { partition, drain } => {
            validate_partition(&partition)?;
            producer
                .send_load_trigger(&LoadTrigger::for_partition(partition, drain))
                .await?
        }
        Command::Classify(notification) => producer.send_object_notification(&notification).await?,
    };

    producer.flush(Duration::from_secs(5))?;

    info!(
        topic = %delivery.topic,
        partition = delivery.partition,
        offset = delivery.offset,
        "Trigger published"
    );

    Ok(())
}
