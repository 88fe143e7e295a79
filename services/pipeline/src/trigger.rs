//! Wire formats of the messages that invoke the pipeline stages.
//!
//! Load triggers carry their parameters as message headers ("attributes") so
//! that an empty message is a valid scheduled trigger.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Header naming the partition day (`YYYYMMDD`) to load
pub const PARTITION_ATTRIBUTE: &str = "partition";
/// Header asking the Loader to re-publish itself while backlog remains
pub const CONTINUE_PUBLISHING_ATTRIBUTE: &str = "continue_publishing";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TriggerError {
    #[error("Invalid value {value:?} for attribute {attribute}")]
    InvalidAttribute { attribute: &'static str, value: String },

    #[error("Invalid object notification: {0}")]
    InvalidNotification(String),
}

/// Parameters of one Loader invocation.
///
/// `partition: None` is a scheduled invocation; the Loader derives the day
/// from the clock.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadTrigger {
    pub partition: Option<String>,
    pub continue_publishing: bool,
}

impl LoadTrigger {
    /// A scheduled (cron) trigger
    pub fn scheduled() -> Self {
        Self::default()
    }

    /// An explicit trigger for one day
    pub fn for_partition(partition: impl Into<String>, continue_publishing: bool) -> Self {
        Self {
            partition: Some(partition.into()),
            continue_publishing,
        }
    }

    /// Read a trigger from message attributes
    pub fn from_attributes(attributes: &HashMap<String, String>) -> Result<Self, TriggerError> {
        let partition = attributes
            .get(PARTITION_ATTRIBUTE)
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty());

        let continue_publishing = match attributes.get(CONTINUE_PUBLISHING_ATTRIBUTE) {
            Some(value) => parse_flag(value).ok_or_else(|| TriggerError::InvalidAttribute {
                attribute: CONTINUE_PUBLISHING_ATTRIBUTE,
                value: value.clone(),
            })?,
            None => false,
        };

        Ok(Self {
            partition,
            continue_publishing,
        })
    }

    /// Attributes to publish for this trigger
    pub fn to_attributes(&self) -> Vec<(String, String)> {
        let mut attributes = Vec::with_capacity(2);
        if let Some(ref partition) = self.partition {
            attributes.push((PARTITION_ATTRIBUTE.to_string(), partition.clone()));
        }
        attributes.push((
            CONTINUE_PUBLISHING_ATTRIBUTE.to_string(),
            self.continue_publishing.to_string(),
        ));
        attributes
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" | "" => Some(false),
        _ => None,
    }
}

/// Object-created notification for a raw log object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectNotification {
    pub bucket: String,
    pub name: String,
}

impl ObjectNotification {
    pub fn from_json(payload: &[u8]) -> Result<Self, TriggerError> {
        let notification: Self = serde_json::from_slice(payload)
            .map_err(|e| TriggerError::InvalidNotification(e.to_string()))?;
        if notification.bucket.is_empty() || notification.name.is_empty() {
            return Err(TriggerError::InvalidNotification(
                "bucket and name must be non-empty".to_string(),
            ));
        }
        Ok(notification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attributes(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_empty_attributes_are_scheduled() {
        let trigger = LoadTrigger::from_attributes(&HashMap::new()).unwrap();
        assert_eq!(trigger, LoadTrigger::scheduled());
    }

    #[test]
    fn test_explicit_trigger() {
        let trigger = LoadTrigger::from_attributes(&attributes(&[
            ("partition", "20210107"),
            ("continue_publishing", "True"),
        ]))
        .unwrap();
        assert_eq!(trigger, LoadTrigger::for_partition("20210107", true));
    }

    #[test]
    fn test_blank_partition_is_scheduled() {
        let trigger =
            LoadTrigger::from_attributes(&attributes(&[("partition", "  ")])).unwrap();
        assert_eq!(trigger.partition, None);
    }

    #[test]
    fn test_invalid_flag_is_rejected() {
        let err = LoadTrigger::from_attributes(&attributes(&[("continue_publishing", "maybe")]))
            .unwrap_err();
        assert_eq!(
            err,
            TriggerError::InvalidAttribute {
                attribute: CONTINUE_PUBLISHING_ATTRIBUTE,
                value: "maybe".to_string(),
            }
        );
    }

    #[test]
    fn test_attributes_survive_publish() {
        let trigger = LoadTrigger::for_partition("20210107", true);
        let published: HashMap<String, String> = trigger.to_attributes().into_iter().collect();
        assert_eq!(LoadTrigger::from_attributes(&published).unwrap(), trigger);
    }

    #[test]
    fn test_object_notification() {
        let notification =
            ObjectNotification::from_json(br#"{"bucket": "raw-logs", "name": "a.log.gz"}"#)
                .unwrap();
        assert_eq!(notification.bucket, "raw-logs");
        assert_eq!(notification.name, "a.log.gz");

        assert!(ObjectNotification::from_json(br#"{"bucket": "", "name": "a"}"#).is_err());
        assert!(ObjectNotification::from_json(b"not json").is_err());
    }
}
