use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};

/// A message read from a single partition of a topic. It owns its payload, so a reader is free
/// to recycle its own buffers once the message has been handed over.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionMessage {
    pub topic: String,
    pub partition: i32,
    /// Position of the message within the partition.
    pub offset: i64,
    pub key: Option<Bytes>,
    /// The user payload.
    pub value: Bytes,
    pub headers: HashMap<String, String>,
    /// Broker assigned (or producer supplied) timestamp, when the broker reports one.
    pub timestamp: Option<DateTime<Utc>>,
}

impl PartitionMessage {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64, value: Bytes) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: None,
            value,
            headers: HashMap::new(),
            timestamp: None,
        }
    }
}

impl fmt::Display for PartitionMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]@{}", self.topic, self.partition, self.offset)
    }
}
