use std::sync::Arc;

use chrono::DateTime;
use consumer_supervisor_kafka::{KafkaMessage, KafkaReaderConfig, PartitionConsumer};
use tracing::warn;

use crate::error::{Error, Result};
use crate::message::PartitionMessage;
use crate::reader::{PartitionReader, PartitionReaderFactory};

/// Consecutive receive errors tolerated before the reader gives up.
const MAX_CONSECUTIVE_ERRORS: usize = 10;

impl From<KafkaMessage> for PartitionMessage {
    fn from(message: KafkaMessage) -> Self {
        PartitionMessage {
            topic: message.topic,
            partition: message.partition,
            offset: message.offset,
            key: message.key,
            value: message.value,
            headers: message.headers,
            timestamp: message
                .timestamp_millis
                .and_then(DateTime::from_timestamp_millis),
        }
    }
}

impl From<consumer_supervisor_kafka::Error> for Error {
    fn from(value: consumer_supervisor_kafka::Error) -> Self {
        match value {
            consumer_supervisor_kafka::Error::Kafka(e) => Error::Reader(e),
            consumer_supervisor_kafka::Error::Connection { server, error } => Error::Reader(
                format!("Failed to connect to Kafka server: {server} - {error}"),
            ),
            consumer_supervisor_kafka::Error::Other(e) => Error::Reader(e),
        }
    }
}

/// Opens Kafka partition readers, all of them sharing the same connection settings.
#[derive(Debug, Clone)]
pub struct KafkaReaderFactory {
    config: Arc<KafkaReaderConfig>,
}

impl KafkaReaderFactory {
    pub fn new(config: KafkaReaderConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl PartitionReaderFactory for KafkaReaderFactory {
    type Reader = KafkaPartitionReader;

    async fn open(&self, topic: &str, partition: i32, offset: i64) -> Result<KafkaPartitionReader> {
        let config = Arc::clone(&self.config);
        let topic = topic.to_string();
        // creating the librdkafka client blocks
        let consumer = tokio::task::spawn_blocking(move || {
            PartitionConsumer::assign(&config, &topic, partition, offset)
        })
        .await
        .map_err(|e| Error::Reader(format!("Kafka assign task failed: {e}")))??;

        Ok(KafkaPartitionReader { consumer })
    }
}

pub struct KafkaPartitionReader {
    consumer: PartitionConsumer,
}

impl PartitionReader for KafkaPartitionReader {
    async fn next(&mut self) -> Option<Result<PartitionMessage>> {
        let mut errors = 0;
        loop {
            match self.consumer.recv().await {
                Ok(message) => return Some(Ok(message.into())),
                Err(e) => {
                    errors += 1;
                    if errors >= MAX_CONSECUTIVE_ERRORS {
                        return Some(Err(e.into()));
                    }
                    warn!(?e, errors, "Kafka error, waiting for the next message");
                }
            }
        }
    }

    async fn close(self) -> Result<()> {
        let topic = self.consumer.topic().to_string();
        tokio::task::spawn_blocking(move || self.consumer.close())
            .await
            .map_err(|e| Error::Close(format!("Kafka close task failed for {topic}: {e}")))?
            .map_err(|e| Error::Close(e.to_string()))
    }
}
