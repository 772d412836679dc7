use std::collections::HashMap;

use bytes::Bytes;
use rdkafka::Offset;
use rdkafka::client::ClientContext;
use rdkafka::config::{ClientConfig, RDKafkaLogLevel};
use rdkafka::consumer::stream_consumer::StreamConsumer;
use rdkafka::consumer::{Consumer, ConsumerContext};
use rdkafka::error::KafkaError;
use rdkafka::message::{Headers, Message};
use rdkafka::topic_partition_list::TopicPartitionList;
use tracing::{debug, error, info, warn};

pub type Result<T> = core::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Connecting to Kafka {server} - {error}")]
    Connection { server: String, error: String },

    #[error("Kafka - {0}")]
    Kafka(String),

    #[error("{0}")]
    Other(String),
}

/// Represents the authentication method used to connect to Kafka.
#[derive(Clone, PartialEq)]
pub enum KafkaAuth {
    Sasl {
        mechanism: String,
        username: String,
        password: String,
    },
}

impl std::fmt::Debug for KafkaAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KafkaAuth::Sasl {
                mechanism,
                username,
                ..
            } => write!(f, "Sasl {{ mechanism: {mechanism}, username: {username}, password: **** }}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TlsConfig {
    pub insecure_skip_verify: bool,
    pub ca_cert: Option<String>,
    pub client_auth: Option<TlsClientAuthCerts>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TlsClientAuthCerts {
    pub client_cert: String,
    pub client_cert_private_key: String,
}

/// Connection settings shared by all the partition readers of a process.
#[derive(Debug, Clone, PartialEq)]
pub struct KafkaReaderConfig {
    pub brokers: Vec<String>,
    /// librdkafka wants a group even though partitions are assigned by hand and nothing is
    /// committed.
    pub group_id: String,
    pub auth: Option<KafkaAuth>,
    pub tls: Option<TlsConfig>,
}

/// Message received from Kafka. It owns its data, the underlying librdkafka buffer is released
/// as soon as it is built.
#[derive(Debug, Clone, PartialEq)]
pub struct KafkaMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    /// The user payload.
    pub value: Bytes,
    pub headers: HashMap<String, String>,
    /// Milliseconds since epoch, if the broker reported a timestamp.
    pub timestamp_millis: Option<i64>,
}

impl<M: Message> From<&M> for KafkaMessage {
    fn from(message: &M) -> Self {
        let headers = match message.headers() {
            Some(headers) => headers
                .iter()
                .map(|header| {
                    (
                        header.key.to_string(),
                        String::from_utf8_lossy(header.value.unwrap_or_default()).to_string(),
                    )
                })
                .collect(),
            None => HashMap::new(),
        };

        KafkaMessage {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(Bytes::copy_from_slice),
            value: message
                .payload()
                .map(Bytes::copy_from_slice)
                .unwrap_or_default(),
            headers,
            timestamp_millis: message.timestamp().to_millis(),
        }
    }
}

/// Routes the librdkafka logs and errors to `tracing`.
struct KafkaContext;

impl ClientContext for KafkaContext {
    fn log(&self, level: RDKafkaLogLevel, fac: &str, log_message: &str) {
        match level {
            RDKafkaLogLevel::Emerg
            | RDKafkaLogLevel::Alert
            | RDKafkaLogLevel::Critical
            | RDKafkaLogLevel::Error => error!(fac, "librdkafka: {log_message}"),
            RDKafkaLogLevel::Warning => warn!(fac, "librdkafka: {log_message}"),
            RDKafkaLogLevel::Notice | RDKafkaLogLevel::Info => {
                info!(fac, "librdkafka: {log_message}")
            }
            RDKafkaLogLevel::Debug => debug!(fac, "librdkafka: {log_message}"),
        }
    }

    fn error(&self, error: KafkaError, reason: &str) {
        error!(?error, reason, "librdkafka error");
    }
}

impl ConsumerContext for KafkaContext {}

fn client_config(config: &KafkaReaderConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("group.id", &config.group_id)
        .set("bootstrap.servers", config.brokers.join(","))
        .set("enable.partition.eof", "false")
        .set("enable.auto.commit", "false")
        .set("enable.auto.offset.store", "false")
        // an assigned offset that fell out of retention restarts at the oldest message
        .set("auto.offset.reset", "earliest")
        .set_log_level(RDKafkaLogLevel::Warning);

    if let Some(auth) = &config.auth {
        match auth {
            KafkaAuth::Sasl {
                mechanism,
                username,
                password,
            } => {
                client_config
                    .set("security.protocol", "SASL_SSL")
                    .set("sasl.mechanisms", mechanism)
                    .set("sasl.username", username)
                    .set("sasl.password", password);
            }
        }
    }

    if let Some(tls_config) = &config.tls {
        if config.auth.is_none() {
            client_config.set("security.protocol", "SSL");
        }
        if tls_config.insecure_skip_verify {
            warn!(
                "'insecureSkipVerify' is set to true, certificate validation will not be performed when connecting to Kafka server"
            );
            client_config
                .set("ssl.endpoint.identification.algorithm", "none")
                .set("enable.ssl.certificate.verification", "false");
        }
        if let Some(ca_cert) = &tls_config.ca_cert {
            client_config.set("ssl.ca.location", ca_cert);
        }
        if let Some(client_auth) = &tls_config.client_auth {
            client_config
                .set("ssl.certificate.location", &client_auth.client_cert)
                .set("ssl.key.location", &client_auth.client_cert_private_key);
        }
    }

    client_config
}

/// Reads a single partition of a topic, starting at an explicit offset. The partition is
/// assigned directly, no consumer group rebalancing is involved.
pub struct PartitionConsumer {
    consumer: StreamConsumer<KafkaContext>,
    topic: String,
    partition: i32,
}

impl PartitionConsumer {
    pub fn assign(
        config: &KafkaReaderConfig,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> Result<Self> {
        let consumer: StreamConsumer<KafkaContext> = client_config(config)
            .create_with_context(KafkaContext)
            .map_err(|err| Error::Connection {
                server: config.brokers.join(","),
                error: err.to_string(),
            })?;

        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(topic, partition, Offset::Offset(offset))
            .map_err(|e| Error::Kafka(format!("Failed to add partition offset: {e}")))?;
        consumer
            .assign(&tpl)
            .map_err(|e| Error::Kafka(format!("Failed to assign partition: {e}")))?;

        info!(topic, partition, offset, "Assigned Kafka partition");
        Ok(Self {
            consumer,
            topic: topic.to_string(),
            partition,
        })
    }

    /// Waits for the next message of the partition.
    pub async fn recv(&self) -> Result<KafkaMessage> {
        let message = self
            .consumer
            .recv()
            .await
            .map_err(|e| Error::Kafka(format!("Failed to receive message: {e}")))?;
        Ok(KafkaMessage::from(&message))
    }

    /// Gives the partition back by assigning an empty list. librdkafka tears down the
    /// connections when the consumer is dropped.
    pub fn close(self) -> Result<()> {
        self.consumer.assign(&TopicPartitionList::new()).map_err(|e| {
            Error::Kafka(format!(
                "Failed to unassign {}[{}]: {e}",
                self.topic, self.partition
            ))
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}
