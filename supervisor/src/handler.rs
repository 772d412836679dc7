use consumer_supervisor::{MessageHandler, OffsetSource, PartitionMessage, Result};
use tracing::info;

use crate::offsets::OffsetStore;

/// Logs every message it is given and remembers the offset of the last one, which is where
/// the consumer resumes after a restart.
#[derive(Debug, Clone)]
pub(crate) struct LoggingHandler {
    store: OffsetStore,
}

impl LoggingHandler {
    pub(crate) fn new(store: OffsetStore) -> Self {
        Self { store }
    }
}

impl MessageHandler for LoggingHandler {
    async fn handle(&self, message: &PartitionMessage) -> Result<()> {
        let key = message.key.as_deref().map(String::from_utf8_lossy);
        info!(
            offset = message.offset,
            key = key.as_deref(),
            bytes = message.value.len(),
            timestamp = ?message.timestamp,
            "Message"
        );
        self.store.save(&message.topic, message.offset).await
    }
}

impl OffsetSource for LoggingHandler {
    async fn last_offset(&self, topic: &str) -> Result<i64> {
        self.store.load(topic).await
    }
}
