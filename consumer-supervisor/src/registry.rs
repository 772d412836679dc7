//! Lookup table from a topic to the consumer currently reading it. Operational tooling uses it to
//! find a running consumer by topic name and command it (cancel/restart).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::consumer::ConsumerControl;
use crate::error::{Error, Result};

type SharedConsumer = Arc<dyn ConsumerControl>;

/// Registry of the active consumers, at most one per topic. Cloning is cheap, all the clones
/// share the same table.
#[derive(Clone, Default)]
pub struct ConsumerRegistry {
    consumers: Arc<RwLock<HashMap<String, SharedConsumer>>>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the consumer registered for the topic.
    pub fn lookup(&self, topic: &str) -> Option<SharedConsumer> {
        self.consumers.read().get(topic).map(Arc::clone)
    }

    /// Inserts the consumer under its topic, replacing (and returning) whatever was registered
    /// there before.
    pub fn register(&self, consumer: SharedConsumer) -> Option<SharedConsumer> {
        let topic = consumer.topic().to_string();
        self.consumers.write().insert(topic, consumer)
    }

    /// Inserts the consumer under its topic unless the topic is held by another consumer.
    pub fn try_register(&self, consumer: SharedConsumer) -> Result<()> {
        let mut consumers = self.consumers.write();
        if let Some(holder) = consumers.get(consumer.topic()) {
            if holder.trace_id() != consumer.trace_id() {
                return Err(Error::TopicInUse {
                    topic: consumer.topic().to_string(),
                    holder: holder.trace_id().to_string(),
                });
            }
        }
        consumers.insert(consumer.topic().to_string(), consumer);
        Ok(())
    }

    /// Removes the consumer's topic if it is registered by this very consumer. Removing an
    /// absent topic is a no-op. Returns whether an entry was removed.
    pub fn unregister(&self, consumer: &dyn ConsumerControl) -> bool {
        let mut consumers = self.consumers.write();
        match consumers.get(consumer.topic()) {
            Some(holder) if holder.trace_id() == consumer.trace_id() => {
                consumers.remove(consumer.topic());
                true
            }
            _ => false,
        }
    }

    /// Topics with a registered consumer, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.consumers.read().keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Snapshot of the registered consumers.
    pub fn consumers(&self) -> Vec<SharedConsumer> {
        self.consumers.read().values().map(Arc::clone).collect()
    }

    pub fn len(&self) -> usize {
        self.consumers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.read().is_empty()
    }
}

impl fmt::Debug for ConsumerRegistry {
    /// Formats as: "{topic1: trace_id1, topic2: trace_id2, ...}"
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let consumers = self.consumers.read();
        let mut entries: Vec<String> = consumers
            .iter()
            .map(|(topic, consumer)| format!("{topic}: {}", consumer.trace_id()))
            .collect();
        entries.sort();
        write!(f, "{{{}}}", entries.join(", "))
    }
}
