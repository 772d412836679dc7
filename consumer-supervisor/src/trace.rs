use std::fmt;

use uuid::Uuid;

const TRACE_ID_LEN: usize = 12;

/// Correlation identifier of a [ManagedConsumer](crate::ManagedConsumer). It is created once per
/// consumer and reused for every restart of that consumer, so all the log lines of one consumer
/// can be grouped together. It doubles as the identity of the consumer in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TraceId(String);

impl TraceId {
    pub fn new() -> Self {
        let mut id = Uuid::new_v4().simple().to_string();
        id.truncate(TRACE_ID_LEN);
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
