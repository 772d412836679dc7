use crate::Result;
use crate::message::PartitionMessage;

/// [Kafka] backed partition reader.
///
/// [Kafka]: https://kafka.apache.org/
#[cfg(feature = "kafka")]
pub mod kafka;

/// In-memory partition log with fault injection, used by the tests.
#[cfg(test)]
pub(crate) mod test_utils;

/// Opens live read handles on a single partition of a topic.
#[trait_variant::make(Send)]
pub trait PartitionReaderFactory: Send + Sync + 'static {
    type Reader: PartitionReader;

    /// Opens a reader on `topic`/`partition` whose first message is the one at `offset`.
    async fn open(&self, topic: &str, partition: i32, offset: i64) -> Result<Self::Reader>;
}

/// A live read handle on one partition. The sequence of messages is lazy and, for a broker,
/// unbounded.
#[trait_variant::make(Send)]
pub trait PartitionReader: Sized + Send + 'static {
    /// Waits for the next message. `None` means the partition will not yield any more messages.
    /// Dropping the returned future before it completes must not lose the reader's position
    /// beyond the message that was being awaited.
    async fn next(&mut self) -> Option<Result<PartitionMessage>>;

    /// Releases the resources held on the broker.
    async fn close(self) -> Result<()>;
}
