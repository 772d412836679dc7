use crate::Result;
use crate::message::PartitionMessage;

/// Supplies the last successfully processed offset of a topic. The value is treated as
/// authoritative, the consumer resumes at the offset right after it.
#[trait_variant::make(Send)]
pub trait OffsetSource: Send + Sync + 'static {
    /// Must be safe to call before the consumer is started.
    async fn last_offset(&self, topic: &str) -> Result<i64>;
}

/// Application processing of the messages read by a [ManagedConsumer](crate::ManagedConsumer).
///
/// The handler is awaited before the next message is read, so a slow handler slows the
/// consumer down. Keeping track of what has been processed (and so what [OffsetSource] reports)
/// is the handler's own business.
#[trait_variant::make(Send)]
pub trait MessageHandler: Send + Sync + 'static {
    /// An error (or a panic) ends the consumer's current episode, see
    /// [ExitReason::HandlerFailed](crate::ExitReason::HandlerFailed).
    async fn handle(&self, message: &PartitionMessage) -> Result<()>;
}
