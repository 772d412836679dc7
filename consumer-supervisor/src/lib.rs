//! Supervises long-running readers, each attached to a single partition of a topic in a
//! partitioned, offset-addressed log (e.g. Kafka).
//!
//! A [ManagedConsumer] opens a reader at the offset right after the last one its handler has
//! processed, feeds every message to the handler on a dedicated task, and can be cancelled or
//! restarted from any task. Running consumers are registered in a [ConsumerRegistry], so that
//! operational tooling can find them by topic and command them.

pub use crate::consumer::{
    ConsumerControl, ConsumerState, ExitReason, ManagedConsumer, StopReason,
};
pub use crate::error::{Error, Result};
pub use crate::handler::{MessageHandler, OffsetSource};
pub use crate::message::PartitionMessage;
pub use crate::reader::{PartitionReader, PartitionReaderFactory};
pub use crate::registry::ConsumerRegistry;
pub use crate::trace::TraceId;

mod error;

/// State machine and lifecycle of a consumer, including the delivery loop.
mod consumer;

/// The capabilities a consumer's handler provides.
mod handler;

mod message;

/// Partition readers, the source of the messages.
pub mod reader;

/// Topic to consumer lookup.
mod registry;

mod trace;
