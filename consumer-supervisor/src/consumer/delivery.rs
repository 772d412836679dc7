//! One episode of consumption: read a message, hand it to the handler, repeat, until the
//! consumer is asked to stop or the reader or the handler gives up.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::{ConsumerControl, ConsumerState, ManagedConsumer};
use crate::error::{Error, Result};
use crate::handler::{MessageHandler, OffsetSource};
use crate::message::PartitionMessage;
use crate::reader::{PartitionReader, PartitionReaderFactory};

/// Why the delivery loop of a consumer ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitReason {
    /// [ConsumerControl::cancel] was invoked.
    Cancelled,
    /// [ConsumerControl::restart] was invoked, the consumer starts again right away.
    RestartRequested,
    /// The reader reported that the partition has no more messages.
    ReaderExhausted,
    ReaderFailed(Error),
    /// The handler returned an error or panicked. Only this consumer is stopped.
    HandlerFailed(Error),
}

impl<F, H> ManagedConsumer<F, H>
where
    F: PartitionReaderFactory,
    H: MessageHandler + OffsetSource,
{
    /// Runs the delivery loop till the cancellation token fires or the reader/handler fails.
    /// Cancellation is checked first, a message that is ready at the same time is not delivered.
    pub(super) async fn deliver(
        &self,
        reader: &mut F::Reader,
        cancel: &CancellationToken,
    ) -> ExitReason {
        loop {
            let next = tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    return self.requested_exit();
                }

                next = reader.next() => next,
            };

            let message = match next {
                Some(Ok(message)) => message,
                Some(Err(e)) => return ExitReason::ReaderFailed(e),
                None => return ExitReason::ReaderExhausted,
            };

            // a stop request raced ahead of this message, it is not redelivered.
            if self.state() != ConsumerState::Consuming {
                trace!(offset = message.offset, "Dropping message, consumer is stopping");
                continue;
            }

            if let Err(e) = self.dispatch(&message).await {
                return ExitReason::HandlerFailed(e);
            }
        }
    }

    /// Hands the message to the handler, turning a panic into a handler error.
    async fn dispatch(&self, message: &PartitionMessage) -> Result<()> {
        trace!(offset = message.offset, "Dispatching message");
        match AssertUnwindSafe(self.handler.handle(message))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(Error::Handler(format!(
                "handler panicked at offset {}: {}",
                message.offset,
                panic_message(panic.as_ref())
            ))),
        }
    }

    fn requested_exit(&self) -> ExitReason {
        match self.state() {
            ConsumerState::RequireRestart => ExitReason::RestartRequested,
            _ => ExitReason::Cancelled,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic payload"
    }
}
