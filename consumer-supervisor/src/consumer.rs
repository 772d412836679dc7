//! [ManagedConsumer] attaches a long-running reader to a single partition of a topic and tracks
//! its lifecycle through an explicit state machine:
//! ```text
//!             start                cancel
//!   (Ready) --------> (Consuming) --------> (Cancelling) ----+
//!      ^                    |                                |
//!      |                    | restart                        | loop exit
//!      |                    v                                |
//!      |            (RequireRestart) -- loop exit, start ----+--> (Consuming)
//!      |                                                     |
//!      +-----------------------------------------------------+
//! ```
//! Every start opens a new *episode*: a reader at `last_offset + 1`, a cancellation token and a
//! registration in the [ConsumerRegistry]. When the delivery loop of the episode ends, the
//! reader is closed, the consumer is unregistered and settles in [ConsumerState::Ready]. If a
//! restart was requested the next episode is opened right away by the same task.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use crate::error::{Error, Result};
use crate::handler::{MessageHandler, OffsetSource};
use crate::reader::{PartitionReader, PartitionReaderFactory};
use crate::registry::ConsumerRegistry;
use crate::trace::TraceId;

/// Delivery loop of an episode.
mod delivery;

pub use delivery::ExitReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Ready,
    Consuming,
    Cancelling,
    RequireRestart,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            ConsumerState::Ready => "ready",
            ConsumerState::Consuming => "consuming",
            ConsumerState::Cancelling => "cancelling",
            ConsumerState::RequireRestart => "require-restart",
        };
        f.write_str(state)
    }
}

/// Why a running consumer is asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Cancel,
    Restart,
}

impl StopReason {
    fn target_state(self) -> ConsumerState {
        match self {
            StopReason::Cancel => ConsumerState::Cancelling,
            StopReason::Restart => ConsumerState::RequireRestart,
        }
    }
}

/// Type-erased handle on a consumer, this is what the [ConsumerRegistry] hands out.
pub trait ConsumerControl: Send + Sync {
    fn topic(&self) -> &str;

    fn partition(&self) -> i32;

    /// Identity of the consumer, stable across restarts.
    fn trace_id(&self) -> &TraceId;

    fn state(&self) -> ConsumerState;

    /// Watches the state transitions of the consumer.
    fn subscribe_state(&self) -> watch::Receiver<ConsumerState>;

    /// Asks a consuming consumer to stop and stay stopped. Returns whether the request was
    /// delivered, it is dropped if the consumer is not consuming.
    fn cancel(&self) -> bool;

    /// Asks a consuming consumer to stop and start again from the offset reported by the
    /// [OffsetSource] at that time. Returns whether the request was delivered.
    fn restart(&self) -> bool;
}

/// Mutable part of the consumer, the state and the cancellation token change together.
struct Control {
    state: ConsumerState,
    /// Present only while consuming.
    cancel: Option<CancellationToken>,
    episodes: u64,
    last_exit: Option<ExitReason>,
    /// Set by [ManagedConsumer::shutdown], never cleared.
    closing: bool,
}

/// Reader and cancellation token of one episode, owned by the delivery task.
struct Episode<R> {
    reader: R,
    cancel: CancellationToken,
}

/// Consumes one partition of a topic and feeds the messages to its handler. The handler is also
/// the [OffsetSource] used to find where to resume.
pub struct ManagedConsumer<F, H> {
    topic: String,
    partition: i32,
    trace_id: TraceId,
    factory: F,
    handler: H,
    registry: ConsumerRegistry,
    control: Mutex<Control>,
    state_tx: watch::Sender<ConsumerState>,
    /// Serializes starts of this consumer, the open is awaited while holding it.
    starting: tokio::sync::Mutex<()>,
}

impl<F, H> ManagedConsumer<F, H>
where
    F: PartitionReaderFactory,
    H: MessageHandler + OffsetSource,
{
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        factory: F,
        handler: H,
        registry: ConsumerRegistry,
    ) -> Arc<Self> {
        Arc::new(Self {
            topic: topic.into(),
            partition,
            trace_id: TraceId::new(),
            factory,
            handler,
            registry,
            control: Mutex::new(Control {
                state: ConsumerState::Ready,
                cancel: None,
                episodes: 0,
                last_exit: None,
                closing: false,
            }),
            state_tx: watch::Sender::new(ConsumerState::Ready),
            starting: tokio::sync::Mutex::new(()),
        })
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Number of episodes started so far (a restart starts a new one).
    pub fn episodes(&self) -> u64 {
        self.control.lock().episodes
    }

    /// How the last finished episode ended.
    pub fn last_exit(&self) -> Option<ExitReason> {
        self.control.lock().last_exit.clone()
    }

    /// Waits till the consumer is in the given state.
    pub async fn wait_for_state(&self, state: ConsumerState) {
        let mut state_rx = self.state_tx.subscribe();
        // the sender is owned by self, so the channel stays open while we wait.
        let _ = state_rx.wait_for(|current| *current == state).await;
    }

    /// Opens a reader at `last_offset + 1`, registers the consumer and spawns the delivery
    /// loop. It returns as soon as the loop is spawned. On error the state is left as it was.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let span = self.span();
        let episode = self.begin_episode().instrument(span.clone()).await?;
        tokio::spawn(Arc::clone(self).supervise(episode).instrument(span));
        Ok(())
    }

    /// Stops the consumer for good: the running episode is cancelled, a pending restart is
    /// dropped and later starts fail with [Error::ShutDown]. Returns once no episode is running
    /// or being opened.
    pub async fn shutdown(&self) {
        self.control.lock().closing = true;
        self.request_stop(StopReason::Cancel);
        self.wait_for_state(ConsumerState::Ready).await;
        // an episode being opened gives up once it sees the flag
        let _starting = self.starting.lock().await;
    }

    fn span(&self) -> Span {
        info_span!(
            "consumer",
            topic = %self.topic,
            partition = self.partition,
            trace_id = %self.trace_id
        )
    }

    /// Moves the consumer from Ready to Consuming.
    async fn begin_episode(self: &Arc<Self>) -> Result<Episode<F::Reader>> {
        let _starting = self.starting.lock().await;
        if self.control.lock().closing {
            return Err(self.shut_down());
        }

        let state = self.state();
        if state != ConsumerState::Ready {
            warn!(%state, "Try to start a consumer which is not ready");
            return Err(Error::NotReady {
                topic: self.topic.clone(),
                state,
            });
        }

        if let Some(holder) = self.registry.lookup(&self.topic) {
            if holder.trace_id() != &self.trace_id {
                return Err(Error::TopicInUse {
                    topic: self.topic.clone(),
                    holder: holder.trace_id().to_string(),
                });
            }
        }

        let last_offset = self
            .handler
            .last_offset(&self.topic)
            .await
            .map_err(|e| self.cannot_start(e))?;
        let offset = last_offset + 1;

        let reader = self
            .factory
            .open(&self.topic, self.partition, offset)
            .await
            .map_err(|e| {
                error!(?e, offset, "Failed to open partition reader");
                self.cannot_start(e)
            })?;

        let cancel = CancellationToken::new();
        let admitted = {
            let mut control = self.control.lock();
            if !control.closing {
                control.state = ConsumerState::Consuming;
                control.cancel = Some(cancel.clone());
                self.state_tx.send_replace(ConsumerState::Consuming);
            }
            !control.closing
        };
        if !admitted {
            self.close_reader(reader).await;
            return Err(self.shut_down());
        }

        // another instance may have registered the topic while we were opening.
        if let Err(e) = self
            .registry
            .try_register(Arc::clone(self) as Arc<dyn ConsumerControl>)
        {
            warn!(?e, "Topic got registered by another consumer, backing off");
            self.transition(ConsumerState::Ready, None);
            self.close_reader(reader).await;
            return Err(e);
        }

        self.control.lock().episodes += 1;
        info!(offset, "Subscribed");
        Ok(Episode { reader, cancel })
    }

    /// Runs the episodes of the consumer, one after another as long as restarts are requested.
    async fn supervise(self: Arc<Self>, mut episode: Episode<F::Reader>) {
        loop {
            let exit = self.deliver(&mut episode.reader, &episode.cancel).await;
            if !self.finish_episode(episode.reader, exit).await {
                return;
            }

            info!("Restarting consumer");
            episode = match self.begin_episode().await {
                Ok(episode) => episode,
                // started by someone else, or shut down meanwhile
                Err(e @ (Error::NotReady { .. } | Error::ShutDown { .. })) => {
                    debug!(?e, "Restart abandoned");
                    return;
                }
                Err(e) => {
                    error!(?e, "Failed to restart consumer, it stays stopped");
                    return;
                }
            };
        }
    }

    /// Cleans up after the delivery loop: closes the reader, unregisters the consumer and settles
    /// it in Ready. Returns whether a restart was requested.
    async fn finish_episode(&self, reader: F::Reader, exit: ExitReason) -> bool {
        match &exit {
            ExitReason::Cancelled => info!("Consumer cancelled"),
            ExitReason::RestartRequested => info!("Consumer restart requested"),
            ExitReason::ReaderExhausted => warn!("Partition reader has no more messages"),
            ExitReason::ReaderFailed(e) => error!(?e, "Partition reader failed"),
            ExitReason::HandlerFailed(e) => error!(?e, "Message handler failed"),
        }

        self.close_reader(reader).await;
        self.registry.unregister(self);

        let mut control = self.control.lock();
        let restart = control.state == ConsumerState::RequireRestart && !control.closing;
        control.last_exit = Some(exit);
        control.cancel = None;
        control.state = ConsumerState::Ready;
        self.state_tx.send_replace(ConsumerState::Ready);
        restart
    }

    async fn close_reader(&self, reader: F::Reader) {
        debug!("Closing partition reader");
        if let Err(e) = reader.close().await {
            error!(?e, "Failed to close partition reader");
        }
    }

    fn transition(&self, state: ConsumerState, cancel: Option<CancellationToken>) {
        let mut control = self.control.lock();
        control.state = state;
        control.cancel = cancel;
        self.state_tx.send_replace(state);
    }

    /// Fires the cancellation token of the running episode, if any.
    fn request_stop(&self, reason: StopReason) -> bool {
        let mut control = self.control.lock();
        if control.state != ConsumerState::Consuming {
            debug!(?reason, state = %control.state, "Consumer is not consuming, ignoring stop request");
            return false;
        }
        let Some(cancel) = control.cancel.take() else {
            return false;
        };
        let state = reason.target_state();
        control.state = state;
        self.state_tx.send_replace(state);
        cancel.cancel();
        true
    }

    fn shut_down(&self) -> Error {
        Error::ShutDown {
            topic: self.topic.clone(),
        }
    }

    fn cannot_start(&self, e: Error) -> Error {
        Error::CannotStart {
            topic: self.topic.clone(),
            reason: e.to_string(),
        }
    }
}

impl<F, H> ConsumerControl for ManagedConsumer<F, H>
where
    F: PartitionReaderFactory,
    H: MessageHandler + OffsetSource,
{
    fn topic(&self) -> &str {
        &self.topic
    }

    fn partition(&self) -> i32 {
        self.partition
    }

    fn trace_id(&self) -> &TraceId {
        &self.trace_id
    }

    fn state(&self) -> ConsumerState {
        self.control.lock().state
    }

    fn subscribe_state(&self) -> watch::Receiver<ConsumerState> {
        self.state_tx.subscribe()
    }

    fn cancel(&self) -> bool {
        self.request_stop(StopReason::Cancel)
    }

    fn restart(&self) -> bool {
        self.request_stop(StopReason::Restart)
    }
}

impl<F, H> fmt::Debug for ManagedConsumer<F, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let control = self.control.lock();
        f.debug_struct("ManagedConsumer")
            .field("topic", &self.topic)
            .field("partition", &self.partition)
            .field("trace_id", &self.trace_id)
            .field("state", &control.state)
            .field("episodes", &control.episodes)
            .finish()
    }
}
