use std::env;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use consumer_supervisor::reader::kafka::KafkaReaderFactory;
use consumer_supervisor::{
    ConsumerControl, ConsumerRegistry, ConsumerState, ManagedConsumer, MessageHandler,
    OffsetSource, PartitionReaderFactory,
};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::handler::LoggingHandler;
use crate::offsets::OffsetStore;

mod cmdline;
mod config;
mod handler;
mod offsets;
mod setup_tracing;

type Consumer = ManagedConsumer<KafkaReaderFactory, LoggingHandler>;

/// How long the consumers get to settle once shut down.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    setup_tracing::register();

    if let Err(e) = run().await {
        error!("{e:?}");
        return Err(e);
    }
    info!("Exiting...");

    Ok(())
}

async fn run() -> Result<(), Box<dyn Error>> {
    let cli = cmdline::root_cli().get_matches();
    let Some(("run", args)) = cli.subcommand() else {
        return Err("Unknown subcommand".into());
    };

    let topics: Vec<String> = args
        .get_many::<String>("topic")
        .ok_or("No topic given")?
        .cloned()
        .collect();
    let partition = args.get_one::<i32>("partition").copied().unwrap_or(0);
    let offsets_dir = args
        .get_one::<PathBuf>("offsets-dir")
        .ok_or("No offsets directory given")?;
    tokio::fs::create_dir_all(offsets_dir).await?;

    let settings = Settings::load(env::vars())?;
    info!(?topics, partition, brokers = ?settings.kafka.brokers, "Starting consumers");

    let registry = ConsumerRegistry::new();
    let factory = KafkaReaderFactory::new(settings.kafka);
    let handler = LoggingHandler::new(OffsetStore::new(offsets_dir, partition));

    let consumers: Vec<Arc<Consumer>> = topics
        .into_iter()
        .map(|topic| {
            ManagedConsumer::new(
                topic,
                partition,
                factory.clone(),
                handler.clone(),
                registry.clone(),
            )
        })
        .collect();
    for consumer in &consumers {
        consumer.start().await?;
    }

    supervise_signals(&registry, &consumers).await?;
    shutdown(&consumers, SHUTDOWN_TIMEOUT).await;
    Ok(())
}

/// Serves SIGHUP till SIGINT or SIGTERM is received.
async fn supervise_signals(
    registry: &ConsumerRegistry,
    consumers: &[Arc<Consumer>],
) -> Result<(), Box<dyn Error>> {
    let mut hangup = signal(SignalKind::hangup())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    loop {
        tokio::select! {
            _ = hangup.recv() => {
                info!(registered = ?registry, "Received hangup signal, restarting consumers");
                restart_all(registry, consumers).await;
            }
            _ = interrupt.recv() => {
                info!("Received Ctrl+C signal");
                return Ok(());
            }
            _ = terminate.recv() => {
                info!("Received terminate signal");
                return Ok(());
            }
        }
    }
}

/// Restarts the registered consumers and starts again the ones which stopped on their own.
async fn restart_all<F, H>(registry: &ConsumerRegistry, consumers: &[Arc<ManagedConsumer<F, H>>])
where
    F: PartitionReaderFactory,
    H: MessageHandler + OffsetSource,
{
    let registered = registry.consumers();
    for consumer in &registered {
        if !consumer.restart() {
            info!(topic = consumer.topic(), state = %consumer.state(), "Restart ignored");
        }
    }

    // the ones which stopped on their own are not registered anymore
    for consumer in consumers {
        let restarting = registered
            .iter()
            .any(|other| other.trace_id() == consumer.trace_id());
        if !restarting && consumer.state() == ConsumerState::Ready {
            if let Err(e) = consumer.start().await {
                warn!(topic = consumer.topic(), ?e, "Failed to start consumer");
            }
        }
    }
}

/// Shuts every consumer down, a restart in flight included. Returns whether all of them
/// settled within the timeout.
async fn shutdown<F, H>(consumers: &[Arc<ManagedConsumer<F, H>>], timeout: Duration) -> bool
where
    F: PartitionReaderFactory,
    H: MessageHandler + OffsetSource,
{
    let settled = tokio::time::timeout(timeout, async {
        for consumer in consumers {
            consumer.shutdown().await;
        }
    })
    .await;

    if settled.is_err() {
        for consumer in consumers {
            warn!(
                topic = consumer.topic(),
                state = %consumer.state(),
                "Consumer did not settle in time"
            );
        }
    }
    settled.is_ok()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use consumer_supervisor::{PartitionMessage, PartitionReader, Result};

    use super::*;

    /// A partition nothing is ever written to, counting opens and closes.
    #[derive(Clone, Default)]
    struct IdlePartition {
        opens: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    impl IdlePartition {
        fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }

        fn closes(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }
    }

    struct IdleReader {
        closes: Arc<AtomicUsize>,
    }

    impl PartitionReaderFactory for IdlePartition {
        type Reader = IdleReader;

        async fn open(&self, _topic: &str, _partition: i32, _offset: i64) -> Result<IdleReader> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(IdleReader {
                closes: Arc::clone(&self.closes),
            })
        }
    }

    impl PartitionReader for IdleReader {
        async fn next(&mut self) -> Option<Result<PartitionMessage>> {
            std::future::pending().await
        }

        async fn close(self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    type TestConsumer = ManagedConsumer<IdlePartition, LoggingHandler>;

    fn consumers(
        registry: &ConsumerRegistry,
        partition: &IdlePartition,
        offsets_dir: &std::path::Path,
    ) -> (Arc<TestConsumer>, Arc<TestConsumer>) {
        let handler = LoggingHandler::new(OffsetStore::new(offsets_dir, 0));
        let orders = ManagedConsumer::new(
            "orders",
            0,
            partition.clone(),
            handler.clone(),
            registry.clone(),
        );
        let payments =
            ManagedConsumer::new("payments", 0, partition.clone(), handler, registry.clone());
        (orders, payments)
    }

    #[tokio::test]
    async fn test_restart_all() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ConsumerRegistry::new();
        let partition = IdlePartition::default();
        let (orders, payments) = consumers(&registry, &partition, dir.path());
        orders.start().await.unwrap();
        payments.start().await.unwrap();

        // payments stopped on its own
        assert!(payments.cancel());
        tokio::time::timeout(
            Duration::from_secs(5),
            payments.wait_for_state(ConsumerState::Ready),
        )
        .await
        .unwrap();
        assert_eq!(registry.topics(), vec!["orders"]);

        let all = [Arc::clone(&orders), Arc::clone(&payments)];
        restart_all(&registry, &all).await;

        tokio::time::timeout(Duration::from_secs(5), async {
            while orders.episodes() < 2 || orders.state() != ConsumerState::Consuming {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("orders was not restarted");
        assert_eq!(payments.state(), ConsumerState::Consuming);
        assert_eq!(payments.episodes(), 2);
        assert_eq!(registry.topics(), vec!["orders", "payments"]);
        assert_eq!(partition.opens(), 4);
        assert_eq!(partition.closes(), 2);

        assert!(shutdown(&all, Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_shutdown_during_restart() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ConsumerRegistry::new();
        let partition = IdlePartition::default();
        let (orders, payments) = consumers(&registry, &partition, dir.path());
        orders.start().await.unwrap();
        payments.start().await.unwrap();

        // a hangup is being served when the terminate signal comes in
        assert!(orders.restart());
        let all = [Arc::clone(&orders), Arc::clone(&payments)];
        assert!(shutdown(&all, Duration::from_secs(5)).await);

        tokio::time::sleep(Duration::from_millis(50)).await;
        for consumer in &all {
            assert_eq!(consumer.state(), ConsumerState::Ready);
            assert_eq!(consumer.episodes(), 1);
        }
        assert!(registry.is_empty());
        assert_eq!(partition.opens(), 2);
        assert_eq!(partition.closes(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ConsumerRegistry::new();
        let handler = LoggingHandler::new(OffsetStore::new(dir.path(), 0));
        let consumer = ManagedConsumer::new("orders", 0, StuckClose, handler, registry.clone());
        consumer.start().await.unwrap();

        assert!(!shutdown(&[consumer], Duration::from_millis(50)).await);
    }

    /// Its readers never finish closing.
    struct StuckClose;

    struct StuckReader;

    impl PartitionReaderFactory for StuckClose {
        type Reader = StuckReader;

        async fn open(&self, _topic: &str, _partition: i32, _offset: i64) -> Result<StuckReader> {
            Ok(StuckReader)
        }
    }

    impl PartitionReader for StuckReader {
        async fn next(&mut self) -> Option<Result<PartitionMessage>> {
            std::future::pending().await
        }

        async fn close(self) -> Result<()> {
            std::future::pending().await
        }
    }
}
