//! An in-memory partition log and a recording handler, with knobs to inject failures into
//! opens, closes, reads, offset lookups and message handling.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Semaphore, mpsc, watch};

use crate::error::{Error, Result};
use crate::handler::{MessageHandler, OffsetSource};
use crate::message::PartitionMessage;
use crate::reader::{PartitionReader, PartitionReaderFactory};

/// Length of the log and whether more entries can be appended.
#[derive(Debug, Clone, Copy, Default)]
struct Tail {
    len: usize,
    sealed: bool,
}

struct LogInner {
    topic: String,
    base_offset: i64,
    /// Messages and injected read failures, in the order readers see them. Failures do not
    /// take an offset.
    entries: Mutex<Vec<Result<PartitionMessage>>>,
    next_offset: Mutex<i64>,
    tail: watch::Sender<Tail>,
    opened_at: Mutex<Vec<i64>>,
    open_attempts: AtomicUsize,
    failing_opens: AtomicUsize,
    failing_closes: AtomicUsize,
    closed: AtomicUsize,
}

/// Single partition log, shared by all its clones. It is its own [PartitionReaderFactory].
#[derive(Clone)]
pub(crate) struct MemoryLog {
    inner: Arc<LogInner>,
}

impl MemoryLog {
    pub(crate) fn new(topic: &str, base_offset: i64) -> Self {
        Self {
            inner: Arc::new(LogInner {
                topic: topic.to_string(),
                base_offset,
                entries: Mutex::new(Vec::new()),
                next_offset: Mutex::new(base_offset),
                tail: watch::Sender::new(Tail::default()),
                opened_at: Mutex::new(Vec::new()),
                open_attempts: AtomicUsize::new(0),
                failing_opens: AtomicUsize::new(0),
                failing_closes: AtomicUsize::new(0),
                closed: AtomicUsize::new(0),
            }),
        }
    }

    /// Appends a message and returns its offset.
    pub(crate) fn append(&self, value: &str) -> i64 {
        let mut next_offset = self.inner.next_offset.lock();
        let offset = *next_offset;
        *next_offset += 1;
        let message = PartitionMessage::new(
            self.inner.topic.as_str(),
            0,
            offset,
            Bytes::from(value.to_string()),
        );
        self.push(Ok(message));
        offset
    }

    /// Makes the readers fail once they reach this point of the log.
    pub(crate) fn append_error(&self, reason: &str) {
        self.push(Err(Error::Reader(reason.to_string())));
    }

    /// Readers report the end of the partition once they read everything.
    pub(crate) fn seal(&self) {
        self.inner.tail.send_modify(|tail| tail.sealed = true);
    }

    fn push(&self, entry: Result<PartitionMessage>) {
        let mut entries = self.inner.entries.lock();
        entries.push(entry);
        let len = entries.len();
        self.inner.tail.send_modify(|tail| tail.len = len);
    }

    pub(crate) fn fail_next_opens(&self, count: usize) {
        self.inner.failing_opens.store(count, Ordering::SeqCst);
    }

    pub(crate) fn fail_next_closes(&self, count: usize) {
        self.inner.failing_closes.store(count, Ordering::SeqCst);
    }

    /// Offsets of the successful opens.
    pub(crate) fn opened_at(&self) -> Vec<i64> {
        self.inner.opened_at.lock().clone()
    }

    pub(crate) fn open_attempts(&self) -> usize {
        self.inner.open_attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn closed(&self) -> usize {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl PartitionReaderFactory for MemoryLog {
    type Reader = MemoryReader;

    async fn open(&self, topic: &str, partition: i32, offset: i64) -> Result<MemoryReader> {
        self.inner.open_attempts.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.inner.failing_opens) {
            return Err(Error::Reader(format!(
                "broker unavailable for {topic}[{partition}]"
            )));
        }
        assert!(
            offset >= self.inner.base_offset,
            "offset {offset} is before the start of the log"
        );
        self.inner.opened_at.lock().push(offset);

        let index = {
            let entries = self.inner.entries.lock();
            entries
                .iter()
                .position(|entry| matches!(entry, Ok(message) if message.offset >= offset))
                .unwrap_or(entries.len())
        };
        Ok(MemoryReader {
            log: Arc::clone(&self.inner),
            tail: self.inner.tail.subscribe(),
            index,
        })
    }
}

pub(crate) struct MemoryReader {
    log: Arc<LogInner>,
    tail: watch::Receiver<Tail>,
    index: usize,
}

impl PartitionReader for MemoryReader {
    async fn next(&mut self) -> Option<Result<PartitionMessage>> {
        let index = self.index;
        if self
            .tail
            .wait_for(|tail| tail.len > index || tail.sealed)
            .await
            .is_err()
        {
            return None;
        }
        let entry = self.log.entries.lock().get(index).cloned()?;
        self.index += 1;
        Some(entry)
    }

    async fn close(self) -> Result<()> {
        self.log.closed.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.log.failing_closes) {
            return Err(Error::Close("connection already gone".to_string()));
        }
        Ok(())
    }
}

/// Handler that records the offsets it is handed and tracks the last handled one, which it
/// reports as its [OffsetSource].
pub(crate) struct RecordingHandler {
    committed: Mutex<i64>,
    handled: Mutex<Vec<i64>>,
    handled_tx: mpsc::UnboundedSender<i64>,
    failing_offset_reads: AtomicUsize,
    gate: Option<Arc<Semaphore>>,
    fail_at: Option<i64>,
    panic_at: Option<i64>,
}

impl RecordingHandler {
    /// Every handled offset is also sent on the returned receiver.
    pub(crate) fn new(committed: i64) -> (Self, mpsc::UnboundedReceiver<i64>) {
        let (handled_tx, handled_rx) = mpsc::unbounded_channel();
        let handler = Self {
            committed: Mutex::new(committed),
            handled: Mutex::new(Vec::new()),
            handled_tx,
            failing_offset_reads: AtomicUsize::new(0),
            gate: None,
            fail_at: None,
            panic_at: None,
        };
        (handler, handled_rx)
    }

    /// Each message waits for a permit before it is committed.
    pub(crate) fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub(crate) fn failing_at(mut self, offset: i64) -> Self {
        self.fail_at = Some(offset);
        self
    }

    pub(crate) fn panicking_at(mut self, offset: i64) -> Self {
        self.panic_at = Some(offset);
        self
    }

    pub(crate) fn fail_next_offset_reads(&self, count: usize) {
        self.failing_offset_reads.store(count, Ordering::SeqCst);
    }

    pub(crate) fn handled(&self) -> Vec<i64> {
        self.handled.lock().clone()
    }
}

impl OffsetSource for RecordingHandler {
    async fn last_offset(&self, _topic: &str) -> Result<i64> {
        if take_one(&self.failing_offset_reads) {
            return Err(Error::OffsetSource("offset store unavailable".to_string()));
        }
        Ok(*self.committed.lock())
    }
}

impl MessageHandler for RecordingHandler {
    async fn handle(&self, message: &PartitionMessage) -> Result<()> {
        self.handled.lock().push(message.offset);
        let _ = self.handled_tx.send(message.offset);

        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate closed").forget();
        }
        if self.panic_at == Some(message.offset) {
            panic!("poisoned message {message}");
        }
        if self.fail_at == Some(message.offset) {
            return Err(Error::Handler(format!("can not process {message}")));
        }

        *self.committed.lock() = message.offset;
        Ok(())
    }
}

/// Waits for the next offset handled by a [RecordingHandler].
pub(crate) async fn next_handled(handled: &mut mpsc::UnboundedReceiver<i64>) -> i64 {
    tokio::time::timeout(Duration::from_secs(5), handled.recv())
        .await
        .expect("timed out waiting for the handler")
        .expect("handler dropped")
}
