//! Coalesces streamed text deltas into batched updates on a fixed cadence,
//! so one token per packet never becomes one consumer update per packet.
//!
//! The batcher is a task sitting between two channels: deltas go in through a
//! [`BatcherHandle`], batches come out through a [`ChunkSink`]. It knows
//! nothing about the network.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const FLUSH_INTERVAL: Duration = Duration::from_millis(100);
pub const MAX_CHUNKS_PER_FLUSH: usize = 5;
pub const MAX_RESPONSE_CHARS: usize = 100_000;

/// Appended once when the response hits [`MAX_RESPONSE_CHARS`].
pub const TRUNCATION_NOTICE: &str =
    "\n\n_Response truncated: exceeded the maximum response length._";

#[derive(Debug, Clone)]
pub struct BatcherConfig {
    pub interval: Duration,
    pub max_chunks: usize,
    pub max_chars: usize,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            interval: FLUSH_INTERVAL,
            max_chunks: MAX_CHUNKS_PER_FLUSH,
            max_chars: MAX_RESPONSE_CHARS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryErrorKind {
    /// Consumer is busy; try again next tick.
    Full,
    /// Consumer is gone for good.
    Closed,
}

/// A batch the consumer did not take, handed back to be requeued.
#[derive(Debug)]
pub struct DeliveryError {
    pub kind: DeliveryErrorKind,
    pub batch: String,
}

/// Consumer side of the batcher.
pub trait ChunkSink: Send + 'static {
    fn deliver(&mut self, batch: String) -> Result<(), DeliveryError>;
}

impl ChunkSink for mpsc::Sender<String> {
    fn deliver(&mut self, batch: String) -> Result<(), DeliveryError> {
        self.try_send(batch).map_err(|e| match e {
            mpsc::error::TrySendError::Full(batch) => DeliveryError {
                kind: DeliveryErrorKind::Full,
                batch,
            },
            mpsc::error::TrySendError::Closed(batch) => DeliveryError {
                kind: DeliveryErrorKind::Closed,
                batch,
            },
        })
    }
}

impl ChunkSink for mpsc::UnboundedSender<String> {
    fn deliver(&mut self, batch: String) -> Result<(), DeliveryError> {
        self.send(batch).map_err(|e| DeliveryError {
            kind: DeliveryErrorKind::Closed,
            batch: e.0,
        })
    }
}

/// What the batcher did over its lifetime.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchReport {
    /// Accumulated response text (capped, with the truncation notice if hit).
    /// Status lines are not included.
    pub text: String,
    pub batches_delivered: usize,
    pub truncated: bool,
    pub cancelled: bool,
    /// Text the consumer never accepted because it went away.
    pub undelivered: String,
}

enum Command {
    Push(String),
    Status(String),
    Finish,
}

/// Producer side. Dropping it without [`finish`](Self::finish) drains the
/// queue in the background.
pub struct BatcherHandle {
    tx: mpsc::UnboundedSender<Command>,
    token: CancellationToken,
    join: JoinHandle<BatchReport>,
}

impl BatcherHandle {
    /// Queue a content delta. Returns false once the batcher has stopped.
    pub fn push(&self, text: impl Into<String>) -> bool {
        self.try_push(text.into()).is_ok()
    }

    /// Like [`push`](Self::push), but a stopped batcher hands the text back.
    pub fn try_push(&self, text: String) -> Result<(), String> {
        if text.is_empty() {
            return if self.tx.is_closed() { Err(text) } else { Ok(()) };
        }
        self.tx.send(Command::Push(text)).map_err(|e| match e.0 {
            Command::Push(text) => text,
            _ => String::new(),
        })
    }

    /// Queue a status line. Keeps its place in the stream but does not count
    /// against the response cap.
    pub fn push_status(&self, text: impl Into<String>) -> bool {
        self.tx.send(Command::Status(text.into())).is_ok()
    }

    /// Deliver everything queued (still on the cadence), then stop.
    pub async fn finish(self) -> BatchReport {
        let _ = self.tx.send(Command::Finish);
        self.join.await.unwrap_or_else(|e| {
            tracing::warn!("batcher task failed: {e}");
            BatchReport::default()
        })
    }

    /// Stop now and discard anything not yet delivered.
    pub async fn abort(self) -> BatchReport {
        self.token.cancel();
        self.join.await.unwrap_or_else(|e| {
            tracing::warn!("batcher task failed: {e}");
            BatchReport {
                cancelled: true,
                ..BatchReport::default()
            }
        })
    }
}

pub struct ChunkBatcher;

impl ChunkBatcher {
    /// Start a batcher task. It stops when `cancel` fires, when finished, or
    /// when the sink closes.
    pub fn spawn<S: ChunkSink>(
        config: BatcherConfig,
        sink: S,
        cancel: &CancellationToken,
    ) -> BatcherHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        // Child token: tearing the batcher down must not cancel the request.
        let token = cancel.child_token();
        let state = BatchState::new(config, sink, token.clone());
        let join = tokio::spawn(state.run(rx));
        BatcherHandle { tx, token, join }
    }
}

/// Result of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flush {
    Sent,
    /// Consumer full; the batch is back at the front.
    Busy,
    Closed,
    /// Token fired before delivery; nothing was handed over.
    Cancelled,
}

struct BatchState<S> {
    config: BatcherConfig,
    sink: S,
    token: CancellationToken,
    queue: VecDeque<String>,
    report: BatchReport,
    accepted_chars: usize,
}

impl<S: ChunkSink> BatchState<S> {
    fn new(config: BatcherConfig, sink: S, token: CancellationToken) -> Self {
        Self {
            config,
            sink,
            token,
            queue: VecDeque::new(),
            report: BatchReport::default(),
            accepted_chars: 0,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) -> BatchReport {
        let token = self.token.clone();
        let interval = self.config.interval;
        let tick = tokio::time::sleep(interval);
        tokio::pin!(tick);
        let mut idle = false;
        let mut draining = false;

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return self.teardown(),
                cmd = rx.recv(), if !draining => match cmd {
                    Some(Command::Push(text)) => {
                        self.accept(text);
                        if idle {
                            idle = false;
                            tick.as_mut().reset(Instant::now() + interval);
                        }
                    }
                    Some(Command::Status(text)) => {
                        self.queue.push_back(text);
                        if idle {
                            idle = false;
                            tick.as_mut().reset(Instant::now() + interval);
                        }
                    }
                    Some(Command::Finish) | None => {
                        draining = true;
                        if self.queue.is_empty() {
                            return self.report;
                        }
                    }
                },
                _ = &mut tick => {
                    if token.is_cancelled() {
                        return self.teardown();
                    }
                    if self.queue.is_empty() {
                        if draining {
                            return self.report;
                        }
                        // Nothing to send: back off quietly until data arrives.
                        idle = true;
                        tick.as_mut().reset(Instant::now() + interval * 2);
                        continue;
                    }
                    match self.flush_one() {
                        Flush::Sent | Flush::Busy => {}
                        Flush::Cancelled => return self.teardown(),
                        Flush::Closed => {
                            tracing::debug!("batch consumer closed, stopping batcher");
                            return self.close(&mut rx);
                        }
                    }
                    if draining && self.queue.is_empty() {
                        return self.report;
                    }
                    tick.as_mut().reset(Instant::now() + interval);
                }
            }
        }
    }

    /// Record a content delta against the cap and queue what fits.
    fn accept(&mut self, text: String) {
        if self.report.truncated || text.is_empty() {
            return;
        }
        let remaining = self.config.max_chars.saturating_sub(self.accepted_chars);
        let len = text.chars().count();
        if len <= remaining {
            self.accepted_chars += len;
            self.report.text.push_str(&text);
            self.queue.push_back(text);
            return;
        }

        let head: String = text.chars().take(remaining).collect();
        if !head.is_empty() {
            self.report.text.push_str(&head);
            self.queue.push_back(head);
        }
        self.accepted_chars = self.config.max_chars;
        self.report.truncated = true;
        self.report.text.push_str(TRUNCATION_NOTICE);
        self.queue.push_back(TRUNCATION_NOTICE.to_string());
        tracing::warn!(max_chars = self.config.max_chars, "response truncated");
    }

    /// Deliver up to `max_chunks` queued chunks as one update. On failure the
    /// batch goes back to the front so nothing is lost or reordered.
    ///
    /// The token is checked right before handing over. A cancel that lands
    /// on another thread while `deliver` runs can still let that one batch
    /// through; nothing is delivered after it.
    fn flush_one(&mut self) -> Flush {
        if self.token.is_cancelled() {
            return Flush::Cancelled;
        }
        let n = self.config.max_chunks.max(1).min(self.queue.len());
        let batch: String = self.queue.drain(..n).collect();
        match self.sink.deliver(batch) {
            Ok(()) => {
                self.report.batches_delivered += 1;
                Flush::Sent
            }
            Err(DeliveryError { kind, batch }) => {
                self.queue.push_front(batch);
                match kind {
                    DeliveryErrorKind::Full => Flush::Busy,
                    DeliveryErrorKind::Closed => Flush::Closed,
                }
            }
        }
    }

    /// Consumer is gone. Stop taking input and keep every queued or
    /// in-flight delta in `undelivered`.
    fn close(mut self, rx: &mut mpsc::UnboundedReceiver<Command>) -> BatchReport {
        rx.close();
        let mut undelivered: String = self.queue.drain(..).collect();
        while let Ok(cmd) = rx.try_recv() {
            match cmd {
                Command::Push(text) | Command::Status(text) => undelivered.push_str(&text),
                Command::Finish => {}
            }
        }
        self.report.undelivered = undelivered;
        self.report
    }

    fn teardown(mut self) -> BatchReport {
        self.queue.clear();
        self.report.cancelled = true;
        self.report
    }
}
