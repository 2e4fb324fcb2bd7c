//! The event dispatcher (C9): consumes one bus subscription, batches events by size or
//! time, and routes the batch to a single sink with retry and exponential backoff.
//! Implemented as the explicit state machine from §4.7 (`Consuming` / `Flushing` /
//! `Backoff` / `Stopping`) rather than folding the retry logic into the batching loop,
//! so each transition's invariant stays easy to name in review: "we only ever sleep in
//! `Backoff`", "we only ever call the sink in `Flushing`".

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use slog::{error, warn, Logger};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// Whether a sink failure is worth retrying. A sink returning `Terminal` (e.g. a
/// malformed batch its encoder can never accept) causes an immediate drop instead of
/// burning through `max_attempts` pointlessly.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SinkFailure {
    Retryable,
    Terminal,
}

/// A delivery target for batches of `T` (§4.7 "Sink contract"). Sinks must tolerate
/// duplicate batches: a batch that partially succeeded before a retryable failure may
/// be resent in full.
#[async_trait]
pub trait Sink<T>: Send + Sync {
    async fn send_batch(&self, batch: &[T]) -> Result<(), SinkFailure>;
}

#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

#[derive(Default)]
struct Counters {
    flushed_batches: std::sync::atomic::AtomicU64,
    flushed_events: std::sync::atomic::AtomicU64,
    dropped_batches: std::sync::atomic::AtomicU64,
    dropped_events: std::sync::atomic::AtomicU64,
}

/// Cheap-to-clone read handle onto a running dispatcher's counters, for metrics
/// reporting (`Metrics::count_with_tags` at the call site owns the actual emission).
#[derive(Clone)]
pub struct DispatcherStats {
    counters: std::sync::Arc<Counters>,
}

impl DispatcherStats {
    pub fn flushed_batches(&self) -> u64 {
        self.counters.flushed_batches.load(std::sync::atomic::Ordering::Relaxed)
    }
    pub fn flushed_events(&self) -> u64 {
        self.counters.flushed_events.load(std::sync::atomic::Ordering::Relaxed)
    }
    pub fn dropped_batches(&self) -> u64 {
        self.counters.dropped_batches.load(std::sync::atomic::Ordering::Relaxed)
    }
    pub fn dropped_events(&self) -> u64 {
        self.counters.dropped_events.load(std::sync::atomic::Ordering::Relaxed)
    }
}

enum State {
    Consuming,
    Flushing,
    Backoff,
    Stopping,
}

pub struct Dispatcher<T, K: Sink<T>> {
    receiver: mpsc::Receiver<T>,
    sink: K,
    config: DispatcherConfig,
    logger: Logger,
    counters: std::sync::Arc<Counters>,
}

pub struct ShutdownSignal {
    sender: oneshot::Sender<()>,
}

impl ShutdownSignal {
    pub fn trigger(self) {
        let _ = self.sender.send(());
    }
}

impl<T, K: Sink<T>> Dispatcher<T, K> {
    pub fn new(
        receiver: mpsc::Receiver<T>,
        sink: K,
        config: DispatcherConfig,
        logger: Logger,
    ) -> (Self, DispatcherStats) {
        let counters = std::sync::Arc::new(Counters::default());
        let stats = DispatcherStats {
            counters: counters.clone(),
        };
        (
            Self {
                receiver,
                sink,
                config,
                logger,
                counters,
            },
            stats,
        )
    }

    pub fn shutdown_signal(&self) -> (ShutdownSignal, oneshot::Receiver<()>) {
        let (sender, receiver) = oneshot::channel();
        (ShutdownSignal { sender }, receiver)
    }

    /// Drives the `Consuming` -> `Flushing` -> `Backoff` -> `Consuming` cycle until
    /// `shutdown` fires, then transitions to `Stopping`: drains whatever is already
    /// buffered in the channel, makes one final delivery attempt, and returns.
    pub async fn run(mut self, shutdown: oneshot::Receiver<()>) {
        let mut state = State::Consuming;
        let mut batch: Vec<T> = Vec::with_capacity(self.config.batch_size);
        let mut batch_started: Option<Instant> = None;
        let mut attempts: u32 = 0;
        tokio::pin!(shutdown);

        loop {
            match state {
                State::Consuming => {
                    let flush_deadline = async {
                        match batch_started {
                            Some(started) => {
                                tokio::time::sleep_until(started + self.config.flush_interval).await
                            }
                            None => std::future::pending::<()>().await,
                        }
                    };

                    tokio::select! {
                        biased;

                        _ = &mut shutdown => {
                            state = State::Stopping;
                        }
                        maybe_event = self.receiver.recv() => {
                            match maybe_event {
                                Some(event) => {
                                    if batch.is_empty() {
                                        batch_started = Some(Instant::now());
                                    }
                                    batch.push(event);
                                    if batch.len() >= self.config.batch_size {
                                        state = State::Flushing;
                                    }
                                }
                                None => {
                                    // every bus subscription handle dropped upstream
                                    state = State::Stopping;
                                }
                            }
                        }
                        _ = flush_deadline => {
                            state = State::Flushing;
                        }
                    }
                }

                State::Flushing => {
                    match self.sink.send_batch(&batch).await {
                        Ok(()) => {
                            self.counters
                                .flushed_batches
                                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                            self.counters
                                .flushed_events
                                .fetch_add(batch.len() as u64, std::sync::atomic::Ordering::Relaxed);
                            batch.clear();
                            batch_started = None;
                            attempts = 0;
                            state = State::Consuming;
                        }
                        Err(SinkFailure::Terminal) => {
                            warn!(self.logger, "dispatcher sink returned a terminal failure, dropping batch";
                                "batch_len" => batch.len());
                            self.drop_batch(&mut batch, &mut batch_started, &mut attempts);
                            state = State::Consuming;
                        }
                        Err(SinkFailure::Retryable) => {
                            state = State::Backoff;
                        }
                    }
                }

                State::Backoff => {
                    if attempts >= self.config.max_attempts {
                        error!(self.logger, "dispatcher exhausted retry attempts, dropping batch";
                            "batch_len" => batch.len(), "max_attempts" => self.config.max_attempts);
                        self.drop_batch(&mut batch, &mut batch_started, &mut attempts);
                        state = State::Consuming;
                        continue;
                    }

                    let delay = backoff_duration(
                        self.config.base_backoff,
                        self.config.max_backoff,
                        attempts,
                    );
                    tokio::select! {
                        biased;

                        _ = &mut shutdown => {
                            state = State::Stopping;
                        }
                        _ = tokio::time::sleep(delay) => {
                            attempts += 1;
                            state = State::Flushing;
                        }
                    }
                }

                State::Stopping => {
                    while let Ok(event) = self.receiver.try_recv() {
                        if batch.is_empty() {
                            batch_started = Some(Instant::now());
                        }
                        batch.push(event);
                    }
                    if !batch.is_empty() {
                        if let Err(failure) = self.sink.send_batch(&batch).await {
                            error!(self.logger, "final shutdown flush failed, batch dropped";
                                "batch_len" => batch.len(), "failure" => ?failure);
                            self.counters
                                .dropped_batches
                                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                            self.counters
                                .dropped_events
                                .fetch_add(batch.len() as u64, std::sync::atomic::Ordering::Relaxed);
                        } else {
                            self.counters
                                .flushed_batches
                                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                            self.counters
                                .flushed_events
                                .fetch_add(batch.len() as u64, std::sync::atomic::Ordering::Relaxed);
                        }
                    }
                    return;
                }
            }
        }
    }

    fn drop_batch(&self, batch: &mut Vec<T>, batch_started: &mut Option<Instant>, attempts: &mut u32) {
        self.counters
            .dropped_batches
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.counters
            .dropped_events
            .fetch_add(batch.len() as u64, std::sync::atomic::Ordering::Relaxed);
        batch.clear();
        *batch_started = None;
        *attempts = 0;
    }
}

/// `min(base_backoff * 2^attempts, max_backoff)` with full jitter (§4.7).
fn backoff_duration(base: Duration, max: Duration, attempts: u32) -> Duration {
    let exp_millis = base
        .as_millis()
        .saturating_mul(1u128 << attempts.min(32))
        .min(max.as_millis());
    let jittered = rand::thread_rng().gen_range(0..=exp_millis.max(1));
    Duration::from_millis(jittered.min(u128::from(u64::MAX)) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    fn config() -> DispatcherConfig {
        DispatcherConfig {
            batch_size: 3,
            flush_interval: Duration::from_secs(3600),
            max_attempts: 3,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        }
    }

    struct RecordingSink {
        batches: std::sync::Mutex<Vec<Vec<u32>>>,
    }

    #[async_trait]
    impl Sink<u32> for RecordingSink {
        async fn send_batch(&self, batch: &[u32]) -> Result<(), SinkFailure> {
            self.batches.lock().unwrap().push(batch.to_vec());
            Ok(())
        }
    }

    struct FlakySink {
        fail_times: AtomicU32,
        batches: std::sync::Mutex<Vec<Vec<u32>>>,
    }

    #[async_trait]
    impl Sink<u32> for FlakySink {
        async fn send_batch(&self, batch: &[u32]) -> Result<(), SinkFailure> {
            if self.fail_times.load(Ordering::SeqCst) > 0 {
                self.fail_times.fetch_sub(1, Ordering::SeqCst);
                return Err(SinkFailure::Retryable);
            }
            self.batches.lock().unwrap().push(batch.to_vec());
            Ok(())
        }
    }

    struct AlwaysFailsSink;

    #[async_trait]
    impl Sink<u32> for AlwaysFailsSink {
        async fn send_batch(&self, _batch: &[u32]) -> Result<(), SinkFailure> {
            Err(SinkFailure::Retryable)
        }
    }

    struct TerminalSink;

    #[async_trait]
    impl Sink<u32> for TerminalSink {
        async fn send_batch(&self, _batch: &[u32]) -> Result<(), SinkFailure> {
            Err(SinkFailure::Terminal)
        }
    }

    #[tokio::test]
    async fn flushes_once_batch_size_is_reached() {
        let sink = Arc::new(RecordingSink {
            batches: std::sync::Mutex::new(vec![]),
        });
        let (tx, rx) = mpsc::channel(16);
        let (dispatcher, stats) = Dispatcher::new(
            rx,
            Arc::clone(&sink),
            config(),
            test_logger(),
        );
        let (signal, shutdown_rx) = dispatcher.shutdown_signal();
        let handle = tokio::spawn(dispatcher.run(shutdown_rx));

        tx.send(1).await.unwrap();
        tx.send(2).await.unwrap();
        tx.send(3).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        signal.trigger();
        handle.await.unwrap();

        assert_eq!(sink.batches.lock().unwrap().len(), 1);
        assert_eq!(stats.flushed_events(), 3);
    }

    #[async_trait]
    impl Sink<u32> for Arc<RecordingSink> {
        async fn send_batch(&self, batch: &[u32]) -> Result<(), SinkFailure> {
            RecordingSink::send_batch(self, batch).await
        }
    }

    #[tokio::test]
    async fn retries_and_succeeds_before_max_attempts() {
        let sink = FlakySink {
            fail_times: AtomicU32::new(2),
            batches: std::sync::Mutex::new(vec![]),
        };
        let (tx, rx) = mpsc::channel(16);
        let (dispatcher, stats) = Dispatcher::new(rx, sink, config(), test_logger());
        let (signal, shutdown_rx) = dispatcher.shutdown_signal();
        let handle = tokio::spawn(dispatcher.run(shutdown_rx));

        tx.send(1).await.unwrap();
        tx.send(2).await.unwrap();
        tx.send(3).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        signal.trigger();
        handle.await.unwrap();

        assert_eq!(stats.flushed_batches(), 1);
        assert_eq!(stats.dropped_batches(), 0);
    }

    #[tokio::test]
    async fn drops_batch_after_max_attempts_exhausted() {
        let (tx, rx) = mpsc::channel(16);
        let (dispatcher, stats) = Dispatcher::new(rx, AlwaysFailsSink, config(), test_logger());
        let (signal, shutdown_rx) = dispatcher.shutdown_signal();
        let handle = tokio::spawn(dispatcher.run(shutdown_rx));

        tx.send(1).await.unwrap();
        tx.send(2).await.unwrap();
        tx.send(3).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        signal.trigger();
        handle.await.unwrap();

        assert_eq!(stats.dropped_batches(), 1);
        assert_eq!(stats.dropped_events(), 3);
        assert_eq!(stats.flushed_batches(), 0);
    }

    #[tokio::test]
    async fn terminal_failure_drops_without_retrying() {
        let (tx, rx) = mpsc::channel(16);
        let (dispatcher, stats) = Dispatcher::new(rx, TerminalSink, config(), test_logger());
        let (signal, shutdown_rx) = dispatcher.shutdown_signal();
        let handle = tokio::spawn(dispatcher.run(shutdown_rx));

        tx.send(1).await.unwrap();
        tx.send(2).await.unwrap();
        tx.send(3).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        signal.trigger();
        handle.await.unwrap();

        assert_eq!(stats.dropped_batches(), 1);
        assert_eq!(stats.flushed_batches(), 0);
    }

    #[tokio::test]
    async fn shutdown_flushes_a_partial_batch_once() {
        let sink = Arc::new(RecordingSink {
            batches: std::sync::Mutex::new(vec![]),
        });
        let (tx, rx) = mpsc::channel(16);
        let (dispatcher, stats) = Dispatcher::new(rx, Arc::clone(&sink), config(), test_logger());
        let (signal, shutdown_rx) = dispatcher.shutdown_signal();
        let handle = tokio::spawn(dispatcher.run(shutdown_rx));

        tx.send(1).await.unwrap();
        tx.send(2).await.unwrap(); // below batch_size, never flushed by size/interval

        signal.trigger();
        handle.await.unwrap();

        assert_eq!(sink.batches.lock().unwrap().len(), 1);
        assert_eq!(stats.flushed_events(), 2);
    }

    #[test]
    fn backoff_never_exceeds_max() {
        let base = Duration::from_millis(100);
        let max = Duration::from_millis(500);
        for attempts in 0..10 {
            let d = backoff_duration(base, max, attempts);
            assert!(d <= max);
        }
    }
}
