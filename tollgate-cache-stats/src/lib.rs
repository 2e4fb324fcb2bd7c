//! The cache-stats aggregator (C7): coalesces per-token cache-hit events off the
//! request path and flushes them in batches to the persistent store, so a hit on a hot
//! key never pays for a write on every single request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use slog::{error, warn, Logger};
use tokio::sync::{mpsc, oneshot};
use tollgate_token_store::TokenStore;

pub struct CacheHitEvent {
    pub token_id: String,
}

/// Producer-side handle: cheap to clone, held by every request-handling task that needs
/// to report a cache hit.
#[derive(Clone)]
pub struct CacheStatsHandle {
    sender: mpsc::Sender<CacheHitEvent>,
    accepting: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
}

impl CacheStatsHandle {
    /// Records a cache hit for `token_id`. Never blocks the request path (§4.5
    /// "Back-pressure"): a full channel, or a handle that has already started shutting
    /// down, just increments the drop counter.
    pub fn record(&self, token_id: String) {
        if !self.accepting.load(Ordering::Acquire) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if self.sender.try_send(CacheHitEvent { token_id }).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Owns the receiving half and drives the flush loop; constructed alongside a
/// [`CacheStatsHandle`] by [`aggregator`].
pub struct CacheStatsAggregator {
    receiver: mpsc::Receiver<CacheHitEvent>,
    accepting: Arc<AtomicBool>,
    store: Arc<dyn TokenStore>,
    batch_size: usize,
    flush_interval: Duration,
    logger: Logger,
}

/// Builds a connected handle/aggregator pair. `buffer_size` bounds the channel
/// (`cache_stats_buffer_size`); `batch_size`/`flush_interval` govern when a flush fires
/// (`cache_stats_batch_size`/`cache_stats_flush_interval`, §6.4).
pub fn aggregator(
    buffer_size: usize,
    batch_size: usize,
    flush_interval: Duration,
    store: Arc<dyn TokenStore>,
    logger: Logger,
) -> (CacheStatsHandle, CacheStatsAggregator) {
    let (sender, receiver) = mpsc::channel(buffer_size.max(1));
    let accepting = Arc::new(AtomicBool::new(true));
    let handle = CacheStatsHandle {
        sender,
        accepting: accepting.clone(),
        dropped: Arc::new(AtomicU64::new(0)),
    };
    let aggregator = CacheStatsAggregator {
        receiver,
        accepting,
        store,
        batch_size: batch_size.max(1),
        flush_interval,
        logger,
    };
    (handle, aggregator)
}

/// Signal sent to a running aggregator to begin shutdown: stop accepting new events and
/// bound the final drain-and-flush by `deadline`.
pub struct ShutdownSignal {
    sender: oneshot::Sender<Duration>,
    accepting: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn trigger(self, deadline: Duration) {
        self.accepting.store(false, Ordering::Release);
        let _ = self.sender.send(deadline);
    }
}

impl CacheStatsAggregator {
    /// Returns a [`ShutdownSignal`] paired with this aggregator, to be handed to
    /// whatever orchestrates graceful shutdown (§5 shutdown ordering).
    pub fn shutdown_signal(&self) -> (ShutdownSignal, oneshot::Receiver<Duration>) {
        let (sender, receiver) = oneshot::channel();
        (
            ShutdownSignal {
                sender,
                accepting: self.accepting.clone(),
            },
            receiver,
        )
    }

    /// Drives the batch/interval flush loop until `shutdown` fires, then drains
    /// whatever is left in the channel and performs one final flush bounded by the
    /// shutdown deadline (§4.5).
    pub async fn run(mut self, shutdown: oneshot::Receiver<Duration>) {
        let mut deltas: HashMap<String, u64> = HashMap::new();
        let mut interval = tokio::time::interval(self.flush_interval.max(Duration::from_millis(1)));
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;

                deadline = &mut shutdown => {
                    let deadline = deadline.unwrap_or(Duration::ZERO);
                    self.drain_then_final_flush(deadline, &mut deltas).await;
                    return;
                }
                maybe_event = self.receiver.recv() => {
                    match maybe_event {
                        Some(event) => {
                            *deltas.entry(event.token_id).or_insert(0) += 1;
                            if deltas.len() >= self.batch_size {
                                self.flush(&mut deltas).await;
                            }
                        }
                        None => {
                            // every handle dropped; flush whatever remains and stop.
                            if !deltas.is_empty() {
                                self.flush(&mut deltas).await;
                            }
                            return;
                        }
                    }
                }
                _ = interval.tick() => {
                    if !deltas.is_empty() {
                        self.flush(&mut deltas).await;
                    }
                }
            }
        }
    }

    async fn drain_then_final_flush(&mut self, deadline: Duration, deltas: &mut HashMap<String, u64>) {
        while let Ok(event) = self.receiver.try_recv() {
            *deltas.entry(event.token_id).or_insert(0) += 1;
        }
        if deltas.is_empty() {
            return;
        }
        if tokio::time::timeout(deadline, self.flush(deltas)).await.is_err() {
            warn!(self.logger, "cache stats final flush exceeded shutdown deadline";
                "deadline_ms" => deadline.as_millis() as u64, "pending_tokens" => deltas.len());
        }
    }

    async fn flush(&self, deltas: &mut HashMap<String, u64>) {
        if deltas.is_empty() {
            return;
        }
        match self.store.increment_cache_hit_count_batch(deltas).await {
            Ok(()) => {
                deltas.clear();
            }
            Err(err) => {
                error!(self.logger, "cache stats flush failed, deltas kept for retry";
                    "error" => %err, "pending_tokens" => deltas.len());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tollgate_token_store::mock::MockStore;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    #[tokio::test]
    async fn flushes_when_batch_size_reached() {
        let store = Arc::new(MockStore::new());
        let (handle, agg) = aggregator(
            16,
            2,
            Duration::from_secs(3600),
            store.clone() as Arc<dyn TokenStore>,
            test_logger(),
        );

        let (signal, shutdown_rx) = agg.shutdown_signal();
        let run_handle = tokio::spawn(agg.run(shutdown_rx));

        handle.record("tok-a".to_owned());
        handle.record("tok-a".to_owned());
        // give the background task a chance to observe the batch-size threshold
        tokio::time::sleep(Duration::from_millis(20)).await;

        signal.trigger(Duration::from_secs(1));
        run_handle.await.unwrap();
    }

    #[tokio::test]
    async fn drops_are_counted_once_shutdown_has_begun() {
        let store = Arc::new(MockStore::new());
        let (handle, agg) = aggregator(
            16,
            100,
            Duration::from_secs(3600),
            store as Arc<dyn TokenStore>,
            test_logger(),
        );
        let (signal, shutdown_rx) = agg.shutdown_signal();
        signal.trigger(Duration::from_millis(50));

        handle.record("tok-a".to_owned());
        assert_eq!(handle.dropped_count(), 1);

        tokio::spawn(agg.run(shutdown_rx)).await.unwrap();
    }

    #[tokio::test]
    async fn final_flush_on_shutdown_drains_pending_events() {
        let store = Arc::new(RecordingStore::default());
        let (handle, agg) = aggregator(
            16,
            100,
            Duration::from_secs(3600),
            store.clone() as Arc<dyn TokenStore>,
            test_logger(),
        );

        handle.record("tok-a".to_owned());
        handle.record("tok-a".to_owned());
        handle.record("tok-b".to_owned());

        let (signal, shutdown_rx) = agg.shutdown_signal();
        signal.trigger(Duration::from_secs(1));
        tokio::spawn(agg.run(shutdown_rx)).await.unwrap();

        let flushed = store.flushed.lock().unwrap();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].get("tok-a"), Some(&2));
        assert_eq!(flushed[0].get("tok-b"), Some(&1));
    }

    #[derive(Default)]
    struct RecordingStore {
        flushed: Mutex<Vec<HashMap<String, u64>>>,
    }

    #[async_trait::async_trait]
    impl TokenStore for RecordingStore {
        async fn create_token(
            &self,
            _project_id: &str,
            _options: &tollgate_token_common::GenerateOptions,
        ) -> Result<tollgate_token_common::Token, tollgate_token_common::TokenError> {
            unimplemented!("not exercised by these tests")
        }

        async fn get_token_by_id(
            &self,
            _token_id: &str,
        ) -> Result<Option<tollgate_token_common::Token>, tollgate_token_common::TokenError> {
            unimplemented!("not exercised by these tests")
        }

        async fn update_token(
            &self,
            _token: &tollgate_token_common::Token,
        ) -> Result<(), tollgate_token_common::TokenError> {
            unimplemented!("not exercised by these tests")
        }

        async fn increment_token_usage(
            &self,
            _token_id: &str,
        ) -> Result<(), tollgate_token_common::TokenError> {
            unimplemented!("not exercised by these tests")
        }

        async fn increment_cache_hit_count_batch(
            &self,
            deltas: &HashMap<String, u64>,
        ) -> Result<(), tollgate_token_common::TokenError> {
            self.flushed.lock().unwrap().push(deltas.clone());
            Ok(())
        }

        async fn list_tokens_by_project_id(
            &self,
            _project_id: &str,
        ) -> Result<Vec<tollgate_token_common::Token>, tollgate_token_common::TokenError> {
            unimplemented!("not exercised by these tests")
        }

        async fn revoke_active_where_expired(
            &self,
            _now: i64,
        ) -> Result<u64, tollgate_token_common::TokenError> {
            unimplemented!("not exercised by these tests")
        }

        async fn revoke_active_where_project(
            &self,
            _project_id: &str,
        ) -> Result<u64, tollgate_token_common::TokenError> {
            unimplemented!("not exercised by these tests")
        }
    }
}
