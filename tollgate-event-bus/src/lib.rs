//! The event bus (C8): a typed fan-out broadcast with N independent subscribers. Each
//! subscriber gets its own bounded `mpsc` channel rather than a single shared
//! `tokio::sync::broadcast` -- a `broadcast` channel evicts the *oldest* unread message
//! on overflow (lagged-receiver semantics), whereas §4.6 requires the newest event to be
//! the one dropped and a counter incremented, which only a per-subscriber bounded queue
//! with `try_send` gives us directly.
//!
//! `Publish` never awaits and never blocks on a full subscriber: it is the same
//! try-send-or-drop discipline the cache-stats aggregator (C7) and the rate limiter's
//! local counters use elsewhere in this workspace, applied here to fan-out instead of a
//! single consumer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;

/// Bus-wide counters, exposed for metrics reporting by whoever owns the bus.
#[derive(Default)]
struct Counters {
    published: AtomicU64,
    /// Incremented once per `publish` call where *every* subscriber's queue was full
    /// (or there were no subscribers to begin with), i.e. the event reached nobody.
    fully_dropped: AtomicU64,
    /// Incremented once per subscriber whose queue was full on a given publish, even
    /// if other subscribers did receive the event.
    per_subscriber_dropped: AtomicU64,
}

struct Subscriber<T> {
    sender: mpsc::Sender<T>,
}

/// A typed, non-blocking fan-out bus (§4.6). `T` is the event payload -- the gateway
/// crate instantiates this with its concrete `Event` record; tests in this crate use a
/// plain `u32` to keep the fan-out behaviour itself the focus.
pub struct EventBus<T> {
    subscribers: Mutex<Vec<Subscriber<T>>>,
    subscriber_buffer_size: usize,
    counters: Counters,
    stopped: AtomicBool,
}

impl<T: Clone + Send + 'static> EventBus<T> {
    /// `subscriber_buffer_size` bounds every fan-out receiver's queue
    /// (`event_bus_buffer_size` configures the subscriber-facing limit; a deployment
    /// wanting independent producer/consumer bounds can wrap this bus behind its own
    /// ingress queue).
    pub fn new(subscriber_buffer_size: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            subscriber_buffer_size: subscriber_buffer_size.max(1),
            counters: Counters::default(),
            stopped: AtomicBool::new(false),
        }
    }

    /// `Subscribe() -> receive-only stream` (§4.6). Returns `None` once the bus has
    /// been stopped -- there is no point handing out a channel that will never receive
    /// anything.
    pub fn subscribe(&self) -> Option<mpsc::Receiver<T>> {
        if self.stopped.load(Ordering::Acquire) {
            return None;
        }
        let (sender, receiver) = mpsc::channel(self.subscriber_buffer_size);
        self.subscribers.lock().unwrap().push(Subscriber { sender });
        Some(receiver)
    }

    /// `Publish(ctx, event)` (§4.6): clones `event` to every subscriber, using
    /// `try_send` so a full or closed subscriber queue never blocks the caller. Rust's
    /// structured concurrency makes an explicit cancellable-context object largely
    /// redundant here -- `publish` never awaits, so there is nothing for a deadline to
    /// bound; a caller that wants to honour a request deadline simply skips calling
    /// `publish` once its own deadline has passed, which the request pipeline (C10)
    /// already does by construction (events are only emitted after the response is
    /// decided).
    pub fn publish(&self, event: T) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }

        self.counters.published.fetch_add(1, Ordering::Relaxed);

        let subscribers = self.subscribers.lock().unwrap();
        if subscribers.is_empty() {
            self.counters.fully_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let mut delivered = false;
        for subscriber in subscribers.iter() {
            match subscriber.sender.try_send(event.clone()) {
                Ok(()) => delivered = true,
                Err(_) => {
                    self.counters
                        .per_subscriber_dropped
                        .fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        if !delivered {
            self.counters.fully_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// `Stop()` (§4.6): idempotent. Stops accepting new subscribers and new publishes;
    /// existing subscriber channels are closed by dropping their senders, which lets
    /// any already-buffered events drain to completion before each receiver observes
    /// end-of-stream, rather than truncating the backlog.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return; // already stopped
        }
        self.subscribers.lock().unwrap().clear();
    }

    pub fn published_count(&self) -> u64 {
        self.counters.published.load(Ordering::Relaxed)
    }

    pub fn fully_dropped_count(&self) -> u64 {
        self.counters.fully_dropped.load(Ordering::Relaxed)
    }

    pub fn per_subscriber_dropped_count(&self) -> u64 {
        self.counters.per_subscriber_dropped.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn publish_before_any_subscriber_is_fully_dropped() {
        let bus: EventBus<u32> = EventBus::new(4);
        bus.publish(1);
        assert_eq!(bus.fully_dropped_count(), 1);
        assert_eq!(bus.published_count(), 1);
    }

    #[tokio::test]
    async fn each_subscriber_receives_every_event_in_publication_order() {
        let bus: EventBus<u32> = EventBus::new(4);
        let mut a = bus.subscribe().unwrap();
        let mut b = bus.subscribe().unwrap();

        bus.publish(1);
        bus.publish(2);
        bus.publish(3);

        assert_eq!(a.recv().await, Some(1));
        assert_eq!(a.recv().await, Some(2));
        assert_eq!(a.recv().await, Some(3));

        assert_eq!(b.recv().await, Some(1));
        assert_eq!(b.recv().await, Some(2));
        assert_eq!(b.recv().await, Some(3));
    }

    #[tokio::test]
    async fn full_subscriber_queue_drops_without_blocking_other_subscribers() {
        let bus: EventBus<u32> = EventBus::new(1);
        let slow = bus.subscribe().unwrap(); // never drained in this test
        let mut fast = bus.subscribe().unwrap();

        bus.publish(1);
        bus.publish(2); // slow's single slot is already full; fast still gets it

        assert_eq!(fast.recv().await, Some(1));
        assert_eq!(fast.recv().await, Some(2));
        assert_eq!(bus.per_subscriber_dropped_count(), 1);
        assert_eq!(bus.fully_dropped_count(), 0);
        drop(slow);
    }

    #[tokio::test]
    async fn publish_returns_immediately_even_with_a_saturated_bus() {
        let bus: EventBus<u32> = EventBus::new(1);
        let _slow = bus.subscribe().unwrap();

        let start = tokio::time::Instant::now();
        for i in 0..1000u32 {
            bus.publish(i);
        }
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_closes_subscribers_after_drain() {
        let bus: EventBus<u32> = EventBus::new(4);
        let mut sub = bus.subscribe().unwrap();
        bus.publish(1);

        bus.stop();
        bus.stop(); // idempotent

        assert_eq!(sub.recv().await, Some(1)); // buffered event still drains
        assert_eq!(sub.recv().await, None); // then the stream ends

        assert!(bus.subscribe().is_none());
        bus.publish(2); // silently ignored, no panic
    }
}
