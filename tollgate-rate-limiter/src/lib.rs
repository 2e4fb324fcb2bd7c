//! The per-token rate limiter (C4): a fixed-window counter with a configurable window
//! and maximum count. Two backends share one contract (§4.2): an in-process
//! [`LocalRateLimiter`], and a [`FallbackRateLimiter`] that prefers a shared external
//! counter store (e.g. Redis `INCR` + `EXPIRE`) and drops back to the local backend on
//! backend error, the same degrade-to-local pattern the gateway crate uses for the HTTP
//! cache and event bus.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use slog::{warn, Logger};

/// Outcome of an `Allow` check: whether the request is admitted, and how many requests
/// remain in the current window after this one is counted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllowResult {
    pub allowed: bool,
    pub remaining: u64,
}

/// Per-token fixed-window rate limiting (§4.2). Implementations must make the
/// check-and-increment atomic per token: concurrent callers for the same token observe a
/// linearizable sequence of increments.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn allow(&self, token_id: &str, now: i64) -> AllowResult;

    /// Zeroes the current window for a token, e.g. after a quota change.
    async fn reset(&self, token_id: &str);
}

struct Window {
    start: i64,
    count: u64,
}

/// In-process fixed-window counter guarded by a single mutex. Expired windows are
/// evicted lazily: a key is reset to a fresh window the next time it is checked after
/// its window has closed, rather than on a timer (§4.2).
pub struct LocalRateLimiter {
    window_secs: i64,
    max_count: u64,
    windows: Mutex<HashMap<String, Window>>,
}

impl LocalRateLimiter {
    pub fn new(window_secs: i64, max_count: u64) -> Self {
        Self {
            window_secs: window_secs.max(1),
            max_count,
            windows: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl RateLimiter for LocalRateLimiter {
    async fn allow(&self, token_id: &str, now: i64) -> AllowResult {
        let mut windows = self.windows.lock().unwrap();
        let window = windows.entry(token_id.to_owned()).or_insert(Window {
            start: now,
            count: 0,
        });

        if now - window.start >= self.window_secs {
            window.start = now;
            window.count = 0;
        }

        if window.count >= self.max_count {
            return AllowResult {
                allowed: false,
                remaining: 0,
            };
        }

        window.count += 1;
        AllowResult {
            allowed: true,
            remaining: self.max_count - window.count,
        }
    }

    async fn reset(&self, token_id: &str) {
        self.windows.lock().unwrap().remove(token_id);
    }
}

/// An external atomic counter store, e.g. Redis `INCR` on a window-scoped key with
/// `EXPIRE` set on first increment. The fixed window is expressed as an external TTL
/// rather than a Rust-side instant so separate gateway instances stay in agreement.
#[async_trait]
pub trait SharedCounterBackend: Send + Sync {
    /// Increments the counter for `token_id`'s current window, setting the window's TTL
    /// if this is the first increment, and returns the post-increment count.
    async fn incr_and_expire(
        &self,
        token_id: &str,
        window_secs: i64,
    ) -> Result<u64, SharedCounterError>;

    async fn reset(&self, token_id: &str) -> Result<(), SharedCounterError>;
}

#[derive(Debug, thiserror::Error)]
#[error("shared rate limit backend error: {0}")]
pub struct SharedCounterError(pub String);

/// Prefers a shared backend; on backend error, logs and falls back to a local counter
/// for that call so a backend outage degrades rate-limit accuracy rather than blocking
/// requests (§4.2, mirroring the gateway's cache/event-bus fallback policy).
pub struct FallbackRateLimiter<B: SharedCounterBackend> {
    shared: B,
    window_secs: i64,
    max_count: u64,
    local: LocalRateLimiter,
    logger: Logger,
}

impl<B: SharedCounterBackend> FallbackRateLimiter<B> {
    pub fn new(shared: B, window_secs: i64, max_count: u64, logger: Logger) -> Self {
        Self {
            shared,
            window_secs,
            max_count,
            local: LocalRateLimiter::new(window_secs, max_count),
            logger,
        }
    }
}

#[async_trait]
impl<B: SharedCounterBackend> RateLimiter for FallbackRateLimiter<B> {
    async fn allow(&self, token_id: &str, now: i64) -> AllowResult {
        match self.shared.incr_and_expire(token_id, self.window_secs).await {
            Ok(count) => {
                if count > self.max_count {
                    AllowResult {
                        allowed: false,
                        remaining: 0,
                    }
                } else {
                    AllowResult {
                        allowed: true,
                        remaining: self.max_count - count,
                    }
                }
            }
            Err(err) => {
                warn!(self.logger, "rate limit backend unavailable, falling back to local";
                    "token_id" => token_id, "error" => %err);
                self.local.allow(token_id, now).await
            }
        }
    }

    async fn reset(&self, token_id: &str) {
        if let Err(err) = self.shared.reset(token_id).await {
            warn!(self.logger, "rate limit backend reset failed, resetting local fallback only";
                "token_id" => token_id, "error" => %err);
        }
        self.local.reset(token_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_up_to_max_then_rejects() {
        let limiter = LocalRateLimiter::new(60, 3);
        assert_eq!(
            limiter.allow("tok", 0).await,
            AllowResult {
                allowed: true,
                remaining: 2
            }
        );
        assert_eq!(
            limiter.allow("tok", 0).await,
            AllowResult {
                allowed: true,
                remaining: 1
            }
        );
        assert_eq!(
            limiter.allow("tok", 0).await,
            AllowResult {
                allowed: true,
                remaining: 0
            }
        );
        assert_eq!(
            limiter.allow("tok", 0).await,
            AllowResult {
                allowed: false,
                remaining: 0
            }
        );
    }

    #[tokio::test]
    async fn window_resets_after_expiry() {
        let limiter = LocalRateLimiter::new(60, 1);
        assert!(limiter.allow("tok", 0).await.allowed);
        assert!(!limiter.allow("tok", 10).await.allowed);
        assert!(limiter.allow("tok", 61).await.allowed);
    }

    #[tokio::test]
    async fn reset_clears_window_immediately() {
        let limiter = LocalRateLimiter::new(60, 1);
        assert!(limiter.allow("tok", 0).await.allowed);
        assert!(!limiter.allow("tok", 5).await.allowed);
        limiter.reset("tok").await;
        assert!(limiter.allow("tok", 5).await.allowed);
    }

    #[tokio::test]
    async fn counters_are_independent_per_token() {
        let limiter = LocalRateLimiter::new(60, 1);
        assert!(limiter.allow("a", 0).await.allowed);
        assert!(limiter.allow("b", 0).await.allowed);
        assert!(!limiter.allow("a", 0).await.allowed);
    }

    struct AlwaysErrBackend;

    #[async_trait]
    impl SharedCounterBackend for AlwaysErrBackend {
        async fn incr_and_expire(
            &self,
            _token_id: &str,
            _window_secs: i64,
        ) -> Result<u64, SharedCounterError> {
            Err(SharedCounterError("connection refused".to_owned()))
        }

        async fn reset(&self, _token_id: &str) -> Result<(), SharedCounterError> {
            Err(SharedCounterError("connection refused".to_owned()))
        }
    }

    #[tokio::test]
    async fn falls_back_to_local_on_shared_backend_error() {
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let limiter = FallbackRateLimiter::new(AlwaysErrBackend, 60, 1, logger);
        assert!(limiter.allow("tok", 0).await.allowed);
        assert!(!limiter.allow("tok", 0).await.allowed);
    }

    proptest::proptest! {
        /// Whatever order same-second calls arrive in, a token is never allowed more than
        /// `max_count` times inside one window (§4.2's core counting invariant).
        #[test]
        fn never_allows_more_than_max_within_a_window(max_count in 1u64..20, calls in 1usize..50) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let limiter = LocalRateLimiter::new(60, max_count);
                let mut allowed = 0u64;
                for _ in 0..calls {
                    if limiter.allow("tok", 0).await.allowed {
                        allowed += 1;
                    }
                }
                proptest::prop_assert!(allowed <= max_count);
                Ok(())
            })?;
        }

        /// `remaining` reported on an allowed call always equals `max_count` minus the
        /// number of calls admitted so far in the window.
        #[test]
        fn remaining_tracks_admitted_count(max_count in 1u64..20) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let limiter = LocalRateLimiter::new(60, max_count);
                for admitted in 1..=max_count {
                    let result = limiter.allow("tok", 0).await;
                    proptest::prop_assert!(result.allowed);
                    proptest::prop_assert_eq!(result.remaining, max_count - admitted);
                }
                Ok(())
            })?;
        }
    }
}
