//! Scheduled sweeper (C13, §4.9): independent cancellable timers for expiry revocation
//! and cache eviction. Stats flush is the cache-stats aggregator's own `run()` loop
//! (C7) and is not duplicated here -- §4.9 calls it "delegated to C7".

use std::sync::Arc;
use std::time::Duration;

use slog::{error, info, Logger};
use tokio::sync::oneshot;
use tollgate_http_cache::HttpCacheBackend;
use tollgate_token_manager::TokenAuthority;

pub struct SweeperHandles {
    pub expiry_shutdown: oneshot::Sender<()>,
    pub cache_shutdown: oneshot::Sender<()>,
}

/// Spawns the two independent sweep timers and returns shutdown senders for each,
/// mirroring §5's "All timers are cancellable on shutdown".
pub fn spawn(
    tokens: Arc<dyn TokenAuthority>,
    cache: Arc<dyn HttpCacheBackend>,
    token_cleanup_interval: Duration,
    cache_sweep_interval: Duration,
    logger: Logger,
) -> SweeperHandles {
    let (expiry_tx, expiry_rx) = oneshot::channel();
    let expiry_logger = logger.clone();
    tokio::spawn(expiry_sweep_loop(tokens, token_cleanup_interval, expiry_logger, expiry_rx));

    let (cache_tx, cache_rx) = oneshot::channel();
    tokio::spawn(cache_sweep_loop(cache, cache_sweep_interval, logger, cache_rx));

    SweeperHandles {
        expiry_shutdown: expiry_tx,
        cache_shutdown: cache_tx,
    }
}

async fn expiry_sweep_loop(
    tokens: Arc<dyn TokenAuthority>,
    interval: Duration,
    logger: Logger,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => return,
            _ = ticker.tick() => {
                match tokens.revoke_expired().await {
                    Ok(count) if count > 0 => info!(logger, "revoked expired tokens"; "count" => count),
                    Ok(_) => {}
                    Err(err) => error!(logger, "expiry sweep failed"; "error" => %err),
                }
            }
        }
    }
}

async fn cache_sweep_loop(
    cache: Arc<dyn HttpCacheBackend>,
    interval: Duration,
    logger: Logger,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => return,
            _ = ticker.tick() => {
                // The in-process backend purges expired entries on its own sweep;
                // a shared backend relies on native TTL and this is a no-op call
                // (§4.9 "Cache eviction").
                let now = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .expect("system clock before unix epoch")
                    .as_secs() as i64;
                let purged = cache.sweep_expired(now).await;
                if purged > 0 {
                    info!(logger, "cache sweep purged entries"; "count" => purged);
                }
            }
        }
    }
}
