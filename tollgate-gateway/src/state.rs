//! Shared application state (the `ServerState` equivalent). Everything here is cheap to
//! clone -- actix-web hands a fresh clone of the relevant `web::Data` to every worker
//! thread the same way `syncserver::server::ServerState` does, via `Arc`s underneath.

use std::sync::Arc;

use slog::Logger;
use tollgate_cache_stats::CacheStatsHandle;
use tollgate_common::Metrics;
use tollgate_event_bus::EventBus;
use tollgate_http_cache::HttpCacheBackend;
use tollgate_settings::Settings;
use tollgate_token_manager::TokenAuthority;
use tollgate_token_store::ProjectStore;

use crate::events::Event;

pub struct AppState {
    pub settings: Settings,
    pub tokens: Arc<dyn TokenAuthority>,
    pub projects: Arc<dyn ProjectStore>,
    pub http_cache: Arc<dyn HttpCacheBackend>,
    pub cache_stats: CacheStatsHandle,
    pub events: Arc<EventBus<Event>>,
    pub upstream: reqwest::Client,
    pub metrics: Metrics,
    pub logger: Logger,
}
