//! Server construction and graceful shutdown orchestration, mirroring
//! `syncserver::server::Server::with_settings` -- one function that wires every
//! component together and hands back a running `actix_web::dev::Server`.

use std::sync::Arc;
use std::time::Duration;

use actix_web::{dev, web, App, HttpServer};
use slog::{info, Logger};
use tollgate_cache_stats::aggregator;
use tollgate_event_bus::EventBus;
use tollgate_event_dispatcher::{Dispatcher, DispatcherConfig, Sink, SinkFailure};
use tollgate_http_cache::{HttpCacheBackend, InMemoryCache};
use tollgate_rate_limiter::LocalRateLimiter;
use tollgate_settings::Settings;
use tollgate_token_common::{Project, UpstreamApiKey};
use tollgate_token_manager::{TokenAuthority, TokenManager};
use tollgate_token_store::mock::MockStore;
use tollgate_token_store::{ProjectStore, TokenStore};

use crate::error::ApiError;
use crate::events::Event;
use crate::handlers;
use crate::pipeline::handle_proxy;
use crate::state::AppState;
use crate::{sweeper, upstream};

/// Stdout sink for dispatched event batches. The real management/observability
/// provider this would forward to is out of scope (§1); this is the minimal sink that
/// satisfies the `Sink<T>` contract so the dispatcher's retry/backoff machinery has
/// somewhere to deliver to when running this crate standalone.
pub struct StdoutSink {
    logger: Logger,
}

#[async_trait::async_trait]
impl Sink<Event> for StdoutSink {
    async fn send_batch(&self, batch: &[Event]) -> Result<(), SinkFailure> {
        for event in batch {
            info!(self.logger, "event";
                "request_id" => %event.request_id,
                "method" => &event.method,
                "path" => &event.path,
                "status" => event.status,
                "duration_ms" => event.duration_ms,
                "cache_status" => %event.cache_status,
            );
        }
        Ok(())
    }
}

/// Handles returned by [`build_and_run`] so the caller can drive an orderly shutdown in
/// the sequence §5 specifies: listener -> handlers -> sweeper -> dispatcher -> stats
/// aggregator (final flush) -> bus -> cache/store.
pub struct Handles {
    pub sweeper: sweeper::SweeperHandles,
    pub dispatcher_shutdown: tollgate_event_dispatcher::ShutdownSignal,
    pub dispatcher_task: tokio::task::JoinHandle<()>,
    pub cache_stats_shutdown: tollgate_cache_stats::ShutdownSignal,
    pub cache_stats_task: tokio::task::JoinHandle<()>,
    pub cache_stats_drain_deadline: Duration,
    pub events: Arc<EventBus<Event>>,
}

impl Handles {
    /// Graceful shutdown in the order §5 specifies. The listener/in-flight-handlers
    /// step is left to the caller (it owns the `dev::Server` future being awaited);
    /// this drains everything downstream of it.
    pub async fn shutdown(self) {
        let _ = self.sweeper.expiry_shutdown.send(());
        let _ = self.sweeper.cache_shutdown.send(());

        self.dispatcher_shutdown.trigger();
        let _ = self.dispatcher_task.await;

        self.cache_stats_shutdown.trigger(self.cache_stats_drain_deadline);
        let _ = self.cache_stats_task.await;

        self.events.stop();
    }
}

pub async fn build_and_run(settings: Settings, logger: Logger) -> Result<(dev::Server, Handles), ApiError> {
    let metrics_client = tollgate_common::metrics_from_opts(
        &settings.proxy_name,
        settings.statsd_host.as_deref(),
        settings.statsd_port,
    )
    .map_err(|err| ApiError::from(crate::error::ApiErrorKind::Internal(err.to_string())))?;
    let metrics = tollgate_common::Metrics::from(&metrics_client);

    // The real SQL-backed persistent store (C1) is an external collaborator (§1); a
    // single shared in-memory store stands in for it when running this crate alone.
    let store = Arc::new(MockStore::new());
    seed_dev_project(&store);

    let rate_limiter = LocalRateLimiter::new(
        settings.rate_limit.window_secs as i64,
        settings.rate_limit.max,
    );
    let token_manager = TokenManager::new(
        store.clone(),
        settings.token_cache.capacity,
        settings.token_cache.ttl_secs as i64,
        rate_limiter,
        logger.new(slog::o!("component" => "token-manager")),
    );
    let tokens: Arc<dyn TokenAuthority> = Arc::new(token_manager);
    let projects: Arc<dyn ProjectStore> = store.clone() as Arc<dyn ProjectStore>;

    let http_cache: Arc<dyn HttpCacheBackend> = Arc::new(InMemoryCache::new());

    let (cache_stats_handle, cache_stats_aggregator) = aggregator(
        settings.cache_stats.buffer_size,
        settings.cache_stats.batch_size,
        Duration::from_millis(settings.cache_stats.flush_interval_millis),
        store.clone() as Arc<dyn TokenStore>,
        logger.new(slog::o!("component" => "cache-stats")),
    );
    let (cache_stats_shutdown, cache_stats_shutdown_rx) = cache_stats_aggregator.shutdown_signal();
    let cache_stats_task = tokio::spawn(cache_stats_aggregator.run(cache_stats_shutdown_rx));

    let events: Arc<EventBus<Event>> = Arc::new(EventBus::new(settings.event_bus.subscriber_buffer_size));
    let dispatcher_receiver = events.subscribe().expect("bus freshly constructed, not stopped");
    let dispatcher_config = DispatcherConfig {
        batch_size: settings.dispatcher.batch_size,
        flush_interval: Duration::from_millis(settings.dispatcher.flush_interval_millis),
        max_attempts: settings.dispatcher.max_attempts,
        base_backoff: Duration::from_millis(settings.dispatcher.base_backoff_millis),
        max_backoff: Duration::from_millis(settings.dispatcher.max_backoff_millis),
    };
    let sink = StdoutSink {
        logger: logger.new(slog::o!("component" => "event-sink")),
    };
    let (dispatcher, _dispatcher_stats) = Dispatcher::new(
        dispatcher_receiver,
        sink,
        dispatcher_config,
        logger.new(slog::o!("component" => "dispatcher")),
    );
    let (dispatcher_shutdown, dispatcher_shutdown_rx) = dispatcher.shutdown_signal();
    let dispatcher_task = tokio::spawn(dispatcher.run(dispatcher_shutdown_rx));

    let sweeper_handles = sweeper::spawn(
        tokens.clone(),
        http_cache.clone(),
        Duration::from_secs(settings.token_cache.cleanup_interval_secs),
        Duration::from_secs(settings.sweeper.cache_sweep_interval_secs),
        logger.new(slog::o!("component" => "sweeper")),
    );

    let upstream_client = upstream::build_client(&settings.upstream);

    let app_state = web::Data::new(AppState {
        settings: settings.clone(),
        tokens,
        projects,
        http_cache,
        cache_stats: cache_stats_handle,
        events: events.clone(),
        upstream: upstream_client,
        metrics,
        logger: logger.clone(),
    });

    let listen_addr = format!("{}:{}", settings.listen_addr, settings.port);
    let http_server = HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .route("/__heartbeat__", web::get().to(handlers::heartbeat))
            .route("/__lbheartbeat__", web::get().to(handlers::lbheartbeat))
            .route("/__version__", web::get().to(handlers::version))
            .default_service(web::route().to(handle_proxy))
    })
    .bind(&listen_addr)
    .map_err(|err| ApiError::from(crate::error::ApiErrorKind::Internal(format!("bind {listen_addr} failed: {err}"))))?
    .run();

    Ok((
        http_server,
        Handles {
            sweeper: sweeper_handles,
            dispatcher_shutdown,
            dispatcher_task,
            cache_stats_shutdown,
            cache_stats_task,
            cache_stats_drain_deadline: Duration::from_millis(
                settings.cache_stats.shutdown_drain_deadline_millis,
            ),
            events,
        },
    ))
}

/// Dev convenience: without a real management API wired up there is otherwise no way to
/// mint a project to test against, so `cargo run` without any setup has something to
/// proxy with.
fn seed_dev_project(store: &Arc<MockStore>) {
    store.insert_project(Project {
        id: "dev".to_owned(),
        name: "dev".to_owned(),
        upstream_api_key: UpstreamApiKey::new("sk-dev-upstream"),
        is_active: true,
        deactivated_at: None,
        created_at: 0,
        updated_at: 0,
    });
}
