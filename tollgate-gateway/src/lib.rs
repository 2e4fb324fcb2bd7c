//! Token-gated reverse proxy data plane: allow-list, token extraction and
//! authorisation, shared HTTP cache lookup/storage, streaming capture, upstream
//! forwarding, and event emission (C10/C11/C12/C13), wired together with the ambient
//! logging/config/metrics/error stack from the rest of this workspace.

pub mod allowlist;
pub mod error;
pub mod events;
pub mod handlers;
pub mod logging;
pub mod observability;
pub mod pipeline;
pub mod server;
pub mod state;
pub mod stream_capture;
pub mod sweeper;
pub mod upstream;

pub use error::{ApiError, ApiErrorKind};
pub use events::Event;
pub use state::AppState;

#[cfg(test)]
mod integration_tests {
    use actix_web::{test, web, App};
    use std::sync::Arc;

    use tollgate_cache_stats::aggregator;
    use tollgate_event_bus::EventBus;
    use tollgate_http_cache::{HttpCacheBackend, InMemoryCache};
    use tollgate_rate_limiter::LocalRateLimiter;
    use tollgate_settings::Settings;
    use tollgate_token_common::{GenerateOptions, Project, UpstreamApiKey};
    use tollgate_token_manager::{TokenAuthority, TokenManager};
    use tollgate_token_store::mock::MockStore;
    use tollgate_token_store::{ProjectStore, TokenStore};

    use crate::events::Event;
    use crate::pipeline::handle_proxy;
    use crate::state::AppState;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    async fn test_state(settings: Settings) -> (web::Data<AppState>, Arc<MockStore>, String) {
        let store = Arc::new(MockStore::new());
        store.insert_project(Project {
            id: "p1".to_owned(),
            name: "p1".to_owned(),
            upstream_api_key: UpstreamApiKey::new("sk-test"),
            is_active: true,
            deactivated_at: None,
            created_at: 0,
            updated_at: 0,
        });

        let token_manager = TokenManager::new(
            store.clone(),
            settings.token_cache.capacity,
            settings.token_cache.ttl_secs as i64,
            LocalRateLimiter::new(settings.rate_limit.window_secs as i64, settings.rate_limit.max),
            test_logger(),
        );
        let generated = token_manager
            .generate("p1", GenerateOptions::default())
            .await
            .unwrap();
        let tokens: Arc<dyn TokenAuthority> = Arc::new(token_manager);
        let projects: Arc<dyn ProjectStore> = store.clone() as Arc<dyn ProjectStore>;
        let http_cache: Arc<dyn HttpCacheBackend> = Arc::new(InMemoryCache::new());

        let (cache_stats_handle, _aggregator) = aggregator(
            16,
            100,
            std::time::Duration::from_secs(3600),
            store.clone() as Arc<dyn TokenStore>,
            test_logger(),
        );

        let events: Arc<EventBus<Event>> = Arc::new(EventBus::new(16));

        let state = web::Data::new(AppState {
            settings,
            tokens,
            projects,
            http_cache,
            cache_stats: cache_stats_handle,
            events,
            upstream: reqwest::Client::new(),
            metrics: tollgate_common::Metrics::noop(),
            logger: test_logger(),
        });

        (state, store, generated.token.id)
    }

    #[actix_web::test]
    async fn unknown_endpoint_is_404_with_no_upstream_call() {
        let settings = Settings::test_settings();
        let (state, _store, token) = test_state(settings).await;

        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .default_service(web::route().to(handle_proxy)),
        )
        .await;

        let req = test::TestRequest::get()
            .uri("/unknown")
            .insert_header(("authorization", format!("Bearer {token}")))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn missing_token_on_an_allowed_path_is_rejected_before_any_cache_or_store_work() {
        let settings = Settings::test_settings();
        let (state, _store, _token) = test_state(settings).await;

        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .default_service(web::route().to(handle_proxy)),
        )
        .await;

        let req = test::TestRequest::get().uri("/v1/models").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::UNAUTHORIZED);
    }

    #[actix_web::test]
    async fn method_not_allowed_on_a_known_path() {
        let mut settings = Settings::test_settings();
        settings.allowed_methods = vec!["GET".to_owned()];
        let (state, _store, token) = test_state(settings).await;

        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .default_service(web::route().to(handle_proxy)),
        )
        .await;

        let req = test::TestRequest::delete()
            .uri("/v1/models")
            .insert_header(("authorization", format!("Bearer {token}")))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::METHOD_NOT_ALLOWED);
    }

    #[actix_web::test]
    async fn oversized_body_is_413_before_any_upstream_call() {
        let mut settings = Settings::test_settings();
        settings.max_request_size = 8;
        let (state, _store, token) = test_state(settings).await;

        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .default_service(web::route().to(handle_proxy)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/v1/models")
            .insert_header(("authorization", format!("Bearer {token}")))
            .set_payload(vec![0u8; 9])
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::PAYLOAD_TOO_LARGE);
    }
}
