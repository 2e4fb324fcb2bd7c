//! Configuration loading, mirroring `syncserver-settings`'s
//! `Settings::with_env_and_config_file`: merge an optional TOML file, then environment
//! overrides with a `GATEWAY_` prefix and `__` as the nesting separator.
#[macro_use]
extern crate slog_scope;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

static PREFIX: &str = "gateway";

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub listen_addr: String,
    pub port: u16,
    pub request_timeout_secs: u64,
    pub max_request_size: u64,
    pub human_logs: bool,
    pub statsd_host: Option<String>,
    pub statsd_port: u16,

    pub proxy_name: String,
    pub allowed_endpoints: Vec<String>,
    pub allowed_methods: Vec<String>,

    pub upstream: UpstreamSettings,
    pub http_cache: HttpCacheSettings,
    pub token_cache: TokenCacheSettings,
    pub rate_limit: RateLimitSettings,
    pub event_bus: EventBusSettings,
    pub dispatcher: DispatcherSettings,
    pub cache_stats: CacheStatsSettings,
    pub sweeper: SweeperSettings,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct UpstreamSettings {
    pub base_url: String,
    pub flush_interval_millis: u64,
    pub response_header_timeout_secs: u64,
    pub idle_connection_timeout_secs: u64,
    pub max_idle_conns: usize,
    pub max_idle_conns_per_host: usize,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum CacheBackendKind {
    InMemory,
    Shared,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct HttpCacheSettings {
    pub enabled: bool,
    pub backend: CacheBackendKind,
    pub default_ttl_secs: u64,
    pub max_ttl_secs: u64,
    pub max_object_bytes: u64,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct TokenCacheSettings {
    pub capacity: usize,
    pub ttl_secs: u64,
    pub cleanup_interval_secs: u64,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimitSettings {
    pub window_secs: u64,
    pub max: u64,
    pub fallback_to_local_on_backend_error: bool,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct EventBusSettings {
    pub backend: CacheBackendKind,
    pub buffer_size: usize,
    pub subscriber_buffer_size: usize,
    pub publish_cache_hits: bool,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatcherSettings {
    pub batch_size: usize,
    pub flush_interval_millis: u64,
    pub max_attempts: u32,
    pub base_backoff_millis: u64,
    pub max_backoff_millis: u64,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheStatsSettings {
    pub buffer_size: usize,
    pub flush_interval_millis: u64,
    pub batch_size: usize,
    pub shutdown_drain_deadline_millis: u64,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct SweeperSettings {
    pub cache_sweep_interval_secs: u64,
}

impl Settings {
    /// Load settings from an optional config file, then environment overrides.
    /// Mirrors `syncserver_settings::Settings::with_env_and_config_file`.
    pub fn with_env_and_config_file(filename: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = filename {
            builder = builder.add_source(File::with_name(path));
        }
        builder = builder.add_source(
            Environment::with_prefix(&PREFIX.to_uppercase()).separator("__"),
        );

        match builder.build().and_then(|c| c.try_deserialize::<Self>()) {
            Ok(settings) => Ok(settings),
            Err(ConfigError::Message(v)) => {
                error!("configuration error: {}", &v);
                Err(ConfigError::Message(v))
            }
            Err(e) => {
                error!("configuration error: {:?}", &e);
                Err(e)
            }
        }
    }

    /// Deterministic, small-capacity settings for tests: short TTLs, tiny caches.
    pub fn test_settings() -> Self {
        let mut settings = Self::default();
        settings.port = 0;
        settings.token_cache.capacity = 16;
        settings.token_cache.ttl_secs = 1;
        settings.http_cache.max_object_bytes = 1 << 16;
        settings.http_cache.default_ttl_secs = 1;
        settings.dispatcher.flush_interval_millis = 10;
        settings.cache_stats.flush_interval_millis = 10;
        settings
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            listen_addr: "127.0.0.1".to_owned(),
            port: 8080,
            request_timeout_secs: 30,
            max_request_size: 2 * 1024 * 1024,
            human_logs: false,
            statsd_host: None,
            statsd_port: 8125,
            proxy_name: "tollgate".to_owned(),
            allowed_endpoints: vec!["/v1".to_owned()],
            allowed_methods: ["GET", "POST", "DELETE"]
                .into_iter()
                .map(String::from)
                .collect(),
            upstream: UpstreamSettings::default(),
            http_cache: HttpCacheSettings::default(),
            token_cache: TokenCacheSettings::default(),
            rate_limit: RateLimitSettings::default(),
            event_bus: EventBusSettings::default(),
            dispatcher: DispatcherSettings::default(),
            cache_stats: CacheStatsSettings::default(),
            sweeper: SweeperSettings::default(),
        }
    }
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        UpstreamSettings {
            base_url: "https://api.openai.com".to_owned(),
            flush_interval_millis: 50,
            response_header_timeout_secs: 30,
            idle_connection_timeout_secs: 90,
            max_idle_conns: 100,
            max_idle_conns_per_host: 20,
        }
    }
}

impl Default for CacheBackendKind {
    fn default() -> Self {
        CacheBackendKind::InMemory
    }
}

impl Default for HttpCacheSettings {
    fn default() -> Self {
        HttpCacheSettings {
            enabled: true,
            backend: CacheBackendKind::InMemory,
            default_ttl_secs: 60,
            max_ttl_secs: 3600,
            max_object_bytes: 2 * 1024 * 1024,
        }
    }
}

impl Default for TokenCacheSettings {
    fn default() -> Self {
        TokenCacheSettings {
            capacity: 10_000,
            ttl_secs: 60,
            cleanup_interval_secs: 300,
        }
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        RateLimitSettings {
            window_secs: 60,
            max: 600,
            fallback_to_local_on_backend_error: true,
        }
    }
}

impl Default for EventBusSettings {
    fn default() -> Self {
        EventBusSettings {
            backend: CacheBackendKind::InMemory,
            buffer_size: 4096,
            subscriber_buffer_size: 1024,
            publish_cache_hits: false,
        }
    }
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        DispatcherSettings {
            batch_size: 100,
            flush_interval_millis: 1000,
            max_attempts: 5,
            base_backoff_millis: 100,
            max_backoff_millis: 5000,
        }
    }
}

impl Default for CacheStatsSettings {
    fn default() -> Self {
        CacheStatsSettings {
            buffer_size: 4096,
            flush_interval_millis: 5000,
            batch_size: 200,
            shutdown_drain_deadline_millis: 2000,
        }
    }
}

impl Default for SweeperSettings {
    fn default() -> Self {
        SweeperSettings {
            cache_sweep_interval_secs: 60,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_environment_variable_prefix() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("GATEWAY_RATE_LIMIT__MAX", "42");
        let settings = Settings::with_env_and_config_file(None).unwrap();
        assert_eq!(settings.rate_limit.max, 42);
        env::remove_var("GATEWAY_RATE_LIMIT__MAX");

        env::set_var("GATEWAY__RATE_LIMIT__MAX", "99");
        let settings = Settings::with_env_and_config_file(None).unwrap();
        assert_ne!(settings.rate_limit.max, 99);
        env::remove_var("GATEWAY__RATE_LIMIT__MAX");
    }

    #[test]
    fn test_defaults_are_sane() {
        let settings = Settings::default();
        assert!(settings.http_cache.max_ttl_secs >= settings.http_cache.default_ttl_secs);
        assert!(!settings.allowed_endpoints.is_empty());
    }
}
