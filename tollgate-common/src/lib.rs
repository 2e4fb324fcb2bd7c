#[macro_use]
extern crate slog_scope;

mod metrics;

pub use metrics::{metrics_from_opts, MetricError, Metrics};

/// Response headers always set on a proxied request. Keep lower case; actix-web
/// normalizes header names but this reduces the chance of a typo slipping through.
pub static X_REQUEST_ID: &str = "x-request-id";
pub static X_PROXY_CACHE: &str = "x-proxy-cache";
pub static X_PROXY_CACHE_KEY: &str = "x-proxy-cache-key";
pub static CACHE_STATUS: &str = "cache-status";

/// The cache outcome tag attached to every request, reported in headers and Events.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    Hit,
    Miss,
    Bypass,
    Store,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "hit",
            CacheStatus::Miss => "miss",
            CacheStatus::Bypass => "bypass",
            CacheStatus::Store => "store",
        }
    }
}

impl std::fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Types that implement this trait can represent internal (never client-caused) errors.
/// Mirrors `syncserver-common::InternalError`: a uniform way for low-level components to
/// hand back an opaque 500 without every crate inventing its own constructor.
pub trait InternalError {
    fn internal_error(message: String) -> Self;
}

/// Implemented by every error type that can reach the HTTP edge, so the observability
/// middleware and Sentry-class reporting (left to the excluded ops surface) can decide
/// how loud to be about a given failure without matching on every concrete variant.
pub trait ReportableError {
    fn error_backtrace(&self) -> String;
    fn is_sentry_event(&self) -> bool;
    fn metric_label(&self) -> Option<String>;
}

/// Request identifier, threaded from the observability middleware through the pipeline
/// and into the Event. Reuses a client-supplied `X-Request-ID` when present so traces
/// correlate across a caller's own logging.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
pub struct RequestId(pub uuid::Uuid);

impl RequestId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn parse(raw: &str) -> Option<Self> {
        uuid::Uuid::parse_str(raw).ok().map(Self)
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[macro_export]
macro_rules! from_error {
    ($from:ty, $to:ty, $to_kind:expr) => {
        impl From<$from> for $to {
            fn from(inner: $from) -> $to {
                $to_kind(inner).into()
            }
        }
    };
}
