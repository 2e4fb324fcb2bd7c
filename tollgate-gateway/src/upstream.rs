//! Upstream forwarding (§4.8 step 5). A single pooled `reqwest::Client`, configured from
//! `upstream.*` settings (`response_header_timeout`, `idle_connection_timeout`,
//! `max_idle_conns`/`max_idle_conns_per_host`), the same "one shared pooled client"
//! discipline `syncserver` applies to its db connection pool -- one construction at
//! startup, cloned (cheaply -- `reqwest::Client` is an `Arc` inside) into every worker.

use std::time::Duration;

use actix_web::http::header::{HeaderName, HeaderValue};
use reqwest::Method;
use tollgate_settings::UpstreamSettings;
use tollgate_token_common::UpstreamApiKey;

use crate::error::{ApiError, ApiErrorKind};

/// Hop-by-hop headers (RFC 7230 §6.1) plus `Host`, stripped both directions: never
/// forwarded upstream, never copied into a cached/forwarded response.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name.to_ascii_lowercase().as_str())
}

pub fn build_client(settings: &UpstreamSettings) -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(settings.max_idle_conns_per_host)
        .pool_idle_timeout(Duration::from_secs(settings.idle_connection_timeout_secs))
        .connect_timeout(Duration::from_secs(settings.response_header_timeout_secs))
        .build()
        .expect("upstream reqwest client failed to build")
}

/// Builds the outbound request: rewrites `Authorization` to the project's upstream API
/// key, drops hop-by-hop headers, and propagates the request id (§12 "`X-Request-ID`
/// propagation inbound"). Does not touch the body (§1 Non-goals: no body transformation
/// beyond header substitution).
pub fn build_request(
    client: &reqwest::Client,
    base_url: &str,
    method: &actix_web::http::Method,
    path_and_query: &str,
    inbound_headers: &actix_web::http::header::HeaderMap,
    request_id: &str,
    upstream_api_key: &UpstreamApiKey,
    body: reqwest::Body,
) -> Result<reqwest::RequestBuilder, ApiError> {
    let url = format!("{}{}", base_url.trim_end_matches('/'), path_and_query);
    let method = Method::from_bytes(method.as_str().as_bytes())
        .map_err(|_| ApiError::from(ApiErrorKind::Internal("invalid method".to_owned())))?;

    let mut builder = client.request(method, url).body(body);

    for (name, value) in inbound_headers.iter() {
        if is_hop_by_hop(name.as_str()) || name.as_str().eq_ignore_ascii_case("authorization") {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_bytes());
    }

    builder = builder
        .header("authorization", format!("Bearer {}", upstream_api_key.expose()))
        .header("x-request-id", request_id);

    Ok(builder)
}

/// Copies non-hop-by-hop response headers from an upstream `reqwest::Response` onto an
/// outbound `actix_web::HttpResponseBuilder`.
pub fn copy_response_headers(
    upstream_headers: &reqwest::header::HeaderMap,
    out: &mut actix_web::HttpResponseBuilder,
) {
    for (name, value) in upstream_headers.iter() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            out.insert_header((name, value));
        }
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> ApiErrorKind {
    if err.is_timeout() {
        ApiErrorKind::UpstreamTimeout
    } else if err.is_connect() {
        ApiErrorKind::UpstreamConnect
    } else {
        ApiErrorKind::Internal(format!("upstream request failed: {err}"))
    }
}
