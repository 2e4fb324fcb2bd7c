//! The request pipeline (C10, §4.8) -- the heart of the proxy. One function per step so
//! the control flow in `handle_proxy` reads as a numbered sequence, the same way
//! `syncserver::web::handlers` keeps one handler per resource rather than one giant
//! dispatcher.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use actix_web::{web, HttpRequest, HttpResponse};
use futures_util::StreamExt;
use slog::{error, info};
use tollgate_common::{CacheStatus, RequestId, CACHE_STATUS, X_PROXY_CACHE, X_PROXY_CACHE_KEY, X_REQUEST_ID};
use tollgate_http_cache::{
    compute_canonical_key, compute_preliminary_key, derive_ttl_secs, hash_body,
    is_request_cache_eligible, is_response_cache_eligible, CacheControl, CacheEntry,
};
use tollgate_token_common::UpstreamApiKey;

use crate::allowlist::{check_allowed, extract_token};
use crate::error::{ApiError, ApiErrorKind};
use crate::events::{BodySnapshot, EventBuilder};
use crate::observability;
use crate::state::AppState;
use crate::stream_capture::{CapturingStream, CaptureOutcome};
use crate::upstream::{build_request, classify_reqwest_error, copy_response_headers};

const MAX_OBSERVED_BODY_BYTES: usize = 8 * 1024;

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs() as i64
}

fn header_str<'a>(req: &'a HttpRequest, name: &str) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

fn parsed_query(req: &HttpRequest) -> Vec<(String, String)> {
    url::form_urlencoded::parse(req.query_string().as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

/// Reads the request body ourselves rather than via the `web::Bytes` extractor: actix's
/// own `PayloadConfig`-limited extraction reports an overrun as a generic `PayloadError`,
/// which does not surface as our `413` (§4.8 step 8, §7). Collecting manually lets an
/// overrun map straight to `ApiErrorKind::PayloadTooLarge`.
async fn collect_request_body(
    mut payload: web::Payload,
    max_bytes: usize,
) -> Result<web::Bytes, ApiError> {
    let mut buf = web::BytesMut::new();
    while let Some(chunk) = payload.next().await {
        let chunk = chunk.map_err(|err| {
            ApiError::from(ApiErrorKind::Internal(format!("reading request body failed: {err}")))
        })?;
        if buf.len() + chunk.len() > max_bytes {
            return Err(ApiError::from(ApiErrorKind::PayloadTooLarge));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

pub async fn handle_proxy(
    req: HttpRequest,
    payload: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let logger = state.logger.clone();
    let path = req.path().to_owned();
    let method = req.method().as_str().to_owned();

    let body = collect_request_body(payload, state.settings.max_request_size as usize).await?;

    // Step 1: allow-list.
    check_allowed(
        &path,
        &method,
        &state.settings.allowed_endpoints,
        &state.settings.allowed_methods,
    )?;

    // Step 2: token extraction.
    let query = parsed_query(&req);
    let token_id = extract_token(
        header_str(&req, "authorization"),
        header_str(&req, "x-api-key"),
        &query,
    )?;

    let request_id = header_str(&req, X_REQUEST_ID)
        .and_then(RequestId::parse)
        .unwrap_or_else(RequestId::generate);

    let started_at = now_unix();
    let mut builder = EventBuilder::new(request_id, method.clone(), path.clone(), started_at);
    builder.token_id = Some(token_id.clone());
    if !body.is_empty() {
        builder.request_body = BodySnapshot::capture(&body, MAX_OBSERVED_BODY_BYTES);
    }

    let request_cache_control = CacheControl::parse(header_str(&req, "cache-control"));
    let body_hash = if !body.is_empty() && request_cache_control.explicitly_opts_in() {
        Some(hash_body(&body))
    } else {
        None
    };
    let header_lookup = |name: &str| header_str(&req, name).map(str::to_owned);
    let preliminary_key =
        compute_preliminary_key(&method, &path, &query, &header_lookup, body_hash.clone());

    // Step 3: pre-authorisation cache lookup.
    if state.settings.http_cache.enabled {
        if let Some(entry) = state.http_cache.get(&preliminary_key, now_unix()).await {
            return handle_cache_hit(&state, &logger, builder, &token_id, &preliminary_key, entry).await;
        }
    }

    // Step 4: full authorisation (cache miss).
    let validation = state.tokens.validate_and_count(&token_id).await?;
    builder.project_id = Some(validation.project_id.clone());

    match state.projects.get_project_active(&validation.project_id).await {
        Ok(Some(true)) => {}
        Ok(Some(false)) => return Err(ApiErrorKind::Token(tollgate_token_common::TokenError::ProjectInactive).into()),
        Ok(None) => return Err(ApiErrorKind::Token(tollgate_token_common::TokenError::ProjectNotFound).into()),
        Err(err) => return Err(ApiErrorKind::Token(err).into()),
    }
    let upstream_api_key = match state
        .projects
        .get_api_key_for_project(&validation.project_id)
        .await
    {
        Ok(Some(key)) => UpstreamApiKey::new(key),
        Ok(None) => return Err(ApiErrorKind::Token(tollgate_token_common::TokenError::ProjectNotFound).into()),
        Err(err) => return Err(ApiErrorKind::Token(err).into()),
    };

    // Step 5: upstream call.
    let request_builder = build_request(
        &state.upstream,
        &state.settings.upstream.base_url,
        req.method(),
        &format!("{}{}", path, raw_query_suffix(&req)),
        req.headers(),
        &request_id.to_string(),
        &upstream_api_key,
        reqwest::Body::from(body.to_vec()),
    )?;

    let response = request_builder.send().await.map_err(|err| {
        error!(logger, "upstream call failed"; "error" => %err, "request_id" => %request_id);
        ApiError::from(classify_reqwest_error(&err))
    })?;

    let status = response.status().as_u16();
    let upstream_headers = response.headers().clone();
    let authenticated = header_str(&req, "authorization").is_some();

    let is_streaming = upstream_headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.starts_with("text/event-stream"))
        .unwrap_or(false)
        || upstream_headers.get("content-length").is_none();

    if is_streaming {
        handle_streaming_response(
            &state,
            &logger,
            builder,
            &method,
            &path,
            &query,
            &header_lookup,
            body_hash,
            status,
            upstream_headers,
            response,
            authenticated,
            request_id,
        )
        .await
    } else {
        handle_buffered_response(
            &state,
            &logger,
            builder,
            &method,
            &path,
            &query,
            &header_lookup,
            body_hash,
            status,
            upstream_headers,
            response,
            authenticated,
            request_id,
        )
        .await
    }
}

fn raw_query_suffix(req: &HttpRequest) -> String {
    if req.query_string().is_empty() {
        String::new()
    } else {
        format!("?{}", req.query_string())
    }
}

async fn handle_cache_hit(
    state: &web::Data<AppState>,
    logger: &slog::Logger,
    builder: EventBuilder,
    token_id: &str,
    key: &str,
    entry: CacheEntry,
) -> Result<HttpResponse, ApiError> {
    // `Validate`, never `ValidateAndCount` -- a cache hit never forwards upstream, so it
    // must never count against `request_count` (§4.8 step 3, P5).
    let _validation = state.tokens.validate(token_id).await?;

    state.cache_stats.record(token_id.to_owned());

    let mut response = HttpResponse::build(
        actix_web::http::StatusCode::from_u16(entry.status).unwrap_or(actix_web::http::StatusCode::OK),
    );
    copy_response_headers(
        &entry
            .headers
            .iter()
            .fold(reqwest::header::HeaderMap::new(), |mut map, (k, v)| {
                if let (Ok(name), Ok(value)) = (
                    reqwest::header::HeaderName::from_bytes(k.as_bytes()),
                    reqwest::header::HeaderValue::from_bytes(v.as_bytes()),
                ) {
                    map.insert(name, value);
                }
                map
            }),
        &mut response,
    );
    response.insert_header((CACHE_STATUS, format!("{}; hit", state.settings.proxy_name)));
    response.insert_header((X_PROXY_CACHE, "hit"));
    response.insert_header((X_PROXY_CACHE_KEY, key.to_owned()));
    response.insert_header((X_REQUEST_ID, builder.request_id.to_string()));

    info!(logger, "cache hit"; "token_id" => token_id, "key" => key);

    observability::emit(
        &state.events,
        builder,
        now_unix(),
        entry.status,
        BodySnapshot::capture(&entry.body, MAX_OBSERVED_BODY_BYTES),
        entry.headers.clone(),
        CacheStatus::Hit,
        state.settings.event_bus.publish_cache_hits,
    );

    Ok(response.body(entry.body))
}

#[allow(clippy::too_many_arguments)]
async fn handle_buffered_response(
    state: &web::Data<AppState>,
    logger: &slog::Logger,
    builder: EventBuilder,
    method: &str,
    path: &str,
    query: &[(String, String)],
    header_lookup: &dyn Fn(&str) -> Option<String>,
    body_hash: Option<String>,
    status: u16,
    upstream_headers: reqwest::header::HeaderMap,
    response: reqwest::Response,
    authenticated: bool,
    request_id: RequestId,
) -> Result<HttpResponse, ApiError> {
    let body = response.bytes().await.map_err(|err| {
        ApiError::from(ApiErrorKind::Internal(format!("reading upstream body failed: {err}")))
    })?;

    let cache_control = CacheControl::parse(
        upstream_headers
            .get("cache-control")
            .and_then(|v| v.to_str().ok()),
    );
    let request_eligible = is_request_cache_eligible(method, &CacheControl::parse(header_lookup("cache-control").as_deref()));
    let response_eligible = is_response_cache_eligible(
        status,
        &cache_control,
        body.len(),
        state.settings.http_cache.max_object_bytes as usize,
        authenticated,
    );

    let cache_status = if !state.settings.http_cache.enabled {
        CacheStatus::Bypass
    } else if request_eligible && response_eligible {
        store_in_cache(state, method, path, query, header_lookup, body_hash, status, &upstream_headers, &body).await
    } else {
        CacheStatus::Miss
    };

    let mut http_response = HttpResponse::build(
        actix_web::http::StatusCode::from_u16(status).unwrap_or(actix_web::http::StatusCode::OK),
    );
    copy_response_headers(&upstream_headers, &mut http_response);
    http_response.insert_header((CACHE_STATUS, format!("{}; {}", state.settings.proxy_name, cache_status)));
    http_response.insert_header((X_PROXY_CACHE, cache_status.as_str()));
    http_response.insert_header((X_REQUEST_ID, request_id.to_string()));

    let selected_headers = observability::select_response_headers(
        &upstream_headers
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_owned())))
            .collect::<Vec<_>>(),
    );

    info!(logger, "request forwarded"; "status" => status, "cache_status" => %cache_status, "request_id" => %request_id);

    observability::emit(
        &state.events,
        builder,
        now_unix(),
        status,
        BodySnapshot::capture(&body, MAX_OBSERVED_BODY_BYTES),
        selected_headers,
        cache_status,
        state.settings.event_bus.publish_cache_hits,
    );

    Ok(http_response.body(body))
}

#[allow(clippy::too_many_arguments)]
async fn store_in_cache(
    state: &web::Data<AppState>,
    method: &str,
    path: &str,
    query: &[(String, String)],
    header_lookup: &dyn Fn(&str) -> Option<String>,
    body_hash: Option<String>,
    status: u16,
    upstream_headers: &reqwest::header::HeaderMap,
    body: &[u8],
) -> CacheStatus {
    let vary_names: Option<Vec<&str>> = upstream_headers
        .get("vary")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').map(str::trim).collect());
    let vary_slice: Option<&[&str]> = vary_names.as_deref();

    let canonical_key = compute_canonical_key(method, path, query, vary_slice, header_lookup, body_hash);

    let cache_control = CacheControl::parse(upstream_headers.get("cache-control").and_then(|v| v.to_str().ok()));
    let ttl = derive_ttl_secs(
        &cache_control,
        state.settings.http_cache.default_ttl_secs as i64,
        state.settings.http_cache.max_ttl_secs as i64,
    );

    let headers: Vec<(String, String)> = upstream_headers
        .iter()
        .filter(|(name, _)| !crate::upstream::is_hop_by_hop(name.as_str()))
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_owned())))
        .collect();

    state
        .http_cache
        .set(
            canonical_key,
            CacheEntry {
                status,
                headers,
                body: bytes::Bytes::copy_from_slice(body),
                stored_at: now_unix(),
                ttl_secs: ttl,
            },
        )
        .await;

    CacheStatus::Store
}

#[allow(clippy::too_many_arguments)]
async fn handle_streaming_response(
    state: &web::Data<AppState>,
    logger: &slog::Logger,
    builder: EventBuilder,
    method: &str,
    path: &str,
    query: &[(String, String)],
    header_lookup: &dyn Fn(&str) -> Option<String>,
    body_hash: Option<String>,
    status: u16,
    upstream_headers: reqwest::header::HeaderMap,
    response: reqwest::Response,
    authenticated: bool,
    request_id: RequestId,
) -> Result<HttpResponse, ApiError> {
    let max_object_bytes = state.settings.http_cache.max_object_bytes as usize;
    let byte_stream = response.bytes_stream();
    let (capturing, outcome_rx) = CapturingStream::new(byte_stream, max_object_bytes);

    let mut http_response = HttpResponse::build(
        actix_web::http::StatusCode::from_u16(status).unwrap_or(actix_web::http::StatusCode::OK),
    );
    copy_response_headers(&upstream_headers, &mut http_response);
    http_response.insert_header((CACHE_STATUS, format!("{}; miss", state.settings.proxy_name)));
    http_response.insert_header((X_PROXY_CACHE, "miss"));
    http_response.insert_header((X_REQUEST_ID, request_id.to_string()));

    info!(logger, "streaming response forwarded"; "status" => status, "request_id" => %request_id);

    // The capture only resolves after the client has read the whole body, well after
    // this handler returns the streamed response -- so the cache store and the Event
    // emission for a streaming response both happen off a detached task (§4.4, §4.8
    // step 6 "Streaming").
    let state = state.clone();
    let method = method.to_owned();
    let path = path.to_owned();
    let query = query.to_owned();
    let header_values: Vec<(String, Option<String>)> = ["cache-control", "accept", "accept-encoding", "accept-language"]
        .iter()
        .map(|name| (name.to_string(), header_lookup(name)))
        .collect();

    tokio::spawn(async move {
        let lookup = move |name: &str| {
            header_values
                .iter()
                .find(|(n, _)| n == name)
                .and_then(|(_, v)| v.clone())
        };

        let cache_control = CacheControl::parse(upstream_headers.get("cache-control").and_then(|v| v.to_str().ok()));
        let request_cache_control = CacheControl::parse(lookup("cache-control").as_deref());
        let request_eligible = is_request_cache_eligible(&method, &request_cache_control);

        let outcome = match outcome_rx.await {
            Ok(outcome) => outcome,
            Err(_) => return,
        };

        let (cache_status, captured_body) = match outcome {
            CaptureOutcome::Complete(bytes) => {
                let response_eligible = is_response_cache_eligible(
                    status,
                    &cache_control,
                    bytes.len(),
                    max_object_bytes,
                    authenticated,
                );
                if state.settings.http_cache.enabled && request_eligible && response_eligible {
                    let vary_names: Option<Vec<&str>> = upstream_headers
                        .get("vary")
                        .and_then(|v| v.to_str().ok())
                        .map(|v| v.split(',').map(str::trim).collect());
                    let canonical_key =
                        compute_canonical_key(&method, &path, &query, vary_names.as_deref(), &lookup, body_hash.clone());
                    let ttl = derive_ttl_secs(
                        &cache_control,
                        state.settings.http_cache.default_ttl_secs as i64,
                        state.settings.http_cache.max_ttl_secs as i64,
                    );
                    let headers: Vec<(String, String)> = upstream_headers
                        .iter()
                        .filter(|(name, _)| !crate::upstream::is_hop_by_hop(name.as_str()))
                        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_owned())))
                        .collect();
                    state
                        .http_cache
                        .set(
                            canonical_key,
                            CacheEntry {
                                status,
                                headers,
                                body: bytes.clone(),
                                stored_at: now_unix(),
                                ttl_secs: ttl,
                            },
                        )
                        .await;
                    (CacheStatus::Store, bytes)
                } else if !state.settings.http_cache.enabled {
                    (CacheStatus::Bypass, bytes)
                } else {
                    (CacheStatus::Miss, bytes)
                }
            }
            CaptureOutcome::Overflowed | CaptureOutcome::UpstreamError => {
                (CacheStatus::Miss, bytes::Bytes::new())
            }
        };

        observability::emit(
            &state.events,
            builder,
            now_unix(),
            status,
            BodySnapshot::capture(&captured_body, MAX_OBSERVED_BODY_BYTES),
            vec![],
            cache_status,
            state.settings.event_bus.publish_cache_hits,
        );
    });

    Ok(http_response.streaming(capturing))
}

/// Not currently exercised (actix-web body streaming requires `'static` futures); kept
/// available for a future `request_timeout`-aware wrapper around `handle_proxy`.
#[allow(dead_code)]
pub fn request_timeout(settings: &tollgate_settings::Settings) -> Duration {
    Duration::from_secs(settings.request_timeout_secs)
}
