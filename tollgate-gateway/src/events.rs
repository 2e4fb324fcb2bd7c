//! The observability event record (§3 "Event", §6.3 "Event format"). Constructed by the
//! observability middleware (C11) and handed to the event bus (C8); once published it
//! is owned by the bus and its subscribers -- nothing in the request path holds a
//! reference back to it.

use tollgate_common::{CacheStatus, RequestId};

/// Bounded snapshot of a request/response body kept on an `Event`. Truncated rather
/// than rejected, so a large body never blocks or fails the observability path -- the
/// same "never slow the client path" discipline as the stream capture (C6).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BodySnapshot {
    pub bytes: Vec<u8>,
    pub truncated: bool,
    pub original_len: usize,
}

impl BodySnapshot {
    pub fn capture(body: &[u8], max_len: usize) -> Self {
        if body.len() <= max_len {
            BodySnapshot {
                bytes: body.to_vec(),
                truncated: false,
                original_len: body.len(),
            }
        } else {
            BodySnapshot {
                bytes: body[..max_len].to_vec(),
                truncated: true,
                original_len: body.len(),
            }
        }
    }

    pub fn empty() -> Self {
        BodySnapshot::default()
    }
}

#[derive(Clone, Debug)]
pub struct Event {
    pub timestamp: i64,
    pub request_id: RequestId,
    pub correlation_id: Option<String>,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub duration_ms: u64,
    pub request_body: BodySnapshot,
    pub response_body: BodySnapshot,
    /// Selected response headers only (§6.3) -- never the full header set, so a
    /// forwarded `Set-Cookie` or similar never ends up duplicated into the
    /// observability pipeline.
    pub response_headers: Vec<(String, String)>,
    pub cache_status: CacheStatus,
    pub token_id: Option<String>,
    pub project_id: Option<String>,
}

/// Headers worth keeping on the Event; deliberately small and fixed rather than "all
/// headers the upstream sent" (§6.3's "selected").
pub const OBSERVED_RESPONSE_HEADERS: &[&str] =
    &["content-type", "content-length", "cache-control", "vary"];

#[derive(Clone)]
pub struct EventBuilder {
    pub request_id: RequestId,
    pub correlation_id: Option<String>,
    pub method: String,
    pub path: String,
    pub started_at: i64,
    pub request_body: BodySnapshot,
    pub token_id: Option<String>,
    pub project_id: Option<String>,
}

impl EventBuilder {
    pub fn new(request_id: RequestId, method: String, path: String, started_at: i64) -> Self {
        EventBuilder {
            request_id,
            correlation_id: None,
            method,
            path,
            started_at,
            request_body: BodySnapshot::empty(),
            token_id: None,
            project_id: None,
        }
    }

    pub fn finish(
        self,
        now: i64,
        status: u16,
        response_body: BodySnapshot,
        response_headers: Vec<(String, String)>,
        cache_status: CacheStatus,
    ) -> Event {
        Event {
            timestamp: self.started_at,
            request_id: self.request_id,
            correlation_id: self.correlation_id,
            method: self.method,
            path: self.path,
            status,
            duration_ms: now.saturating_sub(self.started_at).max(0) as u64,
            request_body: self.request_body,
            response_body,
            response_headers,
            cache_status,
            token_id: self.token_id,
            project_id: self.project_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_snapshot_truncates_past_the_configured_max() {
        let snapshot = BodySnapshot::capture(b"hello world", 5);
        assert!(snapshot.truncated);
        assert_eq!(snapshot.bytes, b"hello");
        assert_eq!(snapshot.original_len, 11);
    }

    #[test]
    fn body_snapshot_keeps_short_bodies_whole() {
        let snapshot = BodySnapshot::capture(b"hi", 5);
        assert!(!snapshot.truncated);
        assert_eq!(snapshot.bytes, b"hi");
    }

    #[test]
    fn event_builder_computes_duration_from_start_to_finish() {
        let builder = EventBuilder::new(RequestId::generate(), "GET".to_owned(), "/v1/models".to_owned(), 1_000);
        let event = builder.finish(
            1_250,
            200,
            BodySnapshot::empty(),
            vec![],
            CacheStatus::Miss,
        );
        assert_eq!(event.duration_ms, 250);
    }
}
