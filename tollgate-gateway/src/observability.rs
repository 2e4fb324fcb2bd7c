//! Observability middleware (C11): finalizes an `Event` once a response is decided and
//! publishes it to the bus (§4.8 step 7, §6.3). Construction is split from publication
//! so the pipeline can build most of an `Event` up front (via `EventBuilder`) and fill
//! in the rest once the response is known, without holding a half-built struct across
//! an `await` boundary that outlives the handler.

use std::sync::Arc;

use tollgate_common::CacheStatus;
use tollgate_event_bus::EventBus;

use crate::events::{BodySnapshot, Event, EventBuilder, OBSERVED_RESPONSE_HEADERS};

/// Selects the headers worth retaining on the Event from a full response header set
/// (§6.3 "selected"), lower-casing names for stable comparison.
pub fn select_response_headers(all_headers: &[(String, String)]) -> Vec<(String, String)> {
    all_headers
        .iter()
        .filter(|(name, _)| {
            OBSERVED_RESPONSE_HEADERS
                .iter()
                .any(|observed| observed.eq_ignore_ascii_case(name))
        })
        .cloned()
        .collect()
}

/// Publishes the finished Event. Cache hits may bypass the bus entirely per
/// `event_bus.publish_cache_hits` (§4.8 step 3, §9 open question 2) -- the call is
/// never blocking either way, so skipping it is purely a volume-reduction knob, not a
/// latency one.
pub fn emit(
    bus: &Arc<EventBus<Event>>,
    builder: EventBuilder,
    now: i64,
    status: u16,
    response_body: BodySnapshot,
    response_headers: Vec<(String, String)>,
    cache_status: CacheStatus,
    publish_cache_hits: bool,
) {
    if cache_status == CacheStatus::Hit && !publish_cache_hits {
        return;
    }
    let event = builder.finish(now, status, response_body, response_headers, cache_status);
    bus.publish(event);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selects_only_the_configured_headers() {
        let all = vec![
            ("content-type".to_owned(), "application/json".to_owned()),
            ("set-cookie".to_owned(), "session=abc".to_owned()),
            ("Content-Length".to_owned(), "42".to_owned()),
        ];
        let selected = select_response_headers(&all);
        assert_eq!(selected.len(), 2);
        assert!(selected.iter().any(|(k, _)| k.eq_ignore_ascii_case("content-type")));
        assert!(selected.iter().any(|(k, _)| k.eq_ignore_ascii_case("content-length")));
        assert!(!selected.iter().any(|(k, _)| k.eq_ignore_ascii_case("set-cookie")));
    }
}
