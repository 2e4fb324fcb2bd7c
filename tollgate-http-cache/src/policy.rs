//! Eligibility and TTL policy (§4.3 "Eligibility" / "TTL derivation"). Kept free of any
//! storage concern so the same rules apply whatever backend ends up holding the entry.

/// Parsed `Cache-Control` directives relevant to this proxy. Unknown directives are
/// ignored; a malformed `max-age`/`s-maxage` value is treated as absent rather than
/// rejecting the whole header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheControl {
    pub public: bool,
    pub private: bool,
    pub no_store: bool,
    pub max_age: Option<u64>,
    pub s_maxage: Option<u64>,
}

impl CacheControl {
    pub fn parse(header_value: Option<&str>) -> Self {
        let mut directives = Self::default();
        let Some(value) = header_value else {
            return directives;
        };

        for token in value.split(',') {
            let token = token.trim();
            let mut parts = token.splitn(2, '=');
            match (parts.next().map(str::trim), parts.next().map(str::trim)) {
                (Some("public"), _) => directives.public = true,
                (Some("private"), _) => directives.private = true,
                (Some("no-store"), _) => directives.no_store = true,
                (Some("max-age"), Some(v)) => directives.max_age = v.parse().ok(),
                (Some("s-maxage"), Some(v)) => directives.s_maxage = v.parse().ok(),
                _ => {}
            }
        }
        directives
    }

    /// Whether this directive set is an explicit opt-in to caching for an otherwise
    /// non-idempotent request or a body-bearing cache key (§4.3 "Request eligibility").
    pub fn explicitly_opts_in(&self) -> bool {
        self.public || self.max_age.is_some() || self.s_maxage.is_some()
    }
}

/// Request-side eligibility: idempotent methods are cacheable unconditionally; any
/// other method needs an explicit `Cache-Control` opt-in (§4.3).
pub fn is_request_cache_eligible(method: &str, cache_control: &CacheControl) -> bool {
    let method = method.to_uppercase();
    matches!(method.as_str(), "GET" | "HEAD") || cache_control.explicitly_opts_in()
}

/// Response-side eligibility (§4.3). `authenticated` is true when the request carried
/// an `Authorization` header -- such responses are only cacheable if the response
/// explicitly declares `public`.
pub fn is_response_cache_eligible(
    status: u16,
    cache_control: &CacheControl,
    body_len: usize,
    max_object_bytes: usize,
    authenticated: bool,
) -> bool {
    if !(200..300).contains(&status) {
        return false;
    }
    if cache_control.no_store || cache_control.private {
        return false;
    }
    if body_len > max_object_bytes {
        return false;
    }
    if authenticated && !cache_control.public {
        return false;
    }
    true
}

/// TTL derivation (§4.3): `s-maxage` beats `max-age` beats the configured default, and
/// the result is never allowed to exceed `max_ttl_secs`.
pub fn derive_ttl_secs(cache_control: &CacheControl, default_ttl_secs: i64, max_ttl_secs: i64) -> i64 {
    let candidate = cache_control
        .s_maxage
        .or(cache_control.max_age)
        .map(|v| v as i64)
        .unwrap_or(default_ttl_secs);
    candidate.clamp(0, max_ttl_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_multiple_directives() {
        let cc = CacheControl::parse(Some("public, max-age=120"));
        assert!(cc.public);
        assert_eq!(cc.max_age, Some(120));
        assert!(!cc.no_store);
    }

    #[test]
    fn malformed_max_age_is_ignored_not_fatal() {
        let cc = CacheControl::parse(Some("max-age=not-a-number"));
        assert_eq!(cc.max_age, None);
    }

    #[test]
    fn get_and_head_are_eligible_without_opt_in() {
        let cc = CacheControl::default();
        assert!(is_request_cache_eligible("GET", &cc));
        assert!(is_request_cache_eligible("head", &cc));
        assert!(!is_request_cache_eligible("POST", &cc));
    }

    #[test]
    fn post_becomes_eligible_with_explicit_opt_in() {
        let cc = CacheControl::parse(Some("max-age=30"));
        assert!(is_request_cache_eligible("POST", &cc));
    }

    #[test]
    fn non_2xx_response_is_never_eligible() {
        let cc = CacheControl::default();
        assert!(!is_response_cache_eligible(404, &cc, 10, 1000, false));
        assert!(!is_response_cache_eligible(500, &cc, 10, 1000, false));
    }

    #[test]
    fn oversized_body_is_not_eligible() {
        let cc = CacheControl::default();
        assert!(!is_response_cache_eligible(200, &cc, 2000, 1000, false));
    }

    #[test]
    fn authenticated_response_requires_explicit_public() {
        let cc_private_default = CacheControl::default();
        assert!(!is_response_cache_eligible(200, &cc_private_default, 10, 1000, true));

        let cc_public = CacheControl::parse(Some("public"));
        assert!(is_response_cache_eligible(200, &cc_public, 10, 1000, true));
    }

    #[test]
    fn no_store_and_private_block_storage() {
        let no_store = CacheControl::parse(Some("no-store"));
        assert!(!is_response_cache_eligible(200, &no_store, 10, 1000, false));

        let private = CacheControl::parse(Some("private"));
        assert!(!is_response_cache_eligible(200, &private, 10, 1000, false));
    }

    #[test]
    fn ttl_prefers_s_maxage_over_max_age_over_default() {
        let both = CacheControl::parse(Some("max-age=10, s-maxage=20"));
        assert_eq!(derive_ttl_secs(&both, 5, 1000), 20);

        let only_max_age = CacheControl::parse(Some("max-age=10"));
        assert_eq!(derive_ttl_secs(&only_max_age, 5, 1000), 10);

        let neither = CacheControl::default();
        assert_eq!(derive_ttl_secs(&neither, 5, 1000), 5);
    }

    #[test]
    fn ttl_is_clamped_to_configured_max() {
        let cc = CacheControl::parse(Some("max-age=99999"));
        assert_eq!(derive_ttl_secs(&cc, 5, 300), 300);
    }
}
