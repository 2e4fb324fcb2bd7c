//! Cache key computation (§4.3 "Cache key" / "Vary handling"). A key is a canonical
//! byte-string: never a hash of the whole request, so purge-by-prefix on path stays
//! possible and a key collision can always be explained by re-deriving it.

use sha2::{Digest, Sha256};

/// Conservative subset used for the *preliminary* key, computed before the response
/// (and its `Vary` header) is known, and as the canonical axis when upstream sends no
/// `Vary` at all.
pub const CONSERVATIVE_VARY_HEADERS: &[&str] = &["accept", "accept-encoding", "accept-language"];

/// Joins fields with a separator that cannot appear in a header name/value or a URL
/// path segment, so distinct inputs can never collide into the same key.
const FIELD_SEP: char = '\u{1f}';

pub struct KeyInputs<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub query: &'a [(String, String)],
    /// Header names contributing to the Vary axis, looked up via `header_value`.
    pub vary_headers: &'a [&'a str],
    pub header_value: &'a dyn Fn(&str) -> Option<String>,
    /// Hex SHA-256 of the raw request body, present only when the request is
    /// body-bearing and the client explicitly opted into caching via `Cache-Control`.
    pub body_hash: Option<String>,
}

pub fn compute_key(inputs: &KeyInputs<'_>) -> String {
    let mut sorted_query: Vec<(String, String)> = inputs.query.to_vec();
    sorted_query.sort();
    let query_part = sorted_query
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");

    let vary_part = inputs
        .vary_headers
        .iter()
        .map(|name| {
            let lower = name.to_lowercase();
            let value = (inputs.header_value)(&lower).unwrap_or_default();
            format!("{lower}={value}")
        })
        .collect::<Vec<_>>()
        .join("&");

    let mut parts = vec![
        inputs.method.to_uppercase(),
        inputs.path.to_owned(),
        query_part,
        vary_part,
    ];
    if let Some(hash) = &inputs.body_hash {
        parts.push(hash.clone());
    }
    parts.join(&FIELD_SEP.to_string())
}

/// Computes the conservative preliminary key used for the pre-response lookup.
pub fn compute_preliminary_key(
    method: &str,
    path: &str,
    query: &[(String, String)],
    header_value: &dyn Fn(&str) -> Option<String>,
    body_hash: Option<String>,
) -> String {
    compute_key(&KeyInputs {
        method,
        path,
        query,
        vary_headers: CONSERVATIVE_VARY_HEADERS,
        header_value,
        body_hash,
    })
}

/// Computes the canonical storage key once the upstream response's `Vary` header (or
/// its absence) is known.
pub fn compute_canonical_key<'a>(
    method: &str,
    path: &str,
    query: &[(String, String)],
    vary_header_names: Option<&'a [&'a str]>,
    header_value: &dyn Fn(&str) -> Option<String>,
    body_hash: Option<String>,
) -> String {
    let vary_headers = vary_header_names.unwrap_or(CONSERVATIVE_VARY_HEADERS);
    compute_key(&KeyInputs {
        method,
        path,
        query,
        vary_headers,
        header_value,
        body_hash,
    })
}

pub fn hash_body(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    hex::encode(hasher.finalize())
}
