//! Shared types for the token subsystem: the `Project`/`Token` rows (§3 of the data
//! model) and the `TokenError` taxonomy, mirroring
//! `tokenserver-common::error::TokenserverError` but mapped onto this proxy's simpler
//! `{ "error": "<message>" }` envelope rather than Tokenserver's `status/errors` body.

mod error;

pub use error::TokenError;

/// A Project row (§3). The core never mutates this directly -- it is read through
/// `ProjectStore` and only `is_active` matters to request-path decisions.
#[derive(Clone, Debug, PartialEq)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub upstream_api_key: UpstreamApiKey,
    pub is_active: bool,
    pub deactivated_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Newtype around the upstream secret credential. Intentionally does not derive
/// `Debug`/`Display` with the secret visible, so a stray `{:?}` in a log line never
/// leaks it -- the same discipline `syncserver-settings::Secrets` applies to its own
/// credential fields.
#[derive(Clone, PartialEq, Eq)]
pub struct UpstreamApiKey(String);

impl UpstreamApiKey {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for UpstreamApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("UpstreamApiKey(<redacted>)")
    }
}

/// A Token row (§3). `id` doubles as the bearer credential clients present.
#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    pub id: String,
    pub project_id: String,
    pub expires_at: Option<i64>,
    pub is_active: bool,
    pub deactivated_at: Option<i64>,
    pub request_count: u64,
    pub max_requests: Option<u64>,
    pub cache_hit_count: u64,
    pub created_at: i64,
    pub last_used_at: Option<i64>,
}

impl Token {
    /// The validity predicate from §3: `is_active ∧ (expires_at == nil ∨ now < expires_at)
    /// ∧ (max_requests == nil ∨ request_count < max_requests)`. Project-active is checked
    /// separately by the caller, since it requires a second lookup.
    pub fn is_valid_ignoring_project(&self, now: i64) -> Result<(), TokenError> {
        if !self.is_active {
            return Err(TokenError::Revoked);
        }
        if let Some(expires_at) = self.expires_at {
            if now >= expires_at {
                return Err(TokenError::Expired);
            }
        }
        if let Some(max_requests) = self.max_requests {
            if self.request_count >= max_requests {
                return Err(TokenError::QuotaExhausted);
            }
        }
        Ok(())
    }

    /// Absolute instant the token will next need re-validating against the store: its own
    /// expiry, or "never" (`None`) for a non-expiring token.
    pub fn expires_at(&self) -> Option<i64> {
        self.expires_at
    }
}

/// Options accepted by `TokenManager::generate`.
#[derive(Clone, Debug, Default)]
pub struct GenerateOptions {
    pub ttl_secs: Option<u64>,
    pub max_requests: Option<u64>,
}
