//! The token manager (C3): the single place that knows how to turn a bearer token into
//! a project id, ties the validation cache (C2), the persistent store (C1) and the rate
//! limiter (C4) together, and owns the revoke/sweep lifecycle. Mirrors the layering of
//! `tokenserver_db::models` (validate against the store, cache the answer) but replaces
//! its FxA-specific logic with the generic predicate from the token data model.

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use rand::RngCore;
use slog::{debug, Logger};
use tollgate_rate_limiter::RateLimiter;
use tollgate_token_cache::{CachedValidation, TokenCache};
use tollgate_token_common::{GenerateOptions, Token, TokenError};
use tollgate_token_store::{ProjectStore, TokenStore};

/// Returns a fresh token and the metadata the caller needs to hand back to the client.
/// The plaintext `id` is only ever available here, at creation time (§4.1).
#[derive(Clone, Debug)]
pub struct GeneratedToken {
    pub token: Token,
}

/// A validated token's project id plus whatever usage bookkeeping the caller needs for
/// response headers (§6.1 `X-RateLimit-*`-style reporting is left to the gateway crate;
/// this only exposes the raw remaining count).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Validation {
    pub project_id: String,
}

pub struct TokenManager<S, C, R>
where
    S: TokenStore + ProjectStore,
    C: TokenCacheTtl,
    R: RateLimiter,
{
    store: S,
    cache: TokenCache,
    rate_limiter: R,
    cache_ttl_secs: C,
    logger: Logger,
    clock_override: Option<AtomicI64>,
}

/// Supplies the configured validation-cache TTL (`token_cache_ttl`, §6.4). A plain `i64`
/// implements it directly; kept as a trait only so a future settings type can implement
/// it without an extra field copy.
pub trait TokenCacheTtl {
    fn ttl_secs(&self) -> i64;
}

impl TokenCacheTtl for i64 {
    fn ttl_secs(&self) -> i64 {
        *self
    }
}

impl<S, C, R> TokenManager<S, C, R>
where
    S: TokenStore + ProjectStore,
    C: TokenCacheTtl,
    R: RateLimiter,
{
    pub fn new(
        store: S,
        cache_capacity: usize,
        cache_ttl_secs: C,
        rate_limiter: R,
        logger: Logger,
    ) -> Self {
        Self {
            store,
            cache: TokenCache::new(cache_capacity),
            rate_limiter,
            cache_ttl_secs,
            logger,
            clock_override: None,
        }
    }

    /// Test-only: pins `now()` to a fixed value instead of reading the system clock.
    #[doc(hidden)]
    pub fn with_fixed_clock(mut self, now: i64) -> Self {
        self.clock_override = Some(AtomicI64::new(now));
        self
    }

    fn now(&self) -> i64 {
        match &self.clock_override {
            Some(fixed) => fixed.load(Ordering::Relaxed),
            None => current_unix_time(),
        }
    }

    /// `Generate(projectID, options)` (§4.1): rejects an unknown or inactive project,
    /// otherwise mints a 128-bit random token id and persists it via the store.
    pub async fn generate(
        &self,
        project_id: &str,
        options: GenerateOptions,
    ) -> Result<GeneratedToken, TokenError> {
        match self.store.get_project_active(project_id).await? {
            None => return Err(TokenError::ProjectNotFound),
            Some(false) => return Err(TokenError::ProjectInactive),
            Some(true) => {}
        }

        let token = self.store.create_token(project_id, &options).await?;

        Ok(GeneratedToken { token })
    }

    /// `Validate(token)` (§4.1): cache-first lookup, falling back to the store and
    /// repopulating the cache on a miss. Never touches the rate limiter or the
    /// persistent `request_count` -- that is `validate_and_count`'s job.
    pub async fn validate(&self, token_id: &str) -> Result<Validation, TokenError> {
        self.validate_inner(token_id).await
    }

    /// `ValidateAndCount(token)` (§4.1): `Validate` plus, on success, an atomic increment
    /// of the rate-limit window counter (C4) and the persistent `request_count` (C1). A
    /// rate-limit rejection is terminal and never increments the persistent counter.
    pub async fn validate_and_count(&self, token_id: &str) -> Result<Validation, TokenError> {
        let validation = self.validate_inner(token_id).await?;

        let now = self.now();
        let allow = self.rate_limiter.allow(token_id, now).await;
        if !allow.allowed {
            return Err(TokenError::RateLimited);
        }

        self.store.increment_token_usage(token_id).await?;

        Ok(validation)
    }

    async fn validate_inner(&self, token_id: &str) -> Result<Validation, TokenError> {
        let now = self.now();

        if let Some(cached) = self.cache.get(token_id, now) {
            debug!(self.logger, "token validation cache hit"; "token_id" => token_id);
            return Ok(Validation {
                project_id: cached.project_id,
            });
        }

        let token = self
            .store
            .get_token_by_id(token_id)
            .await?
            .ok_or(TokenError::NotFound)?;

        token.is_valid_ignoring_project(now)?;

        match self.store.get_project_active(&token.project_id).await? {
            None => return Err(TokenError::ProjectNotFound),
            Some(false) => return Err(TokenError::ProjectInactive),
            Some(true) => {}
        }

        let ttl = self.cache_ttl_secs.ttl_secs();
        let cached_expiry = match token.expires_at() {
            Some(expires_at) => (now + ttl).min(expires_at),
            None => now + ttl,
        };
        self.cache.insert(
            token_id.to_owned(),
            CachedValidation {
                project_id: token.project_id.clone(),
                cached_expiry,
            },
        );

        Ok(Validation {
            project_id: token.project_id,
        })
    }

    /// `Revoke(token)` (§4.1): idempotent -- revoking an already-inactive token is not
    /// an error, it just evicts any stale cache entry again.
    pub async fn revoke(&self, token_id: &str) -> Result<(), TokenError> {
        let mut token = self
            .store
            .get_token_by_id(token_id)
            .await?
            .ok_or(TokenError::NotFound)?;

        if token.is_active {
            token.is_active = false;
            token.deactivated_at = Some(self.now());
            self.store.update_token(&token).await?;
        }

        self.cache.evict(token_id);
        Ok(())
    }

    /// `RevokeExpired()` (§4.1, called by the sweeper C13): revokes every active token
    /// whose `expires_at` has passed, in one store-level pass, and returns the count.
    pub async fn revoke_expired(&self) -> Result<u64, TokenError> {
        let now = self.now();
        self.store.revoke_active_where_expired(now).await
    }

    /// `RevokeProject(projectID)` (§4.1): revokes every active token of a project. Does
    /// not proactively evict C2 entries for that project -- they age out naturally by
    /// TTL rather than a synchronous cache sweep on every revoke.
    pub async fn revoke_project(&self, project_id: &str) -> Result<u64, TokenError> {
        self.store.revoke_active_where_project(project_id).await
    }
}

/// Object-safe facade over [`TokenManager`]'s public operations, so a gateway wiring
/// together a concrete `S`/`C`/`R` at startup can still hand callers a single
/// `Arc<dyn TokenAuthority>` instead of threading three generic parameters through
/// every handler. Mirrors how `tokenserver_db::Db` is boxed as `Box<dyn Db>` once a
/// concrete pool is constructed.
#[async_trait]
pub trait TokenAuthority: Send + Sync {
    async fn generate(
        &self,
        project_id: &str,
        options: GenerateOptions,
    ) -> Result<GeneratedToken, TokenError>;

    async fn validate(&self, token_id: &str) -> Result<Validation, TokenError>;

    async fn validate_and_count(&self, token_id: &str) -> Result<Validation, TokenError>;

    async fn revoke(&self, token_id: &str) -> Result<(), TokenError>;

    async fn revoke_expired(&self) -> Result<u64, TokenError>;

    async fn revoke_project(&self, project_id: &str) -> Result<u64, TokenError>;
}

#[async_trait]
impl<S, C, R> TokenAuthority for TokenManager<S, C, R>
where
    S: TokenStore + ProjectStore + Send + Sync + 'static,
    C: TokenCacheTtl + Send + Sync + 'static,
    R: RateLimiter + Send + Sync + 'static,
{
    async fn generate(
        &self,
        project_id: &str,
        options: GenerateOptions,
    ) -> Result<GeneratedToken, TokenError> {
        TokenManager::generate(self, project_id, options).await
    }

    async fn validate(&self, token_id: &str) -> Result<Validation, TokenError> {
        TokenManager::validate(self, token_id).await
    }

    async fn validate_and_count(&self, token_id: &str) -> Result<Validation, TokenError> {
        TokenManager::validate_and_count(self, token_id).await
    }

    async fn revoke(&self, token_id: &str) -> Result<(), TokenError> {
        TokenManager::revoke(self, token_id).await
    }

    async fn revoke_expired(&self) -> Result<u64, TokenError> {
        TokenManager::revoke_expired(self).await
    }

    async fn revoke_project(&self, project_id: &str) -> Result<u64, TokenError> {
        TokenManager::revoke_project(self, project_id).await
    }
}

/// 128 bits of randomness rendered as a hex token id. Not currently used directly by
/// `generate` (`TokenStore::create_token` owns id minting so a real SQL backend can use
/// its own id scheme) but kept available for stores that want to delegate id generation
/// back to this crate.
pub fn random_token_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn current_unix_time() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs() as i64
}
