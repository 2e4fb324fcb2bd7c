//! Collaborator interfaces consumed by the core (§6.2). The persistent store for
//! projects, tokens and audit rows is explicitly out of scope (§1); this crate defines
//! only the method signatures the core depends on, the same way
//! `tokenserver-db-common`'s `Db`/`DbPool` traits stand in for whatever SQL backend is
//! actually wired up. A `mock` module provides an in-memory implementation for tests and
//! for running the gateway without a real store.

pub mod mock;

use std::collections::HashMap;

use async_trait::async_trait;
use tollgate_token_common::{GenerateOptions, Project, Token, TokenError};

pub type StoreResult<T> = Result<T, TokenError>;

/// Persistent read/write of token rows (C1). Every mutating operation is atomic (§5).
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn create_token(
        &self,
        project_id: &str,
        options: &GenerateOptions,
    ) -> StoreResult<Token>;

    async fn get_token_by_id(&self, token_id: &str) -> StoreResult<Option<Token>>;

    async fn update_token(&self, token: &Token) -> StoreResult<()>;

    /// Increments the persistent `request_count` for a forwarded upstream request.
    /// Never called for a cache-hit or a rate-limited request (§4.1).
    async fn increment_token_usage(&self, token_id: &str) -> StoreResult<()>;

    /// Applies a batch of cache-hit deltas accumulated by the cache-stats aggregator
    /// (C7). Eventually consistent by design (§9, open question 3).
    async fn increment_cache_hit_count_batch(
        &self,
        deltas: &HashMap<String, u64>,
    ) -> StoreResult<()>;

    async fn list_tokens_by_project_id(&self, project_id: &str) -> StoreResult<Vec<Token>>;

    /// Revokes every active token whose `expires_at` is before `now`, in one pass.
    /// Returns the count revoked. Called periodically by the sweeper (C13).
    async fn revoke_active_where_expired(&self, now: i64) -> StoreResult<u64>;

    /// Revokes every active token belonging to a project, in one pass.
    async fn revoke_active_where_project(&self, project_id: &str) -> StoreResult<u64>;
}

/// Project-level collaborator interface (§6.2).
#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn get_api_key_for_project(&self, project_id: &str) -> StoreResult<Option<String>>;

    async fn get_project_active(&self, project_id: &str) -> StoreResult<Option<bool>>;

    async fn get_project(&self, project_id: &str) -> StoreResult<Option<Project>>;
}

/// Write-only collaborator for finished audit records. The core never reads audit
/// history (§6.2) -- a sink only needs to accept a record and is free to drop it on its
/// own failure without affecting the request path.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: AuditRecord);
}

#[derive(Clone, Debug)]
pub struct AuditRecord {
    pub request_id: String,
    pub token_id: Option<String>,
    pub project_id: Option<String>,
    pub method: String,
    pub path: String,
    pub status: u16,
}

/// Lets a store behind an `Arc` be handed both to a `TokenManager` (which owns its
/// store by value) and to the gateway's `AppState` (which needs its own
/// `Arc<dyn ProjectStore>` handle) without the store itself needing to be `Clone`.
/// Mirrors how `tokenserver_db_common`'s pool types are cheaply shared by reference.
#[async_trait]
impl<T: TokenStore + ?Sized> TokenStore for std::sync::Arc<T> {
    async fn create_token(&self, project_id: &str, options: &GenerateOptions) -> StoreResult<Token> {
        T::create_token(self, project_id, options).await
    }

    async fn get_token_by_id(&self, token_id: &str) -> StoreResult<Option<Token>> {
        T::get_token_by_id(self, token_id).await
    }

    async fn update_token(&self, token: &Token) -> StoreResult<()> {
        T::update_token(self, token).await
    }

    async fn increment_token_usage(&self, token_id: &str) -> StoreResult<()> {
        T::increment_token_usage(self, token_id).await
    }

    async fn increment_cache_hit_count_batch(&self, deltas: &HashMap<String, u64>) -> StoreResult<()> {
        T::increment_cache_hit_count_batch(self, deltas).await
    }

    async fn list_tokens_by_project_id(&self, project_id: &str) -> StoreResult<Vec<Token>> {
        T::list_tokens_by_project_id(self, project_id).await
    }

    async fn revoke_active_where_expired(&self, now: i64) -> StoreResult<u64> {
        T::revoke_active_where_expired(self, now).await
    }

    async fn revoke_active_where_project(&self, project_id: &str) -> StoreResult<u64> {
        T::revoke_active_where_project(self, project_id).await
    }
}

#[async_trait]
impl<T: ProjectStore + ?Sized> ProjectStore for std::sync::Arc<T> {
    async fn get_api_key_for_project(&self, project_id: &str) -> StoreResult<Option<String>> {
        T::get_api_key_for_project(self, project_id).await
    }

    async fn get_project_active(&self, project_id: &str) -> StoreResult<Option<bool>> {
        T::get_project_active(self, project_id).await
    }

    async fn get_project(&self, project_id: &str) -> StoreResult<Option<Project>> {
        T::get_project(self, project_id).await
    }
}
