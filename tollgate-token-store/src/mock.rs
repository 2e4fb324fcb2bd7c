//! An in-memory `TokenStore`/`ProjectStore` used by tests and by the gateway's
//! `no_auth`-less dev mode. Mirrors `tokenserver_db::mock::MockDb`: every method is a
//! straightforward map operation, with no pooling or blocking-threadpool concerns.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tollgate_token_common::{GenerateOptions, Project, Token, TokenError, UpstreamApiKey};

use crate::{AuditRecord, AuditSink, ProjectStore, StoreResult, TokenStore};

#[derive(Default)]
pub struct MockStore {
    projects: Mutex<HashMap<String, Project>>,
    tokens: Mutex<HashMap<String, Token>>,
    next_token_id: Mutex<u64>,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_project(&self, project: Project) {
        self.projects
            .lock()
            .unwrap()
            .insert(project.id.clone(), project);
    }

    pub fn insert_token(&self, token: Token) {
        self.tokens.lock().unwrap().insert(token.id.clone(), token);
    }

    pub fn get_token_snapshot(&self, token_id: &str) -> Option<Token> {
        self.tokens.lock().unwrap().get(token_id).cloned()
    }
}

#[async_trait]
impl TokenStore for MockStore {
    async fn create_token(
        &self,
        project_id: &str,
        options: &GenerateOptions,
    ) -> StoreResult<Token> {
        {
            let projects = self.projects.lock().unwrap();
            match projects.get(project_id) {
                None => return Err(TokenError::ProjectNotFound),
                Some(p) if !p.is_active => return Err(TokenError::ProjectInactive),
                Some(_) => {}
            }
        }

        let mut next = self.next_token_id.lock().unwrap();
        *next += 1;
        let id = format!("tok_{:016x}", *next);
        drop(next);

        let now = current_unix_time();
        let token = Token {
            id: id.clone(),
            project_id: project_id.to_owned(),
            expires_at: options.ttl_secs.map(|ttl| now + ttl as i64),
            is_active: true,
            deactivated_at: None,
            request_count: 0,
            max_requests: options.max_requests,
            cache_hit_count: 0,
            created_at: now,
            last_used_at: None,
        };
        self.tokens
            .lock()
            .unwrap()
            .insert(token.id.clone(), token.clone());
        Ok(token)
    }

    async fn get_token_by_id(&self, token_id: &str) -> StoreResult<Option<Token>> {
        Ok(self.tokens.lock().unwrap().get(token_id).cloned())
    }

    async fn update_token(&self, token: &Token) -> StoreResult<()> {
        self.tokens
            .lock()
            .unwrap()
            .insert(token.id.clone(), token.clone());
        Ok(())
    }

    async fn increment_token_usage(&self, token_id: &str) -> StoreResult<()> {
        let mut tokens = self.tokens.lock().unwrap();
        let token = tokens.get_mut(token_id).ok_or(TokenError::NotFound)?;
        token.request_count += 1;
        token.last_used_at = Some(current_unix_time());
        Ok(())
    }

    async fn increment_cache_hit_count_batch(
        &self,
        deltas: &HashMap<String, u64>,
    ) -> StoreResult<()> {
        let mut tokens = self.tokens.lock().unwrap();
        for (token_id, delta) in deltas {
            if let Some(token) = tokens.get_mut(token_id) {
                token.cache_hit_count += delta;
            }
        }
        Ok(())
    }

    async fn list_tokens_by_project_id(&self, project_id: &str) -> StoreResult<Vec<Token>> {
        Ok(self
            .tokens
            .lock()
            .unwrap()
            .values()
            .filter(|t| t.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn revoke_active_where_expired(&self, now: i64) -> StoreResult<u64> {
        let mut tokens = self.tokens.lock().unwrap();
        let mut count = 0;
        for token in tokens.values_mut() {
            if token.is_active && token.expires_at.map(|e| e < now).unwrap_or(false) {
                token.is_active = false;
                token.deactivated_at = Some(now);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn revoke_active_where_project(&self, project_id: &str) -> StoreResult<u64> {
        let mut tokens = self.tokens.lock().unwrap();
        let now = current_unix_time();
        let mut count = 0;
        for token in tokens.values_mut().filter(|t| t.project_id == project_id) {
            if token.is_active {
                token.is_active = false;
                token.deactivated_at = Some(now);
                count += 1;
            }
        }
        Ok(count)
    }
}

#[async_trait]
impl ProjectStore for MockStore {
    async fn get_api_key_for_project(&self, project_id: &str) -> StoreResult<Option<String>> {
        Ok(self
            .projects
            .lock()
            .unwrap()
            .get(project_id)
            .map(|p| p.upstream_api_key.expose().to_owned()))
    }

    async fn get_project_active(&self, project_id: &str) -> StoreResult<Option<bool>> {
        Ok(self
            .projects
            .lock()
            .unwrap()
            .get(project_id)
            .map(|p| p.is_active))
    }

    async fn get_project(&self, project_id: &str) -> StoreResult<Option<Project>> {
        Ok(self.projects.lock().unwrap().get(project_id).cloned())
    }
}

/// A no-op audit sink for tests that don't care about audit records.
pub struct NullAuditSink;

#[async_trait]
impl AuditSink for NullAuditSink {
    async fn record(&self, _record: AuditRecord) {}
}

fn current_unix_time() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_project(id: &str, active: bool) -> Project {
        Project {
            id: id.to_owned(),
            name: format!("project-{id}"),
            upstream_api_key: UpstreamApiKey::new("sk-upstream-secret"),
            is_active: active,
            deactivated_at: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn create_token_rejects_missing_project() {
        let store = MockStore::new();
        let err = store
            .create_token("missing", &GenerateOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, TokenError::ProjectNotFound);
    }

    #[tokio::test]
    async fn create_token_rejects_inactive_project() {
        let store = MockStore::new();
        store.insert_project(sample_project("p1", false));
        let err = store
            .create_token("p1", &GenerateOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, TokenError::ProjectInactive);
    }

    #[tokio::test]
    async fn increment_usage_is_exact() {
        let store = MockStore::new();
        store.insert_project(sample_project("p1", true));
        let token = store
            .create_token("p1", &GenerateOptions::default())
            .await
            .unwrap();

        for _ in 0..5 {
            store.increment_token_usage(&token.id).await.unwrap();
        }

        let snapshot = store.get_token_snapshot(&token.id).unwrap();
        assert_eq!(snapshot.request_count, 5);
    }

    #[tokio::test]
    async fn revoke_active_where_expired_is_idempotent_in_effect() {
        let store = MockStore::new();
        store.insert_project(sample_project("p1", true));
        let mut token = store
            .create_token("p1", &GenerateOptions::default())
            .await
            .unwrap();
        token.expires_at = Some(10);
        store.update_token(&token).await.unwrap();

        let revoked = store.revoke_active_where_expired(100).await.unwrap();
        assert_eq!(revoked, 1);
        let revoked_again = store.revoke_active_where_expired(100).await.unwrap();
        assert_eq!(revoked_again, 0);
    }
}
