use http::StatusCode;
use thiserror::Error;
use tollgate_common::{InternalError, ReportableError};

/// Error taxonomy for the token subsystem (§4.1, §7). Each variant carries the HTTP
/// status it maps to at the edge so the gateway's `ApiError` doesn't need to duplicate
/// the mapping -- the same shape as `TokenserverError::http_status`, minus the
/// `status`/`location`/`name` fields that only made sense for Tokenserver's bespoke body.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum TokenError {
    #[error("token not found")]
    NotFound,
    #[error("token expired")]
    Expired,
    #[error("token revoked")]
    Revoked,
    #[error("token rate limited")]
    RateLimited,
    #[error("token quota exhausted")]
    QuotaExhausted,
    #[error("project inactive")]
    ProjectInactive,
    #[error("project not found")]
    ProjectNotFound,
    #[error("malformed token")]
    Malformed,
    #[error("internal error: {0}")]
    Internal(String),
}

impl TokenError {
    pub fn http_status(&self) -> StatusCode {
        match self {
            TokenError::NotFound => StatusCode::UNAUTHORIZED,
            TokenError::Expired => StatusCode::UNAUTHORIZED,
            TokenError::Revoked => StatusCode::UNAUTHORIZED,
            TokenError::Malformed => StatusCode::UNAUTHORIZED,
            TokenError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            TokenError::QuotaExhausted => StatusCode::TOO_MANY_REQUESTS,
            TokenError::ProjectInactive => StatusCode::FORBIDDEN,
            TokenError::ProjectNotFound => StatusCode::NOT_FOUND,
            TokenError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl InternalError for TokenError {
    fn internal_error(message: String) -> Self {
        TokenError::Internal(message)
    }
}

impl ReportableError for TokenError {
    fn error_backtrace(&self) -> String {
        String::new()
    }

    fn is_sentry_event(&self) -> bool {
        matches!(self, TokenError::Internal(_))
    }

    fn metric_label(&self) -> Option<String> {
        let label = match self {
            TokenError::NotFound => "token.not_found",
            TokenError::Expired => "token.expired",
            TokenError::Revoked => "token.revoked",
            TokenError::RateLimited => "token.rate_limited",
            TokenError::QuotaExhausted => "token.quota_exhausted",
            TokenError::ProjectInactive => "token.project_inactive",
            TokenError::ProjectNotFound => "token.project_not_found",
            TokenError::Malformed => "token.malformed",
            TokenError::Internal(_) => return None,
        };
        Some(label.to_owned())
    }
}
