//! Allow-list check and token extraction (§4.8 steps 1-2). Kept separate from
//! `pipeline.rs` since both are pure functions over request metadata with no I/O --
//! easy to exhaustively unit test on their own, the same way `syncserver`'s validators
//! live apart from its handlers.

use crate::error::ApiErrorKind;

/// Step 1: the request's path must match a configured prefix, and its method must be in
/// the configured method set. A known path with a disallowed method is `405`; an
/// unmatched path is `404` regardless of method (§4.8, P2).
pub fn check_allowed(
    path: &str,
    method: &str,
    allowed_endpoints: &[String],
    allowed_methods: &[String],
) -> Result<(), ApiErrorKind> {
    let path_matches = allowed_endpoints
        .iter()
        .any(|prefix| path.starts_with(prefix.as_str()));
    if !path_matches {
        return Err(ApiErrorKind::UnknownEndpoint);
    }
    let method_matches = allowed_methods
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(method));
    if !method_matches {
        return Err(ApiErrorKind::MethodNotAllowed);
    }
    Ok(())
}

/// Step 2: extracts the bearer token, preferring `Authorization: Bearer <token>`, then
/// `X-API-Key`, then the `token` query parameter (§9 open question 1: `Authorization`
/// wins when both are present). Returns `MissingToken` if none is present or the
/// `Authorization` header is present but not a well-formed bearer credential.
pub fn extract_token(
    authorization: Option<&str>,
    api_key_header: Option<&str>,
    query: &[(String, String)],
) -> Result<String, ApiErrorKind> {
    if let Some(value) = authorization {
        return parse_bearer(value);
    }
    if let Some(key) = api_key_header {
        return non_empty_token(key);
    }
    if let Some((_, value)) = query.iter().find(|(k, _)| k == "token") {
        return non_empty_token(value);
    }
    Err(ApiErrorKind::MissingToken)
}

fn parse_bearer(value: &str) -> Result<String, ApiErrorKind> {
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .ok_or(ApiErrorKind::MissingToken)?;
    non_empty_token(token)
}

fn non_empty_token(raw: &str) -> Result<String, ApiErrorKind> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ApiErrorKind::MissingToken);
    }
    Ok(trimmed.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints() -> Vec<String> {
        vec!["/v1".to_owned()]
    }
    fn methods() -> Vec<String> {
        vec!["GET".to_owned(), "POST".to_owned()]
    }

    #[test]
    fn unknown_path_is_404_regardless_of_method() {
        let err = check_allowed("/unknown", "GET", &endpoints(), &methods()).unwrap_err();
        assert!(matches!(err, ApiErrorKind::UnknownEndpoint));
    }

    #[test]
    fn known_path_wrong_method_is_405() {
        let err = check_allowed("/v1/models", "DELETE", &endpoints(), &methods()).unwrap_err();
        assert!(matches!(err, ApiErrorKind::MethodNotAllowed));
    }

    #[test]
    fn known_path_and_method_is_allowed() {
        assert!(check_allowed("/v1/models", "GET", &endpoints(), &methods()).is_ok());
    }

    #[test]
    fn authorization_header_wins_over_api_key_and_query() {
        let token = extract_token(
            Some("Bearer abc"),
            Some("xyz"),
            &[("token".to_owned(), "qqq".to_owned())],
        )
        .unwrap();
        assert_eq!(token, "abc");
    }

    #[test]
    fn falls_back_to_api_key_header_then_query_param() {
        assert_eq!(extract_token(None, Some("xyz"), &[]).unwrap(), "xyz");
        assert_eq!(
            extract_token(None, None, &[("token".to_owned(), "qqq".to_owned())]).unwrap(),
            "qqq"
        );
    }

    #[test]
    fn malformed_authorization_header_is_rejected() {
        let err = extract_token(Some("Basic abc"), None, &[]).unwrap_err();
        assert!(matches!(err, ApiErrorKind::MissingToken));
    }

    #[test]
    fn absent_token_is_rejected() {
        let err = extract_token(None, None, &[]).unwrap_err();
        assert!(matches!(err, ApiErrorKind::MissingToken));
    }
}
