//! Locating the bearer token on an upgrade request.

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use serde::Deserialize;

/// Query parameters a browser client may use, since it cannot set headers
/// on a WebSocket handshake.
#[derive(Debug, Default, Deserialize)]
pub struct TokenQuery {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub authorization: Option<String>,
}

/// Find the token: `?token=`, then `?authorization=`, then the
/// `Authorization` header. A leading `Bearer ` is stripped from any of them.
pub fn extract_token(query: &TokenQuery, headers: &HeaderMap) -> Option<String> {
    let header = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());

    [query.token.as_deref(), query.authorization.as_deref(), header]
        .into_iter()
        .flatten()
        .map(strip_bearer)
        .find(|token| !token.is_empty())
        .map(str::to_string)
}

fn strip_bearer(raw: &str) -> &str {
    let raw = raw.trim();
    raw.strip_prefix("Bearer ")
        .or_else(|| raw.strip_prefix("bearer "))
        .unwrap_or(raw)
        .trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn query(token: Option<&str>, authorization: Option<&str>) -> TokenQuery {
        TokenQuery {
            token: token.map(str::to_string),
            authorization: authorization.map(str::to_string),
        }
    }

    #[test]
    fn query_token_wins() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer header-token"));
        let token = extract_token(&query(Some("query-token"), None), &headers);
        assert_eq!(token.as_deref(), Some("query-token"));
    }

    #[test]
    fn authorization_query_param_is_stripped() {
        let token = extract_token(&query(None, Some("Bearer abc")), &HeaderMap::new());
        assert_eq!(token.as_deref(), Some("abc"));
    }

    #[test]
    fn falls_back_to_header() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer xyz"));
        let token = extract_token(&query(Some(""), None), &headers);
        assert_eq!(token.as_deref(), Some("xyz"));
    }

    #[test]
    fn missing_everywhere() {
        assert!(extract_token(&TokenQuery::default(), &HeaderMap::new()).is_none());
    }
}
