//! Server Authentication
//!
//! Bearer tokens, taken from the `Authorization` header or, for browser
//! WebSocket clients that cannot set headers, a `?token=` query parameter.

use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use log::debug;
use serde::Deserialize;
use serde_json::json;

use super::AppState;

/// Optional `?token=` query
#[derive(Debug, Default, Deserialize)]
pub struct TokenQuery {
    pub token: Option<String>,
}

/// Token presented by the request, header first
pub fn presented_token(headers: &HeaderMap, query: &TokenQuery) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .or_else(|| query.token.clone())
}

/// Rejected request
#[derive(Debug)]
pub struct Unauthorized;

impl IntoResponse for Unauthorized {
    fn into_response(self) -> Response {
        (StatusCode::UNAUTHORIZED, Json(json!({ "error": "Invalid token" }))).into_response()
    }
}

/// Check the request against the configured tokens
pub fn authorize(state: &AppState, headers: &HeaderMap, query: &TokenQuery) -> Result<(), Unauthorized> {
    let token = presented_token(headers, query);
    if state.accepts(token.as_deref()) {
        Ok(())
    } else {
        debug!("Rejected request with {} token", if token.is_some() { "invalid" } else { "no" });
        Err(Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_header_wins_over_query() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        let query = TokenQuery {
            token: Some("xyz".to_string()),
        };

        assert_eq!(presented_token(&headers, &query).as_deref(), Some("abc"));
        assert_eq!(
            presented_token(&HeaderMap::new(), &query).as_deref(),
            Some("xyz")
        );
        assert!(presented_token(&HeaderMap::new(), &TokenQuery::default()).is_none());
    }

    #[test]
    fn test_non_bearer_header_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic Zm9vOmJhcg=="));
        assert!(presented_token(&headers, &TokenQuery::default()).is_none());
    }
}
