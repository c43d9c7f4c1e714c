//! Session Server
//!
//! HTTP + WebSocket front of the process orchestrator:
//! - `GET /ws` - event channel, one orchestrator per socket
//! - `GET /api/connections` - profile summaries
//! - `GET /health`

pub mod auth;
pub mod socket;

use anyhow::Context;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use log::{info, warn};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::config::{ServerConfig, SshSettings};
use crate::profiles::ProfileStore;

use auth::TokenQuery;

/// State shared by every request
pub struct AppState {
    pub profiles: Arc<ProfileStore>,
    pub settings: SshSettings,
    tokens: HashSet<String>,
}

impl AppState {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            profiles: Arc::new(ProfileStore::new(config.profiles.clone())),
            settings: config.ssh.clone(),
            tokens: config.api_tokens.iter().cloned().collect(),
        }
    }

    /// Whether `token` may use the server. No configured tokens means open access.
    pub fn accepts(&self, token: Option<&str>) -> bool {
        if self.tokens.is_empty() {
            return true;
        }
        token.map(|t| self.tokens.contains(t)).unwrap_or(false)
    }
}

/// Build the application router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(socket::ws_handler))
        .route("/api/connections", get(list_connections))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind `bind` and serve until the process is stopped
pub async fn serve(config: &ServerConfig, bind: &str) -> anyhow::Result<()> {
    if which::which(&config.ssh.binary).is_err() {
        warn!("ssh binary {} not found on PATH; connects will fail", config.ssh.binary);
    }
    if config.api_tokens.is_empty() {
        warn!("No API tokens configured, the server accepts every client");
    }

    let state = Arc::new(AppState::new(config));
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;

    info!(
        "Serving {} connection profiles on http://{}",
        state.profiles.len(),
        listener.local_addr()?
    );
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn list_connections(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Response {
    if let Err(rejection) = auth::authorize(&state, &headers, &query) {
        return rejection.into_response();
    }
    Json(state.profiles.summaries()).into_response()
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "profiles": state.profiles.len(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionProfile, ProfileAuth};
    use crate::protocol::{ConnectionId, ProfileRef};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn state(tokens: &[&str]) -> Arc<AppState> {
        let mut config = ServerConfig::default();
        config.api_tokens = tokens.iter().map(|t| t.to_string()).collect();
        config.profiles = vec![ConnectionProfile {
            id: ConnectionId::from(1),
            name: "bastion".to_string(),
            host: "bastion.internal".to_string(),
            port: 22,
            username: "ops".to_string(),
            auth: ProfileAuth::Agent,
            group: None,
            tags: Some("prod".to_string()),
            notes: None,
        }];
        Arc::new(AppState::new(&config))
    }

    async fn get(app: Router, uri: &str, token: Option<&str>) -> (StatusCode, Vec<u8>) {
        let mut request = Request::builder().uri(uri);
        if let Some(token) = token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }
        let response = app
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn test_connections_require_token() {
        let app = router(state(&["secret"]));

        let (status, _) = get(app.clone(), "/api/connections", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = get(app.clone(), "/api/connections", Some("wrong")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = get(app.clone(), "/api/connections", Some("secret")).await;
        assert_eq!(status, StatusCode::OK);
        let profiles: Vec<ProfileRef> = serde_json::from_slice(&body).unwrap();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].tags.as_deref(), Some("prod"));

        let (status, _) = get(app, "/api/connections?token=secret", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_open_access_without_tokens() {
        let (status, _) = get(router(state(&[])), "/api/connections", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = get(router(state(&["secret"])), "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["profiles"], 1);
    }
}
