//! Connection Profiles
//!
//! Profiles are owned by the server and referenced, never owned, by sessions.
//! The server keeps them in a `ProfileStore`; clients read summaries through
//! `GET /api/connections` with `ProfileClient`.

use log::{debug, info};
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::config::ConnectionProfile;
use crate::protocol::{ConnectionId, ProfileRef};

/// Profile lookup errors
#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Connection profile not found: {0}")]
    NotFound(ConnectionId),

    #[error("Server returned {status}: {body}")]
    Server { status: StatusCode, body: String },
}

impl From<ProfileError> for String {
    fn from(err: ProfileError) -> String {
        err.to_string()
    }
}

/// Server-side profile collection
#[derive(Debug, Default)]
pub struct ProfileStore {
    profiles: HashMap<ConnectionId, ConnectionProfile>,
}

impl ProfileStore {
    pub fn new(profiles: Vec<ConnectionProfile>) -> Self {
        Self {
            profiles: profiles.into_iter().map(|p| (p.id.clone(), p)).collect(),
        }
    }

    /// Full profile, credentials included
    pub fn get(&self, id: &ConnectionId) -> Option<&ConnectionProfile> {
        self.profiles.get(id)
    }

    /// Summaries sorted by group, then name
    pub fn summaries(&self) -> Vec<ProfileRef> {
        let mut summaries: Vec<ProfileRef> = self.profiles.values().map(|p| p.summary()).collect();
        summaries.sort_by(|a, b| {
            a.group
                .cmp(&b.group)
                .then_with(|| a.name.cmp(&b.name))
                .then_with(|| a.id.cmp(&b.id))
        });
        summaries
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

/// Client for the profile API
pub struct ProfileClient {
    client: Client,
    base: Url,
    token: Option<String>,
}

impl ProfileClient {
    /// Create a client for the server at `base` (`http://host:port/`)
    pub fn new(base: Url, token: Option<String>) -> Result<Self, ProfileError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self { client, base, token })
    }

    /// All profile summaries
    pub async fn list(&self) -> Result<Vec<ProfileRef>, ProfileError> {
        let url = self.base.join("api/connections")?;
        debug!("Fetching connection profiles from {}", url);

        let mut request = self.client.get(url);
        if let Some(ref token) = self.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request.send().await?;
        match response.status() {
            StatusCode::OK => {
                let profiles: Vec<ProfileRef> = response.json().await?;
                info!("Fetched {} connection profiles", profiles.len());
                Ok(profiles)
            }
            StatusCode::UNAUTHORIZED => Err(ProfileError::Unauthorized),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(ProfileError::Server { status, body })
            }
        }
    }

    /// One profile summary
    pub async fn get(&self, id: &ConnectionId) -> Result<ProfileRef, ProfileError> {
        self.list()
            .await?
            .into_iter()
            .find(|p| &p.id == id)
            .ok_or_else(|| ProfileError::NotFound(id.clone()))
    }
}
