//! Session State Management
//!
//! Tracks the state of individual remote shell sessions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::log::OutputLog;
use crate::protocol::{ConnectionId, ProfileRef};

/// Lifecycle status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Known but never connected
    Idle,
    /// Connect requested, waiting for the server
    Connecting,
    /// Remote shell is open and accepts commands
    Connected,
    /// Disconnect requested, waiting for the server
    Disconnecting,
    /// Remote shell is closed
    Disconnected,
    /// Opening or running the remote shell failed
    Failed,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self::Idle
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnecting => write!(f, "disconnecting"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl SessionStatus {
    /// Connecting, Connected or Disconnecting: the server may still hold a shell
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Disconnecting)
    }

    /// Idle, Disconnected or Failed: a new connect may start here
    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

/// Complete state of a single session
#[derive(Debug, Clone)]
pub struct Session {
    /// Connection identifier
    pub id: ConnectionId,
    /// Current status
    pub status: SessionStatus,
    /// Profile the session was opened from, if the client knows it
    pub profile: Option<ProfileRef>,
    /// Everything rendered for this session
    pub log: OutputLog,
    /// Start of the latest connect attempt
    pub opened_at: Option<DateTime<Utc>>,
    /// When the latest attempt ended
    pub closed_at: Option<DateTime<Utc>>,
    /// When the status last changed
    pub status_changed_at: DateTime<Utc>,
    /// Message of the latest remote error
    pub last_error: Option<String>,
}

impl Session {
    /// Create an idle session
    pub fn new(id: ConnectionId) -> Self {
        Self {
            id,
            status: SessionStatus::Idle,
            profile: None,
            log: OutputLog::new(),
            opened_at: None,
            closed_at: None,
            status_changed_at: Utc::now(),
            last_error: None,
        }
    }

    /// Profile name if known, otherwise the id
    pub fn display_name(&self) -> String {
        match &self.profile {
            Some(profile) => profile.name.clone(),
            None => self.id.to_string(),
        }
    }

    /// Update status and lifecycle timestamps, returning the previous status
    pub fn set_status(&mut self, status: SessionStatus) -> SessionStatus {
        let old_status = self.status;
        if old_status == status {
            return old_status;
        }

        let now = Utc::now();
        self.status = status;
        self.status_changed_at = now;

        match status {
            SessionStatus::Connecting => {
                self.opened_at = Some(now);
                self.closed_at = None;
                self.last_error = None;
            }
            SessionStatus::Disconnected | SessionStatus::Failed => {
                self.closed_at = Some(now);
            }
            _ => {}
        }

        old_status
    }

    /// Seconds from the latest connect to close (or now)
    pub fn duration_secs(&self) -> Option<i64> {
        let opened = self.opened_at?;
        let end = self.closed_at.unwrap_or_else(Utc::now);
        Some((end - opened).num_seconds())
    }
}

/// Serializable session snapshot for the UI layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: ConnectionId,
    pub name: String,
    pub status: SessionStatus,
    pub target: Option<String>,
    pub opened_at: Option<String>,
    pub closed_at: Option<String>,
    pub last_error: Option<String>,
    pub line_count: usize,
    pub duration_secs: Option<i64>,
}

impl From<&Session> for SessionInfo {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id.clone(),
            name: session.display_name(),
            status: session.status,
            target: session.profile.as_ref().map(|p| p.target()),
            opened_at: session.opened_at.map(|t| t.to_rfc3339()),
            closed_at: session.closed_at.map(|t| t.to_rfc3339()),
            last_error: session.last_error.clone(),
            line_count: session.log.len(),
            duration_secs: session.duration_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_state_creation() {
        let session = Session::new(ConnectionId::from(7));
        assert_eq!(session.status, SessionStatus::Idle);
        assert!(session.status.is_terminal());
        assert_eq!(session.display_name(), "7");
        assert!(session.duration_secs().is_none());
    }

    #[test]
    fn test_status_timestamps() {
        let mut session = Session::new(ConnectionId::from(7));

        let old = session.set_status(SessionStatus::Connecting);
        assert_eq!(old, SessionStatus::Idle);
        assert!(session.opened_at.is_some());
        assert!(session.closed_at.is_none());
        assert!(session.status.is_active());

        session.set_status(SessionStatus::Connected);
        session.set_status(SessionStatus::Disconnected);
        assert!(session.closed_at.is_some());
        assert!(session.duration_secs().unwrap() >= 0);
    }

    #[test]
    fn test_session_info_snapshot() {
        let mut session = Session::new(ConnectionId::from(1));
        session.log.append(crate::protocol::LogKind::Prompt, "$ uptime");
        let info = SessionInfo::from(&session);
        assert_eq!(info.line_count, 1);
        assert_eq!(info.status, SessionStatus::Idle);
        assert!(info.target.is_none());
    }
}
