//! Session Events
//!
//! Notifications the registry broadcasts after each applied transition. The UI
//! layer renders from these and never mutates sessions itself.

use serde::{Deserialize, Serialize};

use super::log::LogLine;
use super::state::SessionStatus;
use crate::protocol::ConnectionId;

/// Events emitted to UI subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionEvent {
    /// Session status changed
    StatusChanged {
        session_id: ConnectionId,
        old_status: SessionStatus,
        new_status: SessionStatus,
    },

    /// A line was appended to the session log
    LineAppended {
        session_id: ConnectionId,
        line: LogLine,
    },

    /// The session dropped unexpectedly; a view focused on it should let go
    FocusReleased { session_id: ConnectionId },

    /// A user request for this session was refused
    Rejected {
        session_id: ConnectionId,
        reason: String,
    },

    /// Session removed from the registry
    Removed { session_id: ConnectionId },

    /// Registry cleared (logout)
    Cleared,
}

impl SessionEvent {
    /// Get the session ID, if the event concerns a single session
    pub fn session_id(&self) -> Option<&ConnectionId> {
        match self {
            Self::StatusChanged { session_id, .. } => Some(session_id),
            Self::LineAppended { session_id, .. } => Some(session_id),
            Self::FocusReleased { session_id } => Some(session_id),
            Self::Rejected { session_id, .. } => Some(session_id),
            Self::Removed { session_id } => Some(session_id),
            Self::Cleared => None,
        }
    }

    /// Get the global event name
    pub fn global_event_name(&self) -> &'static str {
        match self {
            Self::StatusChanged { .. } => "session-status",
            Self::LineAppended { .. } => "session-line",
            Self::FocusReleased { .. } => "session-focus-released",
            Self::Rejected { .. } => "session-rejected",
            Self::Removed { .. } => "session-removed",
            Self::Cleared => "sessions-cleared",
        }
    }

    /// Get the per-session event name
    pub fn event_name(&self) -> String {
        match self.session_id() {
            Some(id) => format!("{}:{}", self.global_event_name(), id),
            None => self.global_event_name().to_string(),
        }
    }
}
