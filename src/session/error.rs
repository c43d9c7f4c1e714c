//! Session Error Types

use thiserror::Error;

use super::state::SessionStatus;
use crate::orchestrator::OrchestratorError;
use crate::protocol::ConnectionId;

/// Errors raised while driving a session
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    SessionNotFound(ConnectionId),

    #[error("Session {id} is already {status}")]
    AlreadyActive {
        id: ConnectionId,
        status: SessionStatus,
    },

    #[error("Session {id} is not connected ({status})")]
    NotConnected {
        id: ConnectionId,
        status: SessionStatus,
    },

    #[error("Session {id} has nothing to disconnect ({status})")]
    NotActive {
        id: ConnectionId,
        status: SessionStatus,
    },

    #[error("Session {id} is {status}, disconnect it first")]
    StillActive {
        id: ConnectionId,
        status: SessionStatus,
    },

    /// Logged out but the server has not confirmed the disconnect yet
    #[error("Session {0} is still closing from the last logout")]
    Draining(ConnectionId),

    #[error("Empty command for session {0}")]
    EmptyCommand(ConnectionId),

    #[error("Maximum sessions reached: {0}")]
    MaxSessionsReached(usize),

    /// An inbound event the current state forbids. Dropped, never fatal.
    #[error("Protocol violation: {event} for {id} while {status}")]
    ProtocolViolation {
        id: ConnectionId,
        event: &'static str,
        status: SessionStatus,
    },

    #[error("Unroutable {0} frame without connection_id")]
    Unroutable(&'static str),

    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),
}

impl SessionError {
    /// Whether the error refused a user intent before anything was sent.
    /// Orchestrator failures are already recorded against the session.
    pub fn is_rejection(&self) -> bool {
        !matches!(
            self,
            Self::ProtocolViolation { .. } | Self::Unroutable(_) | Self::Orchestrator(_)
        )
    }
}

impl From<SessionError> for String {
    fn from(err: SessionError) -> String {
        err.to_string()
    }
}
