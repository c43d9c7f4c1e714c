//! Connection Orchestrator Module
//!
//! The capability that owns real remote shells. The client reaches it through
//! the event channel (`ChannelOrchestrator`); the server implements it with the
//! system `ssh` client (`ProcessOrchestrator`). Every call only submits work:
//! results arrive later as `ssh_*` events for the same connection id.

pub mod channel;
pub mod emitter;
pub mod process;

use thiserror::Error;

use crate::protocol::{ConnectionId, ProfileRef};

pub use channel::ChannelOrchestrator;
pub use emitter::{EventEmitter, SessionEmitter};
pub use process::ProcessOrchestrator;

/// Orchestrator submission errors
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Event channel closed")]
    ChannelClosed,

    #[error("Maximum connections reached ({0})")]
    SessionLimit(usize),

    #[error("ssh binary not found: {0}")]
    BinaryNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for orchestrator operations
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Remote shell capability.
///
/// Implementations must not block: each call returns as soon as the request is
/// queued. For any one id, the resulting events are emitted in the order the
/// remote session produced them.
pub trait Orchestrator: Send + Sync {
    /// Open the shell for `id`. The profile, when given, is informational; the
    /// owner of the real connection resolves credentials itself.
    fn connect(&self, id: &ConnectionId, profile: Option<&ProfileRef>) -> OrchestratorResult<()>;

    /// Run a command in the open shell for `id`
    fn send_command(&self, id: &ConnectionId, command: &str) -> OrchestratorResult<()>;

    /// Close the shell for `id`
    fn disconnect(&self, id: &ConnectionId) -> OrchestratorResult<()>;

    /// Implementation name for logging
    fn orchestrator_type(&self) -> &'static str;
}
