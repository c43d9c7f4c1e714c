//! Session Management Module
//!
//! Client-side lifecycle of multiplexed remote shells:
//! - Per-session state machine (Idle through Disconnected/Failed)
//! - Concurrent registry keyed by connection id (DashMap)
//! - Ordered, exportable output log per session
//! - Single dispatch loop for intents and channel frames

pub mod error;
pub mod events;
pub mod log;
pub mod machine;
pub mod manager;
pub mod registry;
pub mod state;

pub use error::SessionError;
pub use events::SessionEvent;
pub use log::{LogLine, OutputLog};
pub use machine::{Effect, Step};
pub use manager::{Input, Intent, SessionManager};
pub use registry::SessionRegistry;
pub use state::{Session, SessionInfo, SessionStatus};
