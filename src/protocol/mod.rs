//! Session Protocol Module
//!
//! Wire messages exchanged over the event channel and the typed events the
//! session state machine consumes:
//! - `ssh_*` client/server frames (JSON, tagged by `event`)
//! - Channel events, one per state-machine input
//! - Shared identifiers and profile references

pub mod events;
pub mod types;
pub mod wire;

pub use events::{ChannelEvent, DisconnectReason};
pub use types::{ConnectionId, LogKind, ProfileRef};
pub use wire::{ClientMessage, ServerEnvelope, ServerMessage};
