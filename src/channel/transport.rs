//! Channel Transport Abstraction
//!
//! One bidirectional, ordered connection to the server carrying `ssh_*` frames:
//! - WebSocket (production)
//! - In-memory pair (tests, embedding)

use async_trait::async_trait;

use super::ChannelResult;
use crate::protocol::{ClientMessage, ServerEnvelope};

/// Transport trait for the event channel
#[async_trait]
pub trait ChannelTransport: Send {
    /// Write one client frame
    async fn send(&mut self, message: &ClientMessage) -> ChannelResult<()>;

    /// Next server frame, or `None` once the peer closed the connection.
    ///
    /// Must be cancel-safe: the channel pump races it against outbound sends.
    async fn recv(&mut self) -> ChannelResult<Option<ServerEnvelope>>;

    /// Close the connection
    async fn close(&mut self) -> ChannelResult<()>;

    /// Get transport type name
    fn transport_type(&self) -> &'static str;
}
