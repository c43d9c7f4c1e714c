//! Event Channel Module
//!
//! Client side of the single connection every session is multiplexed over. A
//! pump task owns the transport: it writes queued client frames and hands each
//! decoded server frame, in arrival order, to one callback. When the transport
//! fails the callback gets exactly one `Closed` signal.

pub mod memory;
pub mod transport;
pub mod websocket;

use log::{debug, warn};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::protocol::{ClientMessage, ServerEnvelope};

pub use memory::{memory_pair, MemoryPeer, MemoryTransport};
pub use transport::ChannelTransport;
pub use websocket::WebSocketTransport;

/// Event channel errors
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Channel closed")]
    Closed,
}

impl From<tokio_tungstenite::tungstenite::Error> for ChannelError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ChannelError::Transport(err.to_string())
    }
}

impl From<ChannelError> for String {
    fn from(err: ChannelError) -> String {
        err.to_string()
    }
}

/// Result type alias for channel operations
pub type ChannelResult<T> = Result<T, ChannelError>;

/// What the pump reports to its owner
#[derive(Debug, Clone)]
pub enum ChannelSignal {
    /// A decoded server frame
    Frame(ServerEnvelope),
    /// The transport dropped; no further frames follow
    Closed { reason: String },
}

/// Handle for writing to an open event channel
#[derive(Clone)]
pub struct EventChannel {
    outbound: mpsc::UnboundedSender<ClientMessage>,
    transport_type: &'static str,
}

impl EventChannel {
    /// Spawn the pump for `transport`. Dropping every `EventChannel` clone
    /// closes the transport without a `Closed` signal.
    pub fn open<F>(transport: Box<dyn ChannelTransport>, on_signal: F) -> (Self, JoinHandle<()>)
    where
        F: Fn(ChannelSignal) + Send + 'static,
    {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let transport_type = transport.transport_type();
        let handle = tokio::spawn(pump(transport, outbound_rx, on_signal));

        (
            Self {
                outbound,
                transport_type,
            },
            handle,
        )
    }

    /// Queue a client frame
    pub fn send(&self, message: ClientMessage) -> ChannelResult<()> {
        self.outbound.send(message).map_err(|_| ChannelError::Closed)
    }

    /// Whether the pump is still running
    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    pub fn transport_type(&self) -> &'static str {
        self.transport_type
    }
}

async fn pump<F>(
    mut transport: Box<dyn ChannelTransport>,
    mut outbound: mpsc::UnboundedReceiver<ClientMessage>,
    on_signal: F,
) where
    F: Fn(ChannelSignal) + Send + 'static,
{
    let failure = loop {
        tokio::select! {
            message = outbound.recv() => match message {
                Some(message) => {
                    if let Err(e) = transport.send(&message).await {
                        break Some(format!("send {} failed: {}", message.event_name(), e));
                    }
                }
                None => {
                    if let Err(e) = transport.close().await {
                        debug!("Closing {} transport: {}", transport.transport_type(), e);
                    }
                    break None;
                }
            },
            frame = transport.recv() => match frame {
                Ok(Some(envelope)) => on_signal(ChannelSignal::Frame(envelope)),
                Ok(None) => break Some("closed by server".to_string()),
                Err(e) => break Some(e.to_string()),
            },
        }
    };

    if let Some(reason) = failure {
        warn!("Event channel ({}) lost: {}", transport.transport_type(), reason);
        on_signal(ChannelSignal::Closed { reason });
    }
}
