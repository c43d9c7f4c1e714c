//! In-Memory Transport
//!
//! A transport connected to a `MemoryPeer` instead of a socket. The peer plays
//! the server: it reads client frames and pushes server frames or failures.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::transport::ChannelTransport;
use super::{ChannelError, ChannelResult};
use crate::protocol::{ClientMessage, ServerEnvelope};

/// Client end of an in-memory channel
pub struct MemoryTransport {
    inbound: mpsc::UnboundedReceiver<Result<ServerEnvelope, String>>,
    outbound: mpsc::UnboundedSender<ClientMessage>,
}

/// Server end of an in-memory channel
pub struct MemoryPeer {
    inbound: mpsc::UnboundedSender<Result<ServerEnvelope, String>>,
    outbound: mpsc::UnboundedReceiver<ClientMessage>,
}

/// Create a connected transport/peer pair
pub fn memory_pair() -> (MemoryTransport, MemoryPeer) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

    (
        MemoryTransport {
            inbound: inbound_rx,
            outbound: outbound_tx,
        },
        MemoryPeer {
            inbound: inbound_tx,
            outbound: outbound_rx,
        },
    )
}

impl MemoryPeer {
    /// Deliver a server frame
    pub fn push(&self, envelope: ServerEnvelope) -> bool {
        self.inbound.send(Ok(envelope)).is_ok()
    }

    /// Make the client's next read fail
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.inbound.send(Err(reason.into())).is_ok()
    }

    /// Next frame the client wrote
    pub async fn recv_client(&mut self) -> Option<ClientMessage> {
        self.outbound.recv().await
    }
}

#[async_trait]
impl ChannelTransport for MemoryTransport {
    async fn send(&mut self, message: &ClientMessage) -> ChannelResult<()> {
        self.outbound
            .send(message.clone())
            .map_err(|_| ChannelError::Closed)
    }

    async fn recv(&mut self) -> ChannelResult<Option<ServerEnvelope>> {
        match self.inbound.recv().await {
            Some(Ok(envelope)) => Ok(Some(envelope)),
            Some(Err(reason)) => Err(ChannelError::Transport(reason)),
            None => Ok(None),
        }
    }

    async fn close(&mut self) -> ChannelResult<()> {
        self.inbound.close();
        Ok(())
    }

    fn transport_type(&self) -> &'static str {
        "memory"
    }
}
