//! Channel Orchestrator
//!
//! Client-side orchestrator: every request becomes an `ssh_*` frame on the
//! event channel. Results come back through the channel's frame callback.
//! After a transport loss the channel can be swapped for a freshly opened one.

use log::{debug, info};
use parking_lot::Mutex;

use super::{Orchestrator, OrchestratorError, OrchestratorResult};
use crate::channel::EventChannel;
use crate::protocol::{ChannelEvent, ConnectionId, ProfileRef};

/// Orchestrator reached over the event channel
pub struct ChannelOrchestrator {
    channel: Mutex<EventChannel>,
}

impl ChannelOrchestrator {
    pub fn new(channel: EventChannel) -> Self {
        Self {
            channel: Mutex::new(channel),
        }
    }

    /// Whether requests can currently reach the server
    pub fn is_connected(&self) -> bool {
        self.channel.lock().is_open()
    }

    /// Route later requests over `channel`. Sessions are not restored; each
    /// one needs a new connect.
    pub fn replace_channel(&self, channel: EventChannel) {
        info!("Event channel replaced ({})", channel.transport_type());
        *self.channel.lock() = channel;
    }

    fn submit(&self, event: ChannelEvent) -> OrchestratorResult<()> {
        let Some(message) = event.to_client_message() else {
            return Ok(());
        };

        let channel = self.channel.lock();
        debug!(
            "Submitting {} for {} over {}",
            message.event_name(),
            message.connection_id(),
            channel.transport_type()
        );
        channel
            .send(message)
            .map_err(|_| OrchestratorError::ChannelClosed)
    }
}

impl Orchestrator for ChannelOrchestrator {
    fn connect(&self, id: &ConnectionId, _profile: Option<&ProfileRef>) -> OrchestratorResult<()> {
        self.submit(ChannelEvent::ConnectRequest { id: id.clone() })
    }

    fn send_command(&self, id: &ConnectionId, command: &str) -> OrchestratorResult<()> {
        self.submit(ChannelEvent::CommandRequest {
            id: id.clone(),
            text: command.to_string(),
        })
    }

    fn disconnect(&self, id: &ConnectionId) -> OrchestratorResult<()> {
        self.submit(ChannelEvent::DisconnectRequest { id: id.clone() })
    }

    fn orchestrator_type(&self) -> &'static str {
        "channel"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{memory_pair, ChannelSignal, MemoryTransport};
    use crate::protocol::{ClientMessage, ServerEnvelope, ServerMessage};
    use crate::session::{Input, SessionManager, SessionRegistry, SessionStatus};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_requests_become_frames() {
        let (transport, mut peer) = memory_pair();
        let (channel, _handle) = EventChannel::open(Box::new(transport), |_| {});
        let orchestrator = ChannelOrchestrator::new(channel);

        let id = ConnectionId::from(7);
        orchestrator.connect(&id, None).unwrap();
        orchestrator.send_command(&id, "ls").unwrap();
        orchestrator.disconnect(&id).unwrap();

        assert_eq!(
            peer.recv_client().await,
            Some(ClientMessage::SshConnect { connection_id: id.clone() })
        );
        assert_eq!(
            peer.recv_client().await,
            Some(ClientMessage::SshCommand {
                connection_id: id.clone(),
                command: "ls".to_string()
            })
        );
        assert_eq!(
            peer.recv_client().await,
            Some(ClientMessage::SshDisconnect { connection_id: id })
        );
    }

    #[tokio::test]
    async fn test_end_to_end_over_memory_channel() {
        let (transport, mut peer) = memory_pair();
        let (input_tx, input_rx) = mpsc::unbounded_channel::<Input>();
        let signal_tx = input_tx.clone();
        let (channel, _handle) = EventChannel::open(Box::new(transport), move |signal: ChannelSignal| {
            let _ = signal_tx.send(signal.into());
        });

        let registry = Arc::new(SessionRegistry::new());
        let manager = SessionManager::new(registry.clone(), Arc::new(ChannelOrchestrator::new(channel)));
        let mut events = registry.subscribe();
        tokio::spawn(manager.run(input_rx));

        let id = ConnectionId::from(2);
        input_tx
            .send(Input::Intent(crate::session::Intent::Connect {
                id: id.clone(),
                profile: None,
            }))
            .unwrap();
        assert_eq!(
            peer.recv_client().await,
            Some(ClientMessage::SshConnect { connection_id: id.clone() })
        );

        peer.push(ServerEnvelope::sequenced(
            1,
            ServerMessage::SshConnected {
                connection_id: id.clone(),
                message: None,
            },
        ));
        peer.fail("broken pipe");

        loop {
            let event = events.recv().await.unwrap();
            if let crate::session::SessionEvent::StatusChanged {
                new_status: SessionStatus::Disconnected,
                ..
            } = event
            {
                break;
            }
        }
        assert_eq!(registry.status(&id), Some(SessionStatus::Disconnected));
    }

    #[tokio::test]
    async fn test_sessions_reconnect_over_replacement_channel() {
        let (input_tx, input_rx) = mpsc::unbounded_channel::<Input>();
        let open = |transport: MemoryTransport| {
            let signal_tx = input_tx.clone();
            EventChannel::open(Box::new(transport), move |signal: ChannelSignal| {
                let _ = signal_tx.send(signal.into());
            })
            .0
        };

        let (first, mut first_peer) = memory_pair();
        let orchestrator = Arc::new(ChannelOrchestrator::new(open(first)));
        let registry = Arc::new(SessionRegistry::new());
        let manager = SessionManager::new(registry.clone(), orchestrator.clone());
        let events = registry.subscribe();
        tokio::spawn(manager.run(input_rx));

        let id = ConnectionId::from(5);
        let connect = || {
            Input::Intent(crate::session::Intent::Connect {
                id: id.clone(),
                profile: None,
            })
        };
        let connected = |seq: u64| {
            ServerEnvelope::sequenced(
                seq,
                ServerMessage::SshConnected {
                    connection_id: id.clone(),
                    message: None,
                },
            )
        };
        let wait_for = |events: &tokio::sync::broadcast::Receiver<crate::session::SessionEvent>,
                        wanted: SessionStatus| {
            let mut events = events.resubscribe();
            async move {
                loop {
                    if let crate::session::SessionEvent::StatusChanged { new_status, .. } =
                        events.recv().await.unwrap()
                    {
                        if new_status == wanted {
                            break;
                        }
                    }
                }
            }
        };

        let up = wait_for(&events, SessionStatus::Connected);
        input_tx.send(connect()).unwrap();
        assert!(first_peer.recv_client().await.is_some());
        first_peer.push(connected(1));
        up.await;

        let down = wait_for(&events, SessionStatus::Disconnected);
        first_peer.fail("connection reset");
        down.await;
        assert!(!orchestrator.is_connected());

        let (second, mut second_peer) = memory_pair();
        orchestrator.replace_channel(open(second));
        assert!(orchestrator.is_connected());

        let up = wait_for(&events, SessionStatus::Connected);
        input_tx.send(connect()).unwrap();
        assert_eq!(
            second_peer.recv_client().await,
            Some(ClientMessage::SshConnect { connection_id: id.clone() })
        );
        // numbering restarts on the new socket
        second_peer.push(connected(1));
        up.await;
        assert_eq!(registry.status(&id), Some(SessionStatus::Connected));
    }
}
