//! Channel Events
//!
//! Typed inputs of the session state machine. Outbound requests originate from
//! user intents; inbound events are decoded from server frames.

use serde::{Deserialize, Serialize};

use super::types::{ConnectionId, LogKind};
use super::wire::{ClientMessage, ServerMessage};

/// Why a session reached `Disconnected`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// The server reported `ssh_disconnected`
    Remote,
    /// The channel itself dropped; synthesized locally
    TransportLost,
}

/// One event on the session channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    ConnectRequest { id: ConnectionId },
    Connected { id: ConnectionId },
    CommandRequest { id: ConnectionId, text: String },
    Output {
        id: ConnectionId,
        text: String,
        kind: LogKind,
    },
    Error { id: ConnectionId, message: String },
    DisconnectRequest { id: ConnectionId },
    Disconnected {
        id: ConnectionId,
        reason: DisconnectReason,
    },
}

impl ChannelEvent {
    /// Short name used in logs and protocol-violation reports
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConnectRequest { .. } => "ConnectRequest",
            Self::Connected { .. } => "Connected",
            Self::CommandRequest { .. } => "CommandRequest",
            Self::Output { .. } => "Output",
            Self::Error { .. } => "Error",
            Self::DisconnectRequest { .. } => "DisconnectRequest",
            Self::Disconnected { .. } => "Disconnected",
        }
    }

    /// Outbound frame for a request event
    pub fn to_client_message(&self) -> Option<ClientMessage> {
        match self {
            Self::ConnectRequest { id } => Some(ClientMessage::SshConnect {
                connection_id: id.clone(),
            }),
            Self::CommandRequest { id, text } => Some(ClientMessage::SshCommand {
                connection_id: id.clone(),
                command: text.clone(),
            }),
            Self::DisconnectRequest { id } => Some(ClientMessage::SshDisconnect {
                connection_id: id.clone(),
            }),
            _ => None,
        }
    }
}

impl ServerMessage {
    /// Decode into state-machine events, in the order they must be applied.
    ///
    /// `ssh_output` yields one event per non-empty text field, stdout first.
    /// An `ssh_error` without a connection id yields nothing.
    pub fn into_events(self) -> Vec<ChannelEvent> {
        match self {
            Self::SshConnected { connection_id, .. } => {
                vec![ChannelEvent::Connected { id: connection_id }]
            }
            Self::SshOutput {
                connection_id,
                output,
                error,
                ..
            } => {
                let mut events = Vec::with_capacity(2);
                if let Some(text) = output.filter(|t| !t.is_empty()) {
                    events.push(ChannelEvent::Output {
                        id: connection_id.clone(),
                        text,
                        kind: LogKind::Output,
                    });
                }
                if let Some(text) = error.filter(|t| !t.is_empty()) {
                    events.push(ChannelEvent::Output {
                        id: connection_id,
                        text,
                        kind: LogKind::Error,
                    });
                }
                events
            }
            Self::SshError {
                connection_id: Some(id),
                message,
            } => vec![ChannelEvent::Error { id, message }],
            Self::SshError {
                connection_id: None,
                ..
            } => Vec::new(),
            Self::SshDisconnected { connection_id } => vec![ChannelEvent::Disconnected {
                id: connection_id,
                reason: DisconnectReason::Remote,
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dual_field_output_yields_two_events() {
        let events = ServerMessage::SshOutput {
            connection_id: ConnectionId::from(7),
            output: Some("file.txt".to_string()),
            error: Some("ls: denied".to_string()),
            exit_code: Some(1),
        }
        .into_events();

        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], ChannelEvent::Output { kind: LogKind::Output, text, .. } if text == "file.txt"));
        assert!(matches!(&events[1], ChannelEvent::Output { kind: LogKind::Error, text, .. } if text == "ls: denied"));
    }

    #[test]
    fn test_empty_output_fields_are_skipped() {
        let events = ServerMessage::SshOutput {
            connection_id: ConnectionId::from(7),
            output: Some(String::new()),
            error: None,
            exit_code: Some(0),
        }
        .into_events();
        assert!(events.is_empty());
    }

    #[test]
    fn test_request_events_map_to_frames() {
        let event = ChannelEvent::DisconnectRequest {
            id: ConnectionId::from(2),
        };
        assert_eq!(
            event.to_client_message(),
            Some(ClientMessage::SshDisconnect {
                connection_id: ConnectionId::from(2)
            })
        );

        let inbound = ChannelEvent::Connected {
            id: ConnectionId::from(2),
        };
        assert!(inbound.to_client_message().is_none());
    }
}
