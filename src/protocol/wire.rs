//! Wire Messages
//!
//! JSON frames carried by the event channel. Every frame is an object tagged by
//! `event`; server frames additionally carry a per-connection `seq`.

use serde::{Deserialize, Serialize};

use super::types::ConnectionId;

/// Client -> server frames
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Open the remote shell for a stored connection profile
    SshConnect { connection_id: ConnectionId },
    /// Run a command in an open session
    SshCommand {
        connection_id: ConnectionId,
        command: String,
    },
    /// Close an open session
    SshDisconnect { connection_id: ConnectionId },
}

impl ClientMessage {
    /// Connection this frame addresses
    pub fn connection_id(&self) -> &ConnectionId {
        match self {
            Self::SshConnect { connection_id } => connection_id,
            Self::SshCommand { connection_id, .. } => connection_id,
            Self::SshDisconnect { connection_id } => connection_id,
        }
    }

    /// Wire event name
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::SshConnect { .. } => "ssh_connect",
            Self::SshCommand { .. } => "ssh_command",
            Self::SshDisconnect { .. } => "ssh_disconnect",
        }
    }
}

/// Server -> client frames
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Remote shell is open
    SshConnected {
        connection_id: ConnectionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Result of a command. Either text field may be absent.
    SshOutput {
        connection_id: ConnectionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    /// Opening or running the remote shell failed
    SshError {
        /// Older servers omit the id on some failures; such frames cannot be routed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connection_id: Option<ConnectionId>,
        message: String,
    },
    /// Remote shell is closed
    SshDisconnected { connection_id: ConnectionId },
}

impl ServerMessage {
    /// Connection this frame belongs to, if the server named one
    pub fn connection_id(&self) -> Option<&ConnectionId> {
        match self {
            Self::SshConnected { connection_id, .. } => Some(connection_id),
            Self::SshOutput { connection_id, .. } => Some(connection_id),
            Self::SshError { connection_id, .. } => connection_id.as_ref(),
            Self::SshDisconnected { connection_id } => Some(connection_id),
        }
    }

    /// Wire event name
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::SshConnected { .. } => "ssh_connected",
            Self::SshOutput { .. } => "ssh_output",
            Self::SshError { .. } => "ssh_error",
            Self::SshDisconnected { .. } => "ssh_disconnected",
        }
    }
}

/// A server frame with its delivery sequence number.
///
/// `seq` is assigned per connection id and increases for the lifetime of one
/// channel connection; receivers use it to drop redelivered frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(flatten)]
    pub message: ServerMessage,
}

impl ServerEnvelope {
    /// Wrap a frame with a sequence number
    pub fn sequenced(seq: u64, message: ServerMessage) -> Self {
        Self {
            seq: Some(seq),
            message,
        }
    }

    /// Wrap a frame without a sequence number
    pub fn unsequenced(message: ServerMessage) -> Self {
        Self { seq: None, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_message_wire_shape() {
        let msg = ClientMessage::SshCommand {
            connection_id: ConnectionId::from(7),
            command: "ls".to_string(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({"event": "ssh_command", "connection_id": "7", "command": "ls"})
        );
        assert_eq!(msg.event_name(), "ssh_command");
    }

    #[test]
    fn test_server_envelope_parses_numeric_ids_and_seq() {
        let envelope: ServerEnvelope = serde_json::from_value(json!({
            "event": "ssh_output",
            "connection_id": 7,
            "output": "file.txt",
            "exit_code": 0,
            "seq": 4
        }))
        .unwrap();

        assert_eq!(envelope.seq, Some(4));
        assert_eq!(
            envelope.message,
            ServerMessage::SshOutput {
                connection_id: ConnectionId::from(7),
                output: Some("file.txt".to_string()),
                error: None,
                exit_code: Some(0),
            }
        );
    }

    #[test]
    fn test_ssh_error_without_connection_id() {
        let envelope: ServerEnvelope = serde_json::from_value(json!({
            "event": "ssh_error",
            "message": "Connection not found"
        }))
        .unwrap();
        assert_eq!(envelope.seq, None);
        assert!(envelope.message.connection_id().is_none());
        assert_eq!(envelope.message.event_name(), "ssh_error");
    }

    #[test]
    fn test_unknown_event_is_rejected() {
        let result: Result<ServerEnvelope, _> =
            serde_json::from_value(json!({"event": "ssh_teleport", "connection_id": 1}));
        assert!(result.is_err());
    }
}
