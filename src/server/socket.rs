//! WebSocket Handling
//!
//! One socket is one event channel. Each socket owns its emitter and its
//! process orchestrator; when the socket closes, every shell it opened is
//! shut down.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::auth::{self, TokenQuery};
use super::AppState;
use crate::orchestrator::{EventEmitter, Orchestrator, OrchestratorResult, ProcessOrchestrator};
use crate::protocol::{ClientMessage, ServerEnvelope, ServerMessage};

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Response {
    if let Err(rejection) = auth::authorize(&state, &headers, &query) {
        return rejection.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let socket_id = Uuid::new_v4();
    info!("Socket {} connected", socket_id);

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ServerEnvelope>();
    let emitter = EventEmitter::new(outbound_tx);

    let send_task = tokio::spawn(async move {
        while let Some(envelope) = outbound_rx.recv().await {
            let text = match serde_json::to_string(&envelope) {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to serialize {}: {}", envelope.message.event_name(), e);
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                debug!("WebSocket send failed, client disconnected");
                break;
            }
        }
    });

    let orchestrator =
        match ProcessOrchestrator::new(state.settings.clone(), state.profiles.clone(), emitter.clone()) {
            Ok(orchestrator) => orchestrator,
            Err(e) => {
                error!("Socket {}: cannot start orchestrator: {}", socket_id, e);
                emitter.emit_unrouted(ServerMessage::SshError {
                    connection_id: None,
                    message: e.to_string(),
                });
                drop(emitter);
                let _ = send_task.await;
                return;
            }
        };

    while let Some(result) = ws_rx.next().await {
        let text = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => {
                debug!("Socket {} sent close frame", socket_id);
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!("Socket {} error: {}", socket_id, e);
                break;
            }
        };

        match serde_json::from_str::<ClientMessage>(text.as_str()) {
            Ok(message) => route(&orchestrator, &emitter, message),
            Err(e) => {
                warn!("Socket {}: unparseable frame: {}", socket_id, e);
                emitter.emit_unrouted(ServerMessage::SshError {
                    connection_id: None,
                    message: format!("Invalid message: {}", e),
                });
            }
        }
    }

    orchestrator.shutdown_all();
    send_task.abort();
    info!("Socket {} closed", socket_id);
}

/// Hand one client frame to the orchestrator. A submission failure is
/// reported to the client as `ssh_error` for that connection.
pub fn route(orchestrator: &dyn Orchestrator, emitter: &EventEmitter, message: ClientMessage) {
    debug!("{} for {}", message.event_name(), message.connection_id());

    let id = message.connection_id().clone();
    let result: OrchestratorResult<()> = match message {
        ClientMessage::SshConnect { connection_id } => orchestrator.connect(&connection_id, None),
        ClientMessage::SshCommand {
            connection_id,
            command,
        } => orchestrator.send_command(&connection_id, &command),
        ClientMessage::SshDisconnect { connection_id } => orchestrator.disconnect(&connection_id),
    };

    if let Err(e) = result {
        error!("{} failed for {}: {}", orchestrator.orchestrator_type(), id, e);
        emitter.session(&id).error(e.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::OrchestratorError;
    use crate::protocol::{ConnectionId, ProfileRef};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct SpyOrchestrator {
        calls: Mutex<Vec<String>>,
    }

    impl Orchestrator for SpyOrchestrator {
        fn connect(&self, id: &ConnectionId, _profile: Option<&ProfileRef>) -> OrchestratorResult<()> {
            self.calls.lock().push(format!("connect:{}", id));
            Err(OrchestratorError::SessionLimit(0))
        }

        fn send_command(&self, id: &ConnectionId, command: &str) -> OrchestratorResult<()> {
            self.calls.lock().push(format!("command:{}:{}", id, command));
            Ok(())
        }

        fn disconnect(&self, id: &ConnectionId) -> OrchestratorResult<()> {
            self.calls.lock().push(format!("disconnect:{}", id));
            Ok(())
        }

        fn orchestrator_type(&self) -> &'static str {
            "spy"
        }
    }

    #[test]
    fn test_route_dispatches_and_reports_failures() {
        let spy = SpyOrchestrator::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let emitter = EventEmitter::new(tx);
        let id = ConnectionId::from(4);

        route(&spy, &emitter, ClientMessage::SshCommand {
            connection_id: id.clone(),
            command: "df -h".to_string(),
        });
        route(&spy, &emitter, ClientMessage::SshConnect { connection_id: id.clone() });

        assert_eq!(*spy.calls.lock(), vec!["command:4:df -h", "connect:4"]);
        let frame = rx.try_recv().unwrap();
        assert_eq!(
            frame.message,
            ServerMessage::SshError {
                connection_id: Some(id),
                message: "Maximum connections reached (0)".to_string(),
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_socket_round_trip() {
        use crate::channel::{ChannelTransport, WebSocketTransport};
        use crate::config::ServerConfig;
        use crate::server::router;

        let mut config = ServerConfig::default();
        config.api_tokens = vec!["secret".to_string()];
        // never spawned for unknown profiles
        config.ssh.binary = "false".to_string();
        let app = router(Arc::new(AppState::new(&config)));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let url = format!("ws://{}/ws", addr);
        assert!(WebSocketTransport::connect(&url, None).await.is_err());

        let mut transport = WebSocketTransport::connect(&url, Some("secret")).await.unwrap();
        let id = ConnectionId::from(99);
        transport
            .send(&ClientMessage::SshConnect { connection_id: id.clone() })
            .await
            .unwrap();
        transport
            .send(&ClientMessage::SshDisconnect { connection_id: id.clone() })
            .await
            .unwrap();

        let first = transport.recv().await.unwrap().unwrap();
        assert_eq!(first.seq, Some(1));
        assert_eq!(
            first.message,
            ServerMessage::SshError {
                connection_id: Some(id.clone()),
                message: "Connection not found".to_string(),
            }
        );

        let second = transport.recv().await.unwrap().unwrap();
        assert_eq!(second.seq, Some(2));
        assert_eq!(second.message, ServerMessage::SshDisconnected { connection_id: id });

        transport.close().await.unwrap();
    }
}
