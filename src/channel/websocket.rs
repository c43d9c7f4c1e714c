//! WebSocket Transport
//!
//! Text frames, one JSON object each. Authentication is a bearer token sent
//! with the upgrade request.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::transport::ChannelTransport;
use super::{ChannelError, ChannelResult};
use crate::protocol::{ClientMessage, ServerEnvelope};

/// WebSocket transport to the session server
pub struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    url: String,
}

impl WebSocketTransport {
    /// Open the socket at `url` (`ws://host:port/ws`)
    pub async fn connect(url: &str, token: Option<&str>) -> ChannelResult<Self> {
        let mut request = url
            .into_client_request()
            .map_err(|e| ChannelError::InvalidConfig(format!("{}: {}", url, e)))?;

        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| ChannelError::InvalidConfig(format!("Invalid token: {}", e)))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (stream, response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| ChannelError::Connect(format!("{}: {}", url, e)))?;

        info!("Event channel open to {} ({})", url, response.status());

        Ok(Self {
            stream,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl ChannelTransport for WebSocketTransport {
    async fn send(&mut self, message: &ClientMessage) -> ChannelResult<()> {
        let text = serde_json::to_string(message)?;
        debug!("-> {}", text);
        self.stream.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn recv(&mut self) -> ChannelResult<Option<ServerEnvelope>> {
        while let Some(message) = self.stream.next().await {
            match message? {
                Message::Text(text) => match serde_json::from_str::<ServerEnvelope>(text.as_str()) {
                    Ok(envelope) => {
                        debug!("<- {}", text.as_str());
                        return Ok(Some(envelope));
                    }
                    // A frame we cannot decode is skipped, not fatal
                    Err(e) => warn!("Undecodable frame from {}: {}", self.url, e),
                },
                Message::Close(frame) => {
                    debug!("Close frame from {}: {:?}", self.url, frame);
                    return Ok(None);
                }
                _ => {}
            }
        }
        Ok(None)
    }

    async fn close(&mut self) -> ChannelResult<()> {
        self.stream.close(None).await?;
        Ok(())
    }

    fn transport_type(&self) -> &'static str {
        "websocket"
    }
}
