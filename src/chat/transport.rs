// Transport seam and wire frames
// The default transport is a JSON-over-websocket connection to the messaging backend

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::TransportError;
use crate::models::{Identity, MessageKey};

/// Events pushed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InboundFrame {
    #[serde(rename_all = "camelCase")]
    Presence { contact_id: String, status: String },

    #[serde(rename_all = "camelCase")]
    Message {
        peer_id: String,
        payload: String,
        server_seq: u64,
        #[serde(default)]
        timestamp: Option<u64>,
    },

    /// `peer_id` is optional on the wire; without it the ack is matched by
    /// local sequence number alone.
    #[serde(rename_all = "camelCase")]
    Ack {
        local_seq: u64,
        #[serde(default)]
        peer_id: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutboundFrame {
    #[serde(rename_all = "camelCase")]
    Message {
        peer_id: String,
        payload: String,
        local_seq: u64,
    },
}

impl OutboundFrame {
    pub fn key(&self) -> MessageKey {
        match self {
            OutboundFrame::Message { peer_id, local_seq, .. } => {
                MessageKey::new(peer_id.clone(), *local_seq)
            }
        }
    }
}

/// Opens authenticated links to the backend. One call per connection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, identity: &Identity) -> Result<Box<dyn TransportLink>, TransportError>;
}

/// One established bidirectional connection.
///
/// `recv` must be cancel-safe: the connection manager polls it inside
/// `tokio::select!` alongside the outbound queue.
#[async_trait]
pub trait TransportLink: Send {
    async fn send(&mut self, frame: &OutboundFrame) -> Result<(), TransportError>;

    /// `Ok(None)` means the peer closed the connection cleanly.
    async fn recv(&mut self) -> Result<Option<InboundFrame>, TransportError>;

    async fn close(&mut self);
}

/// Connects to a websocket endpoint, passing the identity id as the
/// `userId` query parameter and the credential as a bearer token.
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        WebSocketConnector { url: url.into() }
    }

    fn endpoint_for(&self, identity: &Identity) -> String {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}userId={}", self.url, separator, identity.id)
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, identity: &Identity) -> Result<Box<dyn TransportLink>, TransportError> {
        let endpoint = self.endpoint_for(identity);
        let mut request = endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Connect(format!("Invalid endpoint '{}': {}", endpoint, e)))?;

        let bearer = HeaderValue::from_str(&format!("Bearer {}", identity.credential()))
            .map_err(|e| TransportError::Connect(format!("Invalid credential header: {}", e)))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        debug!("Opening websocket to {}", self.url);
        let (stream, response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        info!("Websocket handshake completed with status {}", response.status());

        Ok(Box::new(WebSocketLink { stream }))
    }
}

struct WebSocketLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl TransportLink for WebSocketLink {
    async fn send(&mut self, frame: &OutboundFrame) -> Result<(), TransportError> {
        let text = serde_json::to_string(frame)
            .map_err(|e| TransportError::Io(format!("Failed to encode frame: {}", e)))?;
        self.stream
            .send(WsMessage::Text(text))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<InboundFrame>, TransportError> {
        loop {
            let message = match self.stream.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => return Err(TransportError::Io(e.to_string())),
                None => return Ok(None),
            };

            let decoded = match message {
                WsMessage::Text(text) => serde_json::from_str::<InboundFrame>(&text),
                WsMessage::Binary(bytes) => serde_json::from_slice::<InboundFrame>(&bytes),
                WsMessage::Close(reason) => {
                    info!("Server closed the websocket: {:?}", reason);
                    return Ok(None);
                }
                // Pings are answered by tungstenite itself
                _ => continue,
            };

            match decoded {
                Ok(frame) => return Ok(Some(frame)),
                Err(e) => warn!("Skipping undecodable frame: {}", e),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!("Error while closing websocket: {}", e);
        }
    }
}
