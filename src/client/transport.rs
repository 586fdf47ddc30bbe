//! WebSocket dialing shared by the daemon and the one-shot client.

use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::bundle::unix_now;
use crate::protocol::{AuthRequest, Message, ProtocolError};
use crate::security::SignatureVerifier;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Client-side connection errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: Box<tungstenite::Error>,
    },

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("connection closed by server")]
    Closed,

    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("server error {code}: {message}")]
    Server { code: i32, message: String },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("transport error: {0}")]
    Transport(Box<tungstenite::Error>),
}

impl From<tungstenite::Error> for ClientError {
    fn from(e: tungstenite::Error) -> Self {
        ClientError::Transport(Box::new(e))
    }
}

/// Accept `http(s)://host`, `ws(s)://host` or a bare `host:port` and return
/// the WebSocket endpoint URL.
pub fn normalize_url(url: &str) -> String {
    let url = url.trim().trim_end_matches('/');
    let mut out = if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if url.starts_with("ws://") || url.starts_with("wss://") {
        url.to_string()
    } else {
        format!("ws://{url}")
    };

    if !out.ends_with("/ws") {
        out.push_str("/ws");
    }
    out
}

/// Dial the server with a bounded handshake.
pub async fn connect(server_url: &str) -> Result<WsStream, ClientError> {
    let url = normalize_url(server_url);
    debug!(url = %url, "Connecting");

    let (stream, _response) = tokio::time::timeout(HANDSHAKE_TIMEOUT, connect_async(url.as_str()))
        .await
        .map_err(|_| ClientError::Timeout("handshake"))?
        .map_err(|source| ClientError::Connect {
            url: url.clone(),
            source: Box::new(source),
        })?;
    Ok(stream)
}

/// Signed `auth` frame for the current time.
pub fn auth_frame(
    verifier: &SignatureVerifier,
    client_id: &str,
    domains: Vec<String>,
) -> Result<WsMessage, ClientError> {
    let timestamp = unix_now();
    let envelope = Message::Auth(AuthRequest {
        client_id: client_id.to_string(),
        signature: verifier.sign(timestamp),
        domains,
    })
    .into_envelope_at(timestamp)?;
    Ok(WsMessage::Text(envelope.encode()?))
}

/// Encode a message as a text frame.
pub fn text_frame(message: Message) -> Result<WsMessage, ClientError> {
    Ok(WsMessage::Text(message.encode()?))
}
