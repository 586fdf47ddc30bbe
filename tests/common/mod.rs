//! Shared fixtures for the integration tests: on-disk bundles, server
//! configuration and a raw WebSocket peer speaking the envelope protocol.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use certdeliver::bundle::unix_now;
use certdeliver::config::{ClientConfig, ServerConfig};
use certdeliver::protocol::{AuthRequest, AuthResponse, Envelope, Message};
use certdeliver::security::SignatureVerifier;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub type TestSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const SECRET: &str = "integration-secret";
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Server bound to an ephemeral loopback port with a short debounce.
pub fn server_config(cert_dir: &Path) -> ServerConfig {
    ServerConfig {
        bind: "127.0.0.1".to_string(),
        port: 0,
        cert_dir: cert_dir.to_path_buf(),
        key: SECRET.to_string(),
        debounce_ms: 300,
        tick_ms: 100,
        ..Default::default()
    }
}

pub fn client_config(addr: SocketAddr, work_dir: &Path, subscribe: &[&str]) -> ClientConfig {
    ClientConfig {
        server_url: format!("ws://{}/ws", addr),
        password: SECRET.to_string(),
        client_id: "test-client".to_string(),
        work_dir: work_dir.to_path_buf(),
        subscribe: subscribe.iter().map(|s| s.to_string()).collect(),
        reconnect_interval_secs: 1,
        reload_debounce_secs: 1,
        ..Default::default()
    }
}

/// Write a complete bundle for `domain` with marker timestamp `ts`.
pub fn write_bundle(root: &Path, domain: &str, ts: i64) -> PathBuf {
    let dir = root.join(domain);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("cert.pem"), format!("CERT {domain} {ts}")).unwrap();
    std::fs::write(dir.join("key.pem"), format!("KEY {domain}")).unwrap();
    std::fs::write(dir.join("fullchain.pem"), format!("CHAIN {domain}")).unwrap();
    std::fs::write(dir.join("time.log"), ts.to_string()).unwrap();
    dir
}

pub async fn connect(addr: SocketAddr) -> TestSocket {
    let (ws, _) = connect_async(format!("ws://{}/ws", addr))
        .await
        .expect("websocket connect");
    ws
}

pub async fn send(ws: &mut TestSocket, message: Message) {
    ws.send(WsMessage::Text(message.encode().unwrap()))
        .await
        .unwrap();
}

pub async fn send_envelope(ws: &mut TestSocket, envelope: &Envelope) {
    ws.send(WsMessage::Text(envelope.encode().unwrap()))
        .await
        .unwrap();
}

/// Next protocol message, skipping transport frames.
pub async fn recv(ws: &mut TestSocket) -> Message {
    loop {
        let frame = tokio::time::timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for message")
            .expect("stream ended")
            .expect("transport error");
        if let WsMessage::Text(text) = frame {
            return Envelope::decode(&text).unwrap().message().unwrap();
        }
    }
}

/// True if nothing arrives within `window`.
pub async fn silent_for(ws: &mut TestSocket, window: Duration) -> bool {
    loop {
        match tokio::time::timeout(window, ws.next()).await {
            Err(_) => return true,
            Ok(Some(Ok(WsMessage::Text(_)))) => return false,
            Ok(Some(Ok(_))) => continue,
            Ok(_) => return true,
        }
    }
}

pub fn auth_message(secret: &str, client_id: &str, domains: &[&str], timestamp: i64) -> Envelope {
    Message::Auth(AuthRequest {
        client_id: client_id.to_string(),
        signature: SignatureVerifier::new(secret).sign(timestamp),
        domains: domains.iter().map(|d| d.to_string()).collect(),
    })
    .into_envelope_at(timestamp)
    .unwrap()
}

/// Authenticate with the shared secret for the current time.
pub async fn authenticate(ws: &mut TestSocket, client_id: &str, domains: &[&str]) -> AuthResponse {
    send_envelope(ws, &auth_message(SECRET, client_id, domains, unix_now())).await;
    match recv(ws).await {
        Message::AuthResult(resp) => resp,
        other => panic!("expected auth_result, got {:?}", other),
    }
}
