//! Per-connection session.
//!
//! Each accepted WebSocket runs a read loop (this task) and a write loop
//! (spawned) around one bounded mailbox. Only the write loop touches the
//! sink, so frames are never interleaved. Both loops share a cancellation
//! token: whichever ends first cancels it and the other follows. The hub
//! cancels the same token on deregistration.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::hub::{Connection, Hub};
use super::pattern::{self, normalize_patterns};
use super::status::collect_all;
use super::store::{CertStore, StoreError};
use crate::bundle::unix_now;
use crate::protocol::{
    AuthRequest, AuthResponse, CertPush, CertRequest, CertResponse, ClientStatusInfo, Envelope,
    ErrorData, Message, StatusResponse, SubscribeRequest, SyncRequest,
};
use crate::security::SignatureVerifier;

/// Everything a session needs from the server.
pub struct SessionContext {
    pub hub: Arc<Hub>,
    pub store: CertStore,
    pub verifier: SignatureVerifier,
    pub mailbox_capacity: usize,
    pub ping_interval: Duration,
    pub read_timeout: Duration,
    /// Parent token; cancelling it ends every session
    pub shutdown: CancellationToken,
}

enum SessionState {
    Connected,
    Authenticated(Arc<Connection>),
    Closed,
}

/// Inbound message dispatcher and authentication gate for one connection.
pub struct SessionHandler {
    ctx: Arc<SessionContext>,
    remote_addr: SocketAddr,
    outbox: mpsc::Sender<Envelope>,
    close: CancellationToken,
    state: SessionState,
}

impl SessionHandler {
    pub fn new(
        ctx: Arc<SessionContext>,
        remote_addr: SocketAddr,
        outbox: mpsc::Sender<Envelope>,
        close: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            remote_addr,
            outbox,
            close,
            state: SessionState::Connected,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self.state, SessionState::Authenticated(_))
    }

    pub fn connection(&self) -> Option<&Arc<Connection>> {
        match &self.state {
            SessionState::Authenticated(conn) => Some(conn),
            _ => None,
        }
    }

    /// Handle one inbound text frame.
    pub async fn handle_text(&mut self, text: &str) {
        if matches!(self.state, SessionState::Closed) {
            return;
        }

        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(remote = %self.remote_addr, error = %e, "Dropping malformed frame");
                self.reply(Message::Error(ErrorData::bad_request(e.to_string())))
                    .await;
                return;
            }
        };

        // Gate on the type string so unauthenticated peers learn nothing
        // from payload validation.
        let open = matches!(envelope.kind.as_str(), Message::AUTH | Message::PING);
        if !open && !self.is_authenticated() {
            debug!(remote = %self.remote_addr, kind = %envelope.kind, "Message before auth");
            self.reply(Message::Error(ErrorData::auth_required())).await;
            return;
        }

        let message = match envelope.message() {
            Ok(message) => message,
            Err(e) => {
                warn!(remote = %self.remote_addr, error = %e, "Dropping invalid message");
                self.reply(Message::Error(ErrorData::bad_request(e.to_string())))
                    .await;
                return;
            }
        };

        match message {
            Message::Auth(req) => self.handle_auth(req, envelope.timestamp).await,
            Message::Ping => self.reply(Message::Pong).await,
            Message::Subscribe(req) => self.handle_subscribe(req).await,
            Message::CertAck(ack) => {
                info!(
                    client_id = %self.identity(),
                    domain = %ack.domain,
                    success = ack.success,
                    message = %ack.message,
                    "Certificate acknowledged"
                );
            }
            Message::CertRequest(req) => self.handle_cert_request(req).await,
            Message::StatusRequest => self.handle_status_request().await,
            Message::SyncRequest(req) => {
                self.handle_sync_request(req).await;
            }
            Message::Pong => {}
            other => {
                debug!(kind = other.kind(), "Ignoring server-bound message of unexpected kind");
                self.reply(Message::Error(ErrorData::bad_request(format!(
                    "unexpected message type {}",
                    other.kind()
                ))))
                .await;
            }
        }
    }

    fn identity(&self) -> &str {
        self.connection().map(|c| c.identity()).unwrap_or("")
    }

    async fn reply(&self, message: Message) {
        match message.into_envelope() {
            Ok(envelope) => {
                if self.outbox.send(envelope).await.is_err() {
                    debug!(remote = %self.remote_addr, "Outbox closed, reply dropped");
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode reply"),
        }
    }

    async fn handle_auth(&mut self, req: AuthRequest, timestamp: i64) {
        if let Err(failure) = self.ctx.verifier.verify(&req.signature, timestamp) {
            warn!(
                remote = %self.remote_addr,
                client_id = %req.client_id,
                reason = %failure,
                "Authentication failed"
            );
            self.reply(Message::AuthResult(AuthResponse {
                success: false,
                message: failure.to_string(),
            }))
            .await;
            return;
        }

        let patterns = normalize_patterns(&req.domains);

        match self.connection().cloned() {
            Some(conn) => {
                // Re-auth keeps the identity and swaps subscriptions
                self.ctx.hub.update_subscription(conn.id(), patterns).await;
            }
            None => {
                let identity = if req.client_id.trim().is_empty() {
                    format!("anonymous-{}", uuid::Uuid::new_v4())
                } else {
                    req.client_id.trim().to_string()
                };
                let conn = Arc::new(
                    Connection::new(identity, self.remote_addr, self.outbox.clone())
                        .with_close_token(self.close.clone()),
                );
                self.ctx.hub.register(conn.clone(), patterns).await;
                self.state = SessionState::Authenticated(conn);
            }
        }

        self.reply(Message::AuthResult(AuthResponse {
            success: true,
            message: "authenticated".to_string(),
        }))
        .await;
    }

    async fn handle_subscribe(&mut self, req: SubscribeRequest) {
        let Some(conn) = self.connection() else {
            return;
        };
        let patterns = normalize_patterns(&req.domains);
        debug!(client_id = %conn.identity(), patterns = ?patterns, "Subscription update");
        self.ctx.hub.update_subscription(conn.id(), patterns).await;
    }

    async fn handle_cert_request(&mut self, req: CertRequest) {
        let domain = req.domain.trim().to_ascii_lowercase();
        debug!(client_id = %self.identity(), domain = %domain, force = req.force, "Certificate request");

        if domain.is_empty() {
            self.reply(Message::CertResponse(CertResponse::failure(
                "",
                "domain is required",
            )))
            .await;
            return;
        }

        let response = match self.ctx.store.read_bundle(&domain) {
            Ok(bundle) => {
                info!(
                    client_id = %self.identity(),
                    domain = %domain,
                    files = bundle.files.len(),
                    "Serving certificate request"
                );
                CertResponse {
                    domain: bundle.domain,
                    files: bundle.files,
                    timestamp: bundle.timestamp,
                    error: String::new(),
                }
            }
            Err(StoreError::DomainNotFound(_)) => CertResponse::failure(domain, "domain not found"),
            Err(StoreError::NoFiles(_)) => CertResponse::failure(domain, "no files available"),
            Err(e) => CertResponse::failure(domain, e.to_string()),
        };
        self.reply(Message::CertResponse(response)).await;
    }

    async fn handle_status_request(&mut self) {
        let clients: Vec<ClientStatusInfo> = self
            .ctx
            .hub
            .list_connections()
            .await
            .into_iter()
            .map(ClientStatusInfo::from)
            .collect();
        let domains = collect_all(&self.ctx.store);

        debug!(clients = clients.len(), domains = domains.len(), "Status request");
        self.reply(Message::StatusResponse(StatusResponse {
            generated_at: unix_now(),
            clients,
            domains,
            error: String::new(),
        }))
        .await;
    }

    /// Push every subscribed domain the store holds a newer copy of. The
    /// candidates are the domains named in the request plus the session's
    /// exact subscriptions. Returns how many pushes were enqueued.
    pub async fn handle_sync_request(&mut self, req: SyncRequest) -> usize {
        let Some(conn) = self.connection().cloned() else {
            return 0;
        };
        let patterns = self
            .ctx
            .hub
            .subscriptions_of(conn.id())
            .await
            .unwrap_or_default();

        let mut candidates: BTreeSet<String> = req
            .timestamps
            .keys()
            .map(|d| d.trim().to_ascii_lowercase())
            .collect();
        candidates.extend(
            patterns
                .iter()
                .filter(|p| *p != pattern::GLOBAL_PATTERN && !pattern::is_wildcard(p))
                .cloned(),
        );

        let mut pushed = 0;
        for domain in candidates {
            if !patterns.iter().any(|p| pattern::matches(p, &domain)) {
                continue;
            }
            let Some(server_ts) = self.ctx.store.timestamp(&domain) else {
                continue;
            };
            let client_ts = req.timestamps.get(&domain).copied().unwrap_or(0);
            if server_ts <= client_ts {
                continue;
            }

            let bundle = match self.ctx.store.read_bundle(&domain) {
                Ok(bundle) => bundle,
                Err(e) => {
                    debug!(domain = %domain, error = %e, "Sync skipped domain");
                    continue;
                }
            };
            let envelope = match Message::CertPush(CertPush::from(bundle)).into_envelope() {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(error = %e, "Failed to encode sync push");
                    continue;
                }
            };

            match conn.try_push(envelope) {
                Ok(()) => pushed += 1,
                Err(_) => warn!(client_id = %conn.identity(), domain = %domain, "Mailbox full, sync push dropped"),
            }
        }

        info!(client_id = %conn.identity(), requested = req.timestamps.len(), pushed, "Sync handled");
        pushed
    }

    /// Leave the hub if registered. Idempotent.
    pub async fn close(&mut self) {
        if let SessionState::Authenticated(conn) =
            std::mem::replace(&mut self.state, SessionState::Closed)
        {
            self.ctx.hub.deregister(conn.id()).await;
        }
        self.close.cancel();
    }
}

/// Drive one accepted WebSocket until either side ends.
pub async fn run_session(socket: WebSocket, remote_addr: SocketAddr, ctx: Arc<SessionContext>) {
    let (mut sink, mut stream) = socket.split();
    let (outbox, mut mailbox) = mpsc::channel::<Envelope>(ctx.mailbox_capacity.max(1));
    let close = ctx.shutdown.child_token();

    debug!(remote = %remote_addr, "Session started");

    let writer_close = close.clone();
    let ping_interval = ctx.ping_interval;
    let writer = tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);

        loop {
            tokio::select! {
                _ = writer_close.cancelled() => break,
                envelope = mailbox.recv() => {
                    let Some(envelope) = envelope else { break };
                    let text = match envelope.encode() {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(error = %e, "Failed to encode outbound message");
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(WsMessage::Text(text)).await {
                        debug!(remote = %remote_addr, error = %e, "Write failed, ending session");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if sink.send(WsMessage::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }

        let _ = sink.send(WsMessage::Close(None)).await;
        writer_close.cancel();
    });

    let mut handler = SessionHandler::new(ctx.clone(), remote_addr, outbox, close.clone());

    loop {
        let frame = tokio::select! {
            _ = close.cancelled() => break,
            frame = tokio::time::timeout(ctx.read_timeout, stream.next()) => frame,
        };

        match frame {
            Err(_) => {
                warn!(remote = %remote_addr, "Read timeout, closing session");
                break;
            }
            Ok(None) | Ok(Some(Ok(WsMessage::Close(_)))) => break,
            Ok(Some(Err(e))) => {
                debug!(remote = %remote_addr, error = %e, "Read failed, ending session");
                break;
            }
            Ok(Some(Ok(WsMessage::Text(text)))) => handler.handle_text(&text).await,
            Ok(Some(Ok(_))) => {}
        }
    }

    handler.close().await;
    let _ = writer.await;
    debug!(remote = %remote_addr, "Session ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    const SECRET: &str = "test-secret";

    fn write_domain(root: &Path, domain: &str, ts: i64) {
        let dir = root.join(domain);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("cert.pem"), format!("CERT {domain}")).unwrap();
        std::fs::write(dir.join("time.log"), ts.to_string()).unwrap();
    }

    fn setup(root: &Path) -> (SessionHandler, mpsc::Receiver<Envelope>, Arc<Hub>) {
        let hub = Arc::new(Hub::new());
        let ctx = Arc::new(SessionContext {
            hub: hub.clone(),
            store: CertStore::new(root),
            verifier: SignatureVerifier::new(SECRET),
            mailbox_capacity: 16,
            ping_interval: Duration::from_secs(108),
            read_timeout: Duration::from_secs(120),
            shutdown: CancellationToken::new(),
        });
        let (tx, rx) = mpsc::channel(16);
        let handler = SessionHandler::new(
            ctx,
            "127.0.0.1:50000".parse().unwrap(),
            tx,
            CancellationToken::new(),
        );
        (handler, rx, hub)
    }

    fn auth_frame(client_id: &str, domains: &[&str]) -> String {
        let ts = unix_now();
        let sig = SignatureVerifier::new(SECRET).sign(ts);
        serde_json::json!({
            "type": "auth",
            "timestamp": ts,
            "data": {"client_id": client_id, "signature": sig, "domains": domains},
        })
        .to_string()
    }

    fn next(rx: &mut mpsc::Receiver<Envelope>) -> Message {
        rx.try_recv().expect("expected a message").message().unwrap()
    }

    #[tokio::test]
    async fn test_unauthenticated_requests_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let (mut handler, mut rx, hub) = setup(tmp.path());

        handler
            .handle_text(r#"{"type":"status_request","timestamp":0}"#)
            .await;
        match next(&mut rx) {
            Message::Error(err) => assert_eq!(err.code, 401),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(hub.is_empty().await);
    }

    #[tokio::test]
    async fn test_ping_allowed_before_auth() {
        let tmp = TempDir::new().unwrap();
        let (mut handler, mut rx, _hub) = setup(tmp.path());

        handler.handle_text(r#"{"type":"ping","timestamp":0}"#).await;
        assert_eq!(next(&mut rx), Message::Pong);
    }

    #[tokio::test]
    async fn test_auth_registers_with_hub() {
        let tmp = TempDir::new().unwrap();
        let (mut handler, mut rx, hub) = setup(tmp.path());

        handler
            .handle_text(&auth_frame("edge-1", &["Example.com", "*.example.com"]))
            .await;
        match next(&mut rx) {
            Message::AuthResult(resp) => assert!(resp.success),
            other => panic!("unexpected: {:?}", other),
        }

        let clients = hub.list_connections().await;
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].identity, "edge-1");
        assert_eq!(clients[0].patterns, vec!["*.example.com", "example.com"]);
    }

    #[tokio::test]
    async fn test_bad_signature_is_rejected_without_registration() {
        let tmp = TempDir::new().unwrap();
        let (mut handler, mut rx, hub) = setup(tmp.path());

        let frame = serde_json::json!({
            "type": "auth",
            "timestamp": unix_now(),
            "data": {"client_id": "x", "signature": "deadbeef", "domains": []},
        })
        .to_string();
        handler.handle_text(&frame).await;

        match next(&mut rx) {
            Message::AuthResult(resp) => {
                assert!(!resp.success);
                assert!(!resp.message.is_empty());
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(hub.is_empty().await);
        assert!(!handler.is_authenticated());
    }

    #[tokio::test]
    async fn test_empty_client_id_gets_anonymous_identity() {
        let tmp = TempDir::new().unwrap();
        let (mut handler, _rx, hub) = setup(tmp.path());

        handler.handle_text(&auth_frame("", &[])).await;
        let clients = hub.list_connections().await;
        assert!(clients[0].identity.starts_with("anonymous-"));
    }

    #[tokio::test]
    async fn test_reauth_replaces_subscriptions() {
        let tmp = TempDir::new().unwrap();
        let (mut handler, _rx, hub) = setup(tmp.path());

        handler.handle_text(&auth_frame("edge", &["a.com"])).await;
        handler.handle_text(&auth_frame("edge", &["b.com"])).await;

        assert_eq!(hub.len().await, 1);
        assert!(hub.resolve("a.com").await.is_empty());
        assert_eq!(hub.resolve("b.com").await.len(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_updates_hub() {
        let tmp = TempDir::new().unwrap();
        let (mut handler, _rx, hub) = setup(tmp.path());

        handler.handle_text(&auth_frame("edge", &["a.com"])).await;
        handler
            .handle_text(r#"{"type":"subscribe","timestamp":0,"data":{"domains":["c.com"]}}"#)
            .await;
        assert_eq!(hub.resolve("c.com").await.len(), 1);
        assert!(hub.resolve("a.com").await.is_empty());
    }

    #[tokio::test]
    async fn test_cert_request_errors_are_in_payload() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join("empty.com")).unwrap();
        let (mut handler, mut rx, _hub) = setup(tmp.path());
        handler.handle_text(&auth_frame("cli", &[])).await;
        let _ = next(&mut rx);

        handler
            .handle_text(r#"{"type":"cert_request","timestamp":0,"data":{"domain":"missing.com"}}"#)
            .await;
        match next(&mut rx) {
            Message::CertResponse(resp) => assert_eq!(resp.error, "domain not found"),
            other => panic!("unexpected: {:?}", other),
        }

        handler
            .handle_text(r#"{"type":"cert_request","timestamp":0,"data":{"domain":"empty.com"}}"#)
            .await;
        match next(&mut rx) {
            Message::CertResponse(resp) => assert_eq!(resp.error, "no files available"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cert_request_returns_bundle() {
        let tmp = TempDir::new().unwrap();
        write_domain(tmp.path(), "example.com", 1_700_000_000);
        let (mut handler, mut rx, _hub) = setup(tmp.path());
        handler.handle_text(&auth_frame("cli", &[])).await;
        let _ = next(&mut rx);

        handler
            .handle_text(r#"{"type":"cert_request","timestamp":0,"data":{"domain":"example.com","force":true}}"#)
            .await;
        match next(&mut rx) {
            Message::CertResponse(resp) => {
                assert!(!resp.is_error());
                assert_eq!(resp.timestamp, 1_700_000_000);
                assert_eq!(resp.files["cert.pem"], b"CERT example.com");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_status_request_lists_clients_and_domains() {
        let tmp = TempDir::new().unwrap();
        write_domain(tmp.path(), "example.com", 100);
        let (mut handler, mut rx, _hub) = setup(tmp.path());
        handler.handle_text(&auth_frame("cli", &["example.com"])).await;
        let _ = next(&mut rx);

        handler
            .handle_text(r#"{"type":"status_request","timestamp":0}"#)
            .await;
        match next(&mut rx) {
            Message::StatusResponse(resp) => {
                assert_eq!(resp.clients.len(), 1);
                assert_eq!(resp.clients[0].id, "cli");
                assert_eq!(resp.domains.len(), 1);
                assert!(!resp.domains[0].valid);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sync_pushes_only_newer_tracked_domains() {
        let tmp = TempDir::new().unwrap();
        write_domain(tmp.path(), "a.com", 150);
        write_domain(tmp.path(), "b.com", 200);
        write_domain(tmp.path(), "c.com", 50);
        let (mut handler, mut rx, _hub) = setup(tmp.path());
        handler.handle_text(&auth_frame("edge", &["*"])).await;
        let _ = next(&mut rx);

        let mut timestamps = std::collections::BTreeMap::new();
        timestamps.insert("a.com".to_string(), 100);
        timestamps.insert("b.com".to_string(), 200);

        let pushed = handler.handle_sync_request(SyncRequest { timestamps }).await;
        assert_eq!(pushed, 1);
        match next(&mut rx) {
            Message::CertPush(push) => {
                assert_eq!(push.domain, "a.com");
                assert_eq!(push.timestamp, 150);
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sync_includes_missing_exact_subscriptions() {
        let tmp = TempDir::new().unwrap();
        write_domain(tmp.path(), "a.com", 150);
        write_domain(tmp.path(), "other.com", 150);
        let (mut handler, mut rx, _hub) = setup(tmp.path());
        handler.handle_text(&auth_frame("edge", &["a.com"])).await;
        let _ = next(&mut rx);

        let mut timestamps = std::collections::BTreeMap::new();
        timestamps.insert("other.com".to_string(), 0);
        let pushed = handler.handle_sync_request(SyncRequest { timestamps }).await;

        // other.com is not subscribed, a.com is missing on the client
        assert_eq!(pushed, 1);
        match next(&mut rx) {
            Message::CertPush(push) => assert_eq!(push.domain, "a.com"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_payload_keeps_session_alive() {
        let tmp = TempDir::new().unwrap();
        let (mut handler, mut rx, _hub) = setup(tmp.path());
        handler.handle_text(&auth_frame("edge", &[])).await;
        let _ = next(&mut rx);

        handler.handle_text("{not json").await;
        match next(&mut rx) {
            Message::Error(err) => assert_eq!(err.code, 400),
            other => panic!("unexpected: {:?}", other),
        }

        handler.handle_text(r#"{"type":"ping","timestamp":0}"#).await;
        assert_eq!(next(&mut rx), Message::Pong);
    }

    #[tokio::test]
    async fn test_close_deregisters_once() {
        let tmp = TempDir::new().unwrap();
        let (mut handler, _rx, hub) = setup(tmp.path());
        handler.handle_text(&auth_frame("edge", &["a.com"])).await;

        handler.close().await;
        handler.close().await;
        assert!(hub.is_empty().await);
    }
}
