//! Push server: WebSocket listener, certificate watcher and the fan-out
//! between them.

pub mod hub;
pub mod pattern;
pub mod session;
pub mod status;
pub mod store;
pub mod watcher;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bundle::Bundle;
use crate::config::ServerConfig;
use crate::protocol::{CertPush, Message};
use crate::security::SignatureVerifier;

pub use hub::{Connection, ConnectionId, ConnectionSnapshot, Hub};
pub use session::{SessionContext, SessionHandler};
pub use store::{CertStore, StoreError};
pub use watcher::{DomainChange, WatchError, WatcherConfig, WatcherHandle};

/// Fatal server startup errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error("server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Running server. Dropping it does not stop anything; call
/// [`ServerHandle::shutdown`].
pub struct ServerHandle {
    local_addr: SocketAddr,
    hub: Arc<Hub>,
    accept: CancellationToken,
    sessions: CancellationToken,
    watcher: WatcherHandle,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Stop accepting, stop the watcher, close every session, then wait for
    /// the background tasks. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.accept.cancel();
        self.watcher.stop().await;
        let closed = self.hub.close_all().await;
        self.sessions.cancel();

        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        if tasks.is_empty() {
            return;
        }
        for task in tasks {
            let _ = task.await;
        }
        info!(closed, "Server stopped");
    }
}

#[derive(Clone)]
struct AppState {
    ctx: Arc<SessionContext>,
}

/// Bind the listener, start the watcher and begin serving.
pub async fn start(config: &ServerConfig) -> Result<ServerHandle, ServerError> {
    let addr = config.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;
    let local_addr = listener.local_addr()?;

    let hub = Arc::new(Hub::new());
    let store = CertStore::new(&config.cert_dir);
    let accept = CancellationToken::new();
    let sessions = CancellationToken::new();

    let (change_tx, change_rx) = mpsc::channel::<DomainChange>(64);
    let watcher = watcher::spawn_cert_watcher(
        store.clone(),
        config.watcher_config(),
        change_tx,
        sessions.child_token(),
    )?;

    let ctx = Arc::new(SessionContext {
        hub: hub.clone(),
        store,
        verifier: SignatureVerifier::new(config.key.clone())
            .with_tolerance(config.timestamp_tolerance_secs),
        mailbox_capacity: config.mailbox_capacity,
        ping_interval: config.ping_interval(),
        read_timeout: config.read_timeout(),
        shutdown: sessions.clone(),
    });

    let app = Router::new()
        .route("/ws", get(websocket_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(AppState { ctx });

    info!(addr = %local_addr, root = %config.cert_dir.display(), "Certificate push server listening");

    let accept_signal = accept.clone();
    let listener_task = tokio::spawn(async move {
        let served = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { accept_signal.cancelled().await })
        .await;
        if let Err(e) = served {
            error!(error = %e, "Server error");
        }
    });

    let broadcaster = tokio::spawn(run_broadcaster(hub.clone(), change_rx, sessions.clone()));

    Ok(ServerHandle {
        local_addr,
        hub,
        accept,
        sessions,
        watcher,
        tasks: Mutex::new(vec![listener_task, broadcaster]),
    })
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    debug!(remote = %remote, "WebSocket upgrade");
    ws.on_upgrade(move |socket| session::run_session(socket, remote, state.ctx))
}

/// Turn settled directory changes into pushes.
async fn run_broadcaster(
    hub: Arc<Hub>,
    mut changes: mpsc::Receiver<DomainChange>,
    cancel: CancellationToken,
) {
    loop {
        let change = tokio::select! {
            _ = cancel.cancelled() => break,
            change = changes.recv() => match change {
                Some(change) => change,
                None => break,
            },
        };

        // Patterns are lowercase, so the directory name must be too
        let domain = change.domain.to_lowercase();
        if domain != change.domain {
            debug!(directory = %change.domain, domain = %domain, "Lowercased domain directory name");
        }
        let bundle = Bundle::from_files(domain, change.files);
        if !bundle.is_deliverable() {
            continue;
        }
        let empty = bundle.empty_files();
        if !empty.is_empty() {
            warn!(domain = %bundle.domain, files = ?empty, "Pushing bundle with empty files");
        }

        let domain = bundle.domain.clone();
        let bytes = bundle.total_size();
        let envelope = match Message::CertPush(CertPush::from(bundle)).into_envelope() {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(domain = %domain, error = %e, "Failed to encode push");
                continue;
            }
        };

        let sent = hub.broadcast(&domain, envelope).await;
        info!(domain = %domain, sent, bytes, "Certificate pushed");
    }
}
