//! Long-running client runtime.
//!
//! One connection attempt walks `Disconnected -> Connecting ->
//! Authenticating -> Active` and any terminal error drops back to
//! `Disconnected`, after which the reconnect backoff decides when to retry.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::ReconnectBackoff;
use super::debouncer::ReloadDebouncer;
use super::heartbeat::{HeartbeatMonitor, HeartbeatStatus};
use super::transport::{self, ClientError, WsStream};
use super::workspace::{Workspace, WorkspaceError};
use crate::deploy::{deploy_with_retry, find_site, CommandRunner, Deployer, SiteDeploy};
use crate::protocol::{CertAck, CertPush, Envelope, Message, SubscribeRequest, SyncRequest};
use crate::security::SignatureVerifier;
use crate::server::pattern::{self, GLOBAL_PATTERN};

pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Daemon errors
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("no pong from server after {0} heartbeats")]
    HeartbeatLost(u32),
}

/// Connection lifecycle as observed from outside
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Disconnected,
    Connecting,
    Authenticating,
    Active,
}

/// Everything the daemon needs, resolved from the client configuration.
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub server_url: String,
    pub password: String,
    pub client_id: String,
    pub work_dir: PathBuf,
    pub subscribe: Vec<String>,
    pub sites: Vec<SiteDeploy>,
    pub reconnect_interval: Duration,
    pub heartbeat_interval: Duration,
    pub reload_debounce: Duration,
    pub deploy_attempts: u32,
}

/// Hot-swappable part of the configuration
#[derive(Debug, Clone, Default)]
struct Subscriptions {
    subscribe: Vec<String>,
    sites: Vec<SiteDeploy>,
}

pub struct Daemon {
    options: DaemonOptions,
    verifier: SignatureVerifier,
    workspace: Workspace,
    runner: Arc<dyn CommandRunner>,
    current: Arc<RwLock<Subscriptions>>,
    /// Sender of the active connection, present only while `Active`
    outbox: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    state_tx: watch::Sender<DaemonState>,
}

impl Daemon {
    pub fn new(options: DaemonOptions, runner: Arc<dyn CommandRunner>) -> Self {
        let (state_tx, _) = watch::channel(DaemonState::Disconnected);
        Self {
            verifier: SignatureVerifier::new(&options.password),
            workspace: Workspace::new(&options.work_dir),
            current: Arc::new(RwLock::new(Subscriptions {
                subscribe: options.subscribe.clone(),
                sites: options.sites.clone(),
            })),
            outbox: Mutex::new(None),
            state_tx,
            runner,
            options,
        }
    }

    pub fn state(&self) -> DaemonState {
        *self.state_tx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<DaemonState> {
        self.state_tx.subscribe()
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub async fn subscriptions(&self) -> Vec<String> {
        self.current.read().await.subscribe.clone()
    }

    fn set_state(&self, state: DaemonState) {
        self.state_tx.send_replace(state);
    }

    /// Replace the subscribe list and deploy sites. A changed subscribe list
    /// is sent to the server when a connection is active; otherwise it is
    /// used on the next authentication. Returns whether an update was sent.
    pub async fn update_config(&self, subscribe: Vec<String>, sites: Vec<SiteDeploy>) -> bool {
        let changed = {
            let mut current = self.current.write().await;
            current.sites = sites;
            if current.subscribe == subscribe {
                false
            } else {
                current.subscribe = subscribe.clone();
                true
            }
        };

        if !changed {
            debug!("Subscribe list unchanged");
            return false;
        }

        let outbox = self.outbox.lock().await;
        match outbox.as_ref() {
            Some(tx) => {
                info!(domains = ?subscribe, "Sending subscription update");
                tx.send(Message::Subscribe(SubscribeRequest { domains: subscribe }))
                    .is_ok()
            }
            None => {
                info!("Subscription updated, takes effect on next connect");
                false
            }
        }
    }

    /// Timestamps sent in `sync_request`: every workspace domain plus 0 for
    /// exact subscriptions with no local copy.
    pub async fn sync_timestamps(&self) -> BTreeMap<String, i64> {
        let mut timestamps = self.workspace.timestamps();
        for domain in self.current.read().await.subscribe.iter() {
            let domain = domain.trim().to_lowercase();
            if domain.is_empty() || domain == GLOBAL_PATTERN || pattern::is_wildcard(&domain) {
                continue;
            }
            timestamps.entry(domain).or_insert(0);
        }
        timestamps
    }

    /// Reconnect loop. Returns once `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), DaemonError> {
        self.workspace.ensure()?;

        let (debouncer, debounce_task) = ReloadDebouncer::spawn(
            self.options.reload_debounce,
            self.runner.clone(),
            cancel.child_token(),
        );
        let mut backoff = ReconnectBackoff::new(self.options.reconnect_interval);

        info!(
            server = %self.options.server_url,
            client_id = %self.options.client_id,
            work_dir = %self.workspace.root().display(),
            "Daemon starting"
        );

        while !cancel.is_cancelled() {
            match self.connect_and_serve(&debouncer, &mut backoff, &cancel).await {
                Ok(()) => {}
                Err(e) => warn!(error = %e, "Connection ended"),
            }
            *self.outbox.lock().await = None;
            self.set_state(DaemonState::Disconnected);

            if cancel.is_cancelled() {
                break;
            }

            let delay = backoff.next_delay();
            info!(attempt = backoff.attempt(), delay = ?delay, "Reconnecting after delay");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        drop(debouncer);
        let _ = debounce_task.await;
        info!("Daemon stopped");
        Ok(())
    }

    /// One connection attempt. `Ok` means the loop ended because of
    /// cancellation.
    async fn connect_and_serve(
        &self,
        debouncer: &ReloadDebouncer,
        backoff: &mut ReconnectBackoff,
        cancel: &CancellationToken,
    ) -> Result<(), DaemonError> {
        self.set_state(DaemonState::Connecting);
        let mut stream = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            result = transport::connect(&self.options.server_url) => result?,
        };

        self.set_state(DaemonState::Authenticating);
        let domains = self.subscriptions().await;
        stream
            .send(transport::auth_frame(
                &self.verifier,
                &self.options.client_id,
                domains.clone(),
            )?)
            .await
            .map_err(ClientError::from)?;

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            result = self.await_auth(&mut stream) => result?,
        }

        backoff.reset();
        self.set_state(DaemonState::Active);
        info!(server = %self.options.server_url, "Authenticated");

        let (mut sink, mut source) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        let _ = tx.send(Message::SyncRequest(SyncRequest {
            timestamps: self.sync_timestamps().await,
        }));
        {
            // update_config calls made during the handshake found no outbox
            let mut outbox = self.outbox.lock().await;
            *outbox = Some(tx.clone());
            let latest = self.subscriptions().await;
            if latest != domains {
                info!(domains = ?latest, "Subscription changed during handshake, resending");
                let _ = tx.send(Message::Subscribe(SubscribeRequest { domains: latest }));
            }
        }

        // Pushes are handled in arrival order off the select loop
        let (push_tx, push_rx) = mpsc::unbounded_channel::<CertPush>();
        tokio::spawn(run_push_worker(
            self.push_handler(debouncer.clone()),
            push_rx,
            tx.clone(),
        ));

        let interval = self.options.heartbeat_interval;
        let mut heartbeat = HeartbeatMonitor::new(interval, Instant::now());
        let mut ticker = interval_at(Instant::now() + interval, interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    return Ok(());
                }
                frame = source.next() => {
                    let text = match frame {
                        None | Some(Ok(WsMessage::Close(_))) => {
                            return Err(ClientError::Closed.into());
                        }
                        Some(Err(e)) => return Err(ClientError::from(e).into()),
                        Some(Ok(WsMessage::Text(text))) => text,
                        Some(Ok(_)) => continue,
                    };

                    let message = match Envelope::decode(&text).and_then(|env| env.message()) {
                        Ok(message) => message,
                        Err(e) => {
                            warn!(error = %e, "Dropping malformed message");
                            continue;
                        }
                    };

                    match message {
                        Message::CertPush(push) => {
                            let _ = push_tx.send(push);
                        }
                        Message::Pong => heartbeat.record_pong(Instant::now()),
                        Message::Ping => {
                            let _ = tx.send(Message::Pong);
                        }
                        Message::Error(err) => {
                            warn!(code = err.code, message = %err.message, "Server reported error");
                        }
                        other => debug!(kind = other.kind(), "Ignoring message"),
                    }
                }
                Some(message) = rx.recv() => {
                    let kind = message.kind();
                    sink.send(transport::text_frame(message)?)
                        .await
                        .map_err(ClientError::from)?;
                    debug!(kind, "Sent message");
                }
                _ = ticker.tick() => {
                    match heartbeat.on_tick(Instant::now()) {
                        HeartbeatStatus::Dead => {
                            let _ = sink.send(WsMessage::Close(None)).await;
                            return Err(DaemonError::HeartbeatLost(heartbeat.missed()));
                        }
                        HeartbeatStatus::Missed(missed) => {
                            warn!(missed, "Pong overdue");
                        }
                        HeartbeatStatus::Healthy => {}
                    }
                    let _ = tx.send(Message::Ping);
                }
            }
        }
    }

    async fn await_auth(&self, stream: &mut WsStream) -> Result<(), ClientError> {
        let deadline = Instant::now() + AUTH_TIMEOUT;
        loop {
            let frame = tokio::time::timeout_at(deadline, stream.next())
                .await
                .map_err(|_| ClientError::Timeout("auth_result"))?;

            let text = match frame {
                None | Some(Ok(WsMessage::Close(_))) => return Err(ClientError::Closed),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(WsMessage::Text(text))) => text,
                Some(Ok(_)) => continue,
            };

            match Envelope::decode(&text).and_then(|env| env.message())? {
                Message::AuthResult(resp) if resp.success => return Ok(()),
                Message::AuthResult(resp) => return Err(ClientError::AuthRejected(resp.message)),
                Message::Error(err) => {
                    return Err(ClientError::Server {
                        code: err.code,
                        message: err.message,
                    })
                }
                other => debug!(kind = other.kind(), "Ignoring message before auth result"),
            }
        }
    }

    fn push_handler(&self, debouncer: ReloadDebouncer) -> PushHandler {
        PushHandler {
            workspace: self.workspace.clone(),
            current: self.current.clone(),
            deploy_attempts: self.options.deploy_attempts,
            debouncer,
        }
    }

    /// Save, deploy and schedule the reload for a pushed bundle. The returned
    /// ack reports the outcome.
    pub async fn handle_push(&self, push: CertPush, debouncer: &ReloadDebouncer) -> CertAck {
        self.push_handler(debouncer.clone()).handle(push).await
    }
}

/// Owned view of what a push needs, so deploys run outside the connection
/// loop.
struct PushHandler {
    workspace: Workspace,
    current: Arc<RwLock<Subscriptions>>,
    deploy_attempts: u32,
    debouncer: ReloadDebouncer,
}

impl PushHandler {
    async fn handle(&self, push: CertPush) -> CertAck {
        let domain = push.domain;
        info!(domain = %domain, files = push.files.len(), timestamp = push.timestamp, "Received certificate push");

        if let Err(e) = self.workspace.save_files(&domain, &push.files) {
            error!(domain = %domain, error = %e, "Failed to save bundle");
            return CertAck {
                domain,
                success: false,
                message: e.to_string(),
            };
        }

        let deployer = {
            let current = self.current.read().await;
            Deployer::for_site(find_site(&current.sites, &domain))
        };

        match deploy_with_retry(&deployer, &domain, &push.files, self.deploy_attempts).await {
            Ok(outcome) => {
                if let Some(cmd) = outcome.reload {
                    self.debouncer.trigger(cmd);
                }
                CertAck {
                    domain,
                    success: true,
                    message: String::new(),
                }
            }
            Err(e) => {
                error!(domain = %domain, error = %e, "Deploy failed");
                CertAck {
                    domain,
                    success: false,
                    message: e.to_string(),
                }
            }
        }
    }
}

/// Handle queued pushes one at a time and ack each through the connection's
/// outbox. Ends once the connection drops its sender and the queue is drained.
async fn run_push_worker(
    handler: PushHandler,
    mut pushes: mpsc::UnboundedReceiver<CertPush>,
    outbox: mpsc::UnboundedSender<Message>,
) {
    while let Some(push) = pushes.recv().await {
        let ack = handler.handle(push).await;
        if outbox.send(Message::CertAck(ack)).is_err() {
            debug!("Connection closed before ack was sent");
        }
    }
}
