//! Connection registry.
//!
//! The hub owns the set of authenticated connections and the index from
//! subscription pattern to subscribers. Structural changes take the write
//! lock for a short critical section; resolution and snapshots share the
//! read lock. Pushes are enqueued with `try_send` so a slow consumer can
//! never stall a broadcast.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::pattern::{self, GLOBAL_PATTERN};
use crate::protocol::{ClientStatusInfo, Envelope};

/// Process-unique connection handle.
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// One live, authenticated peer.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    identity: String,
    remote_addr: SocketAddr,
    connected_at: DateTime<Utc>,
    mailbox: mpsc::Sender<Envelope>,
    closed: CancellationToken,
}

impl Connection {
    pub fn new(
        identity: impl Into<String>,
        remote_addr: SocketAddr,
        mailbox: mpsc::Sender<Envelope>,
    ) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            identity: identity.into(),
            remote_addr,
            connected_at: Utc::now(),
            mailbox,
            closed: CancellationToken::new(),
        }
    }

    /// Share the session's cancellation token so deregistration also ends
    /// the session's loops.
    pub fn with_close_token(mut self, token: CancellationToken) -> Self {
        self.closed = token;
        self
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Token cancelled exactly once, when the hub deregisters the connection.
    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Non-blocking enqueue.
    pub fn try_push(&self, envelope: Envelope) -> Result<(), mpsc::error::TrySendError<Envelope>> {
        if self.is_closed() {
            return Err(mpsc::error::TrySendError::Closed(envelope));
        }
        self.mailbox.try_send(envelope)
    }
}

/// Immutable copy of a connection's metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSnapshot {
    pub id: ConnectionId,
    pub identity: String,
    pub remote_addr: SocketAddr,
    pub connected_at: DateTime<Utc>,
    pub patterns: Vec<String>,
}

impl From<ConnectionSnapshot> for ClientStatusInfo {
    fn from(snapshot: ConnectionSnapshot) -> Self {
        Self {
            id: snapshot.identity,
            remote_ip: snapshot.remote_addr.ip().to_string(),
            connected_at: snapshot.connected_at.timestamp(),
            domains: snapshot.patterns,
        }
    }
}

struct Registered {
    conn: Arc<Connection>,
    patterns: BTreeSet<String>,
}

#[derive(Default)]
struct HubState {
    connections: HashMap<ConnectionId, Registered>,
    /// pattern -> subscribers; empty entries are removed eagerly
    subscriptions: HashMap<String, HashSet<ConnectionId>>,
}

impl HubState {
    fn index(&mut self, id: ConnectionId, patterns: &BTreeSet<String>) {
        for pattern in patterns {
            self.subscriptions
                .entry(pattern.clone())
                .or_default()
                .insert(id);
        }
    }

    fn unindex(&mut self, id: ConnectionId, patterns: &BTreeSet<String>) {
        for pattern in patterns {
            if let Some(subscribers) = self.subscriptions.get_mut(pattern) {
                subscribers.remove(&id);
                if subscribers.is_empty() {
                    self.subscriptions.remove(pattern);
                }
            }
        }
    }

    fn resolve_ids(&self, domain: &str) -> BTreeSet<ConnectionId> {
        let mut ids = BTreeSet::new();
        for (pattern, subscribers) in &self.subscriptions {
            let hit = pattern == domain
                || pattern == GLOBAL_PATTERN
                || pattern::matches_wildcard(pattern, domain);
            if hit {
                ids.extend(subscribers.iter().copied());
            }
        }
        ids
    }
}

/// Connection registry shared by every session and the change broadcaster.
#[derive(Default)]
pub struct Hub {
    state: RwLock<HubState>,
    dropped: AtomicU64,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `conn` and index it under `patterns`. Registering an id that is
    /// already present replaces its pattern set.
    pub async fn register(&self, conn: Arc<Connection>, patterns: BTreeSet<String>) {
        let mut state = self.state.write().await;
        let id = conn.id();

        if let Some(previous) = state.connections.remove(&id) {
            state.unindex(id, &previous.patterns);
        }
        state.index(id, &patterns);

        info!(
            client_id = %conn.identity(),
            remote = %conn.remote_addr(),
            patterns = patterns.len(),
            "Client registered"
        );
        state.connections.insert(id, Registered { conn, patterns });
    }

    /// Remove the connection from every index and close its mailbox.
    /// Returns false if it was not registered.
    pub async fn deregister(&self, id: ConnectionId) -> bool {
        let removed = {
            let mut state = self.state.write().await;
            let removed = state.connections.remove(&id);
            if let Some(entry) = &removed {
                state.unindex(id, &entry.patterns);
            }
            removed
        };

        match removed {
            Some(entry) => {
                entry.conn.closed.cancel();
                info!(client_id = %entry.conn.identity(), "Client deregistered");
                true
            }
            None => {
                debug!(id, "Deregister of unknown connection ignored");
                false
            }
        }
    }

    /// Atomically swap the pattern set of a registered connection.
    pub async fn update_subscription(&self, id: ConnectionId, patterns: BTreeSet<String>) -> bool {
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        let Some(entry) = state.connections.get_mut(&id) else {
            return false;
        };
        let old = std::mem::replace(&mut entry.patterns, patterns.clone());

        state.unindex(id, &old);
        state.index(id, &patterns);

        debug!(id, patterns = ?patterns, "Subscription updated");
        true
    }

    /// Connections interested in `domain`, each once, ordered by id.
    pub async fn resolve(&self, domain: &str) -> Vec<Arc<Connection>> {
        let state = self.state.read().await;
        state
            .resolve_ids(domain)
            .into_iter()
            .filter_map(|id| state.connections.get(&id).map(|entry| entry.conn.clone()))
            .collect()
    }

    /// Enqueue `envelope` on every subscriber of `domain` without blocking.
    /// Returns how many mailboxes accepted it.
    pub async fn broadcast(&self, domain: &str, envelope: Envelope) -> usize {
        let subscribers = self.resolve(domain).await;
        let mut sent = 0;

        for conn in subscribers {
            match conn.try_push(envelope.clone()) {
                Ok(()) => sent += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        domain = %domain,
                        client_id = %conn.identity(),
                        "Mailbox full, dropping push"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(client_id = %conn.identity(), "Mailbox closed, skipping push");
                }
            }
        }

        debug!(domain = %domain, sent, "Broadcast complete");
        sent
    }

    pub async fn subscriptions_of(&self, id: ConnectionId) -> Option<BTreeSet<String>> {
        let state = self.state.read().await;
        state.connections.get(&id).map(|entry| entry.patterns.clone())
    }

    /// Snapshot of every registered connection, ordered by connect time.
    pub async fn list_connections(&self) -> Vec<ConnectionSnapshot> {
        let state = self.state.read().await;
        let mut snapshots: Vec<_> = state
            .connections
            .values()
            .map(|entry| ConnectionSnapshot {
                id: entry.conn.id(),
                identity: entry.conn.identity().to_string(),
                remote_addr: entry.conn.remote_addr(),
                connected_at: entry.conn.connected_at(),
                patterns: entry.patterns.iter().cloned().collect(),
            })
            .collect();
        snapshots.sort_by_key(|s| (s.connected_at, s.id));
        snapshots
    }

    /// Deregister everything. Safe to call repeatedly.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<Registered> = {
            let mut state = self.state.write().await;
            state.subscriptions.clear();
            state.connections.drain().map(|(_, entry)| entry).collect()
        };

        for entry in &drained {
            entry.conn.closed.cancel();
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "Closed all client connections");
        }
        drained.len()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.connections.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of index entries; used to check that empty entries are pruned.
    pub async fn pattern_count(&self) -> usize {
        self.state.read().await.subscriptions.len()
    }

    /// Pushes dropped because a mailbox was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
