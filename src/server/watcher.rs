//! Debounced watcher over the certificate root.
//!
//! Raw `notify` events are mapped to their owning domain (first path segment
//! below the root) and coalesced in [`PendingChanges`]. A ticker flushes ripe
//! domains: their files are read from the store and forwarded as a
//! [`DomainChange`].

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::store::CertStore;
use crate::bundle::FileMap;

/// Watcher startup errors
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("certificate root {path} is not accessible: {source}")]
    Root {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create filesystem watcher: {0}")]
    Init(#[source] notify::Error),

    #[error("failed to watch {path}: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

/// A domain whose files settled after a burst of writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainChange {
    pub domain: String,
    pub files: FileMap,
}

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Quiet period after the last event before a domain is reported
    pub debounce: Duration,
    /// How often pending domains are checked for ripeness
    pub tick: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(2),
            tick: Duration::from_secs(1),
        }
    }
}

/// Per-domain debounce bookkeeping. Time is passed in so the logic can be
/// driven deterministically.
#[derive(Debug)]
pub struct PendingChanges {
    debounce: Duration,
    pending: HashMap<String, Instant>,
    last_processed: HashMap<String, Instant>,
}

impl PendingChanges {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            pending: HashMap::new(),
            last_processed: HashMap::new(),
        }
    }

    /// Record an event for `domain`, re-arming its quiet period.
    pub fn record(&mut self, domain: impl Into<String>, now: Instant) {
        self.pending.insert(domain.into(), now);
    }

    pub fn is_pending(&self, domain: &str) -> bool {
        self.pending.contains_key(domain)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Remove and return domains whose last event is at least `debounce`
    /// old. A domain already finalised within the last `debounce` is dropped
    /// without being returned.
    pub fn take_ripe(&mut self, now: Instant) -> Vec<String> {
        let ripe: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, seen)| now.saturating_duration_since(**seen) >= self.debounce)
            .map(|(domain, _)| domain.clone())
            .collect();

        let mut out = Vec::with_capacity(ripe.len());
        for domain in ripe {
            self.pending.remove(&domain);

            let recent = self
                .last_processed
                .get(&domain)
                .is_some_and(|at| now.saturating_duration_since(*at) < self.debounce);
            if recent {
                debug!(domain = %domain, "Domain already processed in this window");
                continue;
            }

            self.last_processed.insert(domain.clone(), now);
            out.push(domain);
        }

        out.sort();
        out
    }
}

/// Domain owning `path`, i.e. its first component below `root`.
pub fn domain_of(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    match relative.components().next()? {
        Component::Normal(name) => name.to_str().map(str::to_string),
        _ => None,
    }
}

fn is_relevant(kind: &EventKind) -> bool {
    match kind {
        EventKind::Create(_) => true,
        EventKind::Modify(ModifyKind::Metadata(_)) => false,
        EventKind::Modify(_) => true,
        _ => false,
    }
}

/// Events that can bring a new directory into the root: creation, or a
/// rename whose destination is known.
fn adds_entry(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_)
            | EventKind::Modify(ModifyKind::Name(RenameMode::To | RenameMode::Both))
    )
}

/// Handle to the background watcher task.
pub struct WatcherHandle {
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WatcherHandle {
    /// Stop watching and wait for the task to exit. Safe to call repeatedly.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
            info!("Certificate watcher stopped");
        }
    }
}

/// Start watching the store root. Fails only if the root or the underlying
/// notification primitive cannot be set up; later errors are logged.
pub fn spawn_cert_watcher(
    store: CertStore,
    config: WatcherConfig,
    changes: mpsc::Sender<DomainChange>,
    cancel: CancellationToken,
) -> Result<WatcherHandle, WatchError> {
    let root = store
        .root()
        .canonicalize()
        .map_err(|source| WatchError::Root {
            path: store.root().to_path_buf(),
            source,
        })?;
    let store = CertStore::new(root.clone());

    let (event_tx, event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher = notify::recommended_watcher(move |res| {
        let _ = event_tx.send(res);
    })
    .map_err(WatchError::Init)?;

    watch_path(&mut watcher, &root)?;
    for domain in store.domains().unwrap_or_default() {
        let dir = root.join(&domain);
        if let Err(e) = watch_path(&mut watcher, &dir) {
            warn!(error = %e, "Domain directory not watched");
        }
    }

    info!(root = %root.display(), debounce = ?config.debounce, "Watching certificate root");

    let task = tokio::spawn(run_watch_loop(
        watcher,
        store,
        config,
        event_rx,
        changes,
        cancel.clone(),
    ));

    Ok(WatcherHandle {
        cancel,
        task: Mutex::new(Some(task)),
    })
}

fn watch_path(watcher: &mut RecommendedWatcher, path: &Path) -> Result<(), WatchError> {
    watcher
        .watch(path, RecursiveMode::NonRecursive)
        .map_err(|source| WatchError::Watch {
            path: path.to_path_buf(),
            source,
        })
}

async fn run_watch_loop(
    mut watcher: RecommendedWatcher,
    store: CertStore,
    config: WatcherConfig,
    mut events: mpsc::UnboundedReceiver<notify::Result<Event>>,
    changes: mpsc::Sender<DomainChange>,
    cancel: CancellationToken,
) {
    let root = store.root().to_path_buf();
    let mut pending = PendingChanges::new(config.debounce);
    let mut ticker = tokio::time::interval(config.tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => {
                match event {
                    Some(Ok(event)) => {
                        handle_event(&mut watcher, &root, &event, &mut pending);
                    }
                    Some(Err(e)) => warn!(error = %e, "Filesystem watcher error"),
                    None => {
                        warn!("Filesystem event source closed");
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                for domain in pending.take_ripe(Instant::now()) {
                    let files = match store.read_files(&domain) {
                        Ok(files) => files,
                        Err(e) => {
                            warn!(domain = %domain, error = %e, "Failed to read certificate files");
                            continue;
                        }
                    };
                    if files.is_empty() {
                        debug!(domain = %domain, "No certificate files, skipping notification");
                        continue;
                    }

                    info!(domain = %domain, files = files.len(), "Certificate change detected");
                    if changes.send(DomainChange { domain, files }).await.is_err() {
                        debug!("Change receiver dropped, stopping watcher");
                        return;
                    }
                }
            }
        }
    }
}

fn handle_event(
    watcher: &mut RecommendedWatcher,
    root: &Path,
    event: &Event,
    pending: &mut PendingChanges,
) {
    if !is_relevant(&event.kind) {
        return;
    }

    for path in &event.paths {
        let Some(domain) = domain_of(root, path) else {
            continue;
        };

        // New or moved-in first-level directory: start watching it
        let is_domain_dir = path.parent() == Some(root);
        if is_domain_dir && adds_entry(&event.kind) && path.is_dir() {
            match watch_path(watcher, path) {
                Ok(()) => info!(domain = %domain, "Watching new domain directory"),
                Err(e) => warn!(error = %e, "Failed to watch new domain directory"),
            }
        }

        if domain.starts_with('.') {
            continue;
        }
        pending.record(domain, Instant::now());
    }
}
