//! Reload debouncer.
//!
//! Triggers are sent to a single task that owns the pending set. Each
//! trigger re-arms the quiet-period deadline; when it expires every distinct
//! pending command runs once, in order, on that same task. Triggers that
//! arrive during a batch wait in the channel, so batches never overlap.

use std::collections::BTreeSet;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::deploy::CommandRunner;

pub const DEFAULT_RELOAD_DEBOUNCE: Duration = Duration::from_secs(5);

/// Cloneable handle for scheduling reload commands.
#[derive(Clone)]
pub struct ReloadDebouncer {
    tx: mpsc::UnboundedSender<String>,
}

impl ReloadDebouncer {
    /// Start the debouncer task. It exits when `cancel` fires or every
    /// handle has been dropped.
    pub fn spawn(
        delay: Duration,
        runner: Arc<dyn CommandRunner>,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_debouncer(delay, runner, rx, cancel));
        (Self { tx }, task)
    }

    /// Queue `cmd` and restart the quiet period. Empty commands are ignored.
    pub fn trigger(&self, cmd: impl Into<String>) {
        let cmd = cmd.into();
        if cmd.trim().is_empty() {
            return;
        }
        if self.tx.send(cmd).is_err() {
            warn!("Reload debouncer stopped, command dropped");
        }
    }
}

async fn run_debouncer(
    delay: Duration,
    runner: Arc<dyn CommandRunner>,
    mut rx: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) {
    let mut pending_cmds: BTreeSet<String> = BTreeSet::new();
    let mut deadline: Option<Instant> = None;

    loop {
        let armed = deadline;
        let timer = async move {
            match armed {
                Some(at) => sleep_until(at).await,
                None => pending::<()>().await,
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            cmd = rx.recv() => {
                let Some(cmd) = cmd else { break };
                pending_cmds.insert(cmd);
                deadline = Some(Instant::now() + delay);
                debug!(pending = pending_cmds.len(), delay = ?delay, "Reload queued");
            }
            _ = timer => {
                deadline = None;
                let batch = std::mem::take(&mut pending_cmds);
                info!(count = batch.len(), "Running debounced reload commands");
                for cmd in batch {
                    if let Err(e) = runner.run(&cmd).await {
                        warn!(command = %cmd, error = %e, "Reload command failed");
                    }
                }
            }
        }
    }

    if !pending_cmds.is_empty() {
        warn!(count = pending_cmds.len(), "Reload debouncer stopped with pending commands");
    }
}
