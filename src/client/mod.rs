//! Client side: the long-running daemon and the one-shot request client.

pub mod backoff;
pub mod batch;
pub mod daemon;
pub mod debouncer;
pub mod heartbeat;
pub mod oneshot;
pub mod transport;
pub mod workspace;

pub use backoff::{backoff, ReconnectBackoff, MAX_BACKOFF};
pub use batch::{BatchError, BatchOptions, BatchReport, CertBatch};
pub use daemon::{Daemon, DaemonError, DaemonOptions, DaemonState};
pub use debouncer::ReloadDebouncer;
pub use heartbeat::{HeartbeatMonitor, HeartbeatStatus};
pub use oneshot::OneShotClient;
pub use transport::ClientError;
pub use workspace::{Workspace, WorkspaceError};
