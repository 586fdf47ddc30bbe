//! certdeliver - push-based TLS certificate distribution.
//!
//! A server watches a directory of per-domain certificate bundles and pushes
//! changes over WebSocket to subscribed clients; the client daemon writes
//! them to its workspace, deploys them to configured targets and schedules
//! debounced reload commands.

pub mod bundle;
pub mod cli;
pub mod client;
pub mod config;
pub mod deploy;
pub mod protocol;
pub mod security;
pub mod server;
