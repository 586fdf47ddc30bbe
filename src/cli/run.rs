//! Handlers behind each CLI command.

use std::path::PathBuf;
use std::sync::Arc;

use color_eyre::eyre::{bail, WrapErr};
use color_eyre::Result;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::output;
use crate::client::{BatchOptions, CertBatch, Daemon, OneShotClient};
use crate::config::{ClientConfig, ConfigHolder, ServerConfig};
use crate::deploy::ProcessRunner;
use crate::server;

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

pub async fn run_server(config_path: Option<PathBuf>) -> Result<()> {
    let config = ServerConfig::load(config_path.as_deref()).wrap_err("loading server config")?;
    let handle = server::start(&config).await?;

    shutdown_signal().await;
    info!("Shutdown requested");
    handle.shutdown().await;
    Ok(())
}

pub async fn run_daemon(config_path: Option<PathBuf>) -> Result<()> {
    let config = ClientConfig::load(config_path.as_deref()).wrap_err("loading client config")?;
    let holder = Arc::new(ConfigHolder::new(config.clone()));

    let daemon = Arc::new(Daemon::new(
        config.daemon_options(),
        Arc::new(ProcessRunner::default()),
    ));
    let cancel = CancellationToken::new();

    let forward = tokio::spawn(forward_config_changes(
        holder.subscribe(),
        daemon.clone(),
        cancel.clone(),
    ));

    #[cfg(unix)]
    tokio::spawn(reload_on_hangup(holder.clone(), config_path, cancel.clone()));

    let run = tokio::spawn({
        let daemon = daemon.clone();
        let cancel = cancel.clone();
        async move { daemon.run(cancel).await }
    });

    shutdown_signal().await;
    info!("Shutdown requested");
    cancel.cancel();

    run.await??;
    let _ = forward.await;
    Ok(())
}

/// Push subscribe/site changes from the holder into the running daemon.
async fn forward_config_changes(
    mut rx: watch::Receiver<Arc<ClientConfig>>,
    daemon: Arc<Daemon>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let config = rx.borrow_and_update().clone();
                daemon
                    .update_config(config.subscribe.clone(), config.sites.clone())
                    .await;
            }
        }
    }
}

#[cfg(unix)]
async fn reload_on_hangup(
    holder: Arc<ConfigHolder<ClientConfig>>,
    config_path: Option<PathBuf>,
    cancel: CancellationToken,
) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(sig) => sig,
        Err(e) => {
            warn!(error = %e, "Config reload on SIGHUP unavailable");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = hangup.recv() => {
                if received.is_none() {
                    break;
                }
                match ClientConfig::load(config_path.as_deref()) {
                    Ok(config) => {
                        let previous = holder.replace(config);
                        let current = holder.current();
                        if previous.server_url != current.server_url
                            || previous.password != current.password
                        {
                            warn!("Server URL or password changed, restart the daemon to apply");
                        }
                        info!("Configuration reloaded");
                    }
                    Err(e) => warn!(error = %e, "Config reload failed, keeping current settings"),
                }
            }
        }
    }
}

pub async fn run_cert(
    domains: Vec<String>,
    options: BatchOptions,
    config_path: Option<PathBuf>,
) -> Result<()> {
    let config = ClientConfig::load(config_path.as_deref()).wrap_err("loading client config")?;
    let domains = if domains.is_empty() {
        config.site_domains()
    } else {
        domains
    };
    if domains.is_empty() {
        bail!("no domains given and no deploy sites configured");
    }

    let dry_run = options.dry_run;
    let batch = CertBatch::new(&config, options);
    let mut client =
        OneShotClient::connect(&config.server_url, &config.password, &config.client_id).await?;
    let report = batch
        .run(&mut client, &domains, &ProcessRunner::default())
        .await;
    client.close().await;

    output::print_batch(&report, dry_run);
    let failed = report.failed_domains();
    if failed > 0 {
        bail!("{} of {} domains failed", failed, report.domains.len());
    }
    Ok(())
}

pub async fn run_status(config_path: Option<PathBuf>) -> Result<()> {
    let config = ClientConfig::load(config_path.as_deref()).wrap_err("loading client config")?;

    let mut client =
        OneShotClient::connect(&config.server_url, &config.password, &config.client_id).await?;
    let status = client.request_status().await;
    client.close().await;

    output::print_status(&status?);
    Ok(())
}
