//! One-shot fetch over several domains.
//!
//! Each bundle is saved into the workspace and, in deploy mode, copied to its
//! site's targets. Reload commands are collected across the whole batch and
//! each distinct one runs once at the end. A dry run fetches but writes and
//! runs nothing.

use std::collections::BTreeSet;
use std::path::PathBuf;

use thiserror::Error;
use tracing::{info, warn};

use super::oneshot::OneShotClient;
use super::transport::ClientError;
use super::workspace::{Workspace, WorkspaceError};
use crate::config::ClientConfig;
use crate::deploy::{
    deploy_with_retry, find_site, CommandError, CommandRunner, DeployError, Deployer, SiteDeploy,
};

/// Batch errors for a single domain
#[derive(Debug, Error)]
pub enum BatchError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Deploy(#[from] DeployError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOptions {
    pub force: bool,
    pub deploy: bool,
    pub dry_run: bool,
    /// Replaces every site's reload command
    pub reload_cmd: Option<String>,
}

/// What was done for one domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedDomain {
    pub domain: String,
    pub timestamp: i64,
    pub files: usize,
    /// Workspace directory, unset in a dry run
    pub saved_to: Option<PathBuf>,
    /// Deployed paths, or the paths a dry run would write
    pub targets: Vec<PathBuf>,
    pub reload: Option<String>,
}

#[derive(Debug)]
pub struct DomainOutcome {
    pub domain: String,
    pub result: Result<FetchedDomain, BatchError>,
}

#[derive(Debug)]
pub struct ReloadOutcome {
    pub command: String,
    /// Unset when the command was only listed (dry run)
    pub result: Option<Result<String, CommandError>>,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub domains: Vec<DomainOutcome>,
    pub reloads: Vec<ReloadOutcome>,
}

impl BatchReport {
    pub fn failed_domains(&self) -> usize {
        self.domains.iter().filter(|d| d.result.is_err()).count()
    }

    pub fn failed_reloads(&self) -> usize {
        self.reloads
            .iter()
            .filter(|r| matches!(r.result, Some(Err(_))))
            .count()
    }
}

pub struct CertBatch {
    workspace: Workspace,
    sites: Vec<SiteDeploy>,
    default_reload_cmd: String,
    deploy_attempts: u32,
    options: BatchOptions,
}

impl CertBatch {
    pub fn new(config: &ClientConfig, options: BatchOptions) -> Self {
        Self {
            workspace: Workspace::new(&config.work_dir),
            sites: config.sites.clone(),
            default_reload_cmd: config.default_reload_cmd.clone(),
            deploy_attempts: config.deploy_attempts,
            options,
        }
    }

    /// Reload command precedence: override, then the site's own, then the
    /// configured default.
    fn with_reload(&self, site: &SiteDeploy) -> SiteDeploy {
        let mut site = site.clone();
        match self.options.reload_cmd.as_deref().map(str::trim) {
            Some(cmd) if !cmd.is_empty() => site.reloadcmd = cmd.to_string(),
            _ if site.reload_command().is_none() => {
                site.reloadcmd = self.default_reload_cmd.clone();
            }
            _ => {}
        }
        site
    }

    /// Process every domain in order, then run the distinct reloads.
    pub async fn run(
        &self,
        client: &mut OneShotClient,
        domains: &[String],
        runner: &dyn CommandRunner,
    ) -> BatchReport {
        let mut report = BatchReport::default();
        let mut pending = BTreeSet::new();

        for domain in domains {
            let result = self.fetch_one(client, domain).await;
            match &result {
                Ok(fetched) => {
                    if let Some(cmd) = &fetched.reload {
                        pending.insert(cmd.clone());
                    }
                }
                Err(e) => warn!(domain = %domain, error = %e, "Domain failed"),
            }
            report.domains.push(DomainOutcome {
                domain: domain.clone(),
                result,
            });
        }

        for command in pending {
            let result = if self.options.dry_run {
                info!(command = %command, "Dry run, reload skipped");
                None
            } else {
                Some(runner.run(&command).await)
            };
            report.reloads.push(ReloadOutcome { command, result });
        }
        report
    }

    async fn fetch_one(
        &self,
        client: &mut OneShotClient,
        domain: &str,
    ) -> Result<FetchedDomain, BatchError> {
        let response = client.request_cert(domain, self.options.force).await?;
        let mut fetched = FetchedDomain {
            domain: response.domain.clone(),
            timestamp: response.timestamp,
            files: response.files.len(),
            saved_to: None,
            targets: Vec::new(),
            reload: None,
        };

        if !self.options.dry_run {
            fetched.saved_to = Some(self.workspace.save_files(&response.domain, &response.files)?);
        }
        if !self.options.deploy {
            return Ok(fetched);
        }

        let Some(site) = find_site(&self.sites, &response.domain) else {
            info!(domain = %response.domain, "No deploy site configured, skipping deploy");
            return Ok(fetched);
        };
        let deployer = Deployer::for_site(Some(&self.with_reload(site)));

        if self.options.dry_run {
            fetched.reload = deployer.checked_reload()?;
            fetched.targets = deployer
                .targets(&response.domain)
                .into_iter()
                .map(|(_, path)| path)
                .collect();
            info!(domain = %response.domain, targets = fetched.targets.len(), "Dry run, deploy skipped");
            return Ok(fetched);
        }

        let outcome = deploy_with_retry(
            &deployer,
            &response.domain,
            &response.files,
            self.deploy_attempts,
        )
        .await?;
        fetched.targets = outcome.written;
        fetched.reload = outcome.reload;
        Ok(fetched)
    }
}
