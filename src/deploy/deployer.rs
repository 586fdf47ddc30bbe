//! Deploy sites: copying received bundles to their configured targets.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::command::{self, CommandError};
use crate::bundle::{FileMap, CERT_FILE, FULLCHAIN_FILE, KEY_FILE};
use crate::server::pattern;

/// Placeholder replaced by the pushed domain in target paths.
pub const DOMAIN_PLACEHOLDER: &str = "{domain}";

pub const DEFAULT_DEPLOY_ATTEMPTS: u32 = 3;
const RETRY_STEP: Duration = Duration::from_millis(500);

/// Deploy errors
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("{file} is missing or empty, cannot write {path}")]
    EmptyContent { file: &'static str, path: PathBuf },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid reload command: {0}")]
    Command(#[from] CommandError),
}

impl DeployError {
    /// Only I/O failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeployError::Write { .. })
    }
}

/// Target paths and reload command for a domain or `*.suffix` wildcard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SiteDeploy {
    pub domain: String,
    pub cert_path: String,
    pub key_path: String,
    pub fullchain_path: String,
    pub reloadcmd: String,
}

impl SiteDeploy {
    pub fn has_targets(&self) -> bool {
        !(self.cert_path.is_empty() && self.key_path.is_empty() && self.fullchain_path.is_empty())
    }

    pub fn reload_command(&self) -> Option<&str> {
        let cmd = self.reloadcmd.trim();
        (!cmd.is_empty()).then_some(cmd)
    }
}

/// Site for `domain`: an exact entry wins over a wildcard one.
pub fn find_site<'a>(sites: &'a [SiteDeploy], domain: &str) -> Option<&'a SiteDeploy> {
    sites
        .iter()
        .find(|site| site.domain.eq_ignore_ascii_case(domain))
        .or_else(|| {
            sites.iter().find(|site| {
                pattern::is_wildcard(&site.domain)
                    && pattern::matches_wildcard(&site.domain.to_ascii_lowercase(), domain)
            })
        })
}

/// Result of a successful deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeployOutcome {
    pub written: Vec<PathBuf>,
    /// Reload command to schedule, if the site has one
    pub reload: Option<String>,
}

/// Strategy chosen once per push from the site configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Deployer {
    /// No site (or no target paths) configured
    Noop,
    Files(SiteDeploy),
}

impl Deployer {
    pub fn for_site(site: Option<&SiteDeploy>) -> Self {
        match site {
            Some(site) if site.has_targets() || site.reload_command().is_some() => {
                Deployer::Files(site.clone())
            }
            _ => Deployer::Noop,
        }
    }

    /// Bundle file and destination for every configured target path.
    pub fn targets(&self, domain: &str) -> Vec<(&'static str, PathBuf)> {
        let Deployer::Files(site) = self else {
            return Vec::new();
        };
        [
            (CERT_FILE, &site.cert_path),
            (KEY_FILE, &site.key_path),
            (FULLCHAIN_FILE, &site.fullchain_path),
        ]
        .into_iter()
        .filter(|(_, target)| !target.is_empty())
        .map(|(file, target)| (file, PathBuf::from(target.replace(DOMAIN_PLACEHOLDER, domain))))
        .collect()
    }

    /// Reload command to run after deploying, checked against the command
    /// safety rules.
    pub fn checked_reload(&self) -> Result<Option<String>, DeployError> {
        let Deployer::Files(site) = self else {
            return Ok(None);
        };
        match site.reload_command() {
            Some(cmd) => {
                command::validate(cmd)?;
                Ok(Some(cmd.to_string()))
            }
            None => Ok(None),
        }
    }

    /// Write each configured target atomically.
    pub fn deploy(&self, domain: &str, files: &FileMap) -> Result<DeployOutcome, DeployError> {
        if *self == Deployer::Noop {
            return Ok(DeployOutcome::default());
        }
        let reload = self.checked_reload()?;

        let mut outcome = DeployOutcome::default();
        for (file, path) in self.targets(domain) {
            let content = files
                .get(file)
                .filter(|content| !content.is_empty())
                .ok_or_else(|| DeployError::EmptyContent {
                    file,
                    path: path.clone(),
                })?;

            write_atomic(&path, content)?;
            debug!(domain = %domain, path = %path.display(), "Deployed file");
            outcome.written.push(path);
        }

        outcome.reload = reload;
        info!(domain = %domain, files = outcome.written.len(), "Certificate deployed");
        Ok(outcome)
    }
}

/// Write via a sibling temp file and rename.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<(), DeployError> {
    let io_err = |source: std::io::Error| DeployError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    std::fs::write(&tmp, content).map_err(io_err)?;
    if let Err(source) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_err(source));
    }
    Ok(())
}

/// Deploy with bounded retries and a linear pause between attempts.
pub async fn deploy_with_retry(
    deployer: &Deployer,
    domain: &str,
    files: &FileMap,
    attempts: u32,
) -> Result<DeployOutcome, DeployError> {
    let attempts = attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match deployer.deploy(domain, files) {
            Ok(outcome) => return Ok(outcome),
            Err(e) if e.is_retryable() && attempt < attempts => {
                warn!(domain = %domain, attempt, error = %e, "Deploy failed, retrying");
                tokio::time::sleep(RETRY_STEP * attempt).await;
            }
            Err(e) => return Err(e),
        }
    }
}
