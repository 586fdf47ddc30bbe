//! Read-only view of the certificate root directory.
//!
//! The root holds one subdirectory per domain; each contains the bundle
//! files recognised by [`is_cert_file`].

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::bundle::{is_cert_file, parse_timestamp, Bundle, FileMap, TIMESTAMP_FILE};

/// Certificate store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid domain name: {0:?}")]
    InvalidDomain(String),

    #[error("domain not found: {0}")]
    DomainNotFound(String),

    #[error("no files available for {0}")]
    NoFiles(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Reject names that could escape the root.
pub fn validate_domain(domain: &str) -> Result<(), StoreError> {
    let bad = domain.is_empty()
        || domain.contains('/')
        || domain.contains('\\')
        || domain.contains("..")
        || domain.contains('\0');
    if bad {
        Err(StoreError::InvalidDomain(domain.to_string()))
    } else {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CertStore {
    root: PathBuf,
}

impl CertStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn domain_dir(&self, domain: &str) -> Result<PathBuf, StoreError> {
        validate_domain(domain)?;
        Ok(self.root.join(domain))
    }

    /// Read every recognised file of `domain`. A missing directory yields an
    /// empty map; unreadable individual files are skipped.
    pub fn read_files(&self, domain: &str) -> Result<FileMap, StoreError> {
        let dir = self.domain_dir(domain)?;
        let mut files = FileMap::new();

        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
            Err(source) => return Err(StoreError::Io { path: dir, source }),
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !is_cert_file(name) {
                continue;
            }
            match std::fs::read(&path) {
                Ok(content) => {
                    files.insert(name.to_string(), content);
                }
                Err(e) => debug!(path = %path.display(), error = %e, "Skipping unreadable file"),
            }
        }

        Ok(files)
    }

    /// Load the deliverable bundle of `domain`.
    pub fn read_bundle(&self, domain: &str) -> Result<Bundle, StoreError> {
        let dir = self.domain_dir(domain)?;
        if !dir.is_dir() {
            return Err(StoreError::DomainNotFound(domain.to_string()));
        }

        let files = self.read_files(domain)?;
        if files.is_empty() {
            return Err(StoreError::NoFiles(domain.to_string()));
        }
        Ok(Bundle::from_files(domain, files))
    }

    /// Timestamp recorded in the domain's marker file, if any.
    pub fn timestamp(&self, domain: &str) -> Option<i64> {
        let dir = self.domain_dir(domain).ok()?;
        let content = std::fs::read(dir.join(TIMESTAMP_FILE)).ok()?;
        parse_timestamp(&content)
    }

    /// Every domain directory under the root, sorted.
    pub fn domains(&self) -> Result<Vec<String>, StoreError> {
        let entries = std::fs::read_dir(&self.root).map_err(|source| StoreError::Io {
            path: self.root.clone(),
            source,
        })?;

        let mut domains: Vec<String> = entries
            .flatten()
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .filter(|name| !name.starts_with('.'))
            .collect();
        domains.sort();
        Ok(domains)
    }
}
