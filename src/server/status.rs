//! Per-domain certificate status for `status_response`.

use std::fs;

use super::store::CertStore;
use crate::bundle::{CERT_FILE, FULLCHAIN_FILE, KEY_FILE};
use crate::protocol::DomainStatus;

fn file_size(store: &CertStore, domain: &str, name: &str) -> Option<u64> {
    let dir = store.domain_dir(domain).ok()?;
    fs::metadata(dir.join(name))
        .ok()
        .filter(|meta| meta.is_file())
        .map(|meta| meta.len())
}

/// Inspect one domain directory. Validity means the three core files are
/// present and non-empty; certificate contents are not parsed.
pub fn collect_domain_status(store: &CertStore, domain: &str) -> DomainStatus {
    let mut status = DomainStatus {
        domain: domain.to_string(),
        ..Default::default()
    };

    if let Err(e) = store.domain_dir(domain) {
        status.error = e.to_string();
        return status;
    }

    let cert = file_size(store, domain, CERT_FILE);
    let key = file_size(store, domain, KEY_FILE);
    let fullchain = file_size(store, domain, FULLCHAIN_FILE);

    status.has_cert = cert.is_some();
    status.has_key = key.is_some();
    status.has_fullchain = fullchain.is_some();
    status.cert_size = cert.unwrap_or(0);
    status.key_size = key.unwrap_or(0);
    status.fullchain_size = fullchain.unwrap_or(0);
    status.last_update = store.timestamp(domain).unwrap_or(0);

    let mut problems = Vec::new();
    for (name, size) in [(CERT_FILE, cert), (KEY_FILE, key), (FULLCHAIN_FILE, fullchain)] {
        match size {
            None => problems.push(format!("{name} missing")),
            Some(0) => problems.push(format!("{name} empty")),
            Some(_) => {}
        }
    }

    status.valid = problems.is_empty();
    status.error = problems.join(", ");
    status
}

/// Status of every domain in the store; empty if the root is unreadable.
pub fn collect_all(store: &CertStore) -> Vec<DomainStatus> {
    store
        .domains()
        .unwrap_or_default()
        .iter()
        .map(|domain| collect_domain_status(store, domain))
        .collect()
}
