//! Certificate bundles: the unit of data pushed to and pulled by clients.
//!
//! A bundle is the set of certificate-related files found in one domain
//! directory, keyed by file name, plus a freshness timestamp read from the
//! `time.log` marker file.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::Utc;

/// File name -> raw file content.
pub type FileMap = BTreeMap<String, Vec<u8>>;

pub const CERT_FILE: &str = "cert.pem";
pub const KEY_FILE: &str = "key.pem";
pub const FULLCHAIN_FILE: &str = "fullchain.pem";

/// Marker file whose content is a decimal Unix timestamp.
pub const TIMESTAMP_FILE: &str = "time.log";

/// Well-known certificate file names.
const WELL_KNOWN_FILES: &[&str] = &[
    CERT_FILE,
    KEY_FILE,
    FULLCHAIN_FILE,
    "chain.pem",
    "ca.cer",
    "cert.cer",
    "fullchain.cer",
];

const CERT_EXTENSIONS: &[&str] = &["pem", "cer", "crt", "key"];

/// Returns true if `name` belongs in a certificate bundle.
pub fn is_cert_file(name: &str) -> bool {
    if name == TIMESTAMP_FILE || WELL_KNOWN_FILES.contains(&name) {
        return true;
    }

    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| CERT_EXTENSIONS.contains(&ext))
        .unwrap_or(false)
}

/// Parse the content of a timestamp marker file.
///
/// Surrounding whitespace is ignored and only the first 10 characters are
/// significant (a seconds-resolution Unix timestamp).
pub fn parse_timestamp(content: &[u8]) -> Option<i64> {
    let text = std::str::from_utf8(content).ok()?.trim();
    let digits = match text.char_indices().nth(10) {
        Some((idx, _)) => &text[..idx],
        None => text,
    };
    digits.parse::<i64>().ok().filter(|ts| *ts > 0)
}

/// Current Unix time in seconds.
pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

/// A domain's certificate files plus their freshness timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    pub domain: String,
    pub files: FileMap,
    pub timestamp: i64,
}

impl Bundle {
    /// Build a bundle, taking the timestamp from the marker file when it is
    /// present and parseable, otherwise from the current time.
    pub fn from_files(domain: impl Into<String>, files: FileMap) -> Self {
        let timestamp = files
            .get(TIMESTAMP_FILE)
            .and_then(|content| parse_timestamp(content))
            .unwrap_or_else(unix_now);

        Self {
            domain: domain.into(),
            files,
            timestamp,
        }
    }

    /// A bundle is deliverable only if it carries at least one file.
    pub fn is_deliverable(&self) -> bool {
        !self.files.is_empty()
    }

    /// Names of files that are present but empty.
    pub fn empty_files(&self) -> Vec<&str> {
        self.files
            .iter()
            .filter(|(_, content)| content.is_empty())
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn total_size(&self) -> usize {
        self.files.values().map(Vec::len).sum()
    }
}
