//! Local copy of every bundle the client has received.
//!
//! Layout mirrors the server store: `<work_dir>/<domain>/<file>`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::bundle::{parse_timestamp, FileMap, KEY_FILE, TIMESTAMP_FILE};

/// Workspace errors
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("unsafe domain name: {0:?}")]
    UnsafeDomain(String),

    #[error("unsafe file name: {0:?}")]
    UnsafeFilename(String),

    #[error("workspace I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn is_safe_component(name: &str) -> bool {
    !(name.is_empty()
        || name == "."
        || name.contains("..")
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0'))
}

pub fn validate_filename(name: &str) -> Result<(), WorkspaceError> {
    if is_safe_component(name) {
        Ok(())
    } else {
        Err(WorkspaceError::UnsafeFilename(name.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure(&self) -> Result<(), WorkspaceError> {
        std::fs::create_dir_all(&self.root).map_err(|source| WorkspaceError::Io {
            path: self.root.clone(),
            source,
        })
    }

    pub fn domain_dir(&self, domain: &str) -> Result<PathBuf, WorkspaceError> {
        if !is_safe_component(domain) {
            return Err(WorkspaceError::UnsafeDomain(domain.to_string()));
        }
        Ok(self.root.join(domain))
    }

    /// Write every file of a bundle. All names are checked before anything
    /// is written.
    pub fn save_files(&self, domain: &str, files: &FileMap) -> Result<PathBuf, WorkspaceError> {
        let dir = self.domain_dir(domain)?;
        for name in files.keys() {
            validate_filename(name)?;
        }

        std::fs::create_dir_all(&dir).map_err(|source| WorkspaceError::Io {
            path: dir.clone(),
            source,
        })?;

        for (name, content) in files {
            let path = dir.join(name);
            write_atomic(&path, content, name == KEY_FILE)?;
            debug!(path = %path.display(), size = content.len(), "Saved file");
        }

        info!(domain = %domain, files = files.len(), dir = %dir.display(), "Bundle saved to workspace");
        Ok(dir)
    }

    pub fn timestamp(&self, domain: &str) -> Option<i64> {
        let dir = self.domain_dir(domain).ok()?;
        let content = std::fs::read(dir.join(TIMESTAMP_FILE)).ok()?;
        parse_timestamp(&content)
    }

    /// Every domain held locally with its marker timestamp (0 if none).
    pub fn timestamps(&self) -> BTreeMap<String, i64> {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return BTreeMap::new();
        };

        entries
            .flatten()
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .filter(|name| !name.starts_with('.'))
            .map(|domain| {
                let ts = self.timestamp(&domain).unwrap_or(0);
                (domain, ts)
            })
            .collect()
    }
}

fn write_atomic(path: &Path, content: &[u8], private: bool) -> Result<(), WorkspaceError> {
    let io_err = |source: std::io::Error| WorkspaceError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    std::fs::write(&tmp, content).map_err(io_err)?;

    if private {
        restrict_permissions(&tmp).map_err(io_err)?;
    }

    if let Err(source) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_err(source));
    }
    Ok(())
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn bundle_files(ts: &str) -> FileMap {
        let mut files = FileMap::new();
        files.insert("cert.pem".to_string(), b"CERT".to_vec());
        files.insert("key.pem".to_string(), b"KEY".to_vec());
        files.insert("time.log".to_string(), ts.as_bytes().to_vec());
        files
    }

    #[test]
    fn test_save_and_inventory() {
        let tmp = TempDir::new().unwrap();
        let ws = Workspace::new(tmp.path());

        ws.save_files("a.com", &bundle_files("150")).unwrap();
        std::fs::create_dir(tmp.path().join("b.com")).unwrap();

        assert_eq!(std::fs::read(tmp.path().join("a.com/cert.pem")).unwrap(), b"CERT");
        let inventory = ws.timestamps();
        assert_eq!(inventory.get("a.com"), Some(&150));
        assert_eq!(inventory.get("b.com"), Some(&0));
    }

    #[test]
    fn test_rejects_unsafe_names_before_writing() {
        let tmp = TempDir::new().unwrap();
        let ws = Workspace::new(tmp.path());

        let mut files = bundle_files("1");
        files.insert("../escape.pem".to_string(), b"x".to_vec());
        assert!(matches!(
            ws.save_files("a.com", &files),
            Err(WorkspaceError::UnsafeFilename(_))
        ));
        assert!(!tmp.path().join("a.com").exists());

        assert!(matches!(
            ws.save_files("../etc", &bundle_files("1")),
            Err(WorkspaceError::UnsafeDomain(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_private_key_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = TempDir::new().unwrap();
        let ws = Workspace::new(tmp.path());
        ws.save_files("a.com", &bundle_files("1")).unwrap();

        let mode = std::fs::metadata(tmp.path().join("a.com/key.pem"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_missing_root_has_empty_inventory() {
        let ws = Workspace::new("/nonexistent/certdeliver-test");
        assert!(ws.timestamps().is_empty());
    }
}
