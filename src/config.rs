//! Configuration for the server and the client daemon.
//!
//! Values are layered: built-in defaults, then an optional JSON file, then
//! `CERTDELIVER_*` environment variables.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::client::daemon::DaemonOptions;
use crate::client::debouncer::DEFAULT_RELOAD_DEBOUNCE;
use crate::deploy::deployer::DEFAULT_DEPLOY_ATTEMPTS;
use crate::deploy::SiteDeploy;
use crate::security::DEFAULT_TIMESTAMP_TOLERANCE;
use crate::server::watcher::WatcherConfig;

pub const ENV_PREFIX: &str = "CERTDELIVER_";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid value for {name}: {value:?}")]
    InvalidEnv { name: String, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn env_value<T: FromStr>(name: &str, value: String) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        name: name.to_string(),
        value,
    })
}

/// Comma separated list, blanks dropped.
fn env_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn process_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Root directory holding one subdirectory per domain
    pub cert_dir: PathBuf,
    /// Shared secret clients sign with
    pub key: String,
    pub debounce_ms: u64,
    pub tick_ms: u64,
    pub mailbox_capacity: usize,
    pub timestamp_tolerance_secs: i64,
    pub ping_interval_secs: u64,
    pub read_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8080,
            cert_dir: PathBuf::from("./certs"),
            key: String::new(),
            debounce_ms: 2000,
            tick_ms: 1000,
            mailbox_capacity: 256,
            timestamp_tolerance_secs: DEFAULT_TIMESTAMP_TOLERANCE,
            ping_interval_secs: 108,
            read_timeout_secs: 120,
        }
    }
}

impl ServerConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config: Self = match path {
            Some(path) => read_json(path)?,
            None => Self::default(),
        };
        config.apply_env(process_env)?;
        config.ensure_key();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let var = |suffix: &str| {
            let name = format!("{ENV_PREFIX}{suffix}");
            lookup(&name).map(|value| (name, value))
        };

        if let Some((_, value)) = var("BIND") {
            self.bind = value;
        }
        if let Some((name, value)) = var("PORT") {
            self.port = env_value(&name, value)?;
        }
        if let Some((_, value)) = var("CERT_DIR") {
            self.cert_dir = PathBuf::from(value);
        }
        if let Some((_, value)) = var("KEY") {
            self.key = value;
        }
        if let Some((name, value)) = var("DEBOUNCE_MS") {
            self.debounce_ms = env_value(&name, value)?;
        }
        if let Some((name, value)) = var("MAILBOX_CAPACITY") {
            self.mailbox_capacity = env_value(&name, value)?;
        }
        if let Some((name, value)) = var("TIMESTAMP_TOLERANCE") {
            self.timestamp_tolerance_secs = env_value(&name, value)?;
        }
        Ok(())
    }

    /// Generate a random key when none is configured. Returns true if one
    /// was generated.
    pub fn ensure_key(&mut self) -> bool {
        if !self.key.trim().is_empty() {
            return false;
        }
        self.key = Uuid::new_v4().simple().to_string();
        warn!(key = %self.key, "No shared key configured, generated one for this run");
        true
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mailbox_capacity == 0 {
            return Err(ConfigError::Invalid("mailbox_capacity must be positive".into()));
        }
        if self.debounce_ms == 0 || self.tick_ms == 0 {
            return Err(ConfigError::Invalid(
                "debounce_ms and tick_ms must be positive".into(),
            ));
        }
        if self.timestamp_tolerance_secs <= 0 {
            return Err(ConfigError::Invalid(
                "timestamp_tolerance_secs must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn watcher_config(&self) -> WatcherConfig {
        WatcherConfig {
            debounce: Duration::from_millis(self.debounce_ms),
            tick: Duration::from_millis(self.tick_ms),
        }
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_url: String,
    pub password: String,
    pub client_id: String,
    pub work_dir: PathBuf,
    /// Domains and `*.suffix` patterns to receive
    pub subscribe: Vec<String>,
    pub sites: Vec<SiteDeploy>,
    pub reconnect_interval_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub reload_debounce_secs: u64,
    pub deploy_attempts: u32,
    /// Reload command for sites that configure none (one-shot deploys)
    pub default_reload_cmd: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8080/ws".to_string(),
            password: String::new(),
            client_id: default_client_id(),
            work_dir: default_work_dir(),
            subscribe: Vec::new(),
            sites: Vec::new(),
            reconnect_interval_secs: 5,
            heartbeat_interval_secs: 30,
            reload_debounce_secs: DEFAULT_RELOAD_DEBOUNCE.as_secs(),
            default_reload_cmd: String::new(),
            deploy_attempts: DEFAULT_DEPLOY_ATTEMPTS,
        }
    }
}

fn default_client_id() -> String {
    hostname::get()
        .ok()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "certdeliver-client".to_string())
}

fn default_work_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("certdeliver"))
        .unwrap_or_else(|| PathBuf::from("./certdeliver"))
}

impl ClientConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config: Self = match path {
            Some(path) => read_json(path)?,
            None => Self::default(),
        };
        config.apply_env(process_env)?;
        config.validate()?;
        debug!(server = %config.server_url, client_id = %config.client_id, "Client config loaded");
        Ok(config)
    }

    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let var = |suffix: &str| {
            let name = format!("{ENV_PREFIX}{suffix}");
            lookup(&name).map(|value| (name, value))
        };

        if let Some((_, value)) = var("SERVER_URL") {
            self.server_url = value;
        }
        if let Some((_, value)) = var("PASSWORD") {
            self.password = value;
        }
        if let Some((_, value)) = var("CLIENT_ID") {
            self.client_id = value;
        }
        if let Some((_, value)) = var("WORK_DIR") {
            self.work_dir = PathBuf::from(value);
        }
        if let Some((_, value)) = var("SUBSCRIBE") {
            self.subscribe = env_list(&value);
        }
        if let Some((name, value)) = var("RECONNECT_INTERVAL") {
            self.reconnect_interval_secs = env_value(&name, value)?;
        }
        if let Some((_, value)) = var("DEFAULT_RELOAD_CMD") {
            self.default_reload_cmd = value;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_url.trim().is_empty() {
            return Err(ConfigError::Invalid("server_url is required".into()));
        }
        if self.password.is_empty() {
            return Err(ConfigError::Invalid("password is required".into()));
        }
        if self.heartbeat_interval_secs == 0 || self.reconnect_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat and reconnect intervals must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Exact site domains, used by one-shot commands given no domains.
    pub fn site_domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = Vec::new();
        for site in &self.sites {
            let domain = site.domain.trim().to_lowercase();
            if domain.is_empty() || domain.contains('*') || domains.contains(&domain) {
                continue;
            }
            domains.push(domain);
        }
        domains
    }

    pub fn daemon_options(&self) -> DaemonOptions {
        DaemonOptions {
            server_url: self.server_url.clone(),
            password: self.password.clone(),
            client_id: self.client_id.clone(),
            work_dir: self.work_dir.clone(),
            subscribe: self.subscribe.clone(),
            sites: self.sites.clone(),
            reconnect_interval: Duration::from_secs(self.reconnect_interval_secs),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            reload_debounce: Duration::from_secs(self.reload_debounce_secs),
            deploy_attempts: self.deploy_attempts,
        }
    }
}

/// Owns the current configuration value. Consumers take `Arc` snapshots
/// or subscribe to replacements.
#[derive(Debug)]
pub struct ConfigHolder<T> {
    tx: watch::Sender<Arc<T>>,
}

impl<T> ConfigHolder<T> {
    pub fn new(value: T) -> Self {
        let (tx, _) = watch::channel(Arc::new(value));
        Self { tx }
    }

    pub fn current(&self) -> Arc<T> {
        self.tx.borrow().clone()
    }

    /// Install a new value and notify subscribers. Returns the previous one.
    pub fn replace(&self, value: T) -> Arc<T> {
        self.tx.send_replace(Arc::new(value))
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<T>> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_server_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.listen_addr(), "0.0.0.0:8080");
        assert_eq!(config.watcher_config().debounce, Duration::from_secs(2));
        assert_eq!(config.ping_interval(), Duration::from_secs(108));
        assert_eq!(config.read_timeout(), Duration::from_secs(120));
        assert_eq!(config.timestamp_tolerance_secs, 30);
    }

    #[test]
    fn test_file_then_env_layering() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("server.json");
        std::fs::write(&path, r#"{"port": 9000, "key": "from-file", "cert_dir": "/srv/certs"}"#)
            .unwrap();

        let mut config: ServerConfig = read_json(&path).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.mailbox_capacity, 256);

        config
            .apply_env(lookup(&[("CERTDELIVER_PORT", "9100"), ("CERTDELIVER_KEY", "env")]))
            .unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.key, "env");
        assert_eq!(config.cert_dir, PathBuf::from("/srv/certs"));
    }

    #[test]
    fn test_bad_env_value_is_reported() {
        let mut config = ServerConfig::default();
        let err = config
            .apply_env(lookup(&[("CERTDELIVER_PORT", "eighty")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { ref name, .. } if name == "CERTDELIVER_PORT"));
    }

    #[test]
    fn test_empty_key_is_generated() {
        let mut config = ServerConfig::default();
        assert!(config.ensure_key());
        assert_eq!(config.key.len(), 32);
        assert!(config.key.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(!config.ensure_key());
    }

    #[test]
    fn test_malformed_file_is_parse_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            ServerConfig::load(Some(&path)),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_client_subscribe_from_env() {
        let mut config = ClientConfig {
            password: "pw".into(),
            ..Default::default()
        };
        config
            .apply_env(lookup(&[("CERTDELIVER_SUBSCRIBE", "a.com, *.b.com,,")]))
            .unwrap();
        assert_eq!(config.subscribe, vec!["a.com", "*.b.com"]);
        assert!(config.validate().is_ok());

        let options = config.daemon_options();
        assert_eq!(options.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(options.deploy_attempts, 3);
    }

    #[test]
    fn test_site_domains_skip_wildcards_and_duplicates() {
        let site = |domain: &str| SiteDeploy {
            domain: domain.to_string(),
            ..Default::default()
        };
        let config = ClientConfig {
            sites: vec![site("B.com"), site("*.a.com"), site("b.com"), site("c.com")],
            ..Default::default()
        };
        assert_eq!(config.site_domains(), vec!["b.com", "c.com"]);
    }

    #[test]
    fn test_client_requires_password() {
        let config = ClientConfig::default();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_client_sites_from_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("client.json");
        std::fs::write(
            &path,
            r#"{
                "password": "pw",
                "default_reload_cmd": "systemctl reload nginx",
                "sites": [{"domain": "*.a.com", "cert_path": "/etc/ssl/{domain}.crt", "reloadcmd": "nginx -s reload"}]
            }"#,
        )
        .unwrap();

        let config: ClientConfig = read_json(&path).unwrap();
        assert_eq!(config.sites.len(), 1);
        assert_eq!(config.sites[0].key_path, "");
        assert_eq!(config.reload_debounce_secs, 5);
        assert_eq!(config.default_reload_cmd, "systemctl reload nginx");
    }

    #[test]
    #[serial]
    fn test_load_reads_process_env() {
        std::env::set_var("CERTDELIVER_PASSWORD", "from-env");
        std::env::set_var("CERTDELIVER_CLIENT_ID", "edge-7");
        let config = ClientConfig::load(None);
        std::env::remove_var("CERTDELIVER_PASSWORD");
        std::env::remove_var("CERTDELIVER_CLIENT_ID");

        let config = config.unwrap();
        assert_eq!(config.password, "from-env");
        assert_eq!(config.client_id, "edge-7");
    }

    #[tokio::test]
    async fn test_holder_notifies_subscribers() {
        let holder = ConfigHolder::new(vec!["a.com".to_string()]);
        let mut rx = holder.subscribe();

        let previous = holder.replace(vec!["b.com".to_string()]);
        assert_eq!(*previous, vec!["a.com"]);

        rx.changed().await.unwrap();
        assert_eq!(**rx.borrow(), vec!["b.com"]);
        assert_eq!(*holder.current(), vec!["b.com"]);
    }
}
