//! Configuration handling for VPN bypass
//!
//! The user-facing [`Configuration`] (domains, services, flags) and the
//! daemon's own [`DaemonSettings`] live in one TOML file. The service
//! catalog is not stored there beyond each service's `enabled` flag.

use crate::services;
use crate::vpn::hosts::is_valid_hostname;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),
}

/// A user-configured bypass entry. Despite the name it may also hold a
/// literal address or CIDR (see [`EntryKind`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainEntry {
    pub id: String,
    pub domain: String,
    pub enabled: bool,
    /// Resolution cache; only valid for the current `domain` string
    #[serde(skip)]
    pub resolved_ip: Option<IpAddr>,
}

impl DomainEntry {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            domain: domain.into(),
            enabled: true,
            resolved_ip: None,
        }
    }

    pub fn kind(&self) -> Option<EntryKind> {
        EntryKind::classify(&self.domain)
    }
}

/// What a domain entry string denotes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    Host(String),
    Address(IpAddr),
    Network(IpNet),
}

impl EntryKind {
    /// Classify an already-normalized entry string
    pub fn classify(value: &str) -> Option<Self> {
        if let Ok(ip) = value.parse::<IpAddr>() {
            return Some(EntryKind::Address(ip));
        }
        if let Ok(net) = value.parse::<IpNet>() {
            return Some(EntryKind::Network(net.trunc()));
        }
        if is_valid_hostname(value) {
            return Some(EntryKind::Host(value.to_string()));
        }
        None
    }
}

/// Normalize user input for a domain entry: trim, lower-case, drop an
/// http(s) scheme, any path, a port and a trailing dot. Returns `None` when
/// what is left is neither a hostname, an address nor a CIDR.
pub fn normalize_entry(input: &str) -> Option<String> {
    let mut value = input.trim().to_ascii_lowercase();

    for scheme in ["https://", "http://"] {
        if let Some(rest) = value.strip_prefix(scheme) {
            value = rest.to_string();
        }
    }

    // A CIDR keeps its slash; anything else loses the path
    if value.parse::<IpNet>().is_err() {
        if let Some(idx) = value.find('/') {
            value.truncate(idx);
        }
    }

    // Strip a port, but leave IPv6 literals alone
    if value.matches(':').count() == 1 {
        if let Some(idx) = value.find(':') {
            value.truncate(idx);
        }
    }

    let value = value.trim_end_matches('.').to_string();
    EntryKind::classify(&value).map(|_| value)
}

/// Built-in service; only `enabled` may change at runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub id: String,
    pub name: String,
    pub domains: Vec<String>,
    pub ip_ranges: Vec<IpNet>,
    pub enabled: bool,
}

/// The authoritative bypass configuration consumed by the planner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    pub domains: Vec<DomainEntry>,
    pub services: Vec<ServiceEntry>,
    pub auto_apply_on_vpn: bool,
    pub manage_hosts_file: bool,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            domains: Vec::new(),
            services: services::catalog(),
            auto_apply_on_vpn: true,
            manage_hosts_file: false,
        }
    }
}

impl Configuration {
    pub fn domain_mut(&mut self, id: &str) -> Option<&mut DomainEntry> {
        self.domains.iter_mut().find(|d| d.id == id)
    }

    pub fn service_mut(&mut self, id: &str) -> Option<&mut ServiceEntry> {
        self.services.iter_mut().find(|s| s.id == id)
    }

    pub fn has_domain(&self, domain: &str) -> bool {
        self.domains.iter().any(|d| d.domain == domain)
    }

    /// Enforce unique ids and unique, normalized domain strings. Entries that
    /// cannot be normalized are dropped.
    fn sanitize(&mut self) {
        let mut ids = HashSet::new();
        let mut names = HashSet::new();
        self.domains.retain_mut(|entry| {
            let Some(normalized) = normalize_entry(&entry.domain) else {
                warn!("Dropping invalid domain entry: {}", entry.domain);
                return false;
            };
            entry.domain = normalized;
            if !names.insert(entry.domain.clone()) {
                warn!("Dropping duplicate domain entry: {}", entry.domain);
                return false;
            }
            if entry.id.is_empty() || !ids.insert(entry.id.clone()) {
                entry.id = uuid::Uuid::new_v4().to_string();
                ids.insert(entry.id.clone());
            }
            true
        });
    }
}

/// Tunables for the orchestrator daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonSettings {
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_secs: u64,
    #[serde(default = "default_dns_timeout")]
    pub dns_timeout_secs: u64,
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
}

pub const DEFAULT_SOCKET_PATH: &str = "/var/run/vpn-bypass-helper.sock";

fn default_socket_path() -> PathBuf {
    PathBuf::from(DEFAULT_SOCKET_PATH)
}

fn default_poll_interval() -> u64 {
    30
}

fn default_debounce() -> u64 {
    500
}

fn default_rpc_timeout() -> u64 {
    5
}

fn default_dns_timeout() -> u64 {
    3
}

fn default_log_capacity() -> usize {
    100
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            poll_interval_secs: default_poll_interval(),
            debounce_ms: default_debounce(),
            rpc_timeout_secs: default_rpc_timeout(),
            dns_timeout_secs: default_dns_timeout(),
            log_capacity: default_log_capacity(),
        }
    }
}

impl DaemonSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs.max(1))
    }

    pub fn dns_timeout(&self) -> Duration {
        Duration::from_secs(self.dns_timeout_secs.max(1))
    }
}

/// On-disk shape of the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConfigFile {
    #[serde(default = "default_true")]
    auto_apply_on_vpn: bool,
    #[serde(default)]
    manage_hosts_file: bool,
    #[serde(default)]
    domains: Vec<DomainEntry>,
    #[serde(default)]
    services: BTreeMap<String, bool>,
    #[serde(default)]
    daemon: DaemonSettings,
}

fn default_true() -> bool {
    true
}

impl ConfigFile {
    fn from_parts(config: &Configuration, daemon: &DaemonSettings) -> Self {
        Self {
            auto_apply_on_vpn: config.auto_apply_on_vpn,
            manage_hosts_file: config.manage_hosts_file,
            domains: config.domains.clone(),
            services: config
                .services
                .iter()
                .map(|s| (s.id.clone(), s.enabled))
                .collect(),
            daemon: daemon.clone(),
        }
    }

    fn into_parts(self) -> (Configuration, DaemonSettings) {
        for id in self.services.keys() {
            if !services::is_known(id) {
                warn!("Ignoring unknown service in config: {}", id);
            }
        }

        let mut services = services::catalog();
        for service in &mut services {
            service.enabled = self.services.get(&service.id).copied().unwrap_or(false);
        }

        let mut config = Configuration {
            domains: self.domains,
            services,
            auto_apply_on_vpn: self.auto_apply_on_vpn,
            manage_hosts_file: self.manage_hosts_file,
        };
        config.sanitize();
        (config, self.daemon)
    }
}

/// Persistence seam for configuration mutations
pub trait ConfigStore: Send + Sync {
    fn load(&self) -> Result<Configuration, ConfigError>;
    fn save(&self, config: &Configuration) -> Result<(), ConfigError>;
}

/// TOML-file backed [`ConfigStore`]. Keeps the `[daemon]` table it read so
/// saving a configuration never loses it.
pub struct TomlConfigStore {
    path: PathBuf,
    daemon: DaemonSettings,
}

impl TomlConfigStore {
    /// Open a config file; a missing file yields defaults
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let daemon = if path.exists() {
            read_file(&path)?.daemon
        } else {
            DaemonSettings::default()
        };
        Ok(Self { path, daemon })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn daemon(&self) -> &DaemonSettings {
        &self.daemon
    }
}

impl ConfigStore for TomlConfigStore {
    fn load(&self) -> Result<Configuration, ConfigError> {
        if !self.path.exists() {
            info!("No config file at {}, using defaults", self.path.display());
            return Ok(Configuration::default());
        }
        let (config, _) = read_file(&self.path)?.into_parts();
        Ok(config)
    }

    fn save(&self, config: &Configuration) -> Result<(), ConfigError> {
        save(&self.path, config, &self.daemon)
    }
}

fn read_file(path: &Path) -> Result<ConfigFile, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

/// Load configuration and daemon settings from `path`
pub fn load(path: &Path) -> Result<(Configuration, DaemonSettings), ConfigError> {
    Ok(read_file(path)?.into_parts())
}

/// Write configuration and daemon settings to `path`, creating parents
pub fn save(path: &Path, config: &Configuration, daemon: &DaemonSettings) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let content = toml::to_string_pretty(&ConfigFile::from_parts(config, daemon))?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Config file location: `vpn-bypass.toml` in the working directory if it
/// exists, otherwise `<config_dir>/vpn-bypass/config.toml`.
pub fn default_config_path() -> PathBuf {
    let local_config = PathBuf::from("vpn-bypass.toml");
    if local_config.exists() {
        return local_config;
    }

    dirs::config_dir()
        .map(|dir| dir.join("vpn-bypass").join("config.toml"))
        .unwrap_or(local_config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Configuration::default();
        assert!(config.domains.is_empty());
        assert_eq!(config.services.len(), services::catalog().len());
        assert!(config.auto_apply_on_vpn);
        assert!(!config.manage_hosts_file);
    }

    #[test]
    fn test_normalize_entry() {
        assert_eq!(normalize_entry("  Example.COM "), Some("example.com".into()));
        assert_eq!(
            normalize_entry("https://www.example.com/path?q=1"),
            Some("www.example.com".into())
        );
        assert_eq!(normalize_entry("example.com:8443"), Some("example.com".into()));
        assert_eq!(normalize_entry("example.com."), Some("example.com".into()));
        assert_eq!(normalize_entry("10.1.2.3"), Some("10.1.2.3".into()));
        assert_eq!(normalize_entry("10.0.0.0/8"), Some("10.0.0.0/8".into()));
        assert_eq!(normalize_entry("2001:db8::1"), Some("2001:db8::1".into()));
        assert_eq!(normalize_entry(""), None);
        assert_eq!(normalize_entry("not a domain"), None);
    }

    #[test]
    fn test_entry_kind() {
        assert_eq!(
            EntryKind::classify("example.com"),
            Some(EntryKind::Host("example.com".into()))
        );
        assert!(matches!(
            EntryKind::classify("1.2.3.4"),
            Some(EntryKind::Address(_))
        ));
        assert_eq!(
            EntryKind::classify("10.1.0.0/8"),
            Some(EntryKind::Network("10.0.0.0/8".parse().unwrap()))
        );
    }

    #[test]
    fn test_roundtrip_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let mut config = Configuration::default();
        config.domains.push(DomainEntry::new("example.com"));
        config.services[0].enabled = true;
        config.manage_hosts_file = true;
        let daemon = DaemonSettings {
            poll_interval_secs: 10,
            ..DaemonSettings::default()
        };

        save(&path, &config, &daemon).unwrap();
        let (loaded, loaded_daemon) = load(&path).unwrap();

        assert_eq!(loaded, config);
        assert_eq!(loaded_daemon, daemon);
    }

    #[test]
    fn test_services_come_from_catalog() {
        let toml = r#"
            [services]
            telegram = true
            myspace = true
        "#;
        let file: ConfigFile = toml::from_str(toml).unwrap();
        let (mut config, daemon) = file.into_parts();

        assert_eq!(config.services.len(), services::catalog().len());
        assert!(config.service_mut("telegram").unwrap().enabled);
        assert!(config.service_mut("myspace").is_none());
        assert!(config.auto_apply_on_vpn);
        assert_eq!(daemon, DaemonSettings::default());
    }

    #[test]
    fn test_sanitize_dedups_domains_and_ids() {
        let toml = r#"
            [[domains]]
            id = "a"
            domain = "Example.com"
            enabled = true

            [[domains]]
            id = "b"
            domain = "example.com"
            enabled = false

            [[domains]]
            id = "a"
            domain = "other.com"
            enabled = true

            [[domains]]
            id = "c"
            domain = "bad domain"
            enabled = true
        "#;
        let file: ConfigFile = toml::from_str(toml).unwrap();
        let (config, _) = file.into_parts();

        assert_eq!(config.domains.len(), 2);
        assert_eq!(config.domains[0].domain, "example.com");
        assert_eq!(config.domains[0].id, "a");
        assert_eq!(config.domains[1].domain, "other.com");
        assert_ne!(config.domains[1].id, "a");
    }

    #[test]
    fn test_store_preserves_daemon_table() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "[daemon]\ndebounce_ms = 900\n").unwrap();

        let store = TomlConfigStore::open(&path).unwrap();
        let mut config = store.load().unwrap();
        config.domains.push(DomainEntry::new("example.org"));
        store.save(&config).unwrap();

        let (reloaded, daemon) = load(&path).unwrap();
        assert_eq!(daemon.debounce_ms, 900);
        assert_eq!(reloaded.domains[0].domain, "example.org");
    }

    #[test]
    fn test_store_missing_file_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let store = TomlConfigStore::open(temp_dir.path().join("absent.toml")).unwrap();
        assert_eq!(store.load().unwrap(), Configuration::default());
        assert_eq!(store.daemon(), &DaemonSettings::default());
    }
}
