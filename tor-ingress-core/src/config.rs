//! Controller configuration, loaded from YAML.
//!
//! Every field has a default, so a missing or empty file yields a working
//! configuration. Durations are plain millisecond/second integers.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const CONFIG_FILE_NAME: &str = "config.yaml";
pub const APP_DIR_NAME: &str = "tor-ingress";

/// Root of the YAML configuration document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Where the torrc hash store lives.
    pub state_dir: PathBuf,
    /// Unix socket for `status` / `resync` / `stop`.
    pub socket_path: PathBuf,
    /// Replacement for the embedded torrc template.
    pub torrc_template: Option<PathBuf>,
    pub tor: TorConfig,
    pub source: SourceConfig,
    pub controller: ReconcileConfig,
    pub log: LogConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/tor-ingress"),
            socket_path: PathBuf::from("/run/tor-ingress/control.sock"),
            torrc_template: None,
            tor: TorConfig::default(),
            source: SourceConfig::default(),
            controller: ReconcileConfig::default(),
            log: LogConfig::default(),
        }
    }
}

/// How the daemon picks up a new configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReloadPolicy {
    /// `SIGHUP`; restart only if the signal fails or the process died.
    #[default]
    Signal,
    /// `SIGHUP`, then stop and start the process.
    Restart,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TorConfig {
    pub binary: PathBuf,
    /// Appended after `-f <torrc_path>`.
    pub extra_args: Vec<String>,
    pub torrc_path: PathBuf,
    /// Parent of every hidden-service directory.
    pub services_root: PathBuf,
    pub data_directory: Option<PathBuf>,
    pub reload_policy: ReloadPolicy,
    pub reload_grace_ms: u64,
    pub stop_timeout_ms: u64,
}

impl Default for TorConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("tor"),
            extra_args: vec![],
            torrc_path: PathBuf::from("/run/tor/torfile"),
            services_root: PathBuf::from("/run/tor"),
            data_directory: None,
            reload_policy: ReloadPolicy::Signal,
            reload_grace_ms: 500,
            stop_timeout_ms: 5_000,
        }
    }
}

impl TorConfig {
    pub fn reload_grace(&self) -> Duration {
        Duration::from_millis(self.reload_grace_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// Which address a backend is forwarded to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AddressMode {
    /// The Service's `spec.clusterIP`.
    #[default]
    ClusterIp,
    /// `<service>.<namespace>.svc.<cluster_domain>`.
    Dns,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub manifests_dir: PathBuf,
    pub status_dir: PathBuf,
    /// `0` disables periodic resync.
    pub resync_interval_secs: u64,
    pub address_mode: AddressMode,
    pub cluster_domain: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            manifests_dir: PathBuf::from("/etc/tor-ingress/manifests"),
            status_dir: PathBuf::from("/var/lib/tor-ingress/status"),
            resync_interval_secs: 300,
            address_mode: AddressMode::ClusterIp,
            cluster_domain: "cluster.local".to_string(),
        }
    }
}

impl SourceConfig {
    pub fn resync_interval(&self) -> Option<Duration> {
        (self.resync_interval_secs > 0).then(|| Duration::from_secs(self.resync_interval_secs))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub workers: usize,
    /// Consecutive failed syncs tolerated before a key is dropped.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub hostname_poll_ms: u64,
    pub hostname_timeout_ms: u64,
    pub status_retry_steps: u32,
    pub status_retry_delay_ms: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            max_retries: 5,
            backoff_base_ms: 5,
            backoff_max_ms: 1_000_000,
            hostname_poll_ms: 250,
            hostname_timeout_ms: 10_000,
            status_retry_steps: 5,
            status_retry_delay_ms: 10,
        }
    }
}

impl ReconcileConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn hostname_poll(&self) -> Duration {
        Duration::from_millis(self.hostname_poll_ms)
    }

    pub fn hostname_timeout(&self) -> Duration {
        Duration::from_millis(self.hostname_timeout_ms)
    }

    pub fn status_retry_delay(&self) -> Duration {
        Duration::from_millis(self.status_retry_delay_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Text => write!(f, "text"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub format: LogFormat,
    /// `EnvFilter` directive; `RUST_LOG` takes precedence.
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            filter: "info".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

impl ControllerConfig {
    /// Load and validate the config at `path`.
    ///
    /// Returns `ConfigError::NotFound` if absent,
    /// `ConfigError::Parse` (with path + line context) if malformed YAML.
    pub fn load_at(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound {
                path: path.to_path_buf(),
            });
        }
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: ControllerConfig = if contents.trim().is_empty() {
            ControllerConfig::default()
        } else {
            serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                source: e,
            })?
        };
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if given, else from the per-user default location if
    /// that file exists, else fall back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load_at(path);
        }
        match default_config_path() {
            Some(path) if path.exists() => Self::load_at(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.controller.workers == 0 {
            return Err(ConfigError::Invalid(
                "controller.workers must be at least 1".to_string(),
            ));
        }
        if self.controller.max_retries == 0 {
            return Err(ConfigError::Invalid(
                "controller.max_retries must be at least 1".to_string(),
            ));
        }
        if self.controller.status_retry_steps == 0 {
            return Err(ConfigError::Invalid(
                "controller.status_retry_steps must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// `<state_dir>/hashes.json`
    pub fn hash_store_path(&self) -> PathBuf {
        self.state_dir.join("hashes.json")
    }
}

/// `<config_dir>/tor-ingress/config.yaml`, if a config dir is known.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR_NAME).join(CONFIG_FILE_NAME))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_documented_values() {
        let config = ControllerConfig::default();
        assert_eq!(config.controller.max_retries, 5);
        assert_eq!(config.controller.workers, 1);
        assert_eq!(config.tor.torrc_path, PathBuf::from("/run/tor/torfile"));
        assert_eq!(config.tor.reload_policy, ReloadPolicy::Signal);
        assert_eq!(config.source.address_mode, AddressMode::ClusterIp);
    }

    #[test]
    fn partial_yaml_fills_in_defaults() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "tor:\n  binary: /usr/sbin/tor\n  reload_policy: restart\ncontroller:\n  workers: 4\n",
        )
        .expect("write");

        let config = ControllerConfig::load_at(&path).expect("load");
        assert_eq!(config.tor.binary, PathBuf::from("/usr/sbin/tor"));
        assert_eq!(config.tor.reload_policy, ReloadPolicy::Restart);
        assert_eq!(config.tor.services_root, PathBuf::from("/run/tor"));
        assert_eq!(config.controller.workers, 4);
        assert_eq!(config.controller.max_retries, 5);
    }

    #[test]
    fn empty_file_is_default_config() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "\n").expect("write");
        assert_eq!(
            ControllerConfig::load_at(&path).expect("load"),
            ControllerConfig::default()
        );
    }

    #[test]
    fn zero_workers_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "controller:\n  workers: 0\n").expect("write");
        let err = ControllerConfig::load_at(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)), "got: {err}");
    }

    #[test]
    fn resync_interval_zero_disables() {
        let mut source = SourceConfig::default();
        assert_eq!(source.resync_interval(), Some(Duration::from_secs(300)));
        source.resync_interval_secs = 0;
        assert_eq!(source.resync_interval(), None);
    }
}
