//! CLI configuration management.
//!
//! Configuration is stored as TOML:
//! - Linux: `$XDG_CONFIG_HOME/ezlo/cli.toml` (or `~/.config/ezlo/cli.toml`)
//! - Windows: `%APPDATA%/ezlo/cli.toml`

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ezlo_hub_connection::SessionConfig;
use serde::{Deserialize, Serialize};

/// CLI configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CliConfig {
    /// Credentials file. Defaults to `ezlo/credentials.json` next to this file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_path: Option<PathBuf>,

    /// How long to browse mDNS when looking for hubs.
    #[serde(default = "default_discovery_secs")]
    pub discovery_secs: u64,

    /// Fixed hosts per hub serial, for hubs not announced over mDNS.
    #[serde(default)]
    pub hosts: BTreeMap<String, String>,

    #[serde(default)]
    pub session: SessionSettings,
}

fn default_discovery_secs() -> u64 {
    5
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            credentials_path: None,
            discovery_secs: default_discovery_secs(),
            hosts: BTreeMap::new(),
            session: SessionSettings::default(),
        }
    }
}

/// Session tunables, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub heartbeat_timeout_secs: u64,
    pub reconnect_interval_secs: u64,
    pub scene_timeout_secs: u64,
    pub mode_switch_grace_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout_secs: Option<u64>,
    pub accept_invalid_certs: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        let defaults = SessionConfig::default();
        Self {
            heartbeat_timeout_secs: defaults.heartbeat_timeout.as_secs(),
            reconnect_interval_secs: defaults.reconnect_interval.as_secs(),
            scene_timeout_secs: defaults.scene_timeout.as_secs(),
            mode_switch_grace_secs: defaults.mode_switch_grace.as_secs(),
            request_timeout_secs: defaults.request_timeout.map(|d| d.as_secs()),
            accept_invalid_certs: defaults.accept_invalid_certs,
        }
    }
}

impl SessionSettings {
    pub fn to_session_config(&self) -> SessionConfig {
        SessionConfig {
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_secs),
            reconnect_interval: Duration::from_secs(self.reconnect_interval_secs),
            scene_timeout: Duration::from_secs(self.scene_timeout_secs),
            mode_switch_grace: Duration::from_secs(self.mode_switch_grace_secs),
            request_timeout: self.request_timeout_secs.map(Duration::from_secs),
            accept_invalid_certs: self.accept_invalid_certs,
        }
    }
}

impl CliConfig {
    /// Loads configuration from `path`, or creates a default there if not
    /// found.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: CliConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = CliConfig::default();
            config.save(path)?;
            Ok(config)
        }
    }

    /// Saves the configuration to `path`.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    pub fn discovery_duration(&self) -> Duration {
        Duration::from_secs(self.discovery_secs)
    }

    /// Credentials file to use: the configured one, else the default.
    pub fn credentials_path(&self) -> anyhow::Result<PathBuf> {
        match &self.credentials_path {
            Some(path) => Ok(path.clone()),
            None => ezlo_hub_connection::default_credentials_path()
                .ok_or_else(|| anyhow::anyhow!("cannot locate a config directory")),
        }
    }
}

/// Returns the platform-specific configuration file path.
pub fn config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        let base = match std::env::var("XDG_CONFIG_HOME") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
                PathBuf::from(home).join(".config")
            }
        };
        Ok(base.join("ezlo").join("cli.toml"))
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        Ok(PathBuf::from(appdata).join("ezlo").join("cli.toml"))
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        Ok(PathBuf::from(home)
            .join(".config")
            .join("ezlo")
            .join("cli.toml"))
    }
}
