//! Configuration file and resolved relay/client settings

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::error::TunnelError;
use crate::tunnel::DEFAULT_TUNNEL_PATH;

const CONFIG_FILE: &str = "config.toml";

/// Contents of `config.toml`; every field is optional in the file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub relay: RelaySettings,
    pub client: ClientSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// How long a public request waits for the tunnel's response
    pub forward_timeout_secs: u64,
    /// Path tunnel clients connect to
    pub tunnel_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub relay_url: String,
    pub local_host: String,
    /// Deadline for one call against the local server
    pub request_timeout_secs: u64,
    pub registration_timeout_secs: u64,
    /// How long in-flight requests may finish after Ctrl-C
    pub shutdown_grace_secs: u64,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            forward_timeout_secs: 30,
            tunnel_path: DEFAULT_TUNNEL_PATH.to_string(),
        }
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            relay_url: format!("ws://localhost:8080{DEFAULT_TUNNEL_PATH}"),
            local_host: "localhost".to_string(),
            request_timeout_secs: 30,
            registration_timeout_secs: 10,
            shutdown_grace_secs: 5,
        }
    }
}

impl Config {
    /// Platform configuration directory, e.g. `~/.config/tunl`
    #[must_use]
    pub fn default_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "tunl").map(|dirs| dirs.config_dir().to_path_buf())
    }

    pub fn load(config_dir: &Path) -> Result<Self> {
        let config_file = config_dir.join(CONFIG_FILE);

        if config_file.exists() {
            let contents = std::fs::read_to_string(&config_file)
                .with_context(|| format!("Failed to read config file: {:?}", config_file))?;
            toml::from_str(&contents).with_context(|| "Failed to parse config file")
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, config_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(config_dir)
            .with_context(|| format!("Failed to create config directory: {:?}", config_dir))?;
        let config_file = config_dir.join(CONFIG_FILE);
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_file, contents)
            .with_context(|| format!("Failed to write config file: {:?}", config_file))?;
        Ok(())
    }

    #[must_use]
    pub fn exists(config_dir: &Path) -> bool {
        config_dir.join(CONFIG_FILE).exists()
    }
}

fn non_zero_secs(name: &str, secs: u64) -> crate::Result<Duration> {
    if secs == 0 {
        return Err(TunnelError::config(format!("{name} must be greater than zero")));
    }
    Ok(Duration::from_secs(secs))
}

/// Resolved relay settings
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen: SocketAddr,
    /// Base of the public URLs handed to clients, without trailing `/`
    pub public_url: String,
    pub tunnel_path: String,
    pub forward_timeout: Duration,
}

impl RelayConfig {
    /// Combine file settings with the listen port and optional public base URL
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a zero timeout, a tunnel path
    /// without a leading `/`, or an unparseable public URL.
    pub fn new(
        settings: &RelaySettings,
        port: u16,
        public_url: Option<String>,
    ) -> crate::Result<Self> {
        let public_url = public_url.unwrap_or_else(|| format!("http://localhost:{port}"));
        Url::parse(&public_url)
            .map_err(|e| TunnelError::config(format!("invalid public URL {public_url:?}: {e}")))?;

        if !settings.tunnel_path.starts_with('/') {
            return Err(TunnelError::config(format!(
                "tunnel path {:?} must start with '/'",
                settings.tunnel_path
            )));
        }

        Ok(Self {
            listen: SocketAddr::from(([0, 0, 0, 0], port)),
            public_url: public_url.trim_end_matches('/').to_string(),
            tunnel_path: settings.tunnel_path.clone(),
            forward_timeout: non_zero_secs("forward_timeout_secs", settings.forward_timeout_secs)?,
        })
    }
}

/// Resolved client settings
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub relay_url: Url,
    /// Base URL of the local server, without trailing `/`
    pub local_target: String,
    pub request_timeout: Duration,
    pub registration_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl ClientConfig {
    /// Combine file settings with the local port and optional relay URL override
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the relay URL is not `ws://` or
    /// `wss://`, the local target does not parse, or a timeout is zero.
    pub fn new(
        settings: &ClientSettings,
        local_port: u16,
        relay_url: Option<String>,
    ) -> crate::Result<Self> {
        if local_port == 0 {
            return Err(TunnelError::config("local port must be between 1 and 65535"));
        }

        let relay_url = relay_url.unwrap_or_else(|| settings.relay_url.clone());
        let relay_url = Url::parse(&relay_url)
            .map_err(|e| TunnelError::config(format!("invalid relay URL {relay_url:?}: {e}")))?;
        if !matches!(relay_url.scheme(), "ws" | "wss") {
            return Err(TunnelError::config(format!(
                "relay URL must use ws:// or wss://, got {relay_url}"
            )));
        }

        let local_target = format!("http://{}:{}", settings.local_host, local_port);
        Url::parse(&local_target).map_err(|e| {
            TunnelError::config(format!("invalid local target {local_target:?}: {e}"))
        })?;

        Ok(Self {
            relay_url,
            local_target,
            request_timeout: non_zero_secs("request_timeout_secs", settings.request_timeout_secs)?,
            registration_timeout: non_zero_secs(
                "registration_timeout_secs",
                settings.registration_timeout_secs,
            )?,
            shutdown_grace: Duration::from_secs(settings.shutdown_grace_secs),
        })
    }
}
