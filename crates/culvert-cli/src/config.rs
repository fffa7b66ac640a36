//! Client configuration at `~/.culvert/config.toml`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Persisted client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Tunnel server hostname (e.g. `tunnel.example.com`).
    pub server: String,

    /// Control channel port on the server.
    #[serde(default = "default_ws_port")]
    pub ws_port: u16,
}

fn default_ws_port() -> u16 {
    4443
}

impl Config {
    pub fn new(server: String) -> Self {
        Self {
            server,
            ws_port: default_ws_port(),
        }
    }

    /// Default config location in the user's home directory.
    pub fn path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_default()
            .join(".culvert")
            .join("config.toml")
    }

    /// Load the saved configuration, or `None` if none exists yet.
    pub fn load() -> Result<Option<Self>> {
        let path = Self::path();
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;
        Ok(Some(config))
    }

    /// Save the configuration, creating the directory if needed.
    pub fn save(&self) -> Result<()> {
        let path = Self::path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(&path, content)
            .with_context(|| format!("failed to write config to {}", path.display()))?;
        Ok(())
    }

    /// The control channel URL derived from the saved server.
    pub fn ws_url(&self) -> String {
        format!("wss://{}:{}/tunnel", self.server, self.ws_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_the_channel_url() {
        let config = Config::new("tunnel.example.com".into());
        assert_eq!(config.ws_url(), "wss://tunnel.example.com:4443/tunnel");
    }

    #[test]
    fn custom_port_round_trips_through_toml() {
        let config = Config {
            server: "tunnel.example.com".into(),
            ws_port: 9443,
        };
        let serialized = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.server, "tunnel.example.com");
        assert_eq!(parsed.ws_port, 9443);
        assert_eq!(parsed.ws_url(), "wss://tunnel.example.com:9443/tunnel");
    }

    #[test]
    fn missing_port_uses_the_default() {
        let parsed: Config = toml::from_str(r#"server = "t.example.com""#).unwrap();
        assert_eq!(parsed.ws_port, 4443);
    }
}
