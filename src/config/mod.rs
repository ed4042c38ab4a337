//! Configuration management
//!
//! Settings are persisted as TOML and always replaced atomically: the new
//! file is written next to the old one and renamed over it, so a crash
//! mid-write never leaves a corrupt settings file behind.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid remote url: {0}")]
    InvalidRemote(String),
}

/// The resolved values the proxy needs to run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    /// Remote endpoint URL, `http://host[:port]` or `https://host[:port]`
    pub remote: String,
    /// Shared passphrase; possession is the tunnel's access control
    pub passkey: String,
    /// Local SOCKS5 listen port
    pub port: u16,
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Save settings via write-temp-then-rename.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        let mut tmp = path.as_os_str().to_os_string();
        tmp.push(format!(".{nanos}"));

        std::fs::write(&tmp, toml::to_string_pretty(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn exists(path: &Path) -> bool {
        path.exists()
    }
}

/// A parsed remote endpoint: where to dial and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl RemoteEndpoint {
    /// Parse `http://host[:port]` or `https://host[:port]`; the scheme
    /// selects TLS and the default port (80/443).
    pub fn parse(url: &str) -> Result<Self, ConfigError> {
        let (tls, rest) = if let Some(rest) = url.strip_prefix("https://") {
            (true, rest)
        } else if let Some(rest) = url.strip_prefix("http://") {
            (false, rest)
        } else {
            return Err(ConfigError::InvalidRemote(url.to_string()));
        };

        let host_port = rest.split('/').next().unwrap_or("");
        if host_port.is_empty() {
            return Err(ConfigError::InvalidRemote(url.to_string()));
        }

        let (host, port) = match host_port.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| ConfigError::InvalidRemote(url.to_string()))?;
                (host.to_string(), port)
            }
            _ => (host_port.to_string(), if tls { 443 } else { 80 }),
        };

        Ok(Self { host, port, tls })
    }

    /// The value for the upgrade request's Host header.
    pub fn host_header(&self) -> String {
        let default = if self.tls { 443 } else { 80 };
        if self.port == default {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_parsing() {
        let r = RemoteEndpoint::parse("http://relay.example.com:8080").unwrap();
        assert_eq!(r.host, "relay.example.com");
        assert_eq!(r.port, 8080);
        assert!(!r.tls);
        assert_eq!(r.host_header(), "relay.example.com:8080");

        let r = RemoteEndpoint::parse("https://relay.example.com").unwrap();
        assert_eq!(r.port, 443);
        assert!(r.tls);
        assert_eq!(r.host_header(), "relay.example.com");

        let r = RemoteEndpoint::parse("http://relay.example.com/ignored/path").unwrap();
        assert_eq!(r.port, 80);

        assert!(RemoteEndpoint::parse("relay.example.com").is_err());
        assert!(RemoteEndpoint::parse("http://").is_err());
        assert!(RemoteEndpoint::parse("http://host:notaport").is_err());
    }

    #[test]
    fn test_settings_round_trip() {
        let dir = std::env::temp_dir().join(format!("detour-settings-{}", std::process::id()));
        let path = dir.join("settings.toml");

        let settings = Settings {
            remote: "https://relay.example.com".to_string(),
            passkey: "swordfish".to_string(),
            port: 1080,
        };
        assert!(!Settings::exists(&path));
        settings.save(&path).unwrap();
        assert!(Settings::exists(&path));
        assert_eq!(Settings::load(&path).unwrap(), settings);

        std::fs::remove_dir_all(&dir).ok();
    }
}
