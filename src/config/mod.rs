//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default `User-Agent` sent with the upgrade request
pub const DEFAULT_AGENT: &str = concat!("winksock-client/", env!("CARGO_PKG_VERSION"));

/// Process-wide client configuration.
///
/// A default instance is used by [`crate::Client::new`]; pass an explicit
/// value to [`crate::Client::with_config`] to override it per pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Follow HTTP redirects during the upgrade handshake (max 5 hops)
    pub follow_redirects: bool,
    /// `Origin` header value; `None` uses the target host name
    pub origin: Option<String>,
    /// `User-Agent` header value; `None` uses [`DEFAULT_AGENT`]
    pub agent: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            follow_redirects: true,
            origin: None,
            agent: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }

    /// Resolved `Origin` header value for a target host
    pub fn origin_for(&self, host: &str) -> String {
        self.origin.clone().unwrap_or_else(|| host.to_string())
    }

    /// Resolved `User-Agent` header value
    pub fn agent(&self) -> &str {
        self.agent.as_deref().unwrap_or(DEFAULT_AGENT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert!(config.follow_redirects);
        assert_eq!(config.origin_for("example.com"), "example.com");
        assert!(config.agent().starts_with("winksock-client/"));
    }

    #[test]
    fn test_toml_round_trip() {
        let config = ClientConfig {
            follow_redirects: false,
            origin: Some("origin.example".to_string()),
            agent: Some("custom/1.0".to_string()),
        };

        let encoded = toml::to_string_pretty(&config).unwrap();
        let decoded: ClientConfig = toml::from_str(&encoded).unwrap();

        assert!(!decoded.follow_redirects);
        assert_eq!(decoded.origin.as_deref(), Some("origin.example"));
        assert_eq!(decoded.agent(), "custom/1.0");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let decoded: ClientConfig = toml::from_str("follow_redirects = false\n").unwrap();
        assert!(!decoded.follow_redirects);
        assert!(decoded.origin.is_none());
        assert_eq!(decoded.agent(), DEFAULT_AGENT);
    }
}
