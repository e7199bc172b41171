//! Layered configuration for homebid.
//!
//! Settings come from `homebid.toml`, then environment variables, then CLI
//! flags, each layer overriding the previous one. Missing sections fall
//! back to defaults, so an empty file is a valid configuration.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8080
//! db_path = "data/homebid.db"
//! dev_mode = false
//! broadcast_capacity = 256
//!
//! [[commission.tiers]]
//! up_to_cents = 100000
//! rate_bps = 1000
//!
//! [[commission.tiers]]
//! rate_bps = 400
//!
//! [logging]
//! level = "info"
//! json = false
//! dir = "logs"
//! ```
//!
//! # Environment
//!
//! | Variable          | Overrides            |
//! |-------------------|----------------------|
//! | `HOMEBID_HOST`    | `server.host`        |
//! | `HOMEBID_PORT`    | `server.port`        |
//! | `HOMEBID_DB_PATH` | `server.db_path`     |
//! | `HOMEBID_DEV`     | `server.dev_mode`    |
//!
//! `RUST_LOG`, when set, takes precedence over `logging.level`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::market::commission::CommissionSchedule;
use crate::market::server::ServerConfig;

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "homebid.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Permissive CORS for a local frontend dev server.
    #[serde(default)]
    pub dev_mode: bool,
    /// Buffered events per WebSocket subscriber before it starts lagging.
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/homebid.db")
}

fn default_broadcast_capacity() -> usize {
    256
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            db_path: default_db_path(),
            dev_mode: false,
            broadcast_capacity: default_broadcast_capacity(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommissionSection {
    #[serde(default)]
    pub tiers: CommissionSchedule,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// `EnvFilter` directive, e.g. `info` or `homebid=debug,tower_http=info`.
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// Directory for daily-rotated log files. Stderr only when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
            dir: None,
        }
    }
}

/// Root of `homebid.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HomebidConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub commission: CommissionSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl HomebidConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse homebid.toml")
    }

    /// Load from `path`, or defaults if the file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize homebid.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `HOMEBID_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("HOMEBID_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("HOMEBID_PORT") {
            self.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("Invalid HOMEBID_PORT '{}'", port))?;
        }
        if let Some(path) = lookup("HOMEBID_DB_PATH") {
            self.server.db_path = PathBuf::from(path);
        }
        if let Some(dev) = lookup("HOMEBID_DEV") {
            self.server.dev_mode = parse_flag(&dev)
                .with_context(|| format!("Invalid HOMEBID_DEV '{}'", dev))?;
        }
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.server.port == 0 {
            warnings.push("server.port is 0; the OS will pick a random port".to_string());
        }
        if self.server.broadcast_capacity == 0 {
            warnings.push("server.broadcast_capacity must be at least 1".to_string());
        }
        if self.server.db_path.as_os_str().is_empty() {
            warnings.push("server.db_path is empty".to_string());
        }
        if tracing_subscriber::EnvFilter::try_new(&self.logging.level).is_err() {
            warnings.push(format!(
                "Invalid logging.level '{}': expected an EnvFilter directive such as 'info'",
                self.logging.level
            ));
        }
        if self.server.dev_mode && self.server.host != "127.0.0.1" {
            warnings.push(format!(
                "dev_mode enables permissive CORS while listening on {}",
                self.server.host
            ));
        }

        warnings
    }

    /// The server settings this configuration resolves to.
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.server.host.clone(),
            port: self.server.port,
            db_path: self.server.db_path.clone(),
            dev_mode: self.server.dev_mode,
            broadcast_capacity: self.server.broadcast_capacity,
            commission: self.commission.tiers.clone(),
        }
    }
}

fn parse_flag(value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => anyhow::bail!("expected a boolean, got '{}'", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_empty_file_is_default() {
        let config = HomebidConfig::parse("").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.commission.tiers, CommissionSchedule::default());
    }

    #[test]
    fn test_parse_full_config() {
        let config = HomebidConfig::parse(
            r#"
            [server]
            host = "0.0.0.0"
            port = 9000
            db_path = "/var/lib/homebid/market.db"
            dev_mode = true
            broadcast_capacity = 64

            [[commission.tiers]]
            up_to_cents = 50000
            rate_bps = 1200

            [[commission.tiers]]
            rate_bps = 500

            [logging]
            level = "homebid=debug"
            json = true
            dir = "logs"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 9000);
        assert!(config.server.dev_mode);
        assert_eq!(config.server.broadcast_capacity, 64);
        assert_eq!(config.commission.tiers.tiers().len(), 2);
        assert_eq!(config.commission.tiers.quote(50_000).unwrap().rate_bps, 1200);
        assert_eq!(config.commission.tiers.quote(50_001).unwrap().rate_bps, 500);
        assert!(config.logging.json);
        assert_eq!(config.logging.dir, Some(PathBuf::from("logs")));
    }

    #[test]
    fn test_invalid_tiers_fail_to_parse() {
        let result = HomebidConfig::parse(
            r#"
            [[commission.tiers]]
            up_to_cents = 1000
            rate_bps = 500
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = HomebidConfig::default();
        config
            .apply_env_from(env(&[
                ("HOMEBID_HOST", "0.0.0.0"),
                ("HOMEBID_PORT", "3000"),
                ("HOMEBID_DB_PATH", "/tmp/market.db"),
                ("HOMEBID_DEV", "yes"),
            ]))
            .unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.db_path, PathBuf::from("/tmp/market.db"));
        assert!(config.server.dev_mode);
    }

    #[test]
    fn test_env_rejects_bad_values() {
        let mut config = HomebidConfig::default();
        assert!(config.apply_env_from(env(&[("HOMEBID_PORT", "eighty")])).is_err());
        assert!(config.apply_env_from(env(&[("HOMEBID_DEV", "maybe")])).is_err());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);

        let mut config = HomebidConfig::default();
        config.server.port = 4321;
        config.logging.json = true;
        config.save(&path).unwrap();

        let loaded = HomebidConfig::load(&path).unwrap();
        assert_eq!(loaded.server.port, 4321);
        assert!(loaded.logging.json);
        assert_eq!(loaded.commission.tiers, CommissionSchedule::default());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempdir().unwrap();
        let config = HomebidConfig::load_or_default(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_validate_warnings() {
        assert!(HomebidConfig::default().validate().is_empty());

        let mut config = HomebidConfig::default();
        config.server.broadcast_capacity = 0;
        config.logging.level = "homebid=loud".to_string();
        let warnings = config.validate();
        assert_eq!(warnings.len(), 2);
        assert!(warnings.iter().any(|w| w.contains("broadcast_capacity")));
        assert!(warnings.iter().any(|w| w.contains("logging.level")));
    }

    #[test]
    fn test_server_config_from_file_settings() {
        let mut config = HomebidConfig::default();
        config.server.dev_mode = true;
        let server = config.server_config();
        assert!(server.dev_mode);
        assert_eq!(server.port, 8080);
        assert_eq!(server.commission, CommissionSchedule::default());
    }
}
