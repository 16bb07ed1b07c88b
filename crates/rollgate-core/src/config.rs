//! rollgate.toml configuration parser.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RollgateConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8450,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    pub file_name: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/rollgate"),
            file_name: "rollgate.redb".to_string(),
        }
    }
}

impl StoreConfig {
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(&self.file_name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// `tracing` env-filter directive, overridden by `RUST_LOG`.
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info,rollgate=debug".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecoveryConfig {
    /// Resume in-flight rollouts from their snapshots at startup.
    pub resume_on_start: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            resume_on_start: true,
        }
    }
}

impl RollgateConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: RollgateConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_round_trip() {
        let config = RollgateConfig::default();
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("rollgate.redb"));
        let back: RollgateConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_parse_partial() {
        let toml_str = r#"
[server]
bind = "127.0.0.1"
port = 9000

[logging]
filter = "debug"
json = true
"#;
        let config: RollgateConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.port, 9000);
        assert!(config.logging.json);
        assert_eq!(config.store, StoreConfig::default());
        assert!(config.recovery.resume_on_start);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollgate.toml");
        std::fs::write(&path, "[store]\ndata_dir = \"/tmp/rg\"\nfile_name = \"x.redb\"\n").unwrap();
        let config = RollgateConfig::from_file(&path).unwrap();
        assert_eq!(config.store.db_path(), PathBuf::from("/tmp/rg/x.redb"));
    }
}
