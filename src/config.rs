// src/config.rs
//! Bridge configuration stored as JSON under the user's config directory

use crate::error::{GpsError, Result};
use crate::serial::SerialLineConfiguration;
use crate::session::{AutobaudConfig, SessionConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Only use this port
    pub port: Option<String>,
    pub serial: SerialLineConfiguration,
    pub reconnect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub autobaud: AutobaudConfig,
    /// Hot-plug polling interval
    pub poll_interval_ms: u64,
    /// Accept serial ports of any chipset
    pub allow_any_port: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            port: None,
            serial: SerialLineConfiguration::default(),
            reconnect_timeout_ms: 2000,
            read_timeout_ms: 1100,
            autobaud: AutobaudConfig::default(),
            poll_interval_ms: 2000,
            allow_any_port: false,
        }
    }
}

impl BridgeConfig {
    /// Load from the default location, falling back to defaults when absent
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// `$HOME/.config/usb-gps-bridge/config.json`
    pub fn config_path() -> Result<PathBuf> {
        let home = std::env::var("HOME")
            .map_err(|_| GpsError::Config("HOME environment variable not set".to_string()))?;

        Ok(PathBuf::from(home)
            .join(".config")
            .join("usb-gps-bridge")
            .join("config.json"))
    }

    pub fn validate(&self) -> Result<()> {
        if self.serial.is_auto_baud() && self.autobaud.candidates.is_empty() {
            return Err(GpsError::Config(
                "autobaud requires at least one candidate rate".to_string(),
            ));
        }
        if self.autobaud.candidates.contains(&0) {
            return Err(GpsError::Config("autobaud candidate rate 0".to_string()));
        }
        if self.poll_interval_ms == 0 {
            return Err(GpsError::Config("poll interval must be positive".to_string()));
        }
        Ok(())
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            serial: self.serial,
            reconnect_timeout: Duration::from_millis(self.reconnect_timeout_ms),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            autobaud: self.autobaud.clone(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::{BaudRate, Parity};

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.serial.baud_rate, BaudRate::Fixed(9600));
        assert_eq!(config.autobaud.candidates, vec![4800, 9600, 19200, 38400, 57600, 115200]);

        let session = config.session_config();
        assert_eq!(session.reconnect_timeout, Duration::from_millis(2000));
        assert_eq!(session.read_timeout, Duration::from_millis(1100));
        assert_eq!(session.autobaud.window(), Duration::from_millis(2500));
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = BridgeConfig::load_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, BridgeConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = BridgeConfig::default();
        config.port = Some("/dev/ttyACM0".to_string());
        config.serial = SerialLineConfiguration::new(BaudRate::Auto).with_parity(Parity::Odd);
        config.allow_any_port = true;
        config.save_to(&path).unwrap();

        assert_eq!(BridgeConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"serial":{"baud_rate":4800},"read_timeout_ms":500}"#).unwrap();

        let config = BridgeConfig::load_from(&path).unwrap();
        assert_eq!(config.serial.baud_rate, BaudRate::Fixed(4800));
        assert_eq!(config.read_timeout_ms, 500);
        assert_eq!(config.reconnect_timeout_ms, 2000);
    }

    #[test]
    fn test_invalid_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(BridgeConfig::load_from(&path), Err(GpsError::Json(_))));

        std::fs::write(
            &path,
            r#"{"serial":{"baud_rate":"auto"},"autobaud":{"candidates":[]}}"#,
        )
        .unwrap();
        assert!(matches!(BridgeConfig::load_from(&path), Err(GpsError::Config(_))));
    }
}
