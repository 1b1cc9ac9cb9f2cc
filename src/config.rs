// src/config.rs
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::drivers::averaging::validate_factor;
use crate::drivers::{ConsoleError, TdrPreset};
use crate::types::DisplayMode;

pub const DEFAULT_ADDRESS: &str = "127.0.0.1:50052";

/// Console settings. Every field has a default, so a config file only needs
/// the values it overrides.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Instrument endpoint as `host:port`.
    pub address: String,
    pub ready_timeout_ms: u64,
    /// Capacity of the frame handoff queue.
    pub queue_capacity: usize,
    /// Initial averaging factor.
    pub averaging: usize,
    pub rate_log_interval_secs: u64,
    pub refresh_tick_ms: u64,
    pub display_mode: DisplayMode,
    /// Preset applied on start when the instrument has no configuration yet.
    pub preset: Option<String>,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_owned(),
            ready_timeout_ms: 500,
            queue_capacity: 10,
            averaging: 1,
            rate_log_interval_secs: 5,
            refresh_tick_ms: 1000,
            display_mode: DisplayMode::Normalized,
            preset: None,
        }
    }
}

impl ConsoleConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConsoleError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let config: ConsoleConfig = serde_json::from_str(&text)
            .map_err(|err| ConsoleError::Config(format!("{}: {err}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConsoleError> {
        validate_factor(self.averaging)?;
        if self.queue_capacity == 0 {
            return Err(ConsoleError::Config("queue_capacity must be at least 1".into()));
        }
        if self.refresh_tick_ms == 0 {
            return Err(ConsoleError::Config("refresh_tick_ms must be positive".into()));
        }
        if self.address.trim().is_empty() {
            return Err(ConsoleError::Config("address must not be empty".into()));
        }
        if let Some(alias) = &self.preset {
            TdrPreset::resolve(alias)?;
        }
        Ok(())
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn rate_log_interval(&self) -> Duration {
        Duration::from_secs(self.rate_log_interval_secs)
    }

    pub fn refresh_tick(&self) -> Duration {
        Duration::from_millis(self.refresh_tick_ms)
    }

    pub fn preset(&self) -> Result<Option<TdrPreset>, ConsoleError> {
        self.preset.as_deref().map(TdrPreset::resolve).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let text = r#"{"averaging": 8, "display_mode": "impedance_log", "preset": "16/1"}"#;
        file.write_all(text.as_bytes()).unwrap();
        let config = ConsoleConfig::load(file.path()).unwrap();
        assert_eq!(config.averaging, 8);
        assert_eq!(config.display_mode, DisplayMode::ImpedanceLog);
        assert_eq!(config.queue_capacity, 10);
        assert_eq!(config.address, DEFAULT_ADDRESS);
        assert_eq!(config.preset().unwrap().unwrap().key(), "16.0ns/1.0ps");
    }

    #[test]
    fn display_mode_accepts_the_cli_spelling() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"{"display_mode": "impedance-log"}"#).unwrap();
        let config = ConsoleConfig::load(file.path()).unwrap();
        assert_eq!(config.display_mode, DisplayMode::ImpedanceLog);

        let rho: ConsoleConfig = serde_json::from_str(r#"{"display_mode": "rho"}"#).unwrap();
        assert_eq!(rho.display_mode, DisplayMode::ReflectionCoefficient);
    }

    #[test]
    fn invalid_values_are_config_errors() {
        let bad_factor = ConsoleConfig {
            averaging: 3,
            ..ConsoleConfig::default()
        };
        assert!(matches!(bad_factor.validate(), Err(ConsoleError::Config(_))));

        let bad_preset = ConsoleConfig {
            preset: Some("xyz".into()),
            ..ConsoleConfig::default()
        };
        assert!(matches!(bad_preset.validate(), Err(ConsoleError::Config(_))));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(
            ConsoleConfig::load(file.path()),
            Err(ConsoleError::Config(_))
        ));
    }
}
