//! Inspection tool configuration

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use usb_target::RusbSettings;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InspectConfig {
    pub general: GeneralSettings,
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub transfers: TransferSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralSettings {
    pub log_level: String,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Device opened when `--device` is not given
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// VID:PID, e.g. "0x1234:0x5678"
    #[serde(default)]
    pub filter: Option<String>,
}

/// Transfer backend settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferSettings {
    #[serde(default = "TransferSettings::default_workers")]
    pub workers: usize,
    /// Per-attempt timeout of IN transfers; bounds how quickly an abort lands
    #[serde(default = "TransferSettings::default_poll_slice_ms")]
    pub poll_slice_ms: u64,
    #[serde(default = "TransferSettings::default_timeout_ms")]
    pub control_timeout_ms: u64,
    #[serde(default = "TransferSettings::default_timeout_ms")]
    pub write_timeout_ms: u64,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            workers: Self::default_workers(),
            poll_slice_ms: Self::default_poll_slice_ms(),
            control_timeout_ms: Self::default_timeout_ms(),
            write_timeout_ms: Self::default_timeout_ms(),
        }
    }
}

impl TransferSettings {
    fn default_workers() -> usize {
        4
    }

    fn default_poll_slice_ms() -> u64 {
        100
    }

    fn default_timeout_ms() -> u64 {
        5000
    }

    pub fn to_rusb_settings(&self) -> RusbSettings {
        RusbSettings {
            workers: self.workers,
            poll_slice: Duration::from_millis(self.poll_slice_ms),
            control_timeout: Duration::from_millis(self.control_timeout_ms),
            write_timeout: Duration::from_millis(self.write_timeout_ms),
        }
    }
}

impl InspectConfig {
    /// Load configuration from `path`, or from the first standard location
    /// that exists
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usb-target/inspect.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: InspectConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if none is found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("{}, using defaults", e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-target").join("inspect.toml")
        } else {
            PathBuf::from(".config/usb-target/inspect.toml")
        }
    }

    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.general.log_level,
                valid_levels.join(", ")
            ));
        }

        if let Some(filter) = &self.device.filter {
            parse_device_filter(filter)?;
        }

        if self.transfers.workers == 0 {
            return Err(anyhow!("transfers.workers must be at least 1"));
        }
        if self.transfers.poll_slice_ms == 0 {
            return Err(anyhow!("transfers.poll_slice_ms must be greater than 0"));
        }

        Ok(())
    }
}

/// Parse a "VID:PID" pair such as "0x1234:0x5678"
pub fn parse_device_filter(filter: &str) -> Result<(u16, u16)> {
    let parts: Vec<&str> = filter.split(':').collect();
    if parts.len() != 2 {
        return Err(anyhow!(
            "Invalid device '{}', expected VID:PID (e.g., '0x1234:0x5678')",
            filter
        ));
    }

    Ok((
        parse_hex_id(parts[0], "VID")?,
        parse_hex_id(parts[1], "PID")?,
    ))
}

fn parse_hex_id(id: &str, name: &str) -> Result<u16> {
    let hex_part = id
        .strip_prefix("0x")
        .or_else(|| id.strip_prefix("0X"))
        .ok_or_else(|| {
            anyhow!(
                "Invalid {} '{}', must start with '0x' (e.g., '0x1234')",
                name,
                id
            )
        })?;

    if hex_part.is_empty() || hex_part.len() > 4 {
        return Err(anyhow!(
            "Invalid {} '{}', hex part must be 1-4 digits",
            name,
            id
        ));
    }

    u16::from_str_radix(hex_part, 16)
        .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))
}

/// Expand `~` in a user-supplied config path
pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = InspectConfig::default();
        assert_eq!(config.general.log_level, "info");
        assert!(config.device.filter.is_none());
        assert_eq!(config.transfers.workers, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_device_filter() {
        assert_eq!(parse_device_filter("0x1234:0x5678").unwrap(), (0x1234, 0x5678));
        assert_eq!(parse_device_filter("0XABCD:0x1").unwrap(), (0xabcd, 0x0001));

        assert!(parse_device_filter("1234:5678").is_err());
        assert!(parse_device_filter("0x1234").is_err());
        assert!(parse_device_filter("0x1234:*").is_err());
        assert!(parse_device_filter("0xGHIJ:0x5678").is_err());
        assert!(parse_device_filter("0x12345:0x5678").is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = InspectConfig::default();
        config.general.log_level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = InspectConfig::default();
        config.transfers.workers = 0;
        assert!(config.validate().is_err());

        let mut config = InspectConfig::default();
        config.device.filter = Some("usb".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("inspect.toml");

        let mut config = InspectConfig::default();
        config.device.filter = Some("0x046d:0xc52b".to_string());
        config.transfers.poll_slice_ms = 20;
        config.save(&path).unwrap();

        let loaded = InspectConfig::load(Some(path)).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("inspect.toml");
        fs::write(&path, "[general]\nlog_level = \"debug\"\n").unwrap();

        let loaded = InspectConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.general.log_level, "debug");
        assert_eq!(loaded.transfers, TransferSettings::default());
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("inspect.toml");
        fs::write(&path, "[general]\nlog_level = \"debug\"\n[transfers]\nworkers = 0\n").unwrap();

        assert!(InspectConfig::load(Some(path)).is_err());
    }

    #[test]
    fn test_rusb_settings_conversion() {
        let settings = TransferSettings::default().to_rusb_settings();
        assert_eq!(settings.poll_slice, Duration::from_millis(100));
        assert_eq!(settings.control_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_expand_path_without_tilde() {
        assert_eq!(expand_path("/tmp/inspect.toml"), PathBuf::from("/tmp/inspect.toml"));
    }
}
