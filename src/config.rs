// Copyright 2026 Bluebridge Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Configuration module.
//!
//! Handles loading and saving daemon settings.

use anyhow::Result;
use gethostname::gethostname;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Get a sanitized hostname suitable for a Bluetooth device name.
/// Bluetooth names should only contain alphanumeric chars, spaces, and hyphens.
fn get_sanitized_hostname() -> String {
    let hostname = gethostname().to_string_lossy().to_string();
    let sanitized: String = hostname
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == ' ' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = sanitized.trim_matches('-');
    if trimmed.is_empty() {
        "Bluebridge".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory for the inbox and shared folder.
    #[serde(skip)]
    pub data_dir: PathBuf,

    /// Adapter settings.
    #[serde(default)]
    pub bluetooth: BluetoothConfig,

    /// Profile endpoints.
    #[serde(default)]
    pub profiles: ProfilesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Adapter alias advertised to other devices.
    /// This is always computed at runtime from the system hostname.
    #[serde(skip)]
    pub device_name: String,

    /// Power the adapter on at startup.
    pub power_on: bool,

    /// Make the adapter discoverable at startup. Zero timeout means
    /// indefinitely.
    pub discoverable: bool,
    pub discoverable_timeout: u32,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            device_name: get_sanitized_hostname(),
            power_on: true,
            discoverable: true,
            discoverable_timeout: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilesConfig {
    /// RFCOMM channel for the Object Push server.
    pub opp_channel: u8,

    /// RFCOMM channel for the File Transfer server.
    pub ftp_channel: u8,

    /// RFCOMM channel for the Hands-Free service.
    pub hfp_channel: u8,

    /// Where received objects are stored. Defaults to `<data_dir>/inbox`.
    pub inbox_dir: Option<PathBuf>,

    /// Directory served to browsing peers. Defaults to `<data_dir>/shared`.
    pub share_dir: Option<PathBuf>,
}

impl Default for ProfilesConfig {
    fn default() -> Self {
        Self {
            opp_channel: 10,
            ftp_channel: 11,
            hfp_channel: 1,
            inbox_dir: None,
            share_dir: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("bluebridge"),
            bluetooth: BluetoothConfig::default(),
            profiles: ProfilesConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file or create default.
    pub fn load() -> Result<Self> {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("bluebridge");

        std::fs::create_dir_all(&config_dir)?;

        let config_path = config_dir.join("config.toml");

        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            toml::from_str(&content)?
        } else {
            let config = Self::default();
            let content = toml::to_string_pretty(&config)?;
            std::fs::write(&config_path, content)?;
            config
        };

        config.data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("bluebridge");
        std::fs::create_dir_all(&config.data_dir)?;

        Ok(config)
    }

    /// Save configuration to file.
    #[allow(dead_code)]
    pub fn save(&self) -> Result<()> {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("bluebridge");

        let config_path = config_dir.join("config.toml");
        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;

        Ok(())
    }

    /// Resolved inbox directory for received objects.
    pub fn inbox_dir(&self) -> PathBuf {
        self.profiles.inbox_dir.clone().unwrap_or_else(|| self.data_dir.join("inbox"))
    }

    /// Resolved directory served over the File Transfer profile.
    pub fn share_dir(&self) -> PathBuf {
        self.profiles.share_dir.clone().unwrap_or_else(|| self.data_dir.join("shared"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.profiles.opp_channel, 10);
        assert_eq!(config.profiles.ftp_channel, 11);
        assert_eq!(config.profiles.hfp_channel, 1);
        assert!(config.bluetooth.power_on);
        assert!(!config.bluetooth.device_name.is_empty());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            "[bluetooth]\npower_on = false\n\n[profiles]\nopp_channel = 25\n",
        )
        .unwrap();
        assert!(!config.bluetooth.power_on);
        assert_eq!(config.profiles.opp_channel, 25);
        assert_eq!(config.profiles.ftp_channel, 11);
    }

    #[test]
    fn test_directory_resolution() {
        let mut config = Config::default();
        config.data_dir = PathBuf::from("/var/lib/bluebridge");
        assert_eq!(config.inbox_dir(), PathBuf::from("/var/lib/bluebridge/inbox"));

        config.profiles.share_dir = Some(PathBuf::from("/srv/bt"));
        assert_eq!(config.share_dir(), PathBuf::from("/srv/bt"));
    }
}
