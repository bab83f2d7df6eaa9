//! Channel and recording configuration types

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for one logical CAN channel
///
/// Either `db_path` must point at a database file or `is_fd` must be given
/// so the channel can be opened without one (raw-frame operations only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Logical bus name (used to match the database's bus declaration)
    pub name: String,
    /// Hardware interface kind (e.g. "pcan", "sim")
    pub interface: String,
    /// Hardware channel number
    pub channel: u32,
    /// CAN database file path
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    /// CAN-FD flag, required when no database is given
    #[serde(default)]
    pub is_fd: Option<bool>,
    /// Arbitration-phase bitrate
    #[serde(default)]
    pub bitrate: Option<u32>,
    /// Data-phase bitrate (FD channels)
    #[serde(default)]
    pub fd_bitrate: Option<u32>,
}

impl ChannelConfig {
    /// Minimal config for a named channel on an interface
    pub fn new(name: impl Into<String>, interface: impl Into<String>, channel: u32) -> Self {
        Self {
            name: name.into(),
            interface: interface.into(),
            channel,
            db_path: None,
            is_fd: None,
            bitrate: None,
            fd_bitrate: None,
        }
    }

    /// Builder method: set the database path
    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = Some(path.into());
        self
    }

    /// Builder method: set the FD flag
    pub fn with_fd(mut self, is_fd: bool) -> Self {
        self.is_fd = Some(is_fd);
        self
    }

    /// Builder method: set the arbitration-phase bitrate
    pub fn with_bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = Some(bitrate);
        self
    }
}

/// Recording configuration shared by supervisor and orchestrator workers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    /// Root directory recordings are placed under
    pub root: PathBuf,
    /// Maximum size of one recording file before rotation (0 = unbounded)
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
}

fn default_max_bytes() -> u64 {
    100 * 1024 * 1024
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            max_bytes: default_max_bytes(),
        }
    }
}

impl RecordingConfig {
    /// Recording under a root directory with the default rotation size
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Builder method: set the rotation size
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_config_builder() {
        let config = ChannelConfig::new("body_can", "sim", 1)
            .with_db_path("body.dbc")
            .with_bitrate(500_000);
        assert_eq!(config.name, "body_can");
        assert_eq!(config.db_path, Some(PathBuf::from("body.dbc")));
        assert_eq!(config.bitrate, Some(500_000));
        assert_eq!(config.is_fd, None);
    }

    #[test]
    fn test_channel_config_toml_roundtrip() {
        let config = ChannelConfig::new("chassis_can", "sim", 2).with_fd(true);
        let text = toml::to_string(&config).unwrap();
        let back: ChannelConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.name, "chassis_can");
        assert_eq!(back.is_fd, Some(true));
    }
}
