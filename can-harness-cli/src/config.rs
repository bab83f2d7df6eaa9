//! Bench configuration loading and parsing

use anyhow::{Context, Result};
use can_harness::config::ChannelConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Main bench configuration (loaded from bench.toml)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BenchConfig {
    /// Channel declarations, keyed by bus name
    pub bus: HashMap<String, BusEntry>,
    /// E2E data-id overlay: checksum signal name -> data identifier.
    /// Plain DBC files carry no E2E attributes, so they are declared here.
    #[serde(default)]
    pub e2e: HashMap<String, u16>,
    /// Cycle-time overlay: message name -> cycle time in milliseconds
    #[serde(default)]
    pub cycle_times: HashMap<String, u32>,
}

/// One channel declaration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BusEntry {
    /// Hardware interface kind (only "sim" ships in-tree)
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
}

impl BenchConfig {
    /// Load and parse a bench configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config: BenchConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {:?}", path))?;
        Ok(config)
    }

    /// Channel configuration for one named bus
    pub fn channel(&self, bus_name: &str) -> Result<ChannelConfig> {
        let entry = self
            .bus
            .get(bus_name)
            .with_context(|| format!("Bus '{}' not declared in config", bus_name))?;
        Ok(entry.to_channel_config(bus_name))
    }

    /// Channel configurations for every declared bus, sorted by channel
    /// number for stable worker partitioning
    pub fn all_channels(&self) -> Vec<ChannelConfig> {
        let mut configs: Vec<ChannelConfig> = self
            .bus
            .iter()
            .map(|(name, entry)| entry.to_channel_config(name))
            .collect();
        configs.sort_by_key(|c| c.channel);
        configs
    }
}

impl BusEntry {
    fn to_channel_config(&self, name: &str) -> ChannelConfig {
        ChannelConfig {
            name: name.to_string(),
            interface: self.interface.clone(),
            channel: self.channel,
            db_path: self.db_path.clone(),
            is_fd: self.is_fd,
            bitrate: self.bitrate,
            fd_bitrate: None,
        }
    }
}
