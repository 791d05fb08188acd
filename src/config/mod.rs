//! # Configuration
//!
//! TOML configuration for the hub binary. Every section has defaults, so a
//! missing section (or an empty file) yields a runnable radio-less hub.
//!
//! ```toml
//! [hub]
//! name = "Living room"
//! bridge_port = "/dev/ttyUSB0"
//! baud_rate = 115200
//! state_file = "data/fleet.json"
//! utc_offset_minutes = 60
//!
//! [transport]
//! max_retries = 3
//! retry_base_delay_ms = 100
//!
//! [safety]
//! heartbeat_timeout_ms = 60000
//!
//! [logging]
//! level = "info"
//! file = "aquanet.log"
//!
//! [[aquariums]]
//! id = 1
//! name = "Planted 120L"
//! volume_liters = 120.0
//! ```
//!
//! ```rust,no_run
//! use aquanet::config::Config;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let config = Config::load("config.toml").await?;
//! config.validate()?;
//! println!("hub: {}", config.hub.name);
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::fleet::{Aquarium, FleetSettings, WaterTargets};
use crate::hub::HubSettings;
use crate::node::PairingTimings;
use crate::protocol::DEFAULT_CHANNEL;
use crate::transport::TransportSettings;
use crate::validation::validate_aquarium_name;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub transport: TransportSettings,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub pairing: PairingTimings,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Seed aquariums, applied at startup for ids the state file does not define.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aquariums: Vec<AquariumSeed>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub name: String,
    pub channel: u8,
    /// Serial device of the radio bridge. Empty runs the hub without a radio.
    pub bridge_port: String,
    pub baud_rate: u32,
    pub state_file: String,
    /// Wall-clock offset for Daily/Weekly schedules.
    pub utc_offset_minutes: i32,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            name: "aquanet hub".to_string(),
            channel: DEFAULT_CHANNEL,
            bridge_port: String::new(),
            baud_rate: 115_200,
            state_file: "data/fleet.json".to_string(),
            utc_offset_minutes: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub heartbeat_timeout_ms: u64,
    pub health_check_interval_ms: u64,
    pub water_check_interval_ms: u64,
    pub schedule_check_interval_ms: u64,
    pub reading_freshness_ms: u64,
    pub stats_interval_ms: u64,
    pub unmapped_retention_hours: u64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: 60_000,
            health_check_interval_ms: 5_000,
            water_check_interval_ms: 10_000,
            schedule_check_interval_ms: 1_000,
            reading_freshness_ms: 300_000,
            stats_interval_ms: 60_000,
            unmapped_retention_hours: 7 * 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    #[serde(default)]
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AquariumSeed {
    pub id: u8,
    pub name: String,
    #[serde(default)]
    pub volume_liters: f32,
    #[serde(default)]
    pub tank_type: Option<String>,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub water: Option<WaterTargets>,
}

impl AquariumSeed {
    pub fn to_aquarium(&self) -> Aquarium {
        let mut aq = Aquarium::new(self.id, &self.name).with_volume(self.volume_liters);
        if let Some(t) = &self.tank_type {
            aq.tank_type = t.clone();
        }
        aq.location = self.location.clone();
        if let Some(w) = &self.water {
            aq.water = w.clone();
        }
        aq
    }
}

impl Config {
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    pub async fn create_default(path: &str) -> Result<()> {
        let mut config = Config::default();
        config.aquariums.push(AquariumSeed {
            id: 1,
            name: "Main tank".to_string(),
            volume_liters: 100.0,
            tank_type: None,
            location: String::new(),
            water: None,
        });
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let t = &self.transport;
        if t.max_retries == 0 {
            bail!("transport.max_retries must be at least 1");
        }
        if t.retry_base_delay_ms == 0 || t.reassembly_timeout_ms == 0 {
            bail!("transport delays must be non-zero");
        }
        if t.rx_queue_size == 0 {
            bail!("transport.rx_queue_size must be at least 1");
        }
        let s = &self.safety;
        for (name, v) in [
            ("heartbeat_timeout_ms", s.heartbeat_timeout_ms),
            ("health_check_interval_ms", s.health_check_interval_ms),
            ("water_check_interval_ms", s.water_check_interval_ms),
            ("schedule_check_interval_ms", s.schedule_check_interval_ms),
            ("reading_freshness_ms", s.reading_freshness_ms),
            ("stats_interval_ms", s.stats_interval_ms),
        ] {
            if v == 0 {
                bail!("safety.{} must be non-zero", name);
            }
        }
        if !(-14 * 60..=14 * 60).contains(&self.hub.utc_offset_minutes) {
            bail!("hub.utc_offset_minutes out of range: {}", self.hub.utc_offset_minutes);
        }
        let mut seen = HashSet::new();
        for seed in &self.aquariums {
            if seed.id == 0 {
                bail!("aquarium id must be non-zero ('{}')", seed.name);
            }
            if !seen.insert(seed.id) {
                bail!("duplicate aquarium id {}", seed.id);
            }
            validate_aquarium_name(&seed.name).map_err(|e| anyhow!("aquarium {}: {}", seed.id, e))?;
            if let Some(w) = &seed.water {
                if !w.is_consistent() {
                    bail!("aquarium {}: water parameter ranges are inverted", seed.id);
                }
            }
        }
        Ok(())
    }

    pub fn fleet_settings(&self) -> FleetSettings {
        FleetSettings {
            heartbeat_timeout_ms: self.safety.heartbeat_timeout_ms,
            reading_freshness_ms: self.safety.reading_freshness_ms,
            utc_offset_secs: self.hub.utc_offset_minutes * 60,
        }
    }

    pub fn hub_settings(&self) -> HubSettings {
        HubSettings {
            peer_timeout_ms: self.safety.heartbeat_timeout_ms,
            schedule_check_interval_ms: self.safety.schedule_check_interval_ms,
            health_check_interval_ms: self.safety.health_check_interval_ms,
            water_check_interval_ms: self.safety.water_check_interval_ms,
            stats_interval_ms: self.safety.stats_interval_ms,
            unmapped_retention_ms: self.safety.unmapped_retention_hours * 3600 * 1000,
            ..HubSettings::default()
        }
    }
}
