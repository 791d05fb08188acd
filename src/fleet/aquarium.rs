//! Logical tanks: water-quality targets, latest readings and owned devices.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::device::{Device, DeviceStatus};
use super::kinds::SensorReading;
use crate::protocol::{MacAddress, NodeType};

/// Readings older than this are treated as unknown (safe).
pub const DEFAULT_READING_FRESHNESS_MS: u64 = 300_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WaterTargets {
    pub target_temperature: f32,
    pub min_temperature: f32,
    pub max_temperature: f32,
    pub target_ph: f32,
    pub min_ph: f32,
    pub max_ph: f32,
    pub min_tds: u16,
    pub max_tds: u16,
}

impl Default for WaterTargets {
    fn default() -> Self {
        Self {
            target_temperature: 25.0,
            min_temperature: 23.0,
            max_temperature: 27.0,
            target_ph: 7.0,
            min_ph: 6.5,
            max_ph: 7.5,
            min_tds: 150,
            max_tds: 300,
        }
    }
}

impl WaterTargets {
    pub fn is_consistent(&self) -> bool {
        self.min_temperature <= self.target_temperature
            && self.target_temperature <= self.max_temperature
            && self.min_ph <= self.target_ph
            && self.target_ph <= self.max_ph
            && self.min_tds <= self.max_tds
    }
}

/// The operator-editable part of an [`Aquarium`].
#[derive(Debug, Clone, PartialEq)]
pub struct AquariumSettings {
    pub name: String,
    pub volume_liters: f32,
    pub tank_type: String,
    pub location: String,
    pub description: String,
    pub enabled: bool,
    pub water: WaterTargets,
}

impl From<&Aquarium> for AquariumSettings {
    fn from(aq: &Aquarium) -> Self {
        Self {
            name: aq.name.clone(),
            volume_liters: aq.volume_liters,
            tank_type: aq.tank_type.clone(),
            location: aq.location.clone(),
            description: aq.description.clone(),
            enabled: aq.enabled,
            water: aq.water.clone(),
        }
    }
}

impl AquariumSettings {
    pub(crate) fn apply(self, aq: &mut Aquarium) {
        aq.name = self.name;
        aq.volume_liters = self.volume_liters;
        aq.tank_type = self.tank_type;
        aq.location = self.location;
        aq.description = self.description;
        aq.enabled = self.enabled;
        aq.water = self.water;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Readings {
    pub temperature: Option<f32>,
    pub ph: Option<f32>,
    pub tds: Option<u16>,
    pub last_update: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Aquarium {
    pub id: u8,
    pub name: String,
    #[serde(default)]
    pub volume_liters: f32,
    #[serde(default = "default_tank_type")]
    pub tank_type: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub water: WaterTargets,
    #[serde(default)]
    pub readings: Readings,
    #[serde(default)]
    devices: BTreeMap<MacAddress, Device>,
}

fn default_tank_type() -> String {
    "Mix".to_string()
}

fn default_enabled() -> bool {
    true
}

impl Aquarium {
    pub fn new(id: u8, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            volume_liters: 0.0,
            tank_type: default_tank_type(),
            location: String::new(),
            description: String::new(),
            enabled: true,
            water: WaterTargets::default(),
            readings: Readings::default(),
            devices: BTreeMap::new(),
        }
    }

    pub fn with_volume(mut self, liters: f32) -> Self {
        self.volume_liters = liters;
        self
    }

    pub fn with_water(mut self, water: WaterTargets) -> Self {
        self.water = water;
        self
    }

    // ------------------------------------------------------------- devices

    /// Insert a device, taking ownership of its tank id.
    pub fn add_device(&mut self, mut device: Device) {
        device.tank_id = self.id;
        self.devices.insert(device.mac, device);
    }

    pub fn remove_device(&mut self, mac: &MacAddress) -> Option<Device> {
        self.devices.remove(mac)
    }

    pub fn device(&self, mac: &MacAddress) -> Option<&Device> {
        self.devices.get(mac)
    }

    pub fn device_mut(&mut self, mac: &MacAddress) -> Option<&mut Device> {
        self.devices.get_mut(mac)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn devices_mut(&mut self) -> impl Iterator<Item = &mut Device> {
        self.devices.values_mut()
    }

    pub fn devices_of_type(&self, node_type: NodeType) -> impl Iterator<Item = &Device> {
        self.devices.values().filter(move |d| d.node_type() == node_type)
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn online_count(&self) -> usize {
        self.devices.values().filter(|d| d.is_online()).count()
    }

    // ------------------------------------------------------------ readings

    pub fn update_readings(&mut self, reading: &SensorReading, now: u64) {
        self.readings = Readings {
            temperature: Some(reading.temperature),
            ph: Some(reading.ph),
            tds: Some(reading.tds),
            last_update: now,
        };
    }

    fn is_fresh(&self, now: u64, freshness_ms: u64) -> bool {
        self.readings.last_update != 0 && now.saturating_sub(self.readings.last_update) <= freshness_ms
    }

    pub fn is_temperature_safe(&self, now: u64, freshness_ms: u64) -> bool {
        match self.readings.temperature {
            Some(t) if self.is_fresh(now, freshness_ms) => {
                (self.water.min_temperature..=self.water.max_temperature).contains(&t)
            }
            _ => true,
        }
    }

    pub fn is_ph_safe(&self, now: u64, freshness_ms: u64) -> bool {
        match self.readings.ph {
            Some(ph) if self.is_fresh(now, freshness_ms) => (self.water.min_ph..=self.water.max_ph).contains(&ph),
            _ => true,
        }
    }

    pub fn is_tds_safe(&self, now: u64, freshness_ms: u64) -> bool {
        match self.readings.tds {
            Some(tds) if self.is_fresh(now, freshness_ms) => (self.water.min_tds..=self.water.max_tds).contains(&tds),
            _ => true,
        }
    }

    /// Every enabled heater and CO2 regulator is Online.
    pub fn are_devices_healthy(&self) -> bool {
        self.devices
            .values()
            .filter(|d| d.enabled && d.kind.is_critical())
            .all(|d| d.status() == DeviceStatus::Online)
    }

    pub fn health_score(&self, now: u64, freshness_ms: u64) -> u8 {
        let mut score = 100.0f32;
        if !self.is_temperature_safe(now, freshness_ms) {
            score -= 30.0;
        }
        if !self.is_ph_safe(now, freshness_ms) {
            score -= 20.0;
        }
        if !self.devices.is_empty() {
            let online = self.online_count() as f32 / self.devices.len() as f32;
            score -= (1.0 - online) * 30.0;
        }
        score.clamp(0.0, 100.0).round() as u8
    }

    pub fn snapshot(&self, now: u64, freshness_ms: u64) -> Value {
        json!({
            "id": self.id,
            "name": self.name,
            "volumeLiters": self.volume_liters,
            "tankType": self.tank_type,
            "location": self.location,
            "description": self.description,
            "enabled": self.enabled,
            "waterParameters": {
                "temperature": {
                    "target": self.water.target_temperature,
                    "min": self.water.min_temperature,
                    "max": self.water.max_temperature,
                },
                "ph": {
                    "target": self.water.target_ph,
                    "min": self.water.min_ph,
                    "max": self.water.max_ph,
                },
                "tds": { "min": self.water.min_tds, "max": self.water.max_tds },
            },
            "currentReadings": {
                "temperature": self.readings.temperature,
                "ph": self.readings.ph,
                "tds": self.readings.tds,
                "lastUpdate": self.readings.last_update,
            },
            "health": {
                "score": self.health_score(now, freshness_ms),
                "temperatureSafe": self.is_temperature_safe(now, freshness_ms),
                "phSafe": self.is_ph_safe(now, freshness_ms),
                "tdsSafe": self.is_tds_safe(now, freshness_ms),
                "devicesHealthy": self.are_devices_healthy(),
            },
            "deviceCount": self.devices.len(),
        })
    }
}
