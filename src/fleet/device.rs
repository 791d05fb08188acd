//! A managed device: identity, connection state, counters, schedules and
//! its kind-specific state mirror.

use std::fmt;

use log::{debug, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::kinds::{DeviceKind, SensorReading};
use super::radio::HubRadio;
use crate::errors::{FleetError, TransportError};
use crate::logutil::log_name;
use crate::protocol::{Command, MacAddress, Message, NodeType, Status, FRAGMENT_SIZE};
use crate::schedule::Schedule;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DeviceStatus {
    #[default]
    Unknown,
    Initializing,
    Online,
    Offline,
    Error,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceStatus::Unknown => "Unknown",
            DeviceStatus::Initializing => "Initializing",
            DeviceStatus::Online => "Online",
            DeviceStatus::Offline => "Offline",
            DeviceStatus::Error => "Error",
        };
        f.write_str(s)
    }
}

fn full_health() -> u8 {
    100
}

/// Random correlation id for a Command; 0 and 255 are never used.
pub fn next_command_id() -> u8 {
    rand::thread_rng().gen_range(1..=254)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub mac: MacAddress,
    pub name: String,
    #[serde(default)]
    pub node_id: u8,
    pub tank_id: u8,
    #[serde(default)]
    pub firmware_version: u8,
    pub enabled: bool,
    #[serde(skip)]
    status: DeviceStatus,
    #[serde(skip)]
    last_heartbeat: u64,
    #[serde(skip)]
    last_command_sent: u64,
    #[serde(skip)]
    last_status_received: u64,
    #[serde(skip, default = "full_health")]
    health: u8,
    #[serde(skip)]
    uptime_minutes: u16,
    #[serde(default)]
    pub messages_received: u32,
    #[serde(default)]
    pub messages_sent: u32,
    #[serde(default)]
    pub commands_sent: u32,
    #[serde(default)]
    pub error_count: u32,
    #[serde(default)]
    schedules: Vec<Schedule>,
    pub kind: DeviceKind,
}

impl Device {
    pub fn new(mac: MacAddress, name: &str, tank_id: u8, kind: DeviceKind) -> Self {
        Self {
            mac,
            name: name.to_string(),
            node_id: 0,
            tank_id,
            firmware_version: 0,
            enabled: true,
            status: DeviceStatus::Unknown,
            last_heartbeat: 0,
            last_command_sent: 0,
            last_status_received: 0,
            health: 100,
            uptime_minutes: 0,
            messages_received: 0,
            messages_sent: 0,
            commands_sent: 0,
            error_count: 0,
            schedules: Vec::new(),
            kind,
        }
    }

    /// Name used when a device is admitted without one, e.g. "Heater BBCC".
    pub fn default_name(node_type: NodeType, mac: &MacAddress) -> String {
        let b = mac.as_bytes();
        let label = match node_type {
            NodeType::Co2 => "CO2",
            NodeType::Sensor => "Sensor",
            NodeType::FishFeeder => "Feeder",
            other => other.display_name(),
        };
        format!("{} {:02X}{:02X}", label, b[4], b[5])
    }

    pub fn node_type(&self) -> NodeType {
        self.kind.node_type()
    }

    pub fn status(&self) -> DeviceStatus {
        self.status
    }

    pub fn set_status(&mut self, status: DeviceStatus) {
        if self.status != status {
            debug!("{} [{}] {} -> {}", log_name(&self.name), self.mac, self.status, status);
            self.status = status;
        }
    }

    pub fn is_online(&self) -> bool {
        self.status == DeviceStatus::Online
    }

    pub fn health(&self) -> u8 {
        self.health
    }

    pub fn uptime_minutes(&self) -> u16 {
        self.uptime_minutes
    }

    pub fn last_heartbeat(&self) -> u64 {
        self.last_heartbeat
    }

    pub fn last_command_sent(&self) -> u64 {
        self.last_command_sent
    }

    pub fn last_status_received(&self) -> u64 {
        self.last_status_received
    }

    /// Record a heartbeat. Returns true when the device was not Online before.
    pub fn update_heartbeat(&mut self, health: u8, uptime_minutes: u16, now: u64) -> bool {
        self.last_heartbeat = now;
        self.health = health.min(100);
        self.uptime_minutes = uptime_minutes;
        self.messages_received += 1;
        let came_online = self.status != DeviceStatus::Online;
        self.set_status(DeviceStatus::Online);
        came_online
    }

    /// Never true for a device that has not sent a heartbeat yet.
    pub fn has_heartbeat_timed_out(&self, timeout_ms: u64, now: u64) -> bool {
        self.last_heartbeat != 0 && now.saturating_sub(self.last_heartbeat) > timeout_ms
    }

    /// Fold a Status frame into the device. Unsolicited reports (command id 0)
    /// update the kind mirror; replies only confirm a command.
    pub fn handle_status(&mut self, status: &Status, now: u64) -> Option<SensorReading> {
        self.last_status_received = now;
        self.messages_received += 1;
        if status.status_code != 0 {
            self.error_count += 1;
            warn!(
                "{} [{}] reported error code {} for command {}",
                log_name(&self.name),
                self.mac,
                status.status_code,
                status.command_id
            );
            return None;
        }
        if status.command_id != 0 {
            debug!("{} acknowledged command {}", self.mac, status.command_id);
            return None;
        }
        self.kind.handle_report(status, now)
    }

    /// Send a single-fragment command to the node. Returns the correlation id.
    ///
    /// Refused while liveness marks the node offline. A link failure counts
    /// as an error and the frame is queued for retry by the radio.
    pub fn send_command(&mut self, radio: &mut dyn HubRadio, data: &[u8], now: u64) -> Result<u8, FleetError> {
        if data.is_empty() {
            return Err(FleetError::EmptyCommand);
        }
        if data.len() > FRAGMENT_SIZE {
            return Err(FleetError::Transport(TransportError::PayloadTooLarge {
                len: data.len(),
                max: FRAGMENT_SIZE,
            }));
        }
        if !radio.is_online(&self.mac) {
            self.error_count += 1;
            return Err(FleetError::Transport(TransportError::PeerOffline(self.mac)));
        }
        let command_id = next_command_id();
        let message = Message::Command(Command::single(command_id, data));
        match radio.send_reliable(&self.mac, self.tank_id, message, now) {
            Ok(()) => {
                self.record_command_sent(now);
                Ok(command_id)
            }
            Err(e) => {
                self.error_count += 1;
                Err(e.into())
            }
        }
    }

    /// Bookkeeping for a command delivered by other means (fragmented sends).
    pub fn record_command_sent(&mut self, now: u64) {
        self.last_command_sent = now;
        self.commands_sent += 1;
        self.messages_sent += 1;
    }

    /// Put the mirror into the safe state; returns the command to push, if any.
    pub fn trigger_fail_safe(&mut self, now: u64) -> Option<Vec<u8>> {
        warn!(
            "Fail-safe for {} [{}] ({})",
            log_name(&self.name),
            self.mac,
            self.node_type()
        );
        self.kind.fail_safe(now)
    }

    // ------------------------------------------------------------ schedules

    pub fn add_schedule(&mut self, schedule: Schedule) -> Result<(), FleetError> {
        schedule.validate()?;
        if self.schedules.iter().any(|s| s.id == schedule.id) {
            return Err(FleetError::ScheduleExists(schedule.id));
        }
        self.schedules.push(schedule);
        Ok(())
    }

    pub fn remove_schedule(&mut self, id: u32) -> Result<Schedule, FleetError> {
        let pos = self
            .schedules
            .iter()
            .position(|s| s.id == id)
            .ok_or(FleetError::ScheduleNotFound(id))?;
        Ok(self.schedules.remove(pos))
    }

    pub fn schedule(&self, id: u32) -> Option<&Schedule> {
        self.schedules.iter().find(|s| s.id == id)
    }

    pub fn schedule_mut(&mut self, id: u32) -> Option<&mut Schedule> {
        self.schedules.iter_mut().find(|s| s.id == id)
    }

    pub fn schedules(&self) -> &[Schedule] {
        &self.schedules
    }

    pub fn due_schedules(&self, now: u64, utc_offset_secs: i32) -> Vec<u32> {
        self.schedules
            .iter()
            .filter(|s| s.is_due(now, utc_offset_secs))
            .map(|s| s.id)
            .collect()
    }

    pub fn set_schedules_enabled(&mut self, enabled: bool) {
        for s in &mut self.schedules {
            s.enabled = enabled;
        }
    }

    /// Reset runtime state after loading from persistence.
    pub(crate) fn reset_runtime(&mut self) {
        self.status = DeviceStatus::Unknown;
        self.last_heartbeat = 0;
        self.last_command_sent = 0;
        self.last_status_received = 0;
        self.health = 100;
        self.uptime_minutes = 0;
    }

    pub fn snapshot(&self) -> Value {
        json!({
            "mac": self.mac.to_string(),
            "type": self.node_type().display_name(),
            "name": self.name,
            "tankId": self.tank_id,
            "firmwareVersion": self.firmware_version,
            "enabled": self.enabled,
            "status": self.status.to_string(),
            "health": self.health,
            "uptimeMinutes": self.uptime_minutes,
            "lastHeartbeat": self.last_heartbeat,
            "messagesReceived": self.messages_received,
            "messagesSent": self.messages_sent,
            "commandsSent": self.commands_sent,
            "errorCount": self.error_count,
            "scheduleCount": self.schedules.len(),
            "state": serde_json::to_value(&self.kind).unwrap_or(Value::Null),
        })
    }
}
