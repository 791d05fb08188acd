//! Safety monitor: heartbeat timeouts, water-parameter alerts, emergency
//! shutdown and the overall health score.
//!
//! Fail-safe commands are pushed best-effort. The node's own connection
//! timeout is what actually guarantees the safe state when the hub cannot
//! reach it.

use log::{debug, error, warn};
use serde_json::json;

use super::device::{next_command_id, Device, DeviceStatus};
use super::notify::FleetEvent;
use super::radio::HubRadio;
use super::FleetManager;
use crate::logutil::log_name;
use crate::metrics;
use crate::protocol::{Command, Message};

/// Move a device's mirror to its safe state and push the matching command.
fn push_fail_safe(radio: &mut dyn HubRadio, device: &mut Device, now: u64) {
    metrics::inc_failsafes_triggered();
    let Some(payload) = device.trigger_fail_safe(now) else {
        return;
    };
    let message = Message::Command(Command::single(next_command_id(), &payload));
    match radio.send_reliable(&device.mac, device.tank_id, message, now) {
        Ok(()) => device.record_command_sent(now),
        Err(e) => debug!("Fail-safe push to {} not delivered ({}); node enforces locally", device.mac, e),
    }
}

impl FleetManager {
    /// Fail safe every Online device whose heartbeat is older than the
    /// configured timeout and mark it Offline. Returns how many were affected.
    ///
    /// Each device fails safe once per outage; it has to come back Online
    /// before it can time out again.
    pub fn check_device_health(&mut self, radio: &mut dyn HubRadio, now: u64) -> usize {
        let timeout = self.settings.heartbeat_timeout_ms;
        let mut offline = Vec::new();
        for aq in self.aquariums.values_mut() {
            for device in aq.devices_mut() {
                if device.status() == DeviceStatus::Online && device.has_heartbeat_timed_out(timeout, now) {
                    warn!(
                        "{} [{}] missed heartbeats for {}ms",
                        log_name(&device.name),
                        device.mac,
                        now.saturating_sub(device.last_heartbeat())
                    );
                    push_fail_safe(radio, device, now);
                    device.set_status(DeviceStatus::Offline);
                    offline.push(device.snapshot());
                }
            }
        }
        let count = offline.len();
        self.stats.total_errors += count as u64;
        for snapshot in offline {
            self.emit(FleetEvent::DeviceOffline, snapshot);
        }
        count
    }

    /// Emit an alert per aquarium and parameter whose fresh reading is out of
    /// range. Advisory only; no device is commanded. Returns the alert count.
    pub fn check_water_parameters(&mut self, now: u64) -> usize {
        let fresh = self.settings.reading_freshness_ms;
        let mut alerts = Vec::new();
        for aq in self.aquariums.values().filter(|a| a.enabled) {
            let r = &aq.readings;
            if !aq.is_temperature_safe(now, fresh) {
                alerts.push((
                    FleetEvent::TemperatureAlert,
                    json!({
                        "aquariumId": aq.id,
                        "aquariumName": aq.name,
                        "value": r.temperature,
                        "min": aq.water.min_temperature,
                        "max": aq.water.max_temperature,
                    }),
                ));
            }
            if !aq.is_ph_safe(now, fresh) {
                alerts.push((
                    FleetEvent::PhAlert,
                    json!({
                        "aquariumId": aq.id,
                        "aquariumName": aq.name,
                        "value": r.ph,
                        "min": aq.water.min_ph,
                        "max": aq.water.max_ph,
                    }),
                ));
            }
            if !aq.is_tds_safe(now, fresh) {
                alerts.push((
                    FleetEvent::TdsAlert,
                    json!({
                        "aquariumId": aq.id,
                        "aquariumName": aq.name,
                        "value": r.tds,
                        "min": aq.water.min_tds,
                        "max": aq.water.max_tds,
                    }),
                ));
            }
        }
        let count = alerts.len();
        for (event, payload) in alerts {
            self.emit(event, payload);
        }
        count
    }

    /// Fail safe every device in the fleet and mark it Error.
    pub fn emergency_shutdown(&mut self, radio: &mut dyn HubRadio, reason: &str, now: u64) {
        error!("EMERGENCY SHUTDOWN: {}", reason);
        for aq in self.aquariums.values_mut() {
            for device in aq.devices_mut() {
                push_fail_safe(radio, device, now);
                device.set_status(DeviceStatus::Error);
            }
        }
        self.stats.total_errors += 1;
        self.emit(FleetEvent::EmergencyShutdown, json!({ "reason": reason }));
    }

    /// 100 with no devices, 0 with none Online, else the mean health of Online devices.
    pub fn system_health(&self) -> u8 {
        if self.index.is_empty() {
            return 100;
        }
        let (sum, online) = self
            .devices()
            .filter(|d| d.is_online())
            .fold((0u32, 0u32), |(sum, n), d| (sum + u32::from(d.health()), n + 1));
        if online == 0 {
            return 0;
        }
        (sum / online) as u8
    }

    /// Aquarium-level health scores plus the fleet-wide figure.
    pub fn health_report(&self, now: u64) -> serde_json::Value {
        let fresh = self.settings.reading_freshness_ms;
        json!({
            "systemHealth": self.system_health(),
            "devices": self.device_count(),
            "online": self.devices().filter(|d| d.is_online()).count(),
            "unmapped": self.unmapped.len(),
            "stats": self.stats,
            "aquariums": self.aquariums.values().map(|a| a.snapshot(now, fresh)).collect::<Vec<_>>(),
        })
    }
}
