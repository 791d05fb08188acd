//! # Device Fleet Registry
//!
//! Hub-side ownership of aquariums and the devices assigned to them.
//!
//! The [`FleetManager`] admits devices from Announce frames, tracks them
//! through heartbeats and status reports, provisions and unmaps them, runs
//! their schedules and (in [`safety`]) watches for lost contact and unsafe
//! water. All radio traffic goes through a [`HubRadio`].
//!
//! Every device lives in exactly one aquarium; a global address index maps a
//! MAC to the owning aquarium id. A device's `tank_id` always equals that id.

pub mod aquarium;
pub mod device;
pub mod kinds;
pub mod notify;
pub mod radio;
pub mod safety;
pub mod store;
pub mod unmapped;

use std::collections::{BTreeMap, HashMap};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::errors::{FleetError, TransportError};
use crate::logutil::log_name;
use crate::metrics;
use crate::protocol::{
    Ack, Announce, ConfigBody, FrameHeader, Heartbeat, MacAddress, Message, Status, Unmap,
};
use crate::schedule::Schedule;
use crate::transport::Delivery;
use crate::validation::{validate_aquarium_name, validate_device_name};

pub use aquarium::{Aquarium, AquariumSettings, Readings, WaterTargets, DEFAULT_READING_FRESHNESS_MS};
pub use device::{Device, DeviceStatus};
pub use kinds::{DeviceCommand, DeviceKind, SensorReading};
pub use notify::{CollectingNotifier, FleetEvent, LogNotifier, Notifier};
pub use radio::HubRadio;
pub use store::{FleetState, FleetStore, JsonFleetStore, MemoryFleetStore};
pub use unmapped::{UnmappedDevice, UnmappedRegistry};

/// Unmap reason sent when an operator removes a device.
pub const UNMAP_REASON_OPERATOR: u8 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetSettings {
    /// An Online device silent for longer than this is failed safe.
    pub heartbeat_timeout_ms: u64,
    pub reading_freshness_ms: u64,
    /// Wall-clock offset for Daily/Weekly schedules.
    pub utc_offset_secs: i32,
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: 60_000,
            reading_freshness_ms: DEFAULT_READING_FRESHNESS_MS,
            utc_offset_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetStats {
    pub total_messages_received: u64,
    pub total_commands: u64,
    pub total_errors: u64,
}

/// What the hub did with an Announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceOutcome {
    /// Already registered; acknowledged again.
    Known,
    /// Tank id 0; recorded in the unmapped registry.
    Pending,
    /// New device admitted into an aquarium.
    Admitted,
    /// Unknown aquarium or unsupported node type.
    Rejected,
}

pub struct FleetManager {
    aquariums: BTreeMap<u8, Aquarium>,
    index: HashMap<MacAddress, u8>,
    unmapped: UnmappedRegistry,
    stats: FleetStats,
    settings: FleetSettings,
    notifier: Box<dyn Notifier>,
    store: Option<Box<dyn FleetStore>>,
    next_node_id: u8,
    started_at: u64,
}

impl FleetManager {
    pub fn new(settings: FleetSettings, now: u64) -> Self {
        Self {
            aquariums: BTreeMap::new(),
            index: HashMap::new(),
            unmapped: UnmappedRegistry::new(),
            stats: FleetStats::default(),
            settings,
            notifier: Box::new(LogNotifier),
            store: None,
            next_node_id: 1,
            started_at: now,
        }
    }

    pub fn with_notifier(mut self, notifier: impl Notifier + 'static) -> Self {
        self.notifier = Box::new(notifier);
        self
    }

    pub fn with_store(mut self, store: impl FleetStore + 'static) -> Self {
        self.store = Some(Box::new(store));
        self
    }

    pub fn settings(&self) -> &FleetSettings {
        &self.settings
    }

    pub fn stats(&self) -> &FleetStats {
        &self.stats
    }

    pub fn uptime_minutes(&self, now: u64) -> u16 {
        (now.saturating_sub(self.started_at) / 60_000).min(u64::from(u16::MAX)) as u16
    }

    // ------------------------------------------------------- persistence

    /// Load state from the configured store, replacing anything in memory.
    /// Returns the number of aquariums loaded.
    pub fn load(&mut self) -> anyhow::Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        match store.load()? {
            Some(state) => {
                let n = state.aquariums.len();
                self.restore(state);
                Ok(n)
            }
            None => Ok(0),
        }
    }

    /// Replace the registry contents with `state`. Runtime status resets to Unknown.
    pub fn restore(&mut self, state: FleetState) {
        self.aquariums.clear();
        self.index.clear();
        for mut aq in state.aquariums {
            if aq.id == 0 {
                warn!("Skipping persisted aquarium with id 0");
                continue;
            }
            let id = aq.id;
            let macs: Vec<MacAddress> = aq.devices().map(|d| d.mac).collect();
            for mac in macs {
                if self.index.contains_key(&mac) {
                    warn!("Device {} listed in more than one aquarium; keeping the first", mac);
                    aq.remove_device(&mac);
                    continue;
                }
                if let Some(d) = aq.device_mut(&mac) {
                    d.tank_id = id;
                    d.reset_runtime();
                    self.next_node_id = self.next_node_id.max(d.node_id.saturating_add(1)).max(1);
                }
                self.index.insert(mac, id);
            }
            self.aquariums.insert(id, aq);
        }
        self.unmapped.restore(state.unmapped, state.total_discovered);
        info!(
            "Fleet restored: {} aquariums, {} devices, {} unmapped",
            self.aquariums.len(),
            self.index.len(),
            self.unmapped.len()
        );
    }

    pub fn state(&self) -> FleetState {
        FleetState {
            version: store::FLEET_STATE_VERSION,
            aquariums: self.aquariums.values().cloned().collect(),
            unmapped: self.unmapped.iter().cloned().collect(),
            total_discovered: self.unmapped.total_discovered(),
        }
    }

    /// Hand the current state to the store. Failures are logged, not returned.
    pub fn persist(&self) {
        if let Some(store) = &self.store {
            if let Err(e) = store.persist(&self.state()) {
                warn!("Failed to persist fleet state: {:#}", e);
            }
        }
    }

    pub(crate) fn emit(&self, event: FleetEvent, payload: Value) {
        notify::emit(self.notifier.as_ref(), event, payload);
    }

    // ---------------------------------------------------------- aquariums

    pub fn add_aquarium(&mut self, mut aquarium: Aquarium) -> Result<(), FleetError> {
        if aquarium.id == 0 {
            return Err(FleetError::InvalidAquariumId);
        }
        if self.aquariums.contains_key(&aquarium.id) {
            return Err(FleetError::AquariumExists(aquarium.id));
        }
        validate_aquarium_name(&aquarium.name)?;
        if !aquarium.water.is_consistent() {
            return Err(FleetError::InvalidValue("water parameter ranges are inverted".into()));
        }
        if let Some(dup) = aquarium.devices().find(|d| self.index.contains_key(&d.mac)) {
            return Err(FleetError::DeviceExists(dup.mac));
        }
        let id = aquarium.id;
        for d in aquarium.devices_mut() {
            d.tank_id = id;
        }
        for mac in aquarium.devices().map(|d| d.mac) {
            self.index.insert(mac, id);
        }
        info!("Aquarium {} {} added", id, log_name(&aquarium.name));
        self.aquariums.insert(id, aquarium);
        self.persist();
        Ok(())
    }

    /// Remove an aquarium and every device it owns. No fail-safe is pushed.
    pub fn remove_aquarium(&mut self, radio: &mut dyn HubRadio, id: u8) -> Result<Aquarium, FleetError> {
        let aquarium = self.aquariums.remove(&id).ok_or(FleetError::AquariumNotFound(id))?;
        for d in aquarium.devices() {
            self.index.remove(&d.mac);
            radio.remove_peer(&d.mac);
        }
        info!(
            "Aquarium {} {} removed with {} devices",
            id,
            log_name(&aquarium.name),
            aquarium.device_count()
        );
        self.persist();
        Ok(aquarium)
    }

    /// Change an aquarium's settings and persist. The closure works on a
    /// copy that is swapped in only when it validates; the id and the device
    /// set cannot be changed this way.
    pub fn update_aquarium<F>(&mut self, id: u8, f: F) -> Result<(), FleetError>
    where
        F: FnOnce(&mut AquariumSettings),
    {
        let current = self.aquariums.get(&id).ok_or(FleetError::AquariumNotFound(id))?;
        let mut settings = AquariumSettings::from(current);
        f(&mut settings);
        let name = validate_aquarium_name(&settings.name)?;
        if !settings.water.is_consistent() {
            return Err(FleetError::InvalidValue("water parameter ranges are inverted".into()));
        }
        if let Some(aq) = self.aquariums.get_mut(&id) {
            settings.name = name;
            settings.apply(aq);
        }
        self.persist();
        Ok(())
    }

    pub fn aquarium(&self, id: u8) -> Option<&Aquarium> {
        self.aquariums.get(&id)
    }

    pub fn aquariums(&self) -> impl Iterator<Item = &Aquarium> {
        self.aquariums.values()
    }

    pub fn aquarium_count(&self) -> usize {
        self.aquariums.len()
    }

    // ------------------------------------------------------------ devices

    pub fn device(&self, mac: &MacAddress) -> Option<&Device> {
        let id = self.index.get(mac)?;
        self.aquariums.get(id)?.device(mac)
    }

    pub fn device_mut(&mut self, mac: &MacAddress) -> Option<&mut Device> {
        let id = self.index.get(mac)?;
        self.aquariums.get_mut(id)?.device_mut(mac)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.aquariums.values().flat_map(|a| a.devices())
    }

    pub fn device_count(&self) -> usize {
        self.index.len()
    }

    pub fn is_known(&self, mac: &MacAddress) -> bool {
        self.index.contains_key(mac)
    }

    pub fn unmapped(&self) -> &UnmappedRegistry {
        &self.unmapped
    }

    /// Forget pending devices not heard from within `max_age_ms`.
    pub fn cleanup_unmapped(&mut self, max_age_ms: u64, now: u64) -> usize {
        let dropped = self.unmapped.cleanup_older_than(max_age_ms, now);
        if dropped > 0 {
            self.persist();
        }
        dropped
    }

    fn allocate_node_id(&mut self) -> u8 {
        let id = self.next_node_id;
        self.next_node_id = if id >= 254 { 1 } else { id + 1 };
        id
    }

    // ----------------------------------------------------------- dispatch

    /// Route one delivery from the transport.
    pub fn handle_delivery(&mut self, radio: &mut dyn HubRadio, delivery: &Delivery, now: u64) {
        match delivery {
            Delivery::Frame { from, header, message } => match message {
                Message::Announce(a) => {
                    self.handle_announce(radio, *from, header, a, now);
                }
                Message::Heartbeat(hb) => self.handle_heartbeat(radio, *from, hb, now),
                Message::Status(st) => self.handle_status(*from, st, now),
                other => debug!("Ignoring {:?} from {} on the hub", other.kind(), from),
            },
            Delivery::Command { from, .. } => debug!("Ignoring command transfer from {}", from),
        }
    }

    pub fn handle_announce(
        &mut self,
        radio: &mut dyn HubRadio,
        from: MacAddress,
        header: &FrameHeader,
        announce: &Announce,
        now: u64,
    ) -> AnnounceOutcome {
        self.stats.total_messages_received += 1;

        if let Some(device) = self.device_mut(&from) {
            device.firmware_version = announce.firmware_version;
            device.messages_received += 1;
            let (node_id, tank_id) = (device.node_id, device.tank_id);
            radio.peer_heartbeat(from, now);
            self.send_ack(radio, from, tank_id, node_id, true, now);
            return AnnounceOutcome::Known;
        }

        if header.tank_id == 0 {
            let fresh = self.unmapped.upsert(
                from,
                header.node_type,
                announce.firmware_version,
                announce.capabilities,
                now,
            );
            radio.add_peer(from, now);
            self.send_ack(radio, from, 0, 0, true, now);
            if fresh {
                self.persist();
            }
            return AnnounceOutcome::Pending;
        }

        if !self.aquariums.contains_key(&header.tank_id) {
            warn!("Announce from {} names unknown aquarium {}", from, header.tank_id);
            self.stats.total_errors += 1;
            self.send_ack(radio, from, header.tank_id, 0, false, now);
            return AnnounceOutcome::Rejected;
        }

        let Some(kind) = DeviceKind::for_node_type(header.node_type) else {
            warn!("Announce from {} with unsupported node type {}", from, header.node_type);
            self.stats.total_errors += 1;
            self.send_ack(radio, from, header.tank_id, 0, false, now);
            return AnnounceOutcome::Rejected;
        };

        let mut device = Device::new(from, &Device::default_name(header.node_type, &from), header.tank_id, kind);
        device.firmware_version = announce.firmware_version;
        device.node_id = self.allocate_node_id();
        device.messages_received = 1;
        let node_id = device.node_id;
        let snapshot = device.snapshot();
        if let Some(aq) = self.aquariums.get_mut(&header.tank_id) {
            aq.add_device(device);
        }
        self.index.insert(from, header.tank_id);
        self.unmapped.remove(&from);
        radio.add_peer(from, now);
        info!("Admitted {} {} into aquarium {}", header.node_type, from, header.tank_id);
        self.send_ack(radio, from, header.tank_id, node_id, true, now);
        self.emit(FleetEvent::DeviceDiscovered, snapshot);
        self.persist();
        AnnounceOutcome::Admitted
    }

    fn send_ack(&mut self, radio: &mut dyn HubRadio, to: MacAddress, tank_id: u8, node_id: u8, accepted: bool, now: u64) {
        let ack = Message::Ack(Ack {
            assigned_node_id: node_id,
            accepted,
        });
        if let Err(e) = radio.send(&to, tank_id, ack, now) {
            self.stats.total_errors += 1;
            warn!("Ack to {} failed: {}", to, e);
        }
    }

    /// Every heartbeat refreshes the sender's liveness entry, if it has one.
    /// Registered devices and pending nodes are answered with the hub's own
    /// heartbeat so their connection timeout does not expire; other senders
    /// are ignored.
    pub fn handle_heartbeat(&mut self, radio: &mut dyn HubRadio, from: MacAddress, heartbeat: &Heartbeat, now: u64) {
        radio.touch_peer(&from, now);
        let echo = Message::Heartbeat(Heartbeat {
            health: self.system_health(),
            uptime_minutes: self.uptime_minutes(now),
        });

        let Some(device) = self.device_mut(&from) else {
            if self.unmapped.mark_seen(&from, now) {
                self.stats.total_messages_received += 1;
                if let Err(e) = radio.send(&from, 0, echo, now) {
                    debug!("Heartbeat echo to pending {} failed: {}", from, e);
                }
            } else {
                debug!("Heartbeat from unknown {}", from);
            }
            return;
        };
        let came_online = device.update_heartbeat(heartbeat.health, heartbeat.uptime_minutes, now);
        let tank_id = device.tank_id;
        let snapshot = came_online.then(|| device.snapshot());
        self.stats.total_messages_received += 1;
        radio.peer_heartbeat(from, now);
        if let Some(snapshot) = snapshot {
            self.emit(FleetEvent::DeviceOnline, snapshot);
        }
        if let Err(e) = radio.send(&from, tank_id, echo, now) {
            debug!("Heartbeat echo to {} failed: {}", from, e);
        }
    }

    /// Status from a known device updates its mirror; sensor reports also
    /// update the owning aquarium's readings.
    pub fn handle_status(&mut self, from: MacAddress, status: &Status, now: u64) {
        let Some(&tank_id) = self.index.get(&from) else {
            debug!("Status from unknown {}", from);
            return;
        };
        let Some(aq) = self.aquariums.get_mut(&tank_id) else {
            return;
        };
        let Some(device) = aq.device_mut(&from) else {
            return;
        };
        let reading = device.handle_status(status, now);
        let payload = json!({
            "device": device.snapshot(),
            "commandId": status.command_id,
            "statusCode": status.status_code,
        });
        if let Some(r) = reading {
            aq.update_readings(&r, now);
            debug!(
                "Aquarium {} reading: {:.2}°C pH {:.2} TDS {}",
                tank_id, r.temperature, r.ph, r.tds
            );
        }
        self.stats.total_messages_received += 1;
        self.emit(FleetEvent::DeviceStatus, payload);
    }

    // -------------------------------------------------------- provisioning

    /// Assign a pending device to an aquarium: send it Config and register it
    /// as Initializing under `name`. A link failure leaves the Config queued
    /// for retry and still registers the device.
    pub fn provision_device(
        &mut self,
        radio: &mut dyn HubRadio,
        mac: MacAddress,
        tank_id: u8,
        name: &str,
        config: &[u8],
        now: u64,
    ) -> Result<(), FleetError> {
        let name = validate_device_name(name)?;
        let pending = self.unmapped.get(&mac).cloned().ok_or(FleetError::NotPending(mac))?;
        if !self.aquariums.contains_key(&tank_id) {
            return Err(FleetError::AquariumNotFound(tank_id));
        }
        let kind = DeviceKind::for_node_type(pending.node_type)
            .ok_or(FleetError::UnsupportedNodeType(pending.node_type.as_u8()))?;

        let body = Message::Config(ConfigBody::new(&name, config));
        match radio.send_reliable(&mac, tank_id, body, now) {
            Ok(()) => {}
            Err(TransportError::Link(e)) => {
                self.stats.total_errors += 1;
                warn!("Config to {} queued for retry: {}", mac, e);
            }
            Err(e) => return Err(e.into()),
        }

        let mut device = Device::new(mac, &name, tank_id, kind);
        device.firmware_version = pending.firmware_version;
        device.node_id = self.allocate_node_id();
        device.set_status(DeviceStatus::Initializing);
        let snapshot = device.snapshot();
        if let Some(aq) = self.aquariums.get_mut(&tank_id) {
            aq.add_device(device);
        }
        self.index.insert(mac, tank_id);
        self.unmapped.remove(&mac);
        info!("Provisioned {} as {} in aquarium {}", mac, log_name(&name), tank_id);
        self.emit(FleetEvent::DeviceProvisioned, snapshot);
        self.persist();
        Ok(())
    }

    /// Detach a device from its aquarium and return it to the unmapped registry.
    pub fn unmap_device(
        &mut self,
        radio: &mut dyn HubRadio,
        mac: MacAddress,
        reason: u8,
        now: u64,
    ) -> Result<Device, FleetError> {
        let tank_id = *self.index.get(&mac).ok_or(FleetError::DeviceNotFound(mac))?;
        let device = self
            .aquariums
            .get_mut(&tank_id)
            .and_then(|aq| aq.remove_device(&mac))
            .ok_or(FleetError::DeviceNotFound(mac))?;
        self.index.remove(&mac);

        if let Err(e) = radio.send(&mac, 0, Message::Unmap(Unmap { reason }), now) {
            debug!("Unmap to {} not delivered: {}", mac, e);
        }
        self.unmapped
            .insert_returned(mac, device.node_type(), device.firmware_version, now);
        info!("Unmapped {} {} from aquarium {}", mac, log_name(&device.name), tank_id);
        self.emit(
            FleetEvent::DeviceUnmapped,
            json!({ "mac": mac.to_string(), "tankId": tank_id, "reason": reason }),
        );
        self.persist();
        Ok(device)
    }

    pub fn rename_device(&mut self, mac: &MacAddress, name: &str) -> Result<(), FleetError> {
        let name = validate_device_name(name)?;
        let device = self.device_mut(mac).ok_or(FleetError::DeviceNotFound(*mac))?;
        device.name = name;
        self.persist();
        Ok(())
    }

    pub fn set_device_enabled(&mut self, mac: &MacAddress, enabled: bool) -> Result<(), FleetError> {
        let device = self.device_mut(mac).ok_or(FleetError::DeviceNotFound(*mac))?;
        device.enabled = enabled;
        self.persist();
        Ok(())
    }

    // ------------------------------------------------------------ commands

    /// Send raw command bytes (opcode first) to a device.
    pub fn send_device_command(
        &mut self,
        radio: &mut dyn HubRadio,
        mac: &MacAddress,
        payload: &[u8],
        now: u64,
    ) -> Result<u8, FleetError> {
        let device = self.device_mut(mac).ok_or(FleetError::DeviceNotFound(*mac))?;
        match device.send_command(radio, payload, now) {
            Ok(id) => {
                self.stats.total_commands += 1;
                Ok(id)
            }
            Err(e) => {
                self.stats.total_errors += 1;
                Err(e)
            }
        }
    }

    /// Validate, send and mirror a typed command.
    pub fn command_device(
        &mut self,
        radio: &mut dyn HubRadio,
        mac: &MacAddress,
        command: &DeviceCommand,
        now: u64,
    ) -> Result<u8, FleetError> {
        let device = self.device(mac).ok_or(FleetError::DeviceNotFound(*mac))?;
        let payload = device.kind.encode(command, now)?;
        let id = self.send_device_command(radio, mac, &payload, now)?;
        if let Some(device) = self.device_mut(mac) {
            device.kind.apply(command, now);
        }
        Ok(id)
    }

    /// Bookkeeping for a command delivered outside [`Device::send_command`].
    pub fn record_command_sent(&mut self, mac: &MacAddress, now: u64) {
        if let Some(device) = self.device_mut(mac) {
            device.record_command_sent(now);
            self.stats.total_commands += 1;
        }
    }

    // ----------------------------------------------------------- schedules

    pub fn add_schedule(&mut self, mac: &MacAddress, schedule: Schedule) -> Result<(), FleetError> {
        let device = self.device_mut(mac).ok_or(FleetError::DeviceNotFound(*mac))?;
        device.add_schedule(schedule)?;
        self.persist();
        Ok(())
    }

    pub fn remove_schedule(&mut self, mac: &MacAddress, id: u32) -> Result<Schedule, FleetError> {
        let device = self.device_mut(mac).ok_or(FleetError::DeviceNotFound(*mac))?;
        let removed = device.remove_schedule(id)?;
        self.persist();
        Ok(removed)
    }

    pub fn set_schedules_enabled(&mut self, mac: &MacAddress, enabled: bool) -> Result<(), FleetError> {
        let device = self.device_mut(mac).ok_or(FleetError::DeviceNotFound(*mac))?;
        device.set_schedules_enabled(enabled);
        self.persist();
        Ok(())
    }

    /// One scheduling pass: for every enabled Online device, send each due
    /// schedule's command once and mark it executed. Returns how many ran.
    pub fn run_schedules(&mut self, radio: &mut dyn HubRadio, now: u64) -> usize {
        let offset = self.settings.utc_offset_secs;
        let mut executed = 0;
        let mut errors = 0;
        for aq in self.aquariums.values_mut() {
            for device in aq.devices_mut() {
                device.kind.tick(now);
                if !device.enabled || !device.is_online() {
                    continue;
                }
                for id in device.due_schedules(now, offset) {
                    let Some(command) = device.schedule(id).map(|s| s.command().to_vec()) else {
                        continue;
                    };
                    match device.send_command(radio, &command, now) {
                        Ok(_) => debug!("Schedule {} ran on {}", id, device.mac),
                        Err(e) => {
                            errors += 1;
                            warn!("Schedule {} on {} failed: {}", id, device.mac, e);
                        }
                    }
                    if let Some(s) = device.schedule_mut(id) {
                        s.mark_executed(now);
                    }
                    executed += 1;
                    metrics::inc_schedules_executed();
                }
            }
        }
        self.stats.total_commands += executed as u64;
        self.stats.total_errors += errors;
        executed
    }
}

#[cfg(test)]
mod tests;
