//! # Hub Runtime
//!
//! Two loops share one [`HubCore`] behind a single `tokio::sync::Mutex`:
//!
//! - the **network loop** drains inbound frames and dispatches them to the
//!   fleet, services the retry queue, ages out silent peers, runs the
//!   scheduling pass and periodically logs transport statistics
//! - the **watchdog loop** runs the safety monitor: heartbeat timeouts and
//!   water-parameter checks
//!
//! Update volume is low, so every mutation of fleet or transport state goes
//! through that one lock. External callers use a [`HubHandle`].
//!
//! ```rust,no_run
//! # async fn demo() -> anyhow::Result<()> {
//! use aquanet::fleet::{FleetManager, FleetSettings};
//! use aquanet::hub::{Hub, HubCore, HubSettings};
//! use aquanet::protocol::{MacAddress, NodeType};
//! use aquanet::transport::{epoch_ms, link::OfflineLink, rx::rx_queue, Role, Transport, TransportSettings};
//!
//! let (_tx, rx) = rx_queue(10);
//! let transport = Transport::new(Role::Hub, NodeType::Hub, OfflineLink, rx, TransportSettings::default());
//! let fleet = FleetManager::new(FleetSettings::default(), epoch_ms());
//! let hub = Hub::new(HubCore::new(transport, fleet), HubSettings::default());
//! let (stop, shutdown) = tokio::sync::watch::channel(false);
//! let task = tokio::spawn(hub.run(shutdown));
//! stop.send(true)?;
//! task.await??;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use serde_json::{json, Value};
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;

use crate::errors::{FleetError, TransportError};
use crate::fleet::device::next_command_id;
use crate::fleet::{Aquarium, DeviceCommand, FleetManager, FleetState};
use crate::metrics;
use crate::protocol::{MacAddress, FRAGMENT_SIZE};
use crate::schedule::Schedule;
use crate::transport::link::LinkDriver;
use crate::transport::{epoch_ms, Transport, TransportStats};

pub mod bootstrap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubSettings {
    /// How often the network loop drains the RX queue.
    pub poll_interval_ms: u64,
    /// Peers silent for longer than this are marked offline.
    pub peer_timeout_ms: u64,
    pub schedule_check_interval_ms: u64,
    pub health_check_interval_ms: u64,
    pub water_check_interval_ms: u64,
    pub stats_interval_ms: u64,
    /// Unmapped entries not heard from for this long are forgotten.
    pub unmapped_retention_ms: u64,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10,
            peer_timeout_ms: 60_000,
            schedule_check_interval_ms: 1_000,
            health_check_interval_ms: 5_000,
            water_check_interval_ms: 10_000,
            stats_interval_ms: 60_000,
            unmapped_retention_ms: 7 * 24 * 3600 * 1000,
        }
    }
}

enum PreparedCommand {
    Sent(u8),
    Fragments { command_id: u8, frames: Vec<Vec<u8>> },
}

/// Transport plus fleet: the state both loops mutate.
pub struct HubCore<L: LinkDriver> {
    pub transport: Transport<L>,
    pub fleet: FleetManager,
}

impl<L: LinkDriver> HubCore<L> {
    pub fn new(transport: Transport<L>, fleet: FleetManager) -> Self {
        Self { transport, fleet }
    }

    /// Drain the RX queue and dispatch every delivery. Returns how many were handled.
    pub fn process_inbound(&mut self, now: u64) -> usize {
        let deliveries = self.transport.poll(now);
        for d in &deliveries {
            self.fleet.handle_delivery(&mut self.transport, d, now);
        }
        deliveries.len()
    }

    /// One network-loop iteration without the scheduling pass.
    pub fn network_tick(&mut self, now: u64, peer_timeout_ms: u64) -> usize {
        let handled = self.process_inbound(now);
        self.transport.tick(now);
        let expired = self.transport.peers_mut().sweep_timeouts(peer_timeout_ms, now);
        if expired > 0 {
            debug!("{} peers went offline", expired);
        }
        handled
    }

    pub fn run_schedules(&mut self, now: u64) -> usize {
        self.fleet.run_schedules(&mut self.transport, now)
    }

    pub fn check_device_health(&mut self, now: u64) -> usize {
        self.fleet.check_device_health(&mut self.transport, now)
    }

    pub fn check_water_parameters(&mut self, now: u64) -> usize {
        self.fleet.check_water_parameters(now)
    }

    /// Send a command of any length (up to the transport maximum). Payloads
    /// that fit one fragment go through the device's normal send path.
    pub async fn send_command(&mut self, mac: &MacAddress, payload: &[u8], now: u64) -> Result<u8, FleetError> {
        let (command_id, frames) = match self.prepare_command(mac, payload, now)? {
            PreparedCommand::Sent(command_id) => return Ok(command_id),
            PreparedCommand::Fragments { command_id, frames } => (command_id, frames),
        };
        let pause = Duration::from_millis(self.transport.settings().fragment_pause_ms);
        for (index, bytes) in frames.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(pause).await;
            }
            self.transport.send_fragment(mac, bytes)?;
        }
        self.fleet.record_command_sent(mac, now);
        Ok(command_id)
    }

    /// Single-fragment payloads are sent right away; longer ones are encoded
    /// into fragments for the caller to pace out.
    fn prepare_command(&mut self, mac: &MacAddress, payload: &[u8], now: u64) -> Result<PreparedCommand, FleetError> {
        if payload.len() <= FRAGMENT_SIZE {
            let command_id = self.fleet.send_device_command(&mut self.transport, mac, payload, now)?;
            return Ok(PreparedCommand::Sent(command_id));
        }
        let device = self.fleet.device(mac).ok_or(FleetError::DeviceNotFound(*mac))?;
        if !self.transport.peers().is_online(mac) {
            return Err(FleetError::Transport(TransportError::PeerOffline(*mac)));
        }
        let tank_id = device.tank_id;
        let command_id = next_command_id();
        let frames = self.transport.fragment_frames(tank_id, command_id, payload, now)?;
        debug!("Command {} to {} split into {} fragments", command_id, mac, frames.len());
        Ok(PreparedCommand::Fragments { command_id, frames })
    }

    pub fn log_stats(&self) {
        let t = self.transport.stats();
        let f = self.fleet.stats();
        info!(
            "stats: tx={} rx={} fail={} retries={} dup={} bad={} overflow={} queued={} | devices={} online={} unmapped={} cmds={} errors={} health={}",
            t.messages_sent,
            t.messages_received,
            t.send_failures,
            t.retries,
            t.duplicates_ignored,
            t.malformed_frames,
            t.rx_queue_overflows,
            t.retry_queue_len,
            self.fleet.device_count(),
            self.transport.peers().online_count(),
            self.fleet.unmapped().len(),
            f.total_commands,
            f.total_errors,
            self.fleet.system_health()
        );
    }
}

fn ticker(period_ms: u64) -> tokio::time::Interval {
    let mut t = tokio::time::interval(Duration::from_millis(period_ms.max(1)));
    t.set_missed_tick_behavior(MissedTickBehavior::Delay);
    t
}

fn stop_requested(changed: Result<(), watch::error::RecvError>, rx: &watch::Receiver<bool>) -> bool {
    changed.is_err() || *rx.borrow()
}

pub struct Hub<L: LinkDriver> {
    core: Arc<Mutex<HubCore<L>>>,
    settings: HubSettings,
}

impl<L: LinkDriver + 'static> Hub<L> {
    pub fn new(core: HubCore<L>, settings: HubSettings) -> Self {
        Self {
            core: Arc::new(Mutex::new(core)),
            settings,
        }
    }

    pub fn handle(&self) -> HubHandle<L> {
        HubHandle {
            core: self.core.clone(),
        }
    }

    /// Run both loops until `shutdown` flips to true (or its sender is dropped).
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        {
            let core = self.core.lock().await;
            info!(
                "Hub running: {} aquariums, {} devices, {} unmapped",
                core.fleet.aquarium_count(),
                core.fleet.device_count(),
                core.fleet.unmapped().len()
            );
        }
        let network = tokio::spawn(network_loop(self.core.clone(), self.settings.clone(), shutdown.clone()));
        let watchdog = tokio::spawn(watchdog_loop(self.core.clone(), self.settings.clone(), shutdown));
        let (n, w) = tokio::join!(network, watchdog);
        n.map_err(|e| anyhow!("network loop panicked: {}", e))?;
        w.map_err(|e| anyhow!("watchdog loop panicked: {}", e))?;

        let core = self.core.lock().await;
        core.log_stats();
        core.fleet.persist();
        info!("Hub shutdown complete");
        Ok(())
    }
}

async fn network_loop<L: LinkDriver>(core: Arc<Mutex<HubCore<L>>>, settings: HubSettings, mut shutdown: watch::Receiver<bool>) {
    let mut poll = ticker(settings.poll_interval_ms);
    let mut schedules = ticker(settings.schedule_check_interval_ms);
    let mut stats = ticker(settings.stats_interval_ms);
    // the first tick of an interval fires immediately
    stats.tick().await;
    loop {
        tokio::select! {
            _ = poll.tick() => {
                let mut core = core.lock().await;
                core.network_tick(epoch_ms(), settings.peer_timeout_ms);
            }
            _ = schedules.tick() => {
                let mut core = core.lock().await;
                let ran = core.run_schedules(epoch_ms());
                if ran > 0 {
                    debug!("Scheduling pass executed {} schedules", ran);
                }
            }
            _ = stats.tick() => {
                core.lock().await.log_stats();
            }
            changed = shutdown.changed() => {
                if stop_requested(changed, &shutdown) {
                    debug!("Network loop stopping");
                    break;
                }
            }
        }
    }
}

async fn watchdog_loop<L: LinkDriver>(core: Arc<Mutex<HubCore<L>>>, settings: HubSettings, mut shutdown: watch::Receiver<bool>) {
    let mut health = ticker(settings.health_check_interval_ms);
    let mut water = ticker(settings.water_check_interval_ms);
    loop {
        tokio::select! {
            _ = health.tick() => {
                let mut core = core.lock().await;
                let failed = core.check_device_health(epoch_ms());
                if failed > 0 {
                    warn!("{} devices failed safe after heartbeat timeout", failed);
                }
            }
            _ = water.tick() => {
                let now = epoch_ms();
                let mut core = core.lock().await;
                core.check_water_parameters(now);
                let dropped = core.fleet.cleanup_unmapped(settings.unmapped_retention_ms, now);
                if dropped > 0 {
                    info!("Forgot {} stale unmapped devices", dropped);
                }
            }
            changed = shutdown.changed() => {
                if stop_requested(changed, &shutdown) {
                    debug!("Watchdog loop stopping");
                    break;
                }
            }
        }
    }
}

/// Cloneable entry point for operator actions against a running hub.
pub struct HubHandle<L: LinkDriver> {
    core: Arc<Mutex<HubCore<L>>>,
}

impl<L: LinkDriver> Clone for HubHandle<L> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<L: LinkDriver> HubHandle<L> {
    /// Run `f` with exclusive access to the hub state.
    pub async fn with_core<R>(&self, f: impl FnOnce(&mut HubCore<L>) -> R) -> R {
        let mut core = self.core.lock().await;
        f(&mut core)
    }

    pub async fn add_aquarium(&self, aquarium: Aquarium) -> Result<(), FleetError> {
        self.core.lock().await.fleet.add_aquarium(aquarium)
    }

    pub async fn remove_aquarium(&self, id: u8) -> Result<Aquarium, FleetError> {
        let mut core = self.core.lock().await;
        let HubCore { transport, fleet } = &mut *core;
        fleet.remove_aquarium(transport, id)
    }

    pub async fn provision_device(&self, mac: MacAddress, tank_id: u8, name: &str, config: &[u8]) -> Result<(), FleetError> {
        let mut core = self.core.lock().await;
        let HubCore { transport, fleet } = &mut *core;
        fleet.provision_device(transport, mac, tank_id, name, config, epoch_ms())
    }

    pub async fn unmap_device(&self, mac: MacAddress, reason: u8) -> Result<(), FleetError> {
        let mut core = self.core.lock().await;
        let HubCore { transport, fleet } = &mut *core;
        fleet.unmap_device(transport, mac, reason, epoch_ms()).map(|_| ())
    }

    /// Like [`HubCore::send_command`], but the lock is released during the
    /// pauses between fragments so both loops keep running.
    pub async fn send_command(&self, mac: MacAddress, payload: &[u8]) -> Result<u8, FleetError> {
        let now = epoch_ms();
        let (command_id, frames, pause) = {
            let mut core = self.core.lock().await;
            match core.prepare_command(&mac, payload, now)? {
                PreparedCommand::Sent(command_id) => return Ok(command_id),
                PreparedCommand::Fragments { command_id, frames } => {
                    (command_id, frames, core.transport.settings().fragment_pause_ms)
                }
            }
        };
        for (index, bytes) in frames.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(Duration::from_millis(pause)).await;
            }
            self.core.lock().await.transport.send_fragment(&mac, bytes)?;
        }
        self.core.lock().await.fleet.record_command_sent(&mac, now);
        Ok(command_id)
    }

    pub async fn command_device(&self, mac: MacAddress, command: DeviceCommand) -> Result<u8, FleetError> {
        let mut core = self.core.lock().await;
        let HubCore { transport, fleet } = &mut *core;
        fleet.command_device(transport, &mac, &command, epoch_ms())
    }

    pub async fn add_schedule(&self, mac: MacAddress, schedule: Schedule) -> Result<(), FleetError> {
        self.core.lock().await.fleet.add_schedule(&mac, schedule)
    }

    pub async fn remove_schedule(&self, mac: MacAddress, id: u32) -> Result<Schedule, FleetError> {
        self.core.lock().await.fleet.remove_schedule(&mac, id)
    }

    pub async fn emergency_shutdown(&self, reason: &str) {
        let mut core = self.core.lock().await;
        let HubCore { transport, fleet } = &mut *core;
        fleet.emergency_shutdown(transport, reason, epoch_ms());
    }

    pub async fn health_report(&self) -> Value {
        let core = self.core.lock().await;
        let mut report = core.fleet.health_report(epoch_ms());
        report["transport"] = json!(core.transport.stats());
        report["metrics"] = json!(metrics::snapshot());
        report
    }

    pub async fn transport_stats(&self) -> TransportStats {
        self.core.lock().await.transport.stats()
    }

    pub async fn fleet_state(&self) -> FleetState {
        self.core.lock().await.fleet.state()
    }
}
