//! Assemble a hub from configuration: radio link, transport, fleet state.

use anyhow::Result;
use log::{info, warn};

use super::{Hub, HubCore};
use crate::config::Config;
use crate::fleet::{FleetManager, FleetStore, JsonFleetStore, LogNotifier};
use crate::logutil::log_name;
use crate::protocol::NodeType;
use crate::transport::link::{LinkDriver, OfflineLink};
use crate::transport::rx::{rx_queue, FrameSender};
use crate::transport::{epoch_ms, Role, Transport};

/// Link type used by the binary: whichever driver could be opened.
pub type DynLink = Box<dyn LinkDriver>;

/// Open the serial bridge on `port`, or fall back to running without a radio.
pub fn open_link(port: Option<&str>, baud_rate: u32, sink: FrameSender) -> DynLink {
    let Some(port) = port.filter(|p| !p.is_empty()) else {
        warn!("No radio bridge configured; running without radio");
        return Box::new(OfflineLink);
    };
    #[cfg(feature = "serial")]
    {
        match crate::transport::link::SerialBridgeLink::open(port, baud_rate, sink) {
            Ok(link) => return Box::new(link),
            Err(e) => warn!("{} (hub continuing without radio)", e),
        }
    }
    #[cfg(not(feature = "serial"))]
    {
        let _ = (baud_rate, sink);
        warn!("Built without serial support; ignoring bridge port {}", port);
    }
    Box::new(OfflineLink)
}

/// Load persisted fleet state, then add seed aquariums the state lacks.
pub fn load_fleet(config: &Config, now: u64) -> Result<FleetManager> {
    let store = JsonFleetStore::new(&config.hub.state_file);
    let mut fleet = FleetManager::new(config.fleet_settings(), now)
        .with_notifier(LogNotifier)
        .with_store(store);
    let loaded = fleet.load()?;
    if loaded > 0 {
        info!("Loaded {} aquariums from {}", loaded, config.hub.state_file);
    }
    for seed in &config.aquariums {
        if fleet.aquarium(seed.id).is_some() {
            continue;
        }
        match fleet.add_aquarium(seed.to_aquarium()) {
            Ok(()) => info!("Seeded aquarium {} {}", seed.id, log_name(&seed.name)),
            Err(e) => warn!("Skipping seed aquarium {}: {}", seed.id, e),
        }
    }
    Ok(fleet)
}

/// Build a ready-to-run hub. `port_override` wins over `[hub].bridge_port`.
pub fn build_hub(config: &Config, port_override: Option<&str>) -> Result<Hub<DynLink>> {
    config.validate()?;
    let (sink, rx) = rx_queue(config.transport.rx_queue_size);
    let port = port_override.or(Some(config.hub.bridge_port.as_str()));
    let link = open_link(port, config.hub.baud_rate, sink);
    let transport = Transport::new(Role::Hub, NodeType::Hub, link, rx, config.transport.clone());
    let fleet = load_fleet(config, epoch_ms())?;
    Ok(Hub::new(HubCore::new(transport, fleet), config.hub_settings()))
}

/// Read-only summary of a persisted fleet, for `aquanet status`.
pub fn fleet_summary(config: &Config) -> Result<serde_json::Value> {
    let store = JsonFleetStore::new(&config.hub.state_file);
    let state = store.load()?.unwrap_or_default();
    let mut fleet = FleetManager::new(config.fleet_settings(), epoch_ms());
    fleet.restore(state);
    Ok(fleet.health_report(epoch_ms()))
}
