//! Shared fixtures: a hub and nodes wired together over an in-memory medium.
#![allow(dead_code)]

use aquanet::fleet::{Aquarium, CollectingNotifier, FleetManager, FleetSettings, MemoryFleetStore};
use aquanet::hub::HubCore;
use aquanet::node::{CommandReply, MemoryIdentityStore, NodeApplication, NodeIdentity, NodeRuntime, PairingTimings};
use aquanet::protocol::{MacAddress, NodeType};
use aquanet::transport::link::{MemoryLink, MemoryMedium};
use aquanet::transport::rx::rx_queue;
use aquanet::transport::{Role, Transport, TransportSettings};

pub const HUB_MAC: MacAddress = MacAddress::new([0x24, 0x6F, 0x28, 0x00, 0x00, 0x01]);

pub fn node_mac(n: u8) -> MacAddress {
    MacAddress::new([0x24, 0x6F, 0x28, 0xA0, 0x00, n])
}

pub struct TestHub {
    pub core: HubCore<MemoryLink>,
    pub events: CollectingNotifier,
    pub store: MemoryFleetStore,
}

/// Hub with aquarium 1 ("Reef") already configured.
pub fn hub(medium: &MemoryMedium) -> TestHub {
    let (tx, rx) = rx_queue(32);
    let transport = Transport::new(
        Role::Hub,
        NodeType::Hub,
        medium.attach(HUB_MAC, tx),
        rx,
        TransportSettings::default(),
    );
    let events = CollectingNotifier::new();
    let store = MemoryFleetStore::new();
    let mut fleet = FleetManager::new(FleetSettings::default(), 0)
        .with_notifier(events.clone())
        .with_store(store.clone());
    fleet.add_aquarium(Aquarium::new(1, "Reef")).expect("aquarium 1");
    TestHub {
        core: HubCore::new(transport, fleet),
        events,
        store,
    }
}

/// Actuator double that records what the runtime asked of it.
#[derive(Debug, Default)]
pub struct RecordingApp {
    pub commands: Vec<(u8, Vec<u8>)>,
    pub configs: Vec<Vec<u8>>,
    pub fail_safes: usize,
    pub reply_code: u8,
}

impl NodeApplication for RecordingApp {
    fn enter_fail_safe(&mut self) {
        self.fail_safes += 1;
    }

    fn handle_command(&mut self, command_id: u8, payload: &[u8]) -> CommandReply {
        self.commands.push((command_id, payload.to_vec()));
        if self.reply_code == 0 {
            CommandReply::ok()
        } else {
            CommandReply::error(self.reply_code)
        }
    }

    fn apply_config(&mut self, config: &[u8]) {
        self.configs.push(config.to_vec());
    }
}

pub fn node(
    medium: &MemoryMedium,
    mac: MacAddress,
    node_type: NodeType,
    identity: NodeIdentity,
) -> NodeRuntime<MemoryLink, RecordingApp> {
    let (tx, rx) = rx_queue(16);
    let transport = Transport::new(
        Role::Node,
        node_type,
        medium.attach(mac, tx),
        rx,
        TransportSettings::default(),
    );
    NodeRuntime::new(
        transport,
        RecordingApp::default(),
        Box::new(MemoryIdentityStore::new(identity)),
        PairingTimings::default(),
        3,
    )
    .expect("node runtime")
}

pub fn provisioned(tank_id: u8, name: &str) -> NodeIdentity {
    NodeIdentity {
        tank_id,
        name: name.to_string(),
    }
}

/// Let both sides process whatever is in flight at `now`.
pub fn exchange(hub: &mut TestHub, node: &mut NodeRuntime<MemoryLink, RecordingApp>, now: u64) {
    for _ in 0..3 {
        hub.core.network_tick(now, 60_000);
        node.step(now);
    }
}
