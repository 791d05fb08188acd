//! Hub and node runtimes talking over the in-memory medium.
mod common;

use aquanet::fleet::{DeviceStatus, FleetEvent};
use aquanet::hub::HubCore;
use aquanet::node::{NodeIdentity, PairingState};
use aquanet::protocol::NodeType;
use aquanet::transport::link::MemoryMedium;
use common::{exchange, hub, node, node_mac, provisioned, HUB_MAC};

#[test]
fn unprovisioned_node_pairs_and_waits_in_unmapped_registry() {
    let medium = MemoryMedium::new();
    let mut hub = hub(&medium);
    let mac = node_mac(1);
    let mut light = node(&medium, mac, NodeType::Light, NodeIdentity::default());

    light.start(1_000);
    assert_eq!(light.state(), PairingState::WaitingForAck);
    exchange(&mut hub, &mut light, 1_000);

    assert_eq!(light.state(), PairingState::Connected);
    assert_eq!(light.hub(), Some(HUB_MAC));
    let pending = hub.core.fleet.unmapped().get(&mac).expect("pending entry");
    assert_eq!(pending.node_type, NodeType::Light);
    assert_eq!(pending.firmware_version, 3);
    assert!(!hub.core.fleet.is_known(&mac));
    assert_eq!(hub.core.fleet.device_count(), 0);
}

#[test]
fn provisioning_reassigns_the_node_and_it_repairs_with_its_tank() {
    let medium = MemoryMedium::new();
    let mut hub = hub(&medium);
    let mac = node_mac(2);
    let mut light = node(&medium, mac, NodeType::Light, NodeIdentity::default());
    light.start(1_000);
    exchange(&mut hub, &mut light, 1_000);

    {
        let HubCore { transport, fleet } = &mut hub.core;
        fleet
            .provision_device(transport, mac, 1, "Left light", &[7, 1], 2_000)
            .expect("provision");
    }
    exchange(&mut hub, &mut light, 2_000);

    assert_eq!(light.identity().tank_id, 1);
    assert_eq!(light.identity().name, "Left light");
    assert_eq!(&light.app().configs[0][..2], &[7, 1]);
    assert_eq!(light.state(), PairingState::Connected);

    let device = hub.core.fleet.device(&mac).expect("registered");
    assert_eq!(device.name, "Left light");
    assert_eq!(device.tank_id, 1);
    assert_eq!(device.status(), DeviceStatus::Initializing);
    assert!(hub.core.fleet.unmapped().is_empty());
    assert_eq!(hub.events.count(FleetEvent::DeviceProvisioned), 1);
    assert!(hub.store.save_count() >= 2);

    // the first heartbeat brings the device online
    light.step(32_000);
    hub.core.network_tick(32_000, 60_000);
    let device = hub.core.fleet.device(&mac).expect("registered");
    assert_eq!(device.status(), DeviceStatus::Online);
    assert_eq!(hub.events.count(FleetEvent::DeviceOnline), 1);
}

#[test]
fn pending_node_stays_reachable_until_provisioned() {
    let medium = MemoryMedium::new();
    let mut hub = hub(&medium);
    let mac = node_mac(5);
    let mut light = node(&medium, mac, NodeType::Light, NodeIdentity::default());
    light.start(1_000);
    exchange(&mut hub, &mut light, 1_000);

    // well past the 60 s peer timeout, heartbeating the whole time
    for t in [31_000, 61_000, 91_000, 121_000] {
        exchange(&mut hub, &mut light, t);
    }
    hub.core.network_tick(125_000, 60_000);
    assert!(hub.core.transport.peers().is_online(&mac));
    assert_eq!(light.state(), PairingState::Connected);
    assert_eq!(light.app().fail_safes, 0);
    assert_eq!(hub.core.fleet.unmapped().get(&mac).expect("pending").last_seen, 121_000);

    {
        let HubCore { transport, fleet } = &mut hub.core;
        fleet
            .provision_device(transport, mac, 1, "Late light", &[], 125_000)
            .expect("provision after a long wait");
    }
    exchange(&mut hub, &mut light, 125_000);
    assert_eq!(light.identity().tank_id, 1);
    assert!(hub.core.fleet.is_known(&mac));
}

#[test]
fn provisioned_node_is_admitted_directly() {
    let medium = MemoryMedium::new();
    let mut hub = hub(&medium);
    let mac = node_mac(3);
    let mut heater = node(&medium, mac, NodeType::Heater, provisioned(1, "Heater"));

    heater.start(5_000);
    exchange(&mut hub, &mut heater, 5_000);

    assert_eq!(heater.state(), PairingState::Connected);
    let device = hub.core.fleet.device(&mac).expect("admitted");
    assert_eq!(device.node_type(), NodeType::Heater);
    assert_ne!(device.node_id, 0);
    assert_eq!(hub.events.count(FleetEvent::DeviceDiscovered), 1);
}

#[test]
fn node_for_unknown_aquarium_is_refused_and_keeps_announcing() {
    let medium = MemoryMedium::new();
    let mut hub = hub(&medium);
    let mac = node_mac(4);
    let mut feeder = node(&medium, mac, NodeType::FishFeeder, provisioned(7, "Feeder"));

    feeder.start(0);
    exchange(&mut hub, &mut feeder, 0);
    assert_eq!(feeder.state(), PairingState::WaitingForAck);
    assert!(!hub.core.fleet.is_known(&mac));

    // next attempt one announce interval later
    medium.clear_transmissions();
    feeder.step(5_000);
    assert!(medium
        .transmissions()
        .iter()
        .any(|t| t.from == mac && t.to.is_broadcast()));
}

#[test]
fn command_round_trip_is_answered_with_status() {
    let medium = MemoryMedium::new();
    let mut hub = hub(&medium);
    let mac = node_mac(5);
    let mut co2 = node(&medium, mac, NodeType::Co2, provisioned(1, "CO2"));
    co2.start(0);
    exchange(&mut hub, &mut co2, 0);

    let command_id = {
        let HubCore { transport, fleet } = &mut hub.core;
        fleet
            .send_device_command(transport, &mac, &[0x01], 100)
            .expect("command sent")
    };
    assert!((1..=254).contains(&command_id));
    exchange(&mut hub, &mut co2, 100);

    assert_eq!(co2.app().commands, vec![(command_id, vec![0x01])]);
    let statuses = hub
        .events
        .events()
        .into_iter()
        .filter(|(e, _)| *e == FleetEvent::DeviceStatus)
        .collect::<Vec<_>>();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].1["commandId"], command_id);
    assert_eq!(statuses[0].1["statusCode"], 0);

    let device = hub.core.fleet.device(&mac).expect("device");
    assert_eq!(device.last_command_sent(), 100);
    assert_eq!(device.last_status_received(), 100);
    assert_eq!(hub.core.fleet.stats().total_commands, 1);
}

#[test]
fn node_error_reply_counts_against_the_device() {
    let medium = MemoryMedium::new();
    let mut hub = hub(&medium);
    let mac = node_mac(6);
    let mut doser = node(&medium, mac, NodeType::Doser, provisioned(1, "Doser"));
    doser.app_mut().reply_code = 3;
    doser.start(0);
    exchange(&mut hub, &mut doser, 0);

    {
        let HubCore { transport, fleet } = &mut hub.core;
        fleet.send_device_command(transport, &mac, &[0x01, 10], 10).expect("sent");
    }
    exchange(&mut hub, &mut doser, 10);
    assert_eq!(hub.core.fleet.device(&mac).expect("device").error_count, 1);
}

#[tokio::test(start_paused = true)]
async fn long_command_is_fragmented_and_reassembled() {
    let medium = MemoryMedium::new();
    let mut hub = hub(&medium);
    let mac = node_mac(7);
    let mut light = node(&medium, mac, NodeType::Light, provisioned(1, "Light"));
    light.start(0);
    exchange(&mut hub, &mut light, 0);

    let payload: Vec<u8> = (0..70u8).collect();
    let command_id = hub.core.send_command(&mac, &payload, 50).await.expect("fragmented send");
    assert_eq!(hub.core.transport.stats().fragments_sent, 3);
    // fragments carry the device's tank; the hub's own stays untouched
    assert_eq!(hub.core.transport.tank_id(), 0);

    light.step(60);
    assert_eq!(light.app().commands, vec![(command_id, payload)]);
    assert_eq!(light.transport().stats().fragments_received, 3);
}

#[test]
fn hub_silence_puts_the_node_into_fail_safe() {
    let medium = MemoryMedium::new();
    let mut hub = hub(&medium);
    let mac = node_mac(8);
    let mut heater = node(&medium, mac, NodeType::Heater, provisioned(1, "Heater"));
    heater.start(0);
    exchange(&mut hub, &mut heater, 0);
    assert_eq!(heater.state(), PairingState::Connected);

    medium.set_down(HUB_MAC, true);
    for now in (10_000..=90_000).step_by(10_000) {
        exchange(&mut hub, &mut heater, now);
    }
    assert_eq!(heater.app().fail_safes, 0);

    exchange(&mut hub, &mut heater, 90_001);
    assert_eq!(heater.app().fail_safes, 1);
    assert_ne!(heater.state(), PairingState::Connected);
}

#[test]
fn unmap_returns_the_node_to_discovery() {
    let medium = MemoryMedium::new();
    let mut hub = hub(&medium);
    let mac = node_mac(9);
    let mut filter = node(&medium, mac, NodeType::Filter, provisioned(1, "Filter"));
    filter.start(0);
    exchange(&mut hub, &mut filter, 0);

    {
        let HubCore { transport, fleet } = &mut hub.core;
        fleet
            .unmap_device(transport, mac, aquanet::fleet::UNMAP_REASON_OPERATOR, 1_000)
            .expect("unmap");
    }
    exchange(&mut hub, &mut filter, 1_000);

    assert_eq!(filter.identity().tank_id, 0);
    assert!(!hub.core.fleet.is_known(&mac));
    // the node re-announced with tank 0 and is pending again
    let pending = hub.core.fleet.unmapped().get(&mac).expect("pending");
    assert!(pending.announce_count >= 1);
    assert_eq!(filter.state(), PairingState::Connected);
}
