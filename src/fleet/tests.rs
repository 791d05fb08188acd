use super::radio::fake::FakeRadio;
use super::*;
use crate::protocol::{MessageKind, NodeType};
use crate::schedule::ScheduleKind;

const HEATER: MacAddress = MacAddress::new([0x24, 0x6F, 0x28, 0, 0, 0x10]);
const SENSOR: MacAddress = MacAddress::new([0x24, 0x6F, 0x28, 0, 0, 0x11]);
const LIGHT: MacAddress = MacAddress::new([0x24, 0x6F, 0x28, 0, 0, 0x12]);

fn header(tank_id: u8, node_type: NodeType) -> FrameHeader {
    FrameHeader {
        kind: MessageKind::Announce,
        tank_id,
        node_type,
        timestamp: 0,
        seq: 1,
    }
}

fn announce() -> Announce {
    Announce {
        firmware_version: 3,
        capabilities: 0,
    }
}

fn fleet() -> (FleetManager, CollectingNotifier, MemoryFleetStore) {
    let events = CollectingNotifier::new();
    let store = MemoryFleetStore::new();
    let mut fm = FleetManager::new(FleetSettings::default(), 0)
        .with_notifier(events.clone())
        .with_store(store.clone());
    fm.add_aquarium(Aquarium::new(1, "Main")).unwrap();
    (fm, events, store)
}

fn last_ack(radio: &FakeRadio, mac: &MacAddress) -> Ack {
    radio
        .sent_to(mac)
        .into_iter()
        .rev()
        .find_map(|m| match m {
            Message::Ack(a) => Some(*a),
            _ => None,
        })
        .expect("no ack sent")
}

fn admit(fm: &mut FleetManager, radio: &mut FakeRadio, mac: MacAddress, t: NodeType, now: u64) {
    let outcome = fm.handle_announce(radio, mac, &header(1, t), &announce(), now);
    assert_eq!(outcome, AnnounceOutcome::Admitted);
    fm.handle_heartbeat(
        radio,
        mac,
        &Heartbeat {
            health: 90,
            uptime_minutes: 1,
        },
        now,
    );
}

#[test]
fn aquarium_ids_are_validated() {
    let (mut fm, _, _) = fleet();
    assert!(matches!(
        fm.add_aquarium(Aquarium::new(0, "Zero")),
        Err(FleetError::InvalidAquariumId)
    ));
    assert!(matches!(
        fm.add_aquarium(Aquarium::new(1, "Again")),
        Err(FleetError::AquariumExists(1))
    ));
    let mut bad = Aquarium::new(2, "Inverted");
    bad.water.min_ph = 8.0;
    assert!(fm.add_aquarium(bad).is_err());
}

#[test]
fn announce_for_unknown_tank_is_rejected() {
    let (mut fm, events, _) = fleet();
    let mut radio = FakeRadio::default();
    let outcome = fm.handle_announce(&mut radio, HEATER, &header(7, NodeType::Heater), &announce(), 0);
    assert_eq!(outcome, AnnounceOutcome::Rejected);
    assert!(!last_ack(&radio, &HEATER).accepted);
    assert_eq!(fm.device_count(), 0);
    assert_eq!(fm.stats().total_errors, 1);
    assert_eq!(events.count(FleetEvent::DeviceDiscovered), 0);
}

#[test]
fn announce_admits_and_is_idempotent() {
    let (mut fm, events, store) = fleet();
    let mut radio = FakeRadio::default();
    let outcome = fm.handle_announce(&mut radio, HEATER, &header(1, NodeType::Heater), &announce(), 0);
    assert_eq!(outcome, AnnounceOutcome::Admitted);
    let ack = last_ack(&radio, &HEATER);
    assert!(ack.accepted);
    assert_ne!(ack.assigned_node_id, 0);
    assert_eq!(fm.device(&HEATER).unwrap().tank_id, 1);
    assert!(radio.is_online(&HEATER));
    assert_eq!(events.count(FleetEvent::DeviceDiscovered), 1);
    let saves = store.save_count();

    let again = fm.handle_announce(&mut radio, HEATER, &header(1, NodeType::Heater), &announce(), 10);
    assert_eq!(again, AnnounceOutcome::Known);
    assert_eq!(last_ack(&radio, &HEATER).assigned_node_id, ack.assigned_node_id);
    assert_eq!(fm.device_count(), 1);
    assert_eq!(events.count(FleetEvent::DeviceDiscovered), 1);
    assert_eq!(store.save_count(), saves);
    assert_eq!(fm.stats().total_messages_received, 2);
}

#[test]
fn hub_node_type_is_never_admitted() {
    let (mut fm, _, _) = fleet();
    let mut radio = FakeRadio::default();
    let outcome = fm.handle_announce(&mut radio, HEATER, &header(1, NodeType::Hub), &announce(), 0);
    assert_eq!(outcome, AnnounceOutcome::Rejected);
    assert!(!last_ack(&radio, &HEATER).accepted);
}

#[test]
fn pending_then_provision() {
    let (mut fm, events, store) = fleet();
    let mut radio = FakeRadio::default();
    for t in [0, 5_000] {
        let outcome = fm.handle_announce(&mut radio, LIGHT, &header(0, NodeType::Light), &announce(), t);
        assert_eq!(outcome, AnnounceOutcome::Pending);
    }
    assert!(last_ack(&radio, &LIGHT).accepted);
    assert_eq!(fm.unmapped().get(&LIGHT).unwrap().announce_count, 2);
    assert!(!fm.is_known(&LIGHT));

    assert!(matches!(
        fm.provision_device(&mut radio, LIGHT, 9, "Left", &[], 6_000),
        Err(FleetError::AquariumNotFound(9))
    ));
    assert!(matches!(
        fm.provision_device(&mut radio, HEATER, 1, "Left", &[], 6_000),
        Err(FleetError::NotPending(_))
    ));

    fm.provision_device(&mut radio, LIGHT, 1, "Left", &[1, 2], 6_000).unwrap();
    let cfg = radio
        .sent
        .iter()
        .find(|s| matches!(s.message, Message::Config(_)))
        .unwrap();
    assert_eq!(cfg.tank_id, 1);
    match &cfg.message {
        Message::Config(c) => {
            assert_eq!(c.name, "Left");
            assert_eq!(&c.config[..2], &[1, 2]);
        }
        _ => unreachable!(),
    }
    let dev = fm.device(&LIGHT).unwrap();
    assert_eq!(dev.status(), DeviceStatus::Initializing);
    assert_eq!(dev.name, "Left");
    assert!(fm.unmapped().is_empty());
    assert_eq!(events.count(FleetEvent::DeviceProvisioned), 1);
    let saved = store.saved().unwrap();
    assert_eq!(saved.aquariums[0].device_count(), 1);
    assert!(saved.unmapped.is_empty());
}

#[test]
fn unmap_returns_device_to_registry() {
    let (mut fm, events, _) = fleet();
    let mut radio = FakeRadio::default();
    admit(&mut fm, &mut radio, LIGHT, NodeType::Light, 0);
    let dev = fm.unmap_device(&mut radio, LIGHT, UNMAP_REASON_OPERATOR, 100).unwrap();
    assert_eq!(dev.mac, LIGHT);
    assert!(!fm.is_known(&LIGHT));
    let entry = fm.unmapped().get(&LIGHT).unwrap();
    assert_eq!(entry.announce_count, 0);
    assert_eq!(entry.node_type, NodeType::Light);
    let unmap = radio.sent.iter().find(|s| matches!(s.message, Message::Unmap(_))).unwrap();
    assert_eq!(unmap.tank_id, 0);
    assert_eq!(events.count(FleetEvent::DeviceUnmapped), 1);
    assert!(matches!(
        fm.unmap_device(&mut radio, LIGHT, 1, 200),
        Err(FleetError::DeviceNotFound(_))
    ));
}

#[test]
fn heartbeat_from_unknown_is_ignored() {
    let (mut fm, events, _) = fleet();
    let mut radio = FakeRadio::default();
    fm.handle_heartbeat(&mut radio, HEATER, &Heartbeat { health: 50, uptime_minutes: 0 }, 0);
    assert!(radio.sent.is_empty());
    assert_eq!(events.count(FleetEvent::DeviceOnline), 0);
    assert_eq!(fm.stats().total_messages_received, 0);
}

#[test]
fn heartbeat_is_echoed_and_brings_device_online() {
    let (mut fm, events, _) = fleet();
    let mut radio = FakeRadio::default();
    admit(&mut fm, &mut radio, HEATER, NodeType::Heater, 0);
    assert_eq!(events.count(FleetEvent::DeviceOnline), 1);
    assert!(fm.device(&HEATER).unwrap().is_online());
    assert!(radio
        .sent_to(&HEATER)
        .iter()
        .any(|m| matches!(m, Message::Heartbeat(_))));
    assert_eq!(fm.system_health(), 90);
}

#[test]
fn heartbeat_timeout_fails_safe_once() {
    let (mut fm, events, _) = fleet();
    let mut radio = FakeRadio::default();
    admit(&mut fm, &mut radio, HEATER, NodeType::Heater, 1_000);
    radio.sent.clear();

    assert_eq!(fm.check_device_health(&mut radio, 61_000), 0);
    assert_eq!(fm.check_device_health(&mut radio, 61_001), 1);
    assert_eq!(fm.device(&HEATER).unwrap().status(), DeviceStatus::Offline);
    let pushed: Vec<_> = radio
        .sent_to(&HEATER)
        .into_iter()
        .filter_map(|m| match m {
            Message::Command(c) => Some(c.data.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(pushed, vec![vec![kinds::opcodes::heater::MANUAL_OFF]]);
    assert_eq!(events.count(FleetEvent::DeviceOffline), 1);

    // no repeat while still offline
    assert_eq!(fm.check_device_health(&mut radio, 120_000), 0);
    assert_eq!(events.count(FleetEvent::DeviceOffline), 1);
    assert_eq!(fm.system_health(), 0);
}

#[test]
fn sensor_status_updates_aquarium_and_alerts() {
    let (mut fm, events, _) = fleet();
    let mut radio = FakeRadio::default();
    admit(&mut fm, &mut radio, SENSOR, NodeType::Sensor, 0);

    // pH 8.10, TDS 200, 24.50 °C
    fm.handle_status(SENSOR, &Status::new(0, 0, &[8, 10, 200, 0, 24, 50]), 1_000);
    let r = fm.aquarium(1).unwrap().readings;
    assert_eq!(r.tds, Some(200));
    assert_eq!(events.count(FleetEvent::DeviceStatus), 1);

    assert_eq!(fm.check_water_parameters(2_000), 1);
    assert_eq!(events.count(FleetEvent::PhAlert), 1);
    assert_eq!(events.count(FleetEvent::TemperatureAlert), 0);

    // stale reading no longer alerts
    assert_eq!(fm.check_water_parameters(1_000 + DEFAULT_READING_FRESHNESS_MS + 1), 0);
}

#[test]
fn commands_refused_while_offline() {
    let (mut fm, _, _) = fleet();
    let mut radio = FakeRadio::default();
    admit(&mut fm, &mut radio, LIGHT, NodeType::Light, 0);
    radio.peers.insert(LIGHT, false);
    let err = fm.send_device_command(&mut radio, &LIGHT, &[1], 10).unwrap_err();
    assert!(matches!(err, FleetError::Transport(TransportError::PeerOffline(_))));
    assert_eq!(fm.stats().total_errors, 1);
    assert_eq!(fm.device(&LIGHT).unwrap().error_count, 1);
}

#[test]
fn typed_command_updates_mirror() {
    let (mut fm, _, _) = fleet();
    let mut radio = FakeRadio::default();
    admit(&mut fm, &mut radio, HEATER, NodeType::Heater, 0);
    fm.command_device(
        &mut radio,
        &HEATER,
        &DeviceCommand::Heater(kinds::HeaterCommand::EnableAuto(26.0)),
        10,
    )
    .unwrap();
    match &fm.device(&HEATER).unwrap().kind {
        DeviceKind::Heater(s) => assert_eq!(s.target_temperature, 26.0),
        _ => unreachable!(),
    }
    let err = fm
        .command_device(
            &mut radio,
            &HEATER,
            &DeviceCommand::Heater(kinds::HeaterCommand::SetTarget(40.0)),
            20,
        )
        .unwrap_err();
    assert!(matches!(err, FleetError::SafetyLimit(_)));
    assert_eq!(fm.stats().total_commands, 1);
}

#[test]
fn schedules_run_once_per_due_window() {
    let (mut fm, _, _) = fleet();
    let mut radio = FakeRadio::default();
    admit(&mut fm, &mut radio, LIGHT, NodeType::Light, 0);
    fm.add_schedule(
        &LIGHT,
        Schedule::new(1, "pulse", ScheduleKind::Interval)
            .with_interval(120)
            .with_command(&[kinds::opcodes::light::ALL_ON]),
    )
    .unwrap();
    radio.sent.clear();

    assert_eq!(fm.run_schedules(&mut radio, 1_000), 1);
    assert_eq!(fm.run_schedules(&mut radio, 2_000), 0);
    assert_eq!(fm.run_schedules(&mut radio, 121_000), 1);
    let commands = radio
        .sent_to(&LIGHT)
        .into_iter()
        .filter(|m| matches!(m, Message::Command(_)))
        .count();
    assert_eq!(commands, 2);
    assert_eq!(fm.device(&LIGHT).unwrap().schedule(1).unwrap().execution_count, 2);
}

#[test]
fn schedules_skip_offline_devices() {
    let (mut fm, _, _) = fleet();
    let mut radio = FakeRadio::default();
    fm.handle_announce(&mut radio, LIGHT, &header(1, NodeType::Light), &announce(), 0);
    fm.add_schedule(
        &LIGHT,
        Schedule::new(1, "pulse", ScheduleKind::Interval)
            .with_interval(60)
            .with_command(&[1]),
    )
    .unwrap();
    // admitted but never heard a heartbeat: status Unknown
    assert_eq!(fm.run_schedules(&mut radio, 1_000), 0);
}

#[test]
fn emergency_shutdown_fails_everything_safe() {
    let (mut fm, events, _) = fleet();
    let mut radio = FakeRadio::default();
    admit(&mut fm, &mut radio, HEATER, NodeType::Heater, 0);
    admit(&mut fm, &mut radio, SENSOR, NodeType::Sensor, 0);
    radio.sent.clear();
    fm.emergency_shutdown(&mut radio, "leak detected", 10);
    assert!(fm.devices().all(|d| d.status() == DeviceStatus::Error));
    // only the heater has an actuator to switch off
    assert_eq!(radio.sent.len(), 1);
    let (_, payload) = &events.events()[events.events().len() - 1];
    assert_eq!(payload["reason"], "leak detected");
    assert_eq!(events.count(FleetEvent::EmergencyShutdown), 1);
}

#[test]
fn remove_aquarium_drops_devices_without_fail_safe() {
    let (mut fm, _, _) = fleet();
    let mut radio = FakeRadio::default();
    admit(&mut fm, &mut radio, HEATER, NodeType::Heater, 0);
    radio.sent.clear();
    let aq = fm.remove_aquarium(&mut radio, 1).unwrap();
    assert_eq!(aq.device_count(), 1);
    assert!(fm.device(&HEATER).is_none());
    assert!(radio.sent.is_empty());
    assert!(!radio.peers.contains_key(&HEATER));
}

#[test]
fn restore_rebuilds_index_and_resets_status() {
    let (mut fm, _, store) = fleet();
    let mut radio = FakeRadio::default();
    admit(&mut fm, &mut radio, HEATER, NodeType::Heater, 0);
    let state = store.saved().unwrap();

    let mut restored = FleetManager::new(FleetSettings::default(), 0).with_store(MemoryFleetStore::with_state(state));
    assert_eq!(restored.load().unwrap(), 1);
    let dev = restored.device(&HEATER).unwrap();
    assert_eq!(dev.status(), DeviceStatus::Unknown);
    assert_eq!(dev.tank_id, 1);
    // no heartbeat yet, so no timeout either
    assert_eq!(restored.check_device_health(&mut radio, 10_000_000), 0);
}

#[test]
fn pending_heartbeat_keeps_peer_alive_and_is_echoed() {
    let (mut fm, _, _) = fleet();
    let mut radio = FakeRadio::default();
    fm.handle_announce(&mut radio, LIGHT, &header(0, NodeType::Light), &announce(), 0);
    radio.peers.insert(LIGHT, false);
    radio.sent.clear();

    let hb = Heartbeat {
        health: 80,
        uptime_minutes: 2,
    };
    fm.handle_heartbeat(&mut radio, LIGHT, &hb, 30_000);
    assert!(radio.is_online(&LIGHT));
    assert_eq!(fm.unmapped().get(&LIGHT).unwrap().last_seen, 30_000);
    assert!(matches!(radio.sent_to(&LIGHT)[..], [Message::Heartbeat(_)]));
    assert_eq!(radio.sent[0].tank_id, 0);
    assert!(!fm.is_known(&LIGHT));

    // strangers are neither registered nor answered
    fm.handle_heartbeat(&mut radio, SENSOR, &hb, 30_000);
    assert!(!radio.peers.contains_key(&SENSOR));
    assert!(radio.sent_to(&SENSOR).is_empty());
}

#[test]
fn rejected_aquarium_update_leaves_state_untouched() {
    let (mut fm, _, store) = fleet();
    let saves = store.save_count();

    let err = fm.update_aquarium(1, |s| {
        s.name = "Renamed".to_string();
        s.water.max_ph = 1.0;
    });
    assert!(matches!(err, Err(FleetError::InvalidValue(_))));
    let aq = fm.aquarium(1).unwrap();
    assert_eq!(aq.name, "Main");
    assert_eq!(aq.water.max_ph, 7.5);
    assert_eq!(store.save_count(), saves);

    assert!(fm.update_aquarium(1, |s| s.name = " ".to_string()).is_err());
    assert_eq!(fm.aquarium(1).unwrap().name, "Main");

    fm.update_aquarium(1, |s| {
        s.volume_liters = 60.0;
        s.water.max_tds = 400;
    })
    .unwrap();
    let aq = fm.aquarium(1).unwrap();
    assert_eq!(aq.volume_liters, 60.0);
    assert_eq!(aq.water.max_tds, 400);
    assert_eq!(store.save_count(), saves + 1);
}
