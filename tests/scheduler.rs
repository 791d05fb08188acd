//! Device schedules executed by the hub against live node runtimes.
mod common;

use aquanet::fleet::{FleetManager, FleetSettings, MemoryFleetStore};
use aquanet::node::NodeRuntime;
use aquanet::protocol::{MacAddress, NodeType};
use aquanet::schedule::{days, Schedule, ScheduleKind, TimeSpec};
use aquanet::transport::link::{MemoryLink, MemoryMedium};
use chrono::{TimeZone, Utc};
use common::{exchange, hub, node, node_mac, provisioned, RecordingApp, TestHub};

fn ms(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> u64 {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, s)
        .single()
        .expect("valid time")
        .timestamp_millis() as u64
}

/// Pair a node at `t0` and let its first heartbeat bring it Online.
fn online_node(
    medium: &MemoryMedium,
    hub: &mut TestHub,
    mac: MacAddress,
    node_type: NodeType,
    t0: u64,
) -> NodeRuntime<MemoryLink, RecordingApp> {
    let mut n = node(medium, mac, node_type, provisioned(1, "Scheduled"));
    n.start(t0);
    exchange(hub, &mut n, t0);
    exchange(hub, &mut n, t0 + 30_000);
    assert!(hub.core.fleet.device(&mac).expect("device").is_online());
    n
}

#[test]
fn weekend_light_schedule_fires_on_saturday_morning() {
    let medium = MemoryMedium::new();
    let mut hub = hub(&medium);
    let mac = node_mac(1);
    // 2024-01-06 was a Saturday
    let t0 = ms(2024, 1, 6, 8, 29, 0);
    let mut light = online_node(&medium, &mut hub, mac, NodeType::Light, t0);

    let schedule = Schedule::new(1, "Weekend sunrise", ScheduleKind::Weekly)
        .with_times(&[TimeSpec::new(8, 30).expect("time")])
        .with_days(days::WEEKEND)
        .with_command(&[0x01]);
    hub.core.fleet.add_schedule(&mac, schedule).expect("schedule added");

    assert_eq!(hub.core.run_schedules(ms(2024, 1, 6, 8, 29, 59)), 0);
    let at = ms(2024, 1, 6, 8, 30, 0);
    assert_eq!(hub.core.run_schedules(at), 1);
    // still 08:30, but inside the execution guard
    assert_eq!(hub.core.run_schedules(at + 30_000), 0);

    light.step(at);
    assert_eq!(light.app().commands.len(), 1);
    assert_eq!(light.app().commands[0].1, vec![0x01]);

    let device = hub.core.fleet.device(&mac).expect("device");
    let s = device.schedule(1).expect("schedule");
    assert_eq!(s.execution_count, 1);
    assert_eq!(s.last_execution, at);
    assert_eq!(s.next_execution, at + 24 * 3600 * 1000);
    assert_eq!(hub.core.fleet.stats().total_commands, 1);
}

#[test]
fn interval_schedule_repeats_and_one_time_runs_once() {
    let medium = MemoryMedium::new();
    let mut hub = hub(&medium);
    let mac = node_mac(2);
    let t0 = ms(2024, 5, 1, 12, 0, 0);
    let mut doser = online_node(&medium, &mut hub, mac, NodeType::Doser, t0);

    let start = t0 + 60_000;
    hub.core
        .fleet
        .add_schedule(
            &mac,
            Schedule::new(1, "Trace elements", ScheduleKind::Interval)
                .with_interval(120)
                .with_command(&[0x01, 5]),
        )
        .expect("interval");
    hub.core
        .fleet
        .add_schedule(
            &mac,
            Schedule::new(2, "Start-up dose", ScheduleKind::OneTime)
                .at(start)
                .with_command(&[0x01, 20]),
        )
        .expect("one-time");

    assert_eq!(hub.core.run_schedules(start), 2);
    assert_eq!(hub.core.run_schedules(start + 119_999), 0);
    assert_eq!(hub.core.run_schedules(start + 120_000), 1);
    assert_eq!(hub.core.run_schedules(start + 240_000), 1);

    doser.step(start + 240_000);
    let payloads: Vec<Vec<u8>> = doser.app().commands.iter().map(|(_, p)| p.clone()).collect();
    assert_eq!(payloads.iter().filter(|p| p[1] == 5).count(), 3);
    assert_eq!(payloads.iter().filter(|p| p[1] == 20).count(), 1);
}

#[test]
fn disabled_device_and_disabled_schedules_are_skipped() {
    let medium = MemoryMedium::new();
    let mut hub = hub(&medium);
    let mac = node_mac(3);
    let t0 = ms(2024, 5, 1, 12, 0, 0);
    let _filter = online_node(&medium, &mut hub, mac, NodeType::Filter, t0);

    hub.core
        .fleet
        .add_schedule(
            &mac,
            Schedule::new(1, "Pump pulse", ScheduleKind::Interval)
                .with_interval(60)
                .with_command(&[0x01]),
        )
        .expect("schedule");

    hub.core.fleet.set_device_enabled(&mac, false).expect("disable");
    assert_eq!(hub.core.run_schedules(t0 + 60_000), 0);

    hub.core.fleet.set_device_enabled(&mac, true).expect("enable");
    hub.core.fleet.set_schedules_enabled(&mac, false).expect("pause");
    assert_eq!(hub.core.run_schedules(t0 + 60_000), 0);

    hub.core.fleet.set_schedules_enabled(&mac, true).expect("resume");
    assert_eq!(hub.core.run_schedules(t0 + 60_000), 1);
}

#[test]
fn schedules_survive_a_hub_restart() {
    let medium = MemoryMedium::new();
    let mut hub = hub(&medium);
    let mac = node_mac(4);
    let t0 = ms(2024, 5, 1, 12, 0, 0);
    let _light = online_node(&medium, &mut hub, mac, NodeType::Light, t0);
    hub.core
        .fleet
        .add_schedule(
            &mac,
            Schedule::new(7, "Evening", ScheduleKind::Daily)
                .with_times(&[TimeSpec::new(20, 0).expect("time")])
                .with_command(&[0x00]),
        )
        .expect("schedule");

    let saved = hub.store.saved().expect("state persisted");
    let mut restarted = FleetManager::new(FleetSettings::default(), t0).with_store(MemoryFleetStore::with_state(saved));
    assert_eq!(restarted.load().expect("load"), 1);

    let device = restarted.device(&mac).expect("device restored");
    let s = device.schedule(7).expect("schedule restored");
    assert_eq!(s.command(), &[0x00]);
    assert_eq!(s.times, vec![TimeSpec::new(20, 0).expect("time")]);
    // restored devices wait for a heartbeat before anything runs
    assert!(!device.is_online());
}

#[test]
fn duplicate_and_invalid_schedules_are_rejected() {
    let medium = MemoryMedium::new();
    let mut hub = hub(&medium);
    let mac = node_mac(5);
    let _light = online_node(&medium, &mut hub, mac, NodeType::Light, 10_000);

    let s = Schedule::new(1, "A", ScheduleKind::Interval).with_interval(10).with_command(&[1]);
    hub.core.fleet.add_schedule(&mac, s.clone()).expect("first");
    assert!(hub.core.fleet.add_schedule(&mac, s).is_err());
    let empty = Schedule::new(2, "B", ScheduleKind::Interval).with_interval(10);
    assert!(hub.core.fleet.add_schedule(&mac, empty).is_err());
    assert!(hub.core.fleet.remove_schedule(&mac, 9).is_err());
    assert_eq!(hub.core.fleet.remove_schedule(&mac, 1).expect("removed").id, 1);
}
