//! Fleet event notifications.
//!
//! The registry reports noteworthy changes (device online/offline, alerts,
//! emergency shutdown) as an event name plus a JSON payload. Delivery is up to
//! the embedding application; the hub logs them by default.

use std::fmt;
use std::sync::{Arc, Mutex};

use log::{info, warn};
use serde_json::Value;

use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FleetEvent {
    DeviceDiscovered,
    DeviceOnline,
    DeviceOffline,
    DeviceStatus,
    DeviceProvisioned,
    DeviceUnmapped,
    TemperatureAlert,
    PhAlert,
    TdsAlert,
    EmergencyShutdown,
}

impl FleetEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            FleetEvent::DeviceDiscovered => "deviceDiscovered",
            FleetEvent::DeviceOnline => "deviceOnline",
            FleetEvent::DeviceOffline => "deviceOffline",
            FleetEvent::DeviceStatus => "deviceStatus",
            FleetEvent::DeviceProvisioned => "deviceProvisioned",
            FleetEvent::DeviceUnmapped => "deviceUnmapped",
            FleetEvent::TemperatureAlert => "temperatureAlert",
            FleetEvent::PhAlert => "phAlert",
            FleetEvent::TdsAlert => "tdsAlert",
            FleetEvent::EmergencyShutdown => "emergencyShutdown",
        }
    }

    pub fn is_alert(self) -> bool {
        matches!(
            self,
            FleetEvent::DeviceOffline
                | FleetEvent::TemperatureAlert
                | FleetEvent::PhAlert
                | FleetEvent::TdsAlert
                | FleetEvent::EmergencyShutdown
        )
    }
}

impl fmt::Display for FleetEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives fleet events. Called with the fleet lock held; keep it quick.
pub trait Notifier: Send {
    fn notify(&self, event: FleetEvent, payload: &Value);
}

impl<F> Notifier for F
where
    F: Fn(FleetEvent, &Value) + Send,
{
    fn notify(&self, event: FleetEvent, payload: &Value) {
        self(event, payload)
    }
}

/// Default sink: alerts at warn, everything else at info.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: FleetEvent, payload: &Value) {
        if event.is_alert() {
            warn!("[{}] {}", event, payload);
        } else {
            info!("[{}] {}", event, payload);
        }
    }
}

/// Keeps every event in memory; clones share the same buffer.
#[derive(Debug, Default, Clone)]
pub struct CollectingNotifier {
    events: Arc<Mutex<Vec<(FleetEvent, Value)>>>,
}

impl CollectingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(FleetEvent, Value)> {
        match self.events.lock() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn count(&self, event: FleetEvent) -> usize {
        self.events().iter().filter(|(e, _)| *e == event).count()
    }
}

impl Notifier for CollectingNotifier {
    fn notify(&self, event: FleetEvent, payload: &Value) {
        let mut guard = match self.events.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.push((event, payload.clone()));
    }
}

pub(crate) fn emit(notifier: &dyn Notifier, event: FleetEvent, payload: Value) {
    metrics::inc_notifications_emitted();
    notifier.notify(event, &payload);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn closures_are_notifiers() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = seen.clone();
            move |e: FleetEvent, _p: &Value| seen.lock().unwrap().push(e.as_str().to_string())
        };
        emit(&sink, FleetEvent::PhAlert, json!({}));
        assert_eq!(seen.lock().unwrap().as_slice(), ["phAlert"]);
    }

    #[test]
    fn collecting_notifier_shares_buffer() {
        let a = CollectingNotifier::new();
        let b = a.clone();
        b.notify(FleetEvent::DeviceOnline, &json!({"mac": "x"}));
        assert_eq!(a.count(FleetEvent::DeviceOnline), 1);
        assert_eq!(a.events()[0].1["mac"], "x");
    }
}
