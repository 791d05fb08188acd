//! Devices that announced with tank id 0 and wait for an operator to
//! provision them into an aquarium.

use std::collections::BTreeMap;

use log::info;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::protocol::{MacAddress, NodeType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnmappedDevice {
    pub mac: MacAddress,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub firmware_version: u8,
    pub capabilities: u8,
    pub discovered_at: u64,
    pub last_seen: u64,
    pub announce_count: u32,
}

impl UnmappedDevice {
    pub fn snapshot(&self) -> Value {
        json!({
            "mac": self.mac.to_string(),
            "type": self.node_type.tag(),
            "firmwareVersion": self.firmware_version,
            "capabilities": self.capabilities,
            "discoveredAt": self.discovered_at,
            "lastSeen": self.last_seen,
            "announceCount": self.announce_count,
            "status": "DISCOVERED",
        })
    }
}

#[derive(Debug, Default, Clone)]
pub struct UnmappedRegistry {
    entries: BTreeMap<MacAddress, UnmappedDevice>,
    total_discovered: u64,
}

impl UnmappedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an announce. Returns true for a device not seen before.
    pub fn upsert(&mut self, mac: MacAddress, node_type: NodeType, firmware_version: u8, capabilities: u8, now: u64) -> bool {
        if let Some(entry) = self.entries.get_mut(&mac) {
            entry.last_seen = now;
            entry.announce_count += 1;
            entry.node_type = node_type;
            entry.firmware_version = firmware_version;
            entry.capabilities = capabilities;
            return false;
        }
        info!("Discovered unmapped {} at {}", node_type, mac);
        self.entries.insert(
            mac,
            UnmappedDevice {
                mac,
                node_type,
                firmware_version,
                capabilities,
                discovered_at: now,
                last_seen: now,
                announce_count: 1,
            },
        );
        self.total_discovered += 1;
        true
    }

    /// Put a device back (after unmapping) with a fresh announce count.
    pub fn insert_returned(&mut self, mac: MacAddress, node_type: NodeType, firmware_version: u8, now: u64) {
        self.entries.insert(
            mac,
            UnmappedDevice {
                mac,
                node_type,
                firmware_version,
                capabilities: 0,
                discovered_at: now,
                last_seen: now,
                announce_count: 0,
            },
        );
    }

    /// Refresh `last_seen` on a heartbeat. Returns false for addresses not pending.
    pub fn mark_seen(&mut self, mac: &MacAddress, now: u64) -> bool {
        match self.entries.get_mut(mac) {
            Some(entry) => {
                entry.last_seen = now;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, mac: &MacAddress) -> Option<UnmappedDevice> {
        self.entries.remove(mac)
    }

    pub fn get(&self, mac: &MacAddress) -> Option<&UnmappedDevice> {
        self.entries.get(mac)
    }

    pub fn contains(&self, mac: &MacAddress) -> bool {
        self.entries.contains_key(mac)
    }

    pub fn iter(&self) -> impl Iterator<Item = &UnmappedDevice> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_discovered(&self) -> u64 {
        self.total_discovered
    }

    /// Drop entries not heard from for longer than `max_age_ms`. Returns how many.
    pub fn cleanup_older_than(&mut self, max_age_ms: u64, now: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| now.saturating_sub(e.last_seen) <= max_age_ms);
        before - self.entries.len()
    }

    pub(crate) fn restore(&mut self, entries: Vec<UnmappedDevice>, total_discovered: u64) {
        self.entries = entries.into_iter().map(|e| (e.mac, e)).collect();
        self.total_discovered = total_discovered.max(self.entries.len() as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(n: u8) -> MacAddress {
        MacAddress::new([0x24, 0x6F, 0x28, 0, 1, n])
    }

    #[test]
    fn upsert_updates_existing_entry() {
        let mut reg = UnmappedRegistry::new();
        assert!(reg.upsert(mac(1), NodeType::Light, 1, 0, 100));
        assert!(!reg.upsert(mac(1), NodeType::Light, 2, 0, 200));
        let e = reg.get(&mac(1)).unwrap();
        assert_eq!(e.announce_count, 2);
        assert_eq!(e.discovered_at, 100);
        assert_eq!(e.last_seen, 200);
        assert_eq!(e.firmware_version, 2);
        assert_eq!(reg.total_discovered(), 1);
        assert_eq!(e.snapshot()["status"], "DISCOVERED");
        assert_eq!(e.snapshot()["type"], "LIGHT");
    }

    #[test]
    fn cleanup_drops_stale_entries() {
        let mut reg = UnmappedRegistry::new();
        reg.upsert(mac(1), NodeType::Light, 1, 0, 0);
        reg.upsert(mac(2), NodeType::Co2, 1, 0, 5_000);
        assert_eq!(reg.cleanup_older_than(4_000, 9_000), 1);
        assert!(reg.contains(&mac(2)));
    }
}
