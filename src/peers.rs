//! # Peer Liveness Registry
//!
//! Hub-side view of which nodes are currently reachable. Entries are created
//! when a node pairs ([`PeerRegistry::add_peer`]) and removed explicitly.
//! Heartbeats refresh an entry via [`PeerRegistry::touch`]; the network loop
//! ages entries out with [`PeerRegistry::sweep_timeouts`]. The registry also
//! holds the last sequence number seen per peer for duplicate suppression.

use log::{debug, info};
use serde::Serialize;
use std::collections::HashMap;

use crate::protocol::MacAddress;

#[derive(Debug, Clone, Serialize)]
pub struct PeerStatus {
    pub mac: MacAddress,
    pub online: bool,
    /// Milliseconds timestamp of the last heartbeat or pairing.
    pub last_heartbeat: u64,
    pub last_seq: u8,
}

#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<MacAddress, PeerStatus>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or reset) a peer as online with a fresh heartbeat.
    pub fn add_peer(&mut self, mac: MacAddress, now: u64) {
        self.peers.insert(
            mac,
            PeerStatus {
                mac,
                online: true,
                last_heartbeat: now,
                last_seq: 0,
            },
        );
        debug!("Peer added: {}", mac);
    }

    pub fn remove_peer(&mut self, mac: &MacAddress) -> bool {
        self.peers.remove(mac).is_some()
    }

    pub fn contains(&self, mac: &MacAddress) -> bool {
        self.peers.contains_key(mac)
    }

    pub fn get(&self, mac: &MacAddress) -> Option<&PeerStatus> {
        self.peers.get(mac)
    }

    /// Returns true when the state changed.
    pub fn mark_online(&mut self, mac: &MacAddress) -> bool {
        self.set_online(mac, true)
    }

    /// Returns true when the state changed.
    pub fn mark_offline(&mut self, mac: &MacAddress) -> bool {
        self.set_online(mac, false)
    }

    fn set_online(&mut self, mac: &MacAddress, online: bool) -> bool {
        match self.peers.get_mut(mac) {
            Some(peer) if peer.online != online => {
                peer.online = online;
                info!("Peer {} is now {}", mac, if online { "ONLINE" } else { "OFFLINE" });
                true
            }
            _ => false,
        }
    }

    /// Unknown peers are never online.
    pub fn is_online(&self, mac: &MacAddress) -> bool {
        self.peers.get(mac).map(|p| p.online).unwrap_or(false)
    }

    /// Record a heartbeat. Flips an offline peer back online; returns true in that case.
    /// Unknown peers are ignored.
    pub fn touch(&mut self, mac: &MacAddress, now: u64) -> bool {
        let Some(peer) = self.peers.get_mut(mac) else {
            return false;
        };
        peer.last_heartbeat = now;
        if !peer.online {
            peer.online = true;
            info!("Peer {} is now ONLINE", mac);
            return true;
        }
        false
    }

    /// Mark every online peer whose heartbeat is older than `timeout_ms` offline.
    /// Returns how many peers went offline in this sweep.
    pub fn sweep_timeouts(&mut self, timeout_ms: u64, now: u64) -> usize {
        let mut count = 0;
        for peer in self.peers.values_mut() {
            if peer.online && now.saturating_sub(peer.last_heartbeat) > timeout_ms {
                peer.online = false;
                count += 1;
                info!("Peer {} timed out (no heartbeat for {}ms)", peer.mac, now - peer.last_heartbeat);
            }
        }
        count
    }

    /// Duplicate iff `seq` equals the last one recorded for this sender and is
    /// non-zero. The last sequence is updated on every call; unknown senders
    /// are never duplicates.
    pub fn is_duplicate(&mut self, mac: &MacAddress, seq: u8) -> bool {
        let Some(peer) = self.peers.get_mut(mac) else {
            return false;
        };
        let dup = seq != 0 && seq == peer.last_seq;
        peer.last_seq = seq;
        dup
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn online_count(&self) -> usize {
        self.peers.values().filter(|p| p.online).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerStatus> {
        self.peers.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(n: u8) -> MacAddress {
        MacAddress::new([0x24, 0x6F, 0x28, 0, 0, n])
    }

    #[test]
    fn unknown_peer_is_not_online() {
        let reg = PeerRegistry::new();
        assert!(!reg.is_online(&mac(1)));
    }

    #[test]
    fn sweep_counts_only_newly_offline() {
        let mut reg = PeerRegistry::new();
        reg.add_peer(mac(1), 0);
        reg.add_peer(mac(2), 50_000);
        assert_eq!(reg.sweep_timeouts(60_000, 60_001), 1);
        assert!(!reg.is_online(&mac(1)));
        assert!(reg.is_online(&mac(2)));
        // already offline: not counted again
        assert_eq!(reg.sweep_timeouts(60_000, 60_002), 0);
        assert_eq!(reg.online_count(), 1);
    }

    #[test]
    fn touch_revives_offline_peer() {
        let mut reg = PeerRegistry::new();
        reg.add_peer(mac(1), 0);
        assert!(reg.mark_offline(&mac(1)));
        assert!(!reg.mark_offline(&mac(1)));
        assert!(reg.touch(&mac(1), 1_000));
        assert!(reg.is_online(&mac(1)));
        assert!(!reg.touch(&mac(9), 1_000));
        assert!(!reg.contains(&mac(9)));
    }

    #[test]
    fn duplicate_detection_ignores_zero() {
        let mut reg = PeerRegistry::new();
        reg.add_peer(mac(1), 0);
        assert!(!reg.is_duplicate(&mac(1), 5));
        assert!(reg.is_duplicate(&mac(1), 5));
        assert!(!reg.is_duplicate(&mac(1), 0));
        assert!(!reg.is_duplicate(&mac(1), 0));
        assert!(!reg.is_duplicate(&mac(1), 6));
        // unknown sender is never a duplicate
        assert!(!reg.is_duplicate(&mac(2), 6));
        assert!(!reg.is_duplicate(&mac(2), 6));
    }

    #[test]
    fn remove_peer_forgets_state() {
        let mut reg = PeerRegistry::new();
        reg.add_peer(mac(3), 0);
        assert!(reg.remove_peer(&mac(3)));
        assert!(!reg.remove_peer(&mac(3)));
        assert!(reg.is_empty());
    }
}
