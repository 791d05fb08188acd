//! Node-side discovery and connection state machine.
//!
//! ```text
//! Initializing --start--> Announcing --announce--> WaitingForAck
//!                             ^                         | accepted Ack
//!                             |                         v
//!                      LostConnection <--timeout--- Connected
//! ```
//!
//! The machine performs no IO. [`PairingMachine::tick`] returns the frames the
//! runtime has to send and calls the fail-safe hook itself, before the state
//! leaves `Connected`.
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::protocol::{Ack, MacAddress};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PairingState {
    Initializing,
    Announcing,
    WaitingForAck,
    Connected,
    LostConnection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PairingTimings {
    pub announce_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Hub silence tolerated while connected; three heartbeat periods.
    pub connection_timeout_ms: u64,
    pub reconnect_delay_ms: u64,
}

impl Default for PairingTimings {
    fn default() -> Self {
        Self {
            announce_interval_ms: 5_000,
            heartbeat_interval_ms: 30_000,
            connection_timeout_ms: 90_000,
            reconnect_delay_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingAction {
    SendAnnounce,
    SendHeartbeat,
}

#[derive(Debug)]
pub struct PairingMachine {
    state: PairingState,
    timings: PairingTimings,
    hub: Option<MacAddress>,
    assigned_node_id: Option<u8>,
    last_sent: u64,
    last_received: u64,
    lost_at: u64,
    announce_attempts: u32,
}

impl PairingMachine {
    pub fn new(timings: PairingTimings) -> Self {
        Self {
            state: PairingState::Initializing,
            timings,
            hub: None,
            assigned_node_id: None,
            last_sent: 0,
            last_received: 0,
            lost_at: 0,
            announce_attempts: 0,
        }
    }

    pub fn state(&self) -> PairingState {
        self.state
    }

    pub fn hub(&self) -> Option<MacAddress> {
        self.hub
    }

    pub fn assigned_node_id(&self) -> Option<u8> {
        self.assigned_node_id
    }

    pub fn announce_attempts(&self) -> u32 {
        self.announce_attempts
    }

    pub fn is_connected(&self) -> bool {
        self.state == PairingState::Connected
    }

    /// Begin (or begin again) discovery from a clean slate; the first announce is immediate.
    pub fn start(&mut self, now: u64) -> Vec<PairingAction> {
        self.hub = None;
        self.assigned_node_id = None;
        self.announce_attempts = 0;
        self.state = PairingState::Announcing;
        vec![self.announce(now)]
    }

    fn announce(&mut self, now: u64) -> PairingAction {
        self.last_sent = now;
        self.announce_attempts += 1;
        self.state = PairingState::WaitingForAck;
        PairingAction::SendAnnounce
    }

    /// Once a hub is adopted, frames from anyone else are ignored.
    pub fn accepts_from(&self, from: &MacAddress) -> bool {
        self.hub.map_or(true, |hub| hub == *from)
    }

    /// Record traffic from the hub (or a prospective hub).
    pub fn on_traffic(&mut self, now: u64) {
        self.last_received = now;
    }

    /// Returns true when this Ack completed pairing.
    pub fn on_ack(&mut self, from: MacAddress, ack: &Ack, now: u64) -> bool {
        if !ack.accepted {
            warn!("Hub {} rejected our announce", from);
            return false;
        }
        if !matches!(self.state, PairingState::Announcing | PairingState::WaitingForAck) {
            return false;
        }
        self.hub = Some(from);
        self.assigned_node_id = Some(ack.assigned_node_id);
        self.state = PairingState::Connected;
        self.last_received = now;
        // next heartbeat one full period from now
        self.last_sent = now;
        info!(
            "Paired with hub {} (node id {}) after {} announce(s)",
            from, ack.assigned_node_id, self.announce_attempts
        );
        true
    }

    pub fn tick<F: FnMut()>(&mut self, now: u64, mut fail_safe: F) -> Vec<PairingAction> {
        let mut actions = Vec::new();
        match self.state {
            PairingState::Initializing => {}
            PairingState::Announcing | PairingState::WaitingForAck => {
                if now.saturating_sub(self.last_sent) >= self.timings.announce_interval_ms {
                    actions.push(self.announce(now));
                }
            }
            PairingState::Connected => {
                if now.saturating_sub(self.last_received) > self.timings.connection_timeout_ms {
                    warn!("Connection timeout - hub not responding, entering fail-safe");
                    fail_safe();
                    self.state = PairingState::LostConnection;
                    self.lost_at = now;
                } else if now.saturating_sub(self.last_sent) >= self.timings.heartbeat_interval_ms {
                    self.last_sent = now;
                    actions.push(PairingAction::SendHeartbeat);
                }
            }
            PairingState::LostConnection => {
                if now.saturating_sub(self.lost_at) >= self.timings.reconnect_delay_ms {
                    info!("Attempting to reconnect...");
                    actions.extend(self.start(now));
                }
            }
        }
        actions
    }
}
