//! # Node Runtime
//!
//! Everything a node needs besides its actuator: the pairing state machine,
//! a node-role [`Transport`], and persistence of the tank assignment.
//!
//! Device-specific behavior plugs in through [`NodeApplication`]. The runtime
//! guarantees:
//!
//! - commands reach the application only while connected to a hub
//! - every handled command is answered with a Status echoing its id
//! - on hub silence the application's fail-safe runs before the node leaves
//!   the connected state
//! - Config and Unmap persist the new identity and restart pairing from scratch
//!
//! ```rust,no_run
//! # use aquanet::node::{CommandReply, NodeApplication};
//! struct Valve { open: bool }
//! impl NodeApplication for Valve {
//!     fn enter_fail_safe(&mut self) { self.open = false; }
//!     fn handle_command(&mut self, _id: u8, payload: &[u8]) -> CommandReply {
//!         self.open = payload.first() == Some(&1);
//!         CommandReply::ok()
//!     }
//! }
//! ```

pub mod identity;
pub mod pairing;

use std::time::Duration;

use anyhow::Result;
use log::{debug, info, trace, warn};
use tokio::sync::watch;

use crate::logutil::log_name;
use crate::protocol::{Announce, Heartbeat, MacAddress, Message, Status};
use crate::transport::link::LinkDriver;
use crate::transport::{epoch_ms, Delivery, Transport};

pub use identity::{IdentityStore, JsonIdentityStore, MemoryIdentityStore, NodeIdentity};
pub use pairing::{PairingAction, PairingMachine, PairingState, PairingTimings};

/// Result of a command, carried back to the hub in Status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReply {
    pub code: u8,
    pub data: Vec<u8>,
}

impl CommandReply {
    /// Status code 0 with the single byte `1`.
    pub fn ok() -> Self {
        Self {
            code: 0,
            data: vec![1],
        }
    }

    pub fn with_data(data: &[u8]) -> Self {
        Self {
            code: 0,
            data: data.to_vec(),
        }
    }

    pub fn error(code: u8) -> Self {
        Self {
            code,
            data: Vec::new(),
        }
    }
}

impl Default for CommandReply {
    fn default() -> Self {
        Self::ok()
    }
}

/// The device-specific half of a node.
pub trait NodeApplication: Send {
    /// Put the actuator into its safe state.
    fn enter_fail_safe(&mut self);

    fn handle_command(&mut self, command_id: u8, payload: &[u8]) -> CommandReply;

    /// Device-specific bytes of a Config message.
    fn apply_config(&mut self, _config: &[u8]) {}

    /// 0-100, reported in heartbeats.
    fn health(&self) -> u8 {
        100
    }
}

pub struct NodeRuntime<L: LinkDriver, A: NodeApplication> {
    transport: Transport<L>,
    pairing: PairingMachine,
    store: Box<dyn IdentityStore>,
    identity: NodeIdentity,
    app: A,
    firmware_version: u8,
    capabilities: u8,
    started_at: u64,
}

impl<L: LinkDriver, A: NodeApplication> NodeRuntime<L, A> {
    pub fn new(
        mut transport: Transport<L>,
        app: A,
        mut store: Box<dyn IdentityStore>,
        timings: PairingTimings,
        firmware_version: u8,
    ) -> Result<Self> {
        let identity = store.load()?;
        transport.set_tank_id(identity.tank_id);
        Ok(Self {
            transport,
            pairing: PairingMachine::new(timings),
            store,
            identity,
            app,
            firmware_version,
            capabilities: 0,
            started_at: 0,
        })
    }

    pub fn with_capabilities(mut self, capabilities: u8) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn state(&self) -> PairingState {
        self.pairing.state()
    }

    pub fn hub(&self) -> Option<MacAddress> {
        self.pairing.hub()
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn app(&self) -> &A {
        &self.app
    }

    pub fn app_mut(&mut self) -> &mut A {
        &mut self.app
    }

    pub fn transport(&self) -> &Transport<L> {
        &self.transport
    }

    pub fn start(&mut self, now: u64) {
        self.started_at = now;
        info!(
            "Node starting (tank {}, name {})",
            self.identity.tank_id,
            log_name(&self.identity.name)
        );
        let actions = self.pairing.start(now);
        self.perform(actions, now);
    }

    /// One pass of the node loop: drain received frames, advance pairing,
    /// run transport housekeeping.
    pub fn step(&mut self, now: u64) {
        for delivery in self.transport.poll(now) {
            self.handle_delivery(delivery, now);
        }
        let app = &mut self.app;
        let actions = self.pairing.tick(now, || app.enter_fail_safe());
        self.perform(actions, now);
        self.transport.tick(now);
    }

    /// Send an unsolicited Status (command id 0), e.g. a sensor reading.
    pub fn report_status(&mut self, status_code: u8, data: &[u8], now: u64) -> bool {
        let Some(hub) = self.pairing.hub() else {
            return false;
        };
        let msg = Message::Status(Status::new(0, status_code, data));
        self.transport.send_message(&hub, msg, now).is_ok()
    }

    fn perform(&mut self, actions: Vec<PairingAction>, now: u64) {
        for action in actions {
            match action {
                PairingAction::SendAnnounce => {
                    let msg = Message::Announce(Announce {
                        firmware_version: self.firmware_version,
                        capabilities: self.capabilities,
                    });
                    match self.transport.send_message(&MacAddress::BROADCAST, msg, now) {
                        Ok(()) => debug!("ANNOUNCE sent (attempt {})", self.pairing.announce_attempts()),
                        Err(e) => warn!("Announce failed: {}", e),
                    }
                }
                PairingAction::SendHeartbeat => {
                    let Some(hub) = self.pairing.hub() else { continue };
                    let uptime = (now.saturating_sub(self.started_at) / 60_000).min(u64::from(u16::MAX)) as u16;
                    let msg = Message::Heartbeat(Heartbeat {
                        health: self.app.health().min(100),
                        uptime_minutes: uptime,
                    });
                    if let Err(e) = self.transport.send_message(&hub, msg, now) {
                        warn!("Heartbeat to {} failed: {}", hub, e);
                    }
                }
            }
        }
    }

    fn handle_delivery(&mut self, delivery: Delivery, now: u64) {
        let from = delivery.from();
        if !self.pairing.accepts_from(&from) {
            trace!("Ignoring frame from unknown sender {}", from);
            return;
        }
        self.pairing.on_traffic(now);

        match delivery {
            Delivery::Frame {
                header, message, ..
            } => match message {
                Message::Ack(ack) => {
                    self.pairing.on_ack(from, &ack, now);
                }
                Message::Config(config) if self.pairing.is_connected() => {
                    info!(
                        "Provisioned: tank {} name {}",
                        header.tank_id,
                        log_name(&config.name)
                    );
                    self.app.apply_config(&config.config);
                    self.reidentify(
                        NodeIdentity {
                            tank_id: header.tank_id,
                            name: config.name,
                        },
                        now,
                    );
                }
                Message::Unmap(unmap) if self.pairing.is_connected() => {
                    info!("Unmapped by hub (reason {})", unmap.reason);
                    self.reidentify(NodeIdentity::default(), now);
                }
                Message::Heartbeat(_) => trace!("Hub heartbeat received"),
                other => debug!("Ignoring {:?} in state {:?}", other.kind(), self.pairing.state()),
            },
            Delivery::Command {
                command_id, payload, ..
            } => {
                if !self.pairing.is_connected() {
                    debug!("Ignoring command {} - not connected", command_id);
                    return;
                }
                let reply = self.app.handle_command(command_id, &payload);
                let msg = Message::Status(Status::new(command_id, reply.code, &reply.data));
                if let Err(e) = self.transport.send_message(&from, msg, now) {
                    warn!("Status for command {} failed: {}", command_id, e);
                }
            }
        }
    }

    /// Persist a new identity and rediscover the hub from a clean state.
    fn reidentify(&mut self, identity: NodeIdentity, now: u64) {
        if let Err(e) = self.store.save(&identity) {
            warn!("Failed to persist node identity: {}", e);
        }
        self.transport.set_tank_id(identity.tank_id);
        self.identity = identity;
        let actions = self.pairing.start(now);
        self.perform(actions, now);
    }

    /// Drive the node from the wall clock until `shutdown` flips to true.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>, period: Duration) -> Result<Self> {
        self.start(epoch_ms());
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.step(epoch_ms()),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        Ok(self)
    }
}

