//! The slice of the hub transport the fleet registry needs.
//!
//! Fleet operations are synchronous and run under the hub's single lock, so
//! they talk to the radio through this trait instead of a concrete
//! [`Transport`]. Unit tests substitute a recording fake.

use crate::errors::TransportError;
use crate::protocol::{MacAddress, Message};
use crate::transport::{link::LinkDriver, Transport};

pub trait HubRadio {
    /// Liveness as tracked by the peer registry; unknown peers are offline.
    fn is_online(&self, mac: &MacAddress) -> bool;

    fn add_peer(&mut self, mac: MacAddress, now: u64);

    fn remove_peer(&mut self, mac: &MacAddress);

    /// Refresh liveness for `mac`, registering it if the hub has no entry
    /// (e.g. after a restart with restored fleet state).
    fn peer_heartbeat(&mut self, mac: MacAddress, now: u64);

    /// Refresh liveness of a peer the registry already knows. Unknown
    /// addresses are left alone.
    fn touch_peer(&mut self, mac: &MacAddress, now: u64);

    /// Single attempt. The frame header carries `tank_id`.
    fn send(&mut self, dest: &MacAddress, tank_id: u8, message: Message, now: u64) -> Result<(), TransportError>;

    /// Like [`HubRadio::send`], but a link failure is queued for cooperative retry.
    /// The error is still returned so callers can count it.
    fn send_reliable(&mut self, dest: &MacAddress, tank_id: u8, message: Message, now: u64) -> Result<(), TransportError>;
}

impl<L: LinkDriver> HubRadio for Transport<L> {
    fn is_online(&self, mac: &MacAddress) -> bool {
        self.peers().is_online(mac)
    }

    fn add_peer(&mut self, mac: MacAddress, now: u64) {
        Transport::add_peer(self, mac, now);
    }

    fn remove_peer(&mut self, mac: &MacAddress) {
        Transport::remove_peer(self, mac);
    }

    fn peer_heartbeat(&mut self, mac: MacAddress, now: u64) {
        if self.peers().contains(&mac) {
            self.peers_mut().touch(&mac, now);
        } else {
            Transport::add_peer(self, mac, now);
        }
    }

    fn touch_peer(&mut self, mac: &MacAddress, now: u64) {
        self.peers_mut().touch(mac, now);
    }

    fn send(&mut self, dest: &MacAddress, tank_id: u8, message: Message, now: u64) -> Result<(), TransportError> {
        let frame = self.make_frame_for_tank(tank_id, message, now);
        Transport::send(self, dest, &frame.encode())
    }

    fn send_reliable(&mut self, dest: &MacAddress, tank_id: u8, message: Message, now: u64) -> Result<(), TransportError> {
        let bytes = self.make_frame_for_tank(tank_id, message, now).encode();
        self.send_bytes_or_queue(dest, bytes, now)
    }
}
