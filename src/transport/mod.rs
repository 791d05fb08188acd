//! # Message Transport
//!
//! Reliable-messaging layer on top of a lossy, connectionless radio link.
//!
//! A [`Transport`] owns one [`LinkDriver`] and the receiving half of the
//! bounded RX queue the driver feeds. It provides:
//!
//! - single-frame sends with size checks and (hub only) a liveness gate
//! - fragmented Command sends with a short pause between fragments
//! - blocking-style retries with exponential backoff ([`Transport::send_with_retry`])
//! - a cooperative retry queue evaluated on every tick ([`Transport::process_retries`])
//! - inbound draining with per-sender duplicate suppression (hub) and
//!   single-slot fragment reassembly (node)
//!
//! All time-dependent entry points take the current epoch milliseconds so the
//! logic can be driven by tests without a real clock.
//!
//! ```rust,no_run
//! use aquanet::transport::{link::MemoryMedium, rx::rx_queue, Role, Transport, TransportSettings};
//! use aquanet::protocol::{MacAddress, NodeType};
//!
//! let medium = MemoryMedium::new();
//! let (tx, rx) = rx_queue(10);
//! let link = medium.attach(MacAddress::new([0x24, 0x6F, 0x28, 0, 0, 1]), tx);
//! let mut hub = Transport::new(Role::Hub, NodeType::Hub, link, rx, TransportSettings::default());
//! for delivery in hub.poll(aquanet::transport::epoch_ms()) {
//!     println!("{:?}", delivery);
//! }
//! ```

pub mod link;
pub mod reassembly;
pub mod retry;
pub mod rx;
pub mod slip;

use std::time::Duration;

use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};

use crate::errors::TransportError;
use crate::logutil::hex_preview;
use crate::metrics;
use crate::peers::PeerRegistry;
use crate::protocol::{
    Command, Frame, FrameHeader, MacAddress, Message, NodeType, FRAGMENT_SIZE, MAX_FRAME_LEN,
    MAX_MESSAGE_SIZE,
};

use link::LinkDriver;
use reassembly::{FragmentOutcome, Reassembler};
use retry::RetryQueue;
use rx::FrameReceiver;

/// Current wall-clock time in epoch milliseconds.
pub fn epoch_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Tunables of the reliable-messaging layer (`[transport]` in the config file).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TransportSettings {
    pub max_retries: u8,
    pub retry_base_delay_ms: u64,
    pub reassembly_timeout_ms: u64,
    pub rx_queue_size: usize,
    pub fragment_pause_ms: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay_ms: 100,
            reassembly_timeout_ms: 1500,
            rx_queue_size: 10,
            fragment_pause_ms: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Tracks peers, suppresses duplicates, refuses sends to offline peers.
    Hub,
    /// Trusts its single hub; reassembles fragmented commands.
    Node,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct TransportStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub send_failures: u64,
    pub retries: u64,
    pub retries_exhausted: u64,
    pub fragments_sent: u64,
    pub fragments_received: u64,
    pub reassembly_timeouts: u64,
    pub reassembly_failures: u64,
    pub duplicates_ignored: u64,
    pub malformed_frames: u64,
    pub rx_queue_overflows: u64,
    pub retry_queue_len: usize,
}

/// A received unit handed to the application layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Any non-Command message.
    Frame {
        from: MacAddress,
        header: FrameHeader,
        message: Message,
    },
    /// A complete (possibly reassembled) command transfer.
    Command {
        from: MacAddress,
        header: FrameHeader,
        command_id: u8,
        payload: Vec<u8>,
    },
}

impl Delivery {
    pub fn from(&self) -> MacAddress {
        match self {
            Delivery::Frame { from, .. } | Delivery::Command { from, .. } => *from,
        }
    }

    pub fn header(&self) -> &FrameHeader {
        match self {
            Delivery::Frame { header, .. } | Delivery::Command { header, .. } => header,
        }
    }
}

pub struct Transport<L: LinkDriver> {
    role: Role,
    node_type: NodeType,
    tank_id: u8,
    seq: u8,
    link: L,
    rx: FrameReceiver,
    peers: PeerRegistry,
    retries: RetryQueue,
    reassembly: Reassembler,
    stats: TransportStats,
    settings: TransportSettings,
}

impl<L: LinkDriver> Transport<L> {
    pub fn new(
        role: Role,
        node_type: NodeType,
        link: L,
        rx: FrameReceiver,
        settings: TransportSettings,
    ) -> Self {
        Self {
            role,
            node_type,
            tank_id: 0,
            seq: 0,
            link,
            rx,
            peers: PeerRegistry::new(),
            retries: RetryQueue::new(settings.max_retries, settings.retry_base_delay_ms),
            reassembly: Reassembler::new(settings.reassembly_timeout_ms),
            stats: TransportStats::default(),
            settings,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    /// Tank id stamped into outgoing headers.
    pub fn set_tank_id(&mut self, tank_id: u8) {
        self.tank_id = tank_id;
    }

    pub fn tank_id(&self) -> u8 {
        self.tank_id
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    pub fn peers_mut(&mut self) -> &mut PeerRegistry {
        &mut self.peers
    }

    pub fn add_peer(&mut self, mac: MacAddress, now: u64) {
        self.peers.add_peer(mac, now);
    }

    pub fn remove_peer(&mut self, mac: &MacAddress) -> bool {
        self.peers.remove_peer(mac)
    }

    pub fn stats(&self) -> TransportStats {
        let mut stats = self.stats.clone();
        stats.rx_queue_overflows = self.rx.dropped();
        stats.retry_queue_len = self.retries.len();
        stats
    }

    /// Build a frame with this transport's identity and the next sequence number.
    pub fn make_frame(&mut self, message: Message, now: u64) -> Frame {
        self.make_frame_for_tank(self.tank_id, message, now)
    }

    /// Like [`Transport::make_frame`] but stamped with an explicit tank id
    /// (the hub addresses Config and Unmap to a tank this way).
    pub fn make_frame_for_tank(&mut self, tank_id: u8, message: Message, now: u64) -> Frame {
        self.seq = self.seq.wrapping_add(1);
        Frame::new(tank_id, self.node_type, now as u32, self.seq, message)
    }

    /// Send one already-encoded frame.
    pub fn send(&mut self, dest: &MacAddress, bytes: &[u8]) -> Result<(), TransportError> {
        if bytes.is_empty() {
            return Err(TransportError::EmptyPayload);
        }
        if bytes.len() > MAX_FRAME_LEN {
            return Err(TransportError::PayloadTooLarge {
                len: bytes.len(),
                max: MAX_FRAME_LEN,
            });
        }
        // Only peers the hub knows about can be marked offline; unknown
        // addresses (fresh announcers, rejected nodes) are always reachable.
        if self.role == Role::Hub
            && !dest.is_broadcast()
            && self.peers.contains(dest)
            && !self.peers.is_online(dest)
        {
            return Err(TransportError::PeerOffline(*dest));
        }
        match self.link.raw_send(dest, bytes) {
            Ok(()) => {
                self.stats.messages_sent += 1;
                trace!("TX {} [{}]", dest, hex_preview(bytes, 16));
                Ok(())
            }
            Err(e) => {
                self.stats.send_failures += 1;
                debug!("Send to {} failed: {}", dest, e);
                Err(e.into())
            }
        }
    }

    pub fn send_message(&mut self, dest: &MacAddress, message: Message, now: u64) -> Result<(), TransportError> {
        let frame = self.make_frame(message, now);
        self.send(dest, &frame.encode())
    }

    /// Split `payload` into Command fragments and send them in order, pausing
    /// between fragments. Aborts at the first fragment that cannot be sent.
    pub async fn send_fragmented(
        &mut self,
        dest: &MacAddress,
        command_id: u8,
        payload: &[u8],
        now: u64,
    ) -> Result<(), TransportError> {
        let frames = self.fragment_frames(self.tank_id, command_id, payload, now)?;
        let pause = Duration::from_millis(self.settings.fragment_pause_ms);
        for (index, bytes) in frames.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(pause).await;
            }
            self.send_fragment(dest, bytes)?;
        }
        if frames.len() > 1 {
            debug!("Sent command {} to {} in {} fragments", command_id, dest, frames.len());
        }
        Ok(())
    }

    /// Encode `payload` as a run of Command fragments stamped with `tank_id`,
    /// ready for [`Transport::send_fragment`]. Lets a caller pace the sends
    /// itself without holding on to the transport in between.
    pub fn fragment_frames(
        &mut self,
        tank_id: u8,
        command_id: u8,
        payload: &[u8],
        now: u64,
    ) -> Result<Vec<Vec<u8>>, TransportError> {
        if payload.is_empty() {
            return Err(TransportError::EmptyPayload);
        }
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(TransportError::PayloadTooLarge {
                len: payload.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        let count = payload.len().div_ceil(FRAGMENT_SIZE);
        let frames = payload
            .chunks(FRAGMENT_SIZE)
            .enumerate()
            .map(|(index, chunk)| {
                let fragment = Command {
                    command_id,
                    fragment_index: index as u8,
                    is_final: index + 1 == count,
                    data: chunk.to_vec(),
                };
                self.make_frame_for_tank(tank_id, Message::Command(fragment), now).encode()
            })
            .collect();
        Ok(frames)
    }

    /// Send one frame produced by [`Transport::fragment_frames`].
    pub fn send_fragment(&mut self, dest: &MacAddress, bytes: &[u8]) -> Result<(), TransportError> {
        self.send(dest, bytes)?;
        self.stats.fragments_sent += 1;
        Ok(())
    }

    /// Send with up to `max_attempts` tries, waiting `base * 2^(n-1)` before retry n.
    /// Size and liveness rejections are returned immediately.
    pub async fn send_with_retry(
        &mut self,
        dest: &MacAddress,
        bytes: &[u8],
        max_attempts: u8,
    ) -> Result<(), TransportError> {
        let attempts = max_attempts.max(1);
        for attempt in 1..=attempts {
            if attempt > 1 {
                let delay = self.settings.retry_base_delay_ms * 2u64.pow(u32::from(attempt - 2));
                tokio::time::sleep(Duration::from_millis(delay)).await;
                self.stats.retries += 1;
            }
            match self.send(dest, bytes) {
                Ok(()) => return Ok(()),
                Err(TransportError::Link(e)) => {
                    debug!("Attempt {}/{} to {} failed: {}", attempt, attempts, dest, e);
                }
                Err(other) => return Err(other),
            }
        }
        self.stats.retries_exhausted += 1;
        metrics::inc_retries_exhausted();
        warn!("Giving up on {} after {} attempts", dest, attempts);
        Err(TransportError::RetriesExhausted { attempts })
    }

    pub async fn send_message_with_retry(
        &mut self,
        dest: &MacAddress,
        message: Message,
        max_attempts: u8,
        now: u64,
    ) -> Result<(), TransportError> {
        let bytes = self.make_frame(message, now).encode();
        self.send_with_retry(dest, &bytes, max_attempts).await
    }

    /// Queue an encoded frame for cooperative retransmission.
    pub fn enqueue_retry(&mut self, dest: MacAddress, bytes: Vec<u8>, now: u64) {
        self.retries.push(dest, bytes, now);
        metrics::inc_retries_scheduled();
        debug!("Queued retry to {} ({} pending)", dest, self.retries.len());
    }

    /// Send a message; if the radio refuses it, queue it for retry.
    pub fn send_or_queue(&mut self, dest: &MacAddress, message: Message, now: u64) -> Result<(), TransportError> {
        let bytes = self.make_frame(message, now).encode();
        self.send_bytes_or_queue(dest, bytes, now)
    }

    pub fn send_bytes_or_queue(&mut self, dest: &MacAddress, bytes: Vec<u8>, now: u64) -> Result<(), TransportError> {
        match self.send(dest, &bytes) {
            Err(TransportError::Link(e)) => {
                self.enqueue_retry(*dest, bytes, now);
                Err(TransportError::Link(e))
            }
            other => other,
        }
    }

    /// Retry every queued send whose deadline has passed. Returns how many succeeded.
    pub fn process_retries(&mut self, now: u64) -> usize {
        let mut delivered = 0;
        for ctx in self.retries.take_due(now) {
            self.stats.retries += 1;
            match self.send(&ctx.dest, &ctx.payload) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    let dest = ctx.dest;
                    if !self.retries.reschedule(ctx, now) {
                        self.stats.retries_exhausted += 1;
                        metrics::inc_retries_exhausted();
                        warn!("Retry to {} exhausted: {}", dest, e);
                    }
                }
            }
        }
        delivered
    }

    /// Housekeeping for one processing tick: retries and reassembly expiry.
    pub fn tick(&mut self, now: u64) {
        self.process_retries(now);
        self.expire_reassembly(now);
    }

    fn expire_reassembly(&mut self, now: u64) {
        if self.reassembly.expire(now) {
            self.stats.reassembly_timeouts += 1;
            debug!("Reassembly timed out");
        }
    }

    /// Drain the RX queue and return the decoded deliveries in arrival order.
    pub fn poll(&mut self, now: u64) -> Vec<Delivery> {
        let mut out = Vec::new();
        while let Some(raw) = self.rx.try_recv() {
            if let Some(d) = self.on_raw(raw.from, &raw.bytes, now) {
                out.push(d);
            }
        }
        out
    }

    fn on_raw(&mut self, from: MacAddress, bytes: &[u8], now: u64) -> Option<Delivery> {
        let frame = match Frame::decode(bytes) {
            Ok(f) => f,
            Err(e) => {
                self.stats.malformed_frames += 1;
                debug!("Dropping frame from {}: {} [{}]", from, e, hex_preview(bytes, 16));
                return None;
            }
        };
        self.stats.messages_received += 1;

        if self.role == Role::Hub && self.peers.is_duplicate(&from, frame.header.seq) {
            self.stats.duplicates_ignored += 1;
            trace!("Duplicate seq {} from {}", frame.header.seq, from);
            return None;
        }

        let Frame { header, message } = frame;
        match message {
            Message::Command(fragment) => {
                if self.role == Role::Hub {
                    debug!("Hub ignoring Command from {}", from);
                    return None;
                }
                self.stats.fragments_received += 1;
                self.expire_reassembly(now);
                match self.reassembly.accept(from, &fragment, now) {
                    FragmentOutcome::Pending => None,
                    FragmentOutcome::Complete {
                        command_id,
                        payload,
                    } => Some(Delivery::Command {
                        from,
                        header,
                        command_id,
                        payload,
                    }),
                    FragmentOutcome::Dropped(reason) => {
                        self.stats.reassembly_failures += 1;
                        debug!("Discarding command transfer from {}: {:?}", from, reason);
                        None
                    }
                }
            }
            message => Some(Delivery::Frame {
                from,
                header,
                message,
            }),
        }
    }
}
