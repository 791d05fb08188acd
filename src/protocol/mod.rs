//! # Wire Protocol
//!
//! Every radio frame starts with an 8 byte header followed by a fixed-size body
//! whose layout depends on the message kind. All multi-byte integers are
//! little-endian and nothing relies on in-memory struct layout: each body has an
//! explicit encode/decode routine in [`message`].
//!
//! ```text
//! +------+--------+----------+-----------+-----+----------------+
//! | kind | tankId | nodeType | timestamp | seq | body ...       |
//! |  1B  |   1B   |    1B    |   4B LE   | 1B  | kind-specific  |
//! +------+--------+----------+-----------+-----+----------------+
//! ```
//!
//! A frame never exceeds [`MAX_FRAME_LEN`]; the largest body (Config) is 48 bytes.

pub mod message;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::errors::ValidationError;

pub use message::{
    Ack, Announce, Command, ConfigBody, Frame, Heartbeat, Message, Status, Unmap,
};

/// Hard per-frame ceiling of the radio link.
pub const MAX_FRAME_LEN: usize = 250;
/// Size of [`FrameHeader`] on the wire.
pub const HEADER_LEN: usize = 8;
/// Payload bytes carried by one Command fragment.
pub const FRAGMENT_SIZE: usize = 32;
/// Largest payload accepted by fragmented sends and reassembly.
pub const MAX_MESSAGE_SIZE: usize = 512;
/// Bytes reserved for a device name in Config (including the NUL terminator).
pub const MAX_NODE_NAME_LEN: usize = 16;
/// Device-specific configuration bytes in Config.
pub const CONFIG_DATA_LEN: usize = 32;
/// Result bytes carried by Status.
pub const STATUS_DATA_LEN: usize = 32;
/// Default radio channel shared by hub and nodes.
pub const DEFAULT_CHANNEL: u8 = 6;

/// Six byte physical radio address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// Link-layer broadcast address used for discovery announces.
    pub const BROADCAST: MacAddress = MacAddress([0xFF; 6]);

    pub const fn new(bytes: [u8; 6]) -> Self {
        MacAddress(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddress({})", self)
    }
}

impl FromStr for MacAddress {
    type Err = ValidationError;

    /// Accepts `AA:BB:CC:DD:EE:FF` or `aa-bb-cc-dd-ee-ff`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(|c: char| c == ':' || c == '-').collect();
        if parts.len() != 6 {
            return Err(ValidationError::InvalidMac(s.to_string()));
        }
        let mut out = [0u8; 6];
        for (slot, part) in out.iter_mut().zip(parts) {
            if part.len() != 2 {
                return Err(ValidationError::InvalidMac(s.to_string()));
            }
            *slot = u8::from_str_radix(part, 16)
                .map_err(|_| ValidationError::InvalidMac(s.to_string()))?;
        }
        Ok(MacAddress(out))
    }
}

impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Message kind byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Announce = 0x01,
    Ack = 0x02,
    Config = 0x03,
    Command = 0x04,
    Status = 0x05,
    Heartbeat = 0x06,
    Unmap = 0x07,
}

impl MessageKind {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(MessageKind::Announce),
            0x02 => Some(MessageKind::Ack),
            0x03 => Some(MessageKind::Config),
            0x04 => Some(MessageKind::Command),
            0x05 => Some(MessageKind::Status),
            0x06 => Some(MessageKind::Heartbeat),
            0x07 => Some(MessageKind::Unmap),
            _ => None,
        }
    }

    /// Body length that follows the header for this kind.
    pub fn body_len(self) -> usize {
        match self {
            MessageKind::Announce => 18,
            MessageKind::Ack => 2,
            MessageKind::Config => MAX_NODE_NAME_LEN + CONFIG_DATA_LEN,
            MessageKind::Command => 4 + FRAGMENT_SIZE,
            MessageKind::Status => 2 + STATUS_DATA_LEN,
            MessageKind::Heartbeat => 3,
            MessageKind::Unmap => 9,
        }
    }

    /// Total on-air size of a frame of this kind.
    pub fn frame_len(self) -> usize {
        HEADER_LEN + self.body_len()
    }
}

/// Role of the sender, carried in every header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum NodeType {
    #[default]
    Unknown = 0x00,
    Hub = 0x01,
    Light = 0x02,
    Co2 = 0x03,
    Doser = 0x04,
    Sensor = 0x05,
    Heater = 0x06,
    Filter = 0x07,
    FishFeeder = 0x08,
    Repeater = 0x09,
}

impl NodeType {
    /// Unrecognised values decode as `Unknown` rather than failing the frame.
    pub fn from_u8(b: u8) -> Self {
        match b {
            0x01 => NodeType::Hub,
            0x02 => NodeType::Light,
            0x03 => NodeType::Co2,
            0x04 => NodeType::Doser,
            0x05 => NodeType::Sensor,
            0x06 => NodeType::Heater,
            0x07 => NodeType::Filter,
            0x08 => NodeType::FishFeeder,
            0x09 => NodeType::Repeater,
            _ => NodeType::Unknown,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Human readable name used in device snapshots.
    pub fn display_name(self) -> &'static str {
        match self {
            NodeType::Unknown => "Unknown",
            NodeType::Hub => "Hub",
            NodeType::Light => "Light",
            NodeType::Co2 => "CO2 Regulator",
            NodeType::Doser => "Doser",
            NodeType::Sensor => "Water Quality Sensor",
            NodeType::Heater => "Heater",
            NodeType::Filter => "Filter",
            NodeType::FishFeeder => "Fish Feeder",
            NodeType::Repeater => "Repeater",
        }
    }

    /// Upper-case tag used in the unmapped-device registry.
    pub fn tag(self) -> &'static str {
        match self {
            NodeType::Unknown => "UNKNOWN",
            NodeType::Hub => "HUB",
            NodeType::Light => "LIGHT",
            NodeType::Co2 => "CO2",
            NodeType::Doser => "DOSER",
            NodeType::Sensor => "SENSOR",
            NodeType::Heater => "HEATER",
            NodeType::Filter => "FILTER",
            NodeType::FishFeeder => "FISH_FEEDER",
            NodeType::Repeater => "REPEATER",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Common 8 byte header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: MessageKind,
    /// Logical tank, 0 while unprovisioned.
    pub tank_id: u8,
    pub node_type: NodeType,
    /// Sender-local monotonic milliseconds (wraps).
    pub timestamp: u32,
    /// Per-sender sequence number (wraps at 256).
    pub seq: u8,
}
