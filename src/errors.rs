//! Error taxonomy shared by the protocol, transport and fleet layers.
//!
//! Transport and protocol errors are counted and logged by their callers and
//! never unwind through the dispatch loop. Only fleet operations invoked from
//! the outside (provisioning, manual commands, CRUD) surface them to a caller.
use thiserror::Error;

use crate::protocol::MacAddress;

/// Problems found while decoding a received frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Frame shorter than the header or the body its kind requires.
    #[error("frame too short: need {expected} bytes, got {found}")]
    TooShort { expected: usize, found: usize },

    /// First byte is not a known message kind.
    #[error("unknown message kind 0x{0:02x}")]
    UnknownKind(u8),

    /// A Command fragment claims more payload bytes than a fragment can carry.
    #[error("invalid fragment length {0}")]
    InvalidFragmentLength(u8),
}

/// Failures reported by a link driver.
#[derive(Debug, Error)]
pub enum LinkError {
    /// IO failure on the underlying device.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The driver has no usable radio (closed port, running radio-less).
    #[error("link closed")]
    Closed,

    /// The driver refused the frame (radio busy, unknown destination...).
    #[error("link rejected frame: {0}")]
    Rejected(String),
}

/// Failures of the reliable-messaging layer.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("payload too large: {len} bytes (max {max})")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("payload is empty")]
    EmptyPayload,

    /// Hub refused to send because liveness marks the peer offline.
    #[error("peer {0} is offline")]
    PeerOffline(MacAddress),

    #[error("link error: {0}")]
    Link(#[from] LinkError),

    #[error("gave up after {attempts} attempts")]
    RetriesExhausted { attempts: u8 },
}

/// Errors surfaced by fleet registry operations.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("aquarium id must be non-zero")]
    InvalidAquariumId,

    #[error("aquarium {0} already exists")]
    AquariumExists(u8),

    #[error("aquarium {0} not found")]
    AquariumNotFound(u8),

    #[error("device {0} not found")]
    DeviceNotFound(MacAddress),

    #[error("device {0} already registered")]
    DeviceExists(MacAddress),

    #[error("device {0} is not awaiting provisioning")]
    NotPending(MacAddress),

    #[error("node type {0} cannot be managed as a device")]
    UnsupportedNodeType(u8),

    #[error("schedule {0} already exists")]
    ScheduleExists(u32),

    #[error("schedule {0} not found")]
    ScheduleNotFound(u32),

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("command payload is empty")]
    EmptyCommand,

    /// Rejected by a device-specific safety limit (duration, temperature, feed interval).
    #[error("safety limit: {0}")]
    SafetyLimit(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Name validation failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("name is empty")]
    Empty,

    #[error("name is too long (maximum {max} bytes)")]
    TooLong { max: usize },

    #[error("name cannot start or end with whitespace")]
    InvalidWhitespace,

    #[error("name contains control characters")]
    ControlCharacters,

    #[error("invalid MAC address: {0}")]
    InvalidMac(String),
}
