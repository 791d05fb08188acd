//! Typed message bodies and their byte-exact encoding.
use bytes::{Buf, BufMut, BytesMut};

use super::{
    FrameHeader, MessageKind, NodeType, CONFIG_DATA_LEN, FRAGMENT_SIZE, HEADER_LEN,
    MAX_NODE_NAME_LEN, STATUS_DATA_LEN,
};
use crate::errors::DecodeError;

const ANNOUNCE_RESERVED: usize = 16;
const UNMAP_RESERVED: usize = 8;
const FLAG_FINAL: u8 = 0x01;

/// Node discovery broadcast. `tank_id` in the header is 0 while unprovisioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Announce {
    pub firmware_version: u8,
    pub capabilities: u8,
}

/// Hub reply to an Announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub assigned_node_id: u8,
    pub accepted: bool,
}

/// Provisioning: display name plus device-specific configuration bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigBody {
    pub name: String,
    pub config: [u8; CONFIG_DATA_LEN],
}

impl ConfigBody {
    pub fn new(name: &str, config: &[u8]) -> Self {
        let mut buf = [0u8; CONFIG_DATA_LEN];
        let n = config.len().min(CONFIG_DATA_LEN);
        buf[..n].copy_from_slice(&config[..n]);
        Self {
            name: truncate_name(name).to_string(),
            config: buf,
        }
    }
}

/// One Command fragment. A single-frame command is fragment 0 with `is_final`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub command_id: u8,
    pub fragment_index: u8,
    pub is_final: bool,
    /// At most [`FRAGMENT_SIZE`] bytes.
    pub data: Vec<u8>,
}

impl Command {
    /// Single-frame command; data beyond one fragment is truncated.
    pub fn single(command_id: u8, data: &[u8]) -> Self {
        let n = data.len().min(FRAGMENT_SIZE);
        Self {
            command_id,
            fragment_index: 0,
            is_final: true,
            data: data[..n].to_vec(),
        }
    }
}

/// Node reply or unsolicited report (`command_id == 0`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub command_id: u8,
    pub status_code: u8,
    pub data: [u8; STATUS_DATA_LEN],
}

impl Status {
    pub fn new(command_id: u8, status_code: u8, data: &[u8]) -> Self {
        let mut buf = [0u8; STATUS_DATA_LEN];
        let n = data.len().min(STATUS_DATA_LEN);
        buf[..n].copy_from_slice(&data[..n]);
        Self {
            command_id,
            status_code,
            data: buf,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    /// 0-100
    pub health: u8,
    pub uptime_minutes: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unmap {
    pub reason: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Announce(Announce),
    Ack(Ack),
    Config(ConfigBody),
    Command(Command),
    Status(Status),
    Heartbeat(Heartbeat),
    Unmap(Unmap),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Announce(_) => MessageKind::Announce,
            Message::Ack(_) => MessageKind::Ack,
            Message::Config(_) => MessageKind::Config,
            Message::Command(_) => MessageKind::Command,
            Message::Status(_) => MessageKind::Status,
            Message::Heartbeat(_) => MessageKind::Heartbeat,
            Message::Unmap(_) => MessageKind::Unmap,
        }
    }
}

/// Header plus body, as it travels over the air.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub message: Message,
}

impl Frame {
    pub fn new(tank_id: u8, node_type: NodeType, timestamp: u32, seq: u8, message: Message) -> Self {
        Self {
            header: FrameHeader {
                kind: message.kind(),
                tank_id,
                node_type,
                timestamp,
                seq,
            },
            message,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let kind = self.message.kind();
        let mut buf = BytesMut::with_capacity(kind.frame_len());
        buf.put_u8(kind as u8);
        buf.put_u8(self.header.tank_id);
        buf.put_u8(self.header.node_type.as_u8());
        buf.put_u32_le(self.header.timestamp);
        buf.put_u8(self.header.seq);

        match &self.message {
            Message::Announce(a) => {
                buf.put_u8(a.firmware_version);
                buf.put_u8(a.capabilities);
                buf.put_bytes(0, ANNOUNCE_RESERVED);
            }
            Message::Ack(a) => {
                buf.put_u8(a.assigned_node_id);
                buf.put_u8(a.accepted as u8);
            }
            Message::Config(c) => {
                let name = truncate_name(&c.name);
                buf.put_slice(name.as_bytes());
                buf.put_bytes(0, MAX_NODE_NAME_LEN - name.len());
                buf.put_slice(&c.config);
            }
            Message::Command(c) => {
                let n = c.data.len().min(FRAGMENT_SIZE);
                buf.put_u8(c.command_id);
                buf.put_u8(c.fragment_index);
                buf.put_u8(if c.is_final { FLAG_FINAL } else { 0 });
                buf.put_u8(n as u8);
                buf.put_slice(&c.data[..n]);
                buf.put_bytes(0, FRAGMENT_SIZE - n);
            }
            Message::Status(s) => {
                buf.put_u8(s.command_id);
                buf.put_u8(s.status_code);
                buf.put_slice(&s.data);
            }
            Message::Heartbeat(h) => {
                buf.put_u8(h.health);
                buf.put_u16_le(h.uptime_minutes);
            }
            Message::Unmap(u) => {
                buf.put_u8(u.reason);
                buf.put_bytes(0, UNMAP_RESERVED);
            }
        }
        buf.to_vec()
    }

    /// Decode a received frame. Trailing bytes beyond the body are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Frame, DecodeError> {
        let header = decode_header(bytes)?;
        let need = header.kind.frame_len();
        if bytes.len() < need {
            return Err(DecodeError::TooShort {
                expected: need,
                found: bytes.len(),
            });
        }
        let mut body = &bytes[HEADER_LEN..need];

        let message = match header.kind {
            MessageKind::Announce => Message::Announce(Announce {
                firmware_version: body.get_u8(),
                capabilities: body.get_u8(),
            }),
            MessageKind::Ack => Message::Ack(Ack {
                assigned_node_id: body.get_u8(),
                accepted: body.get_u8() != 0,
            }),
            MessageKind::Config => {
                let raw_name = &body[..MAX_NODE_NAME_LEN];
                let end = raw_name.iter().position(|&b| b == 0).unwrap_or(raw_name.len());
                let name = String::from_utf8_lossy(&raw_name[..end]).into_owned();
                body.advance(MAX_NODE_NAME_LEN);
                let mut config = [0u8; CONFIG_DATA_LEN];
                body.copy_to_slice(&mut config);
                Message::Config(ConfigBody { name, config })
            }
            MessageKind::Command => {
                let command_id = body.get_u8();
                let fragment_index = body.get_u8();
                let flags = body.get_u8();
                let len = body.get_u8();
                if len as usize > FRAGMENT_SIZE {
                    return Err(DecodeError::InvalidFragmentLength(len));
                }
                Message::Command(Command {
                    command_id,
                    fragment_index,
                    is_final: flags & FLAG_FINAL != 0,
                    data: body[..len as usize].to_vec(),
                })
            }
            MessageKind::Status => {
                let command_id = body.get_u8();
                let status_code = body.get_u8();
                let mut data = [0u8; STATUS_DATA_LEN];
                body.copy_to_slice(&mut data);
                Message::Status(Status {
                    command_id,
                    status_code,
                    data,
                })
            }
            MessageKind::Heartbeat => Message::Heartbeat(Heartbeat {
                health: body.get_u8(),
                uptime_minutes: body.get_u16_le(),
            }),
            MessageKind::Unmap => Message::Unmap(Unmap {
                reason: body.get_u8(),
            }),
        };

        Ok(Frame { header, message })
    }
}

/// Parse only the 8 byte header.
pub fn decode_header(bytes: &[u8]) -> Result<FrameHeader, DecodeError> {
    if bytes.len() < HEADER_LEN {
        return Err(DecodeError::TooShort {
            expected: HEADER_LEN,
            found: bytes.len(),
        });
    }
    let mut buf = &bytes[..HEADER_LEN];
    let kind_byte = buf.get_u8();
    let kind = MessageKind::from_u8(kind_byte).ok_or(DecodeError::UnknownKind(kind_byte))?;
    Ok(FrameHeader {
        kind,
        tank_id: buf.get_u8(),
        node_type: NodeType::from_u8(buf.get_u8()),
        timestamp: buf.get_u32_le(),
        seq: buf.get_u8(),
    })
}

/// Longest prefix of `name` that fits the name field with its NUL terminator.
fn truncate_name(name: &str) -> &str {
    let mut end = name.len().min(MAX_NODE_NAME_LEN - 1);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}
