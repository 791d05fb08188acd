//! SLIP framing for the serial radio bridge.
//!
//! The bridge is a small radio co-processor attached over UART. Each record in
//! either direction is one SLIP frame carrying
//!
//!   `<peer mac: 6 bytes><radio frame bytes><crc16 LE: 2 bytes>`
//!
//! where the CRC (CRC-16/IBM-SDLC) covers the address and the radio frame.
//! Records failing the CRC or shorter than address + checksum are dropped.
use crc::{Crc, CRC_16_IBM_SDLC};

use crate::protocol::MacAddress;

pub const END: u8 = 0xC0;
pub const ESC: u8 = 0xDB;
pub const ESC_END: u8 = 0xDC;
pub const ESC_ESC: u8 = 0xDD;

const BRIDGE_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_SDLC);
/// Decoded records larger than this are discarded while still being read.
const MAX_RECORD: usize = 6 + crate::protocol::MAX_FRAME_LEN + 2;

#[derive(Debug, Default)]
pub struct SlipDecoder {
    buf: Vec<u8>,
    esc: bool,
    overflow: bool,
}

impl SlipDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push raw serial bytes, returning any completed (unescaped) records.
    pub fn push(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        for &b in data {
            if self.esc {
                self.esc = false;
                match b {
                    ESC_END => self.put(END),
                    ESC_ESC => self.put(ESC),
                    // protocol violation: poison the current record
                    _ => self.overflow = true,
                }
                continue;
            }
            match b {
                END => {
                    if !self.buf.is_empty() && !self.overflow {
                        frames.push(std::mem::take(&mut self.buf));
                    }
                    self.buf.clear();
                    self.overflow = false;
                }
                ESC => self.esc = true,
                _ => self.put(b),
            }
        }
        frames
    }

    fn put(&mut self, b: u8) {
        if self.buf.len() >= MAX_RECORD {
            self.overflow = true;
            return;
        }
        self.buf.push(b);
    }
}

pub fn slip_encode(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.push(END);
    for &b in payload {
        match b {
            END => out.extend_from_slice(&[ESC, ESC_END]),
            ESC => out.extend_from_slice(&[ESC, ESC_ESC]),
            _ => out.push(b),
        }
    }
    out.push(END);
    out
}

/// Build the SLIP-encoded bridge record for one radio frame.
pub fn encode_record(peer: &MacAddress, frame: &[u8]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(6 + frame.len() + 2);
    raw.extend_from_slice(peer.as_bytes());
    raw.extend_from_slice(frame);
    let crc = BRIDGE_CRC.checksum(&raw);
    raw.extend_from_slice(&crc.to_le_bytes());
    slip_encode(&raw)
}

/// Split an unescaped record into sender address and radio frame, verifying the CRC.
pub fn decode_record(record: &[u8]) -> Option<(MacAddress, Vec<u8>)> {
    if record.len() < 6 + 2 {
        return None;
    }
    let (body, crc_bytes) = record.split_at(record.len() - 2);
    let crc = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
    if BRIDGE_CRC.checksum(body) != crc {
        return None;
    }
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&body[..6]);
    Some((MacAddress::new(mac), body[6..].to_vec()))
}
