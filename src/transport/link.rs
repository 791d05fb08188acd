//! Link drivers: the raw, unreliable radio underneath [`super::Transport`].
//!
//! A driver only has to push one frame at a time towards an address and hand
//! received frames to a [`FrameSender`]. Three drivers exist:
//!
//! * [`MemoryLink`] on a shared [`MemoryMedium`], used by tests and the
//!   simulator. Supports loss injection.
//! * [`OfflineLink`] for running a hub without a radio attached.
//! * `SerialBridgeLink` (feature `serial`), a UART-attached radio co-processor
//!   speaking SLIP records (see [`super::slip`]).
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use log::trace;

use super::rx::FrameSender;
use crate::errors::LinkError;
use crate::logutil::hex_preview;
use crate::protocol::MacAddress;

pub trait LinkDriver: Send {
    /// Transmit one frame. Success means the radio accepted it, not that it arrived.
    fn raw_send(&mut self, dest: &MacAddress, frame: &[u8]) -> Result<(), LinkError>;
}

impl<T: LinkDriver + ?Sized> LinkDriver for Box<T> {
    fn raw_send(&mut self, dest: &MacAddress, frame: &[u8]) -> Result<(), LinkError> {
        (**self).raw_send(dest, frame)
    }
}

/// A frame observed on the in-memory medium.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmission {
    pub from: MacAddress,
    pub to: MacAddress,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Default)]
struct MediumInner {
    stations: HashMap<MacAddress, FrameSender>,
    /// Stations whose radio refuses to transmit.
    down: HashSet<MacAddress>,
    /// Per-sender count of upcoming sends that fail at the radio.
    fail_sends: HashMap<MacAddress, usize>,
    /// Upcoming transmissions accepted by the radio but lost in the air.
    drop_in_air: usize,
    log: Vec<Transmission>,
}

/// Shared in-memory "air" connecting any number of [`MemoryLink`]s.
#[derive(Debug, Clone, Default)]
pub struct MemoryMedium {
    inner: Arc<Mutex<MediumInner>>,
}

impl MemoryMedium {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MediumInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attach a station; frames addressed to `mac` (or broadcast) go to `sink`.
    pub fn attach(&self, mac: MacAddress, sink: FrameSender) -> MemoryLink {
        self.lock().stations.insert(mac, sink);
        MemoryLink {
            mac,
            medium: self.clone(),
        }
    }

    pub fn detach(&self, mac: &MacAddress) {
        self.lock().stations.remove(mac);
    }

    /// Make the next `count` sends from `mac` fail at the radio.
    pub fn fail_next_sends(&self, mac: MacAddress, count: usize) {
        self.lock().fail_sends.insert(mac, count);
    }

    /// Silently lose the next `count` transmissions (the sender sees success).
    pub fn drop_next(&self, count: usize) {
        self.lock().drop_in_air = count;
    }

    pub fn set_down(&self, mac: MacAddress, down: bool) {
        let mut inner = self.lock();
        if down {
            inner.down.insert(mac);
        } else {
            inner.down.remove(&mac);
        }
    }

    /// Every transmission accepted so far, in order.
    pub fn transmissions(&self) -> Vec<Transmission> {
        self.lock().log.clone()
    }

    pub fn clear_transmissions(&self) {
        self.lock().log.clear();
    }

    fn transmit(&self, from: MacAddress, to: &MacAddress, frame: &[u8]) -> Result<(), LinkError> {
        let mut inner = self.lock();
        if inner.down.contains(&from) {
            return Err(LinkError::Closed);
        }
        if let Some(left) = inner.fail_sends.get_mut(&from) {
            if *left > 0 {
                *left -= 1;
                return Err(LinkError::Rejected("injected failure".to_string()));
            }
        }
        if !to.is_broadcast() && !inner.stations.contains_key(to) {
            return Err(LinkError::Rejected(format!("no station {}", to)));
        }
        inner.log.push(Transmission {
            from,
            to: *to,
            bytes: frame.to_vec(),
        });
        if inner.drop_in_air > 0 {
            inner.drop_in_air -= 1;
            trace!("medium: lost frame {} -> {}", from, to);
            return Ok(());
        }
        for (mac, sink) in inner.stations.iter() {
            if *mac != from && (to.is_broadcast() || mac == to) {
                sink.on_frame_received(from, frame);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct MemoryLink {
    mac: MacAddress,
    medium: MemoryMedium,
}

impl MemoryLink {
    pub fn address(&self) -> MacAddress {
        self.mac
    }
}

impl LinkDriver for MemoryLink {
    fn raw_send(&mut self, dest: &MacAddress, frame: &[u8]) -> Result<(), LinkError> {
        trace!("{} -> {}: {}", self.mac, dest, hex_preview(frame, 16));
        self.medium.transmit(self.mac, dest, frame)
    }
}

/// Radio-less driver: every send fails with [`LinkError::Closed`].
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineLink;

impl LinkDriver for OfflineLink {
    fn raw_send(&mut self, _dest: &MacAddress, _frame: &[u8]) -> Result<(), LinkError> {
        Err(LinkError::Closed)
    }
}

#[cfg(feature = "serial")]
pub use serial_bridge::SerialBridgeLink;

#[cfg(feature = "serial")]
mod serial_bridge {
    use std::io::{Read, Write};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread::JoinHandle;
    use std::time::Duration;

    use anyhow::{anyhow, Result};
    use log::{debug, info, warn};
    use serialport::SerialPort;

    use super::super::rx::FrameSender;
    use super::super::slip::{decode_record, encode_record, SlipDecoder};
    use super::LinkDriver;
    use crate::errors::LinkError;
    use crate::protocol::MacAddress;

    /// Radio co-processor on a serial port. A background thread reads SLIP
    /// records and queues the frames they carry.
    pub struct SerialBridgeLink {
        port: Box<dyn SerialPort>,
        stop: Arc<AtomicBool>,
        reader: Option<JoinHandle<()>>,
    }

    impl SerialBridgeLink {
        pub fn open(port_name: &str, baud_rate: u32, sink: FrameSender) -> Result<Self> {
            debug!("Opening radio bridge {} at {} baud", port_name, baud_rate);
            let mut builder = serialport::new(port_name, baud_rate).timeout(Duration::from_millis(500));
            #[cfg(unix)]
            {
                builder = builder
                    .data_bits(serialport::DataBits::Eight)
                    .stop_bits(serialport::StopBits::One)
                    .parity(serialport::Parity::None);
            }
            let port = builder
                .open()
                .map_err(|e| anyhow!("Failed to open serial port {}: {}", port_name, e))?;
            let reader_port = port
                .try_clone()
                .map_err(|e| anyhow!("Failed to clone serial port {}: {}", port_name, e))?;

            let stop = Arc::new(AtomicBool::new(false));
            let reader_stop = stop.clone();
            let reader = std::thread::Builder::new()
                .name("radio-bridge-rx".to_string())
                .spawn(move || read_loop(reader_port, sink, reader_stop))
                .map_err(|e| anyhow!("Failed to start bridge reader: {}", e))?;

            info!("Radio bridge ready on {}", port_name);
            Ok(Self {
                port,
                stop,
                reader: Some(reader),
            })
        }
    }

    fn read_loop(mut port: Box<dyn SerialPort>, sink: FrameSender, stop: Arc<AtomicBool>) {
        let mut decoder = SlipDecoder::new();
        let mut buf = [0u8; 512];
        while !stop.load(Ordering::Relaxed) {
            match port.read(&mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    for record in decoder.push(&buf[..n]) {
                        match decode_record(&record) {
                            Some((from, frame)) => {
                                sink.on_frame_received(from, &frame);
                            }
                            None => debug!("Dropping corrupt bridge record ({} bytes)", record.len()),
                        }
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => {
                    warn!("Serial read error (continuing): {}", e);
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        }
        debug!("Bridge reader stopped");
    }

    impl LinkDriver for SerialBridgeLink {
        fn raw_send(&mut self, dest: &MacAddress, frame: &[u8]) -> Result<(), LinkError> {
            let record = encode_record(dest, frame);
            self.port.write_all(&record)?;
            self.port.flush()?;
            Ok(())
        }
    }

    impl Drop for SerialBridgeLink {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::Relaxed);
            if let Some(handle) = self.reader.take() {
                let _ = handle.join();
            }
        }
    }
}
