//! Bounded inbound frame queue between a link driver and the transport.
//!
//! [`FrameSender::on_frame_received`] never blocks and may be called from any
//! thread (serial reader thread, in-memory medium). A full queue drops the
//! frame and counts it; heartbeats and announces are periodic, so a lost frame
//! is repaired by the next one.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::trace;
use tokio::sync::mpsc;

use crate::metrics;
use crate::protocol::MacAddress;

/// One frame as handed over by the radio, before decoding.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub from: MacAddress,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<RawFrame>,
    dropped: Arc<AtomicU64>,
}

impl FrameSender {
    /// Queue a received frame. Returns false when the frame was dropped.
    pub fn on_frame_received(&self, from: MacAddress, bytes: &[u8]) -> bool {
        match self.tx.try_send(RawFrame {
            from,
            bytes: bytes.to_vec(),
        }) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::inc_rx_queue_overflow();
                trace!("RX queue full, dropped frame from {}", from);
                false
            }
            // consumer gone; nothing left to count for
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

#[derive(Debug)]
pub struct FrameReceiver {
    rx: mpsc::Receiver<RawFrame>,
    dropped: Arc<AtomicU64>,
}

impl FrameReceiver {
    pub fn try_recv(&mut self) -> Option<RawFrame> {
        self.rx.try_recv().ok()
    }

    /// Wait for the next frame; `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<RawFrame> {
        self.rx.recv().await
    }

    /// Frames dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Create a queue holding at most `capacity` undrained frames (minimum 1).
pub fn rx_queue(capacity: usize) -> (FrameSender, FrameReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    (
        FrameSender {
            tx,
            dropped: dropped.clone(),
        },
        FrameReceiver { rx, dropped },
    )
}
