//! Process-wide counters for the hub.
//! Per-transport statistics live in [`crate::transport::TransportStats`]; these
//! atomics aggregate across instances and are cheap to bump from any thread,
//! including the link driver's receive context.
use std::sync::atomic::{AtomicU64, Ordering};

static RX_QUEUE_OVERFLOW: AtomicU64 = AtomicU64::new(0);
static RETRIES_SCHEDULED: AtomicU64 = AtomicU64::new(0);
static RETRIES_EXHAUSTED: AtomicU64 = AtomicU64::new(0);
static FAILSAFES_TRIGGERED: AtomicU64 = AtomicU64::new(0);
static NOTIFICATIONS_EMITTED: AtomicU64 = AtomicU64::new(0);
static SCHEDULES_EXECUTED: AtomicU64 = AtomicU64::new(0);

pub fn inc_rx_queue_overflow() {
    RX_QUEUE_OVERFLOW.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_retries_scheduled() {
    RETRIES_SCHEDULED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_retries_exhausted() {
    RETRIES_EXHAUSTED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_failsafes_triggered() {
    FAILSAFES_TRIGGERED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_notifications_emitted() {
    NOTIFICATIONS_EMITTED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_schedules_executed() {
    SCHEDULES_EXECUTED.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct Snapshot {
    pub rx_queue_overflow: u64,
    pub retries_scheduled: u64,
    pub retries_exhausted: u64,
    pub failsafes_triggered: u64,
    pub notifications_emitted: u64,
    pub schedules_executed: u64,
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        rx_queue_overflow: RX_QUEUE_OVERFLOW.load(Ordering::Relaxed),
        retries_scheduled: RETRIES_SCHEDULED.load(Ordering::Relaxed),
        retries_exhausted: RETRIES_EXHAUSTED.load(Ordering::Relaxed),
        failsafes_triggered: FAILSAFES_TRIGGERED.load(Ordering::Relaxed),
        notifications_emitted: NOTIFICATIONS_EMITTED.load(Ordering::Relaxed),
        schedules_executed: SCHEDULES_EXECUTED.load(Ordering::Relaxed),
    }
}
