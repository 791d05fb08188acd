//! Node-side reassembly of fragmented Command transfers.
//!
//! A node holds at most one transfer in flight. Fragment 0 always starts a new
//! transfer, discarding whatever was there. Later fragments must carry the
//! same command id and the next expected index; anything else discards the
//! whole transfer. The timeout is measured from the first fragment.
use crate::protocol::{Command, MacAddress, MAX_MESSAGE_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Continuation fragment without a transfer in progress.
    NoTransfer,
    /// Command id, sender or index did not match the transfer.
    Mismatch,
    /// Accumulated payload would exceed the maximum message size.
    Overflow,
}

#[derive(Debug, PartialEq, Eq)]
pub enum FragmentOutcome {
    Pending,
    Complete { command_id: u8, payload: Vec<u8> },
    Dropped(DropReason),
}

#[derive(Debug)]
struct ReassemblyContext {
    command_id: u8,
    expected_index: u8,
    started_at: u64,
    buffer: Vec<u8>,
    from: MacAddress,
}

#[derive(Debug)]
pub struct Reassembler {
    active: Option<ReassemblyContext>,
    timeout_ms: u64,
}

impl Reassembler {
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            active: None,
            timeout_ms,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Discard a transfer older than the timeout. Returns true if one was discarded.
    pub fn expire(&mut self, now: u64) -> bool {
        match &self.active {
            Some(ctx) if now.saturating_sub(ctx.started_at) > self.timeout_ms => {
                self.active = None;
                true
            }
            _ => false,
        }
    }

    pub fn accept(&mut self, from: MacAddress, fragment: &Command, now: u64) -> FragmentOutcome {
        if fragment.fragment_index == 0 {
            if fragment.is_final {
                self.active = None;
                return FragmentOutcome::Complete {
                    command_id: fragment.command_id,
                    payload: fragment.data.clone(),
                };
            }
            self.active = Some(ReassemblyContext {
                command_id: fragment.command_id,
                expected_index: 1,
                started_at: now,
                buffer: fragment.data.clone(),
                from,
            });
            return FragmentOutcome::Pending;
        }

        let Some(ctx) = self.active.as_mut() else {
            return FragmentOutcome::Dropped(DropReason::NoTransfer);
        };
        if ctx.command_id != fragment.command_id
            || ctx.expected_index != fragment.fragment_index
            || ctx.from != from
        {
            self.active = None;
            return FragmentOutcome::Dropped(DropReason::Mismatch);
        }
        if ctx.buffer.len() + fragment.data.len() > MAX_MESSAGE_SIZE {
            self.active = None;
            return FragmentOutcome::Dropped(DropReason::Overflow);
        }
        ctx.buffer.extend_from_slice(&fragment.data);
        ctx.expected_index = ctx.expected_index.wrapping_add(1);

        if fragment.is_final {
            let done = self.active.take();
            return match done {
                Some(ctx) => FragmentOutcome::Complete {
                    command_id: ctx.command_id,
                    payload: ctx.buffer,
                },
                None => FragmentOutcome::Dropped(DropReason::NoTransfer),
            };
        }
        FragmentOutcome::Pending
    }
}
