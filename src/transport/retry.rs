//! Hub-side queue of sends waiting for another attempt.
//!
//! Entries are evaluated once per processing tick. The first retry happens
//! `base` after enqueueing; every failed retry doubles the wait. An entry is
//! removed on success or once its attempts are used up.
use crate::protocol::MacAddress;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryContext {
    pub dest: MacAddress,
    pub payload: Vec<u8>,
    pub attempts_remaining: u8,
    /// Epoch milliseconds after which the entry is due.
    pub next_retry_at: u64,
}

#[derive(Debug)]
pub struct RetryQueue {
    entries: Vec<RetryContext>,
    max_attempts: u8,
    base_delay_ms: u64,
}

impl RetryQueue {
    pub fn new(max_attempts: u8, base_delay_ms: u64) -> Self {
        Self {
            entries: Vec::new(),
            max_attempts,
            base_delay_ms,
        }
    }

    pub fn push(&mut self, dest: MacAddress, payload: Vec<u8>, now: u64) {
        self.entries.push(RetryContext {
            dest,
            payload,
            attempts_remaining: self.max_attempts,
            next_retry_at: now + self.base_delay_ms,
        });
    }

    /// Remove and return every entry whose deadline has passed.
    pub fn take_due(&mut self, now: u64) -> Vec<RetryContext> {
        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|c| now >= c.next_retry_at);
        self.entries = waiting;
        due
    }

    /// Put back an entry whose retry failed. Returns false when it is exhausted
    /// and has been dropped instead.
    pub fn reschedule(&mut self, mut ctx: RetryContext, now: u64) -> bool {
        ctx.attempts_remaining = ctx.attempts_remaining.saturating_sub(1);
        if ctx.attempts_remaining == 0 {
            return false;
        }
        let used = u32::from(self.max_attempts - ctx.attempts_remaining);
        ctx.next_retry_at = now + self.base_delay_ms * 2u64.pow(used);
        self.entries.push(ctx);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pending_for(&self, dest: &MacAddress) -> usize {
        self.entries.iter().filter(|c| &c.dest == dest).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEST: MacAddress = MacAddress::new([9, 9, 9, 9, 9, 9]);

    #[test]
    fn backoff_doubles_until_exhausted() {
        let mut q = RetryQueue::new(3, 100);
        q.push(DEST, vec![1], 1_000);
        assert!(q.take_due(1_099).is_empty());

        let ctx = q.take_due(1_100).remove(0);
        assert!(q.reschedule(ctx, 1_100));
        assert!(q.take_due(1_299).is_empty());

        let ctx = q.take_due(1_300).remove(0);
        assert_eq!(ctx.attempts_remaining, 2);
        assert!(q.reschedule(ctx, 1_300));

        let ctx = q.take_due(1_700).remove(0);
        assert!(!q.reschedule(ctx, 1_700));
        assert!(q.is_empty());
    }

    #[test]
    fn only_due_entries_are_taken() {
        let mut q = RetryQueue::new(3, 100);
        q.push(DEST, vec![1], 0);
        q.push(DEST, vec![2], 500);
        let due = q.take_due(100);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].payload, vec![1]);
        assert_eq!(q.pending_for(&DEST), 1);
    }
}
