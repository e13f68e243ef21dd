//! Bounded, sequence-tagged output buffer for one agent process.
//!
//! Lines carry strictly monotonic sequence numbers that survive eviction
//! and `clear()`. The summed payload size never exceeds the ceiling:
//! oversized lines are truncated, and writes evict the oldest lines
//! until they fit.

use chrono::Utc;
use coven_core::{OutputLine, OutputStream};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Default per-process ceiling (10 MiB).
pub const DEFAULT_CEILING_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Default)]
struct RingInner {
    lines: VecDeque<OutputLine>,
    total_bytes: usize,
    next_sequence: u64,
}

/// Thread-safe output ring. Readers receive consistent snapshots;
/// concurrent writers serialise on the internal lock.
#[derive(Debug)]
pub struct OutputRing {
    ceiling: usize,
    inner: Mutex<RingInner>,
}

impl OutputRing {
    pub fn new(ceiling: usize) -> Self {
        Self {
            ceiling: ceiling.max(1),
            inner: Mutex::new(RingInner::default()),
        }
    }

    pub fn with_default_ceiling() -> Self {
        Self::new(DEFAULT_CEILING_BYTES)
    }

    /// Append a line, returning its sequence number.
    pub fn write(&self, stream: OutputStream, data: &str) -> u64 {
        let mut data = data.to_string();
        if data.len() > self.ceiling {
            data = truncate_to_boundary(&data, self.ceiling);
        }

        let mut inner = self.lock();
        while inner.total_bytes + data.len() > self.ceiling {
            let Some(evicted) = inner.lines.pop_front() else {
                break;
            };
            inner.total_bytes -= evicted.data.len();
        }

        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        inner.total_bytes += data.len();
        inner.lines.push_back(OutputLine {
            sequence,
            timestamp: Utc::now(),
            stream,
            data,
        });
        sequence
    }

    /// Snapshot of all retained lines, oldest first.
    pub fn get_all(&self) -> Vec<OutputLine> {
        self.lock().lines.iter().cloned().collect()
    }

    /// Fetch one retained line by sequence, if it has not been evicted.
    pub fn get(&self, sequence: u64) -> Option<OutputLine> {
        self.lock()
            .lines
            .iter()
            .find(|l| l.sequence == sequence)
            .cloned()
    }

    /// Snapshot of retained lines with `sequence > after_seq`.
    pub fn get_since(&self, after_seq: u64) -> Vec<OutputLine> {
        self.lock()
            .lines
            .iter()
            .filter(|l| l.sequence > after_seq)
            .cloned()
            .collect()
    }

    /// Summed payload bytes currently retained.
    pub fn size(&self) -> usize {
        self.lock().total_bytes
    }

    pub fn line_count(&self) -> usize {
        self.lock().lines.len()
    }

    /// Highest sequence assigned so far, or `None` before the first write.
    pub fn last_sequence(&self) -> Option<u64> {
        let inner = self.lock();
        inner.next_sequence.checked_sub(1)
    }

    /// Drop all retained lines. The sequence counter does not rewind.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.lines.clear();
        inner.total_bytes = 0;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RingInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Truncate to at most `max` bytes on a char boundary.
fn truncate_to_boundary(s: &str, max: usize) -> String {
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}
