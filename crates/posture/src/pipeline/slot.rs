//! Single-slot, latest-wins hand-off between the producer and viewers.
//!
//! The slot holds at most one value. `put` overwrites whatever is there and
//! never waits on readers. Each reader keeps its own cursor, so every reader
//! sees the newest value independently of the others; readers that fall
//! behind skip intermediate values.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

struct SlotState<T> {
    value: Option<Arc<T>>,
    sequence: u64,
    closed: bool,
}

struct SlotInner<T> {
    state: Mutex<SlotState<T>>,
    ready: Condvar,
}

/// Overwrite buffer of capacity one with broadcast reads.
pub struct LatestSlot<T> {
    inner: Arc<SlotInner<T>>,
}

impl<T> Clone for LatestSlot<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for LatestSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LatestSlot<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SlotInner {
                state: Mutex::new(SlotState {
                    value: None,
                    sequence: 0,
                    closed: false,
                }),
                ready: Condvar::new(),
            }),
        }
    }

    /// Replace the visible value and wake every waiting reader. Returns the
    /// slot sequence stamped on `value`.
    pub fn put(&self, value: T) -> u64 {
        let value = Arc::new(value);
        let sequence = {
            let mut state = self.inner.state.lock();
            state.sequence = state.sequence.wrapping_add(1);
            state.value = Some(value);
            state.sequence
        };
        self.inner.ready.notify_all();
        sequence
    }

    /// Current value without consuming it for any reader.
    pub fn latest(&self) -> Option<Arc<T>> {
        self.inner.state.lock().value.clone()
    }

    /// Sequence of the most recent `put` (0 before the first).
    pub fn sequence(&self) -> u64 {
        self.inner.state.lock().sequence
    }

    /// A new independent reader. Its first `try_take` returns the current
    /// value, if any.
    pub fn reader(&self) -> SlotReader<T> {
        SlotReader {
            inner: self.inner.clone(),
            last_seen: 0,
        }
    }

    /// Wake all readers; subsequent `try_take` calls return `None` at once.
    pub fn close(&self) {
        self.inner.state.lock().closed = true;
        self.inner.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }
}

/// Cursor over a [`LatestSlot`]. Never yields the same value twice.
pub struct SlotReader<T> {
    inner: Arc<SlotInner<T>>,
    last_seen: u64,
}

impl<T> SlotReader<T> {
    /// Wait up to `timeout` for a value newer than the last one this reader
    /// returned. `None` means nothing new arrived (or the slot is closed).
    pub fn try_take(&mut self, timeout: Duration) -> Option<Arc<T>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if state.closed {
                return None;
            }
            if state.sequence != self.last_seen {
                if let Some(value) = state.value.clone() {
                    self.last_seen = state.sequence;
                    return Some(value);
                }
            }
            if self.inner.ready.wait_until(&mut state, deadline).timed_out() {
                // One last look: a put may have raced the timeout.
                if !state.closed && state.sequence != self.last_seen {
                    if let Some(value) = state.value.clone() {
                        self.last_seen = state.sequence;
                        return Some(value);
                    }
                }
                return None;
            }
        }
    }

    /// Slot sequence of the last value this reader returned.
    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }
}
