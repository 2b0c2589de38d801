//! Bounded, blocking ring buffers of reusable raw-buffer frames.
//!
//! Raw buffers move between daemons exclusively through these rings, one
//! producer and one consumer per ring. Each slot owns a fixed-capacity
//! frame that is reused in place — `put` copies into the slot, `get` copies
//! out into the consumer's own scratch frame — so sustained throughput
//! causes no per-buffer allocation.
//!
//! A ring can be constructed *disabled* (storage turned off online): both
//! sides return immediately with a sentinel outcome instead of blocking, so
//! a dead storage path never stalls the pipeline.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// A fixed-capacity block of raw words received from the front end.
///
/// The allocation is made once and reused; `len` tracks the live payload.
#[derive(Debug)]
pub struct RawBuffer {
    data: Box<[u8]>,
    len: usize,
}

impl RawBuffer {
    /// Allocate an empty frame of the given byte capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    /// Byte capacity of the frame.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Live payload length.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when no payload is present.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The live payload.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Copy `src` into the frame, replacing the previous payload. Payloads
    /// longer than the frame capacity are truncated.
    pub fn fill_from(&mut self, src: &[u8]) {
        let n = src.len().min(self.data.len());
        self.data[..n].copy_from_slice(&src[..n]);
        self.len = n;
    }

    /// Full backing storage, for `recv`-style APIs that write in place.
    pub fn storage_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Set the live payload length after an in-place write.
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.data.len());
    }

    /// Drop the payload, keeping the allocation.
    pub fn clear(&mut self) {
        self.len = 0;
    }
}

/// Result of a `put` attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The payload was copied into a slot.
    Stored,
    /// The ring is disabled; nothing was stored and nothing blocked.
    Disabled,
    /// The ring was closed for shutdown.
    Closed,
    /// The ring stayed full for the whole timeout.
    TimedOut,
}

/// Result of a `get` attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetOutcome {
    /// A payload of this many bytes was copied into the caller's frame.
    Received(usize),
    /// The ring is disabled; there will never be data.
    Disabled,
    /// The ring was closed for shutdown.
    Closed,
    /// The ring stayed empty for the whole timeout.
    TimedOut,
}

#[derive(Debug)]
struct RingState {
    frames: Vec<RawBuffer>,
    put_cursor: usize,
    get_cursor: usize,
    occupied: usize,
    closed: bool,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<RingState>,
    not_full: Condvar,
    not_empty: Condvar,
}

/// Bounded blocking queue of reusable frames, or a disabled placeholder.
///
/// Cloning shares the same ring; the clone is how the producing and
/// consuming daemons each hold an endpoint.
#[derive(Debug, Clone)]
pub struct RingBuffer {
    name: Arc<str>,
    inner: Option<Arc<Inner>>,
}

impl RingBuffer {
    /// Create an enabled ring of `capacity` slots, each `frame_bytes` wide.
    pub fn new(name: &str, capacity: usize, frame_bytes: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be at least 1");
        let frames = (0..capacity)
            .map(|_| RawBuffer::with_capacity(frame_bytes))
            .collect();
        Self {
            name: Arc::from(name),
            inner: Some(Arc::new(Inner {
                state: Mutex::new(RingState {
                    frames,
                    put_cursor: 0,
                    get_cursor: 0,
                    occupied: 0,
                    closed: false,
                }),
                not_full: Condvar::new(),
                not_empty: Condvar::new(),
            })),
        }
    }

    /// Create a disabled ring whose `put`/`get` return immediately.
    pub fn disabled(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            inner: None,
        }
    }

    /// The ring's name, used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True for rings built with [`RingBuffer::disabled`].
    pub fn is_disabled(&self) -> bool {
        self.inner.is_none()
    }

    /// Slot count (0 for a disabled ring).
    pub fn capacity(&self) -> usize {
        self.inner
            .as_ref()
            .map_or(0, |inner| inner.state.lock().frames.len())
    }

    /// True when no payloads are queued. A disabled ring is always empty.
    pub fn is_empty(&self) -> bool {
        self.inner
            .as_ref()
            .map_or(true, |inner| inner.state.lock().occupied == 0)
    }

    /// Copy a payload into the next free slot, blocking while the ring is
    /// full.
    pub fn put(&self, payload: &[u8]) -> PutOutcome {
        self.put_inner(payload, None)
    }

    /// Like [`RingBuffer::put`] but gives up after `timeout`, so daemon
    /// loops can interleave state polls.
    pub fn put_timeout(&self, payload: &[u8], timeout: Duration) -> PutOutcome {
        self.put_inner(payload, Some(timeout))
    }

    fn put_inner(&self, payload: &[u8], timeout: Option<Duration>) -> PutOutcome {
        let Some(inner) = self.inner.as_ref() else {
            return PutOutcome::Disabled;
        };
        let mut state = inner.state.lock();
        loop {
            if state.closed {
                return PutOutcome::Closed;
            }
            if state.occupied < state.frames.len() {
                break;
            }
            match timeout {
                Some(t) => {
                    if inner.not_full.wait_for(&mut state, t).timed_out() {
                        return PutOutcome::TimedOut;
                    }
                }
                None => inner.not_full.wait(&mut state),
            }
        }
        let state = &mut *state;
        let idx = state.put_cursor;
        state.frames[idx].fill_from(payload);
        state.put_cursor = (idx + 1) % state.frames.len();
        state.occupied += 1;
        trace!(ring = %self.name, slot = idx, bytes = payload.len(), "buffer stored");
        inner.not_empty.notify_one();
        PutOutcome::Stored
    }

    /// Copy the oldest payload into the caller's scratch frame, blocking
    /// while the ring is empty.
    pub fn get(&self, out: &mut RawBuffer) -> GetOutcome {
        self.get_inner(out, None)
    }

    /// Like [`RingBuffer::get`] but gives up after `timeout`.
    pub fn get_timeout(&self, out: &mut RawBuffer, timeout: Duration) -> GetOutcome {
        self.get_inner(out, Some(timeout))
    }

    fn get_inner(&self, out: &mut RawBuffer, timeout: Option<Duration>) -> GetOutcome {
        let Some(inner) = self.inner.as_ref() else {
            return GetOutcome::Disabled;
        };
        let mut state = inner.state.lock();
        loop {
            if state.occupied > 0 {
                break;
            }
            if state.closed {
                // Drain-then-close: queued payloads are still delivered.
                return GetOutcome::Closed;
            }
            match timeout {
                Some(t) => {
                    if inner.not_empty.wait_for(&mut state, t).timed_out() {
                        return GetOutcome::TimedOut;
                    }
                }
                None => inner.not_empty.wait(&mut state),
            }
        }
        let state = &mut *state;
        let idx = state.get_cursor;
        out.fill_from(state.frames[idx].as_slice());
        state.frames[idx].clear();
        state.get_cursor = (idx + 1) % state.frames.len();
        state.occupied -= 1;
        trace!(ring = %self.name, slot = idx, bytes = out.len(), "buffer taken");
        inner.not_full.notify_one();
        GetOutcome::Received(out.len())
    }

    /// Discard any queued payloads, keeping the slot allocations. Used to
    /// reuse a ring across runs.
    pub fn reset(&self) {
        if let Some(inner) = self.inner.as_ref() {
            let mut state = inner.state.lock();
            for frame in &mut state.frames {
                frame.clear();
            }
            state.put_cursor = 0;
            state.get_cursor = 0;
            state.occupied = 0;
            inner.not_full.notify_all();
        }
    }

    /// Close the ring for shutdown, waking all blocked producers and
    /// consumers. Consumers still drain queued payloads before seeing
    /// `Closed`.
    pub fn close(&self) {
        if let Some(inner) = self.inner.as_ref() {
            let mut state = inner.state.lock();
            state.closed = true;
            inner.not_full.notify_all();
            inner.not_empty.notify_all();
        }
    }
}
