//! Sorter daemon: decodes raw buffers and drives the analysis routine.
//!
//! The loop takes one raw buffer at a time from the sorting ring, binds a
//! word cursor to it and calls the input codec's `read_event` until a
//! buffer boundary status comes back. Each complete event bumps the
//! received counter, passes the sampling gate (1 of every K), and goes to
//! the routine's `sort`; accepted events are re-encoded through the output
//! codec and the sealed frames queued on the storage ring.
//!
//! Failure handling follows the taxonomy: decode errors abandon the
//! current buffer and the daemon moves on; routine failures are recorded
//! on the handle for the run controller and stop the daemon.

use super::POLL_INTERVAL;
use crate::codec::{Event, EventInput, EventInputStatus, EventOutput, WordCursor};
use crate::error::DaqError;
use crate::ring::{GetOutcome, PutOutcome, RawBuffer, RingBuffer};
use crate::sort::{DiscardAcceptor, EventAcceptor, SortError, SortRoutine};
use crate::worker::{StateControl, Worker, WorkerState};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Sorter counters: raw and processed event counts are tracked separately
/// so the sampling behavior is observable.
#[derive(Debug, Default)]
pub struct SorterStats {
    buffers: AtomicU64,
    events_received: AtomicU64,
    events_sorted: AtomicU64,
    scaler_blocks: AtomicU64,
    unknown_words: AtomicU64,
    decode_errors: AtomicU64,
}

/// Point-in-time copy of the sorter counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SorterSnapshot {
    /// Raw buffers decoded.
    pub buffers: u64,
    /// Events decoded (pre-sampling).
    pub events_received: u64,
    /// Events passed to the analysis routine.
    pub events_sorted: u64,
    /// Scaler statuses observed.
    pub scaler_blocks: u64,
    /// Words no classification matched.
    pub unknown_words: u64,
    /// Buffers abandoned on a decode error.
    pub decode_errors: u64,
}

impl SorterStats {
    fn snapshot(&self) -> SorterSnapshot {
        SorterSnapshot {
            buffers: self.buffers.load(Ordering::Relaxed),
            events_received: self.events_received.load(Ordering::Relaxed),
            events_sorted: self.events_sorted.load(Ordering::Relaxed),
            scaler_blocks: self.scaler_blocks.load(Ordering::Relaxed),
            unknown_words: self.unknown_words.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
        }
    }
}

/// Write path: re-encodes accepted events and queues sealed frames on the
/// storage ring.
pub struct EventWriter {
    codec: Box<dyn EventOutput>,
    ring: RingBuffer,
    frame: Vec<u8>,
}

impl EventWriter {
    /// Build a writer over an output codec and the storage ring.
    pub fn new(codec: Box<dyn EventOutput>, ring: RingBuffer) -> Self {
        Self {
            codec,
            ring,
            frame: Vec::new(),
        }
    }

    fn put_sealed(&mut self) -> Result<(), SortError> {
        match self.ring.put(&self.frame) {
            PutOutcome::Stored | PutOutcome::Disabled => {
                self.frame.clear();
                Ok(())
            }
            PutOutcome::Closed => Err(SortError::Archive(format!(
                "ring '{}' closed",
                self.ring.name()
            ))),
            PutOutcome::TimedOut => unreachable!("blocking put cannot time out"),
        }
    }

    /// Seal the open frame with a buffer-end marker and queue it.
    pub fn flush_buffer(&mut self) -> Result<(), SortError> {
        if self.frame.is_empty() {
            return Ok(());
        }
        self.codec.end_buffer(&mut self.frame);
        self.put_sealed()
    }

    /// Seal the open frame with the run-end marker and queue it.
    pub fn end_run(&mut self) -> Result<(), SortError> {
        self.codec.end_run(&mut self.frame);
        self.put_sealed()
    }
}

impl EventAcceptor for EventWriter {
    fn accept(&mut self, event: &Event) -> Result<(), SortError> {
        if self.codec.write_event(&mut self.frame, event) {
            return Ok(());
        }
        // Frame full: seal, queue, retry on a fresh frame.
        self.flush_buffer()?;
        if self.codec.write_event(&mut self.frame, event) {
            Ok(())
        } else {
            Err(SortError::Archive(
                "event larger than one output record".to_string(),
            ))
        }
    }
}

type SharedRoutine = Arc<Mutex<Box<dyn SortRoutine>>>;

/// Controller-side view of a running sorter.
#[derive(Clone)]
pub struct SorterHandle {
    ring: RingBuffer,
    routine: SharedRoutine,
    stats: Arc<SorterStats>,
    reached_run_end: Arc<AtomicBool>,
    offline_cancel: Arc<AtomicBool>,
    last_error: Arc<Mutex<Option<DaqError>>>,
}

impl SorterHandle {
    /// Run the routine's begin-of-run hook, preserving the failure
    /// distinction between ordinary errors and resource exhaustion.
    pub fn user_begin(&self) -> Result<(), SortError> {
        self.routine.lock().initialize()
    }

    /// Run the routine's end-of-run hook.
    pub fn user_end(&self) -> Result<(), SortError> {
        self.routine.lock().finish()
    }

    /// Query a named monitor value from the routine.
    pub fn monitor(&self, name: &str) -> f64 {
        self.routine.lock().monitor(name)
    }

    /// End-of-run handshake predicate: the sorting ring is drained and the
    /// last decoded buffer ended the run.
    pub fn caught_up(&self) -> bool {
        self.ring.is_empty() && self.reached_run_end.load(Ordering::SeqCst)
    }

    /// Abandon the current offline replay immediately, irrespective of
    /// drain state.
    pub fn cancel_offline_sorting(&self) {
        self.offline_cancel.store(true, Ordering::SeqCst);
        self.ring.reset();
    }

    /// Clear sticky run-boundary state between runs.
    pub fn reset_run_state(&self) {
        self.reached_run_end.store(false, Ordering::SeqCst);
        self.offline_cancel.store(false, Ordering::SeqCst);
    }

    /// Current counter values.
    pub fn stats(&self) -> SorterSnapshot {
        self.stats.snapshot()
    }

    /// Whether a routine failure has stopped the daemon.
    pub fn has_error(&self) -> bool {
        self.last_error.lock().is_some()
    }

    /// Take the error that stopped the daemon, if any. The run controller
    /// polls this; failures are never discarded.
    pub fn take_error(&self) -> Option<DaqError> {
        self.last_error.lock().take()
    }
}

/// The sorter daemon, pre-spawn.
pub struct Sorter {
    ring: RingBuffer,
    input: Box<dyn EventInput>,
    writer: Option<EventWriter>,
    routine: SharedRoutine,
    sample_interval: u64,
    frame_bytes: usize,
    event_size: usize,
    stats: Arc<SorterStats>,
    reached_run_end: Arc<AtomicBool>,
    offline_cancel: Arc<AtomicBool>,
    last_error: Arc<Mutex<Option<DaqError>>>,
}

impl Sorter {
    /// Build the sorter over its ring, codecs and routine. `writer` is
    /// `None` when disk writing is disabled.
    pub fn new(
        ring: RingBuffer,
        input: Box<dyn EventInput>,
        writer: Option<EventWriter>,
        routine: Box<dyn SortRoutine>,
        sample_interval: u64,
        frame_bytes: usize,
    ) -> (Self, SorterHandle) {
        let event_size = routine.event_size();
        let routine: SharedRoutine = Arc::new(Mutex::new(routine));
        let stats = Arc::new(SorterStats::default());
        let reached_run_end = Arc::new(AtomicBool::new(false));
        let offline_cancel = Arc::new(AtomicBool::new(false));
        let last_error = Arc::new(Mutex::new(None));
        let handle = SorterHandle {
            ring: ring.clone(),
            routine: Arc::clone(&routine),
            stats: Arc::clone(&stats),
            reached_run_end: Arc::clone(&reached_run_end),
            offline_cancel: Arc::clone(&offline_cancel),
            last_error: Arc::clone(&last_error),
        };
        (
            Self {
                ring,
                input,
                writer,
                routine,
                sample_interval: sample_interval.max(1),
                frame_bytes,
                event_size,
                stats,
                reached_run_end,
                offline_cancel,
                last_error,
            },
            handle,
        )
    }

    /// Spawn the daemon thread.
    pub fn spawn(self, state: Arc<StateControl>) -> std::io::Result<Worker> {
        let loop_state = Arc::clone(&state);
        Worker::spawn("sorter", state, move || self.run_loop(&loop_state))
    }

    fn run_loop(mut self, state: &StateControl) {
        let mut frame = RawBuffer::with_capacity(self.frame_bytes);
        let mut event = Event::new(self.event_size);
        while state.check() {
            match self.ring.get_timeout(&mut frame, POLL_INTERVAL) {
                GetOutcome::Received(_) => {
                    self.stats.buffers.fetch_add(1, Ordering::Relaxed);
                    self.process_buffer(frame.as_slice(), &mut event, state);
                }
                GetOutcome::TimedOut => continue,
                GetOutcome::Closed => break,
                GetOutcome::Disabled => {
                    warn!("sorting ring is disabled; sorter has nothing to do");
                    break;
                }
            }
        }
        info!(stats = ?self.stats.snapshot(), "sorter exiting");
    }

    /// Decode one raw buffer to completion (or abandonment).
    fn process_buffer(&mut self, data: &[u8], event: &mut Event, state: &StateControl) {
        let mut cursor = WordCursor::new(data);
        loop {
            if self.offline_cancel.load(Ordering::SeqCst) {
                debug!("offline sorting cancelled mid-buffer");
                return;
            }
            match self.input.read_event(&mut cursor, event) {
                Ok(EventInputStatus::Event) => {
                    let seen = self.stats.events_received.fetch_add(1, Ordering::Relaxed);
                    if seen % self.sample_interval == 0 {
                        if let Err(e) = self.sort_one(event) {
                            let seen = self.stats.events_received.load(Ordering::Relaxed);
                            error!(error = %e, events = seen, "sort routine failed; stopping sorter");
                            *self.last_error.lock() = Some(DaqError::Sort(e));
                            state.set(WorkerState::Stop);
                            return;
                        }
                        self.stats.events_sorted.fetch_add(1, Ordering::Relaxed);
                    }
                    event.clear();
                }
                Ok(EventInputStatus::Partial) | Ok(EventInputStatus::Ignore) => {}
                Ok(EventInputStatus::Scaler) => {
                    self.stats.scaler_blocks.fetch_add(1, Ordering::Relaxed);
                }
                Ok(EventInputStatus::UnknownWord) => {
                    self.stats.unknown_words.fetch_add(1, Ordering::Relaxed);
                }
                Ok(EventInputStatus::EndBuffer) => return,
                Ok(EventInputStatus::EndFile) => {
                    // A truncated tail; don't strand accepted events in the
                    // open output frame.
                    if let Some(writer) = self.writer.as_mut() {
                        if let Err(e) = writer.flush_buffer() {
                            warn!(error = %e, "failed to flush output frame");
                        }
                    }
                    return;
                }
                Ok(EventInputStatus::EndRun) => {
                    self.reached_run_end.store(true, Ordering::SeqCst);
                    if let Some(writer) = self.writer.as_mut() {
                        if let Err(e) = writer.end_run() {
                            warn!(error = %e, "failed to archive run-end frame");
                        }
                    }
                    debug!("run-end marker decoded");
                    return;
                }
                Err(e) => {
                    // Unrecoverable for this buffer only; the daemon
                    // continues with the next one.
                    self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                    error!(error = %e, "decode error; buffer abandoned");
                    return;
                }
            }
        }
    }

    fn sort_one(&mut self, event: &Event) -> Result<(), SortError> {
        let mut routine = self.routine.lock();
        match self.writer.as_mut() {
            Some(writer) => routine.sort(event, writer),
            None => routine.sort(event, &mut DiscardAcceptor),
        }
    }
}
