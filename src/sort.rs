//! Contract for the user-supplied analysis routine.
//!
//! The sorter daemon drives an object implementing [`SortRoutine`]: once
//! per run it calls `initialize`, once per accepted event it calls `sort`,
//! and once at run end it calls `finish`. Every failure is a `Result` the
//! daemon propagates to the run controller — a misbehaving routine must be
//! visible to the operator, never silently absorbed.
//!
//! Event archiving is decoupled from the routine through the
//! [`EventAcceptor`] handed to `sort`: the routine calls `accept` for each
//! event it wants written, and the pipeline decides where accepted events
//! go (the output codec and storage ring when write-enabled, nowhere
//! otherwise).

use crate::codec::Event;
use thiserror::Error;

/// Failures raised by the analysis routine.
///
/// `Init` and `ResourceExhausted` are deliberately distinct: an ordinary
/// initialization failure reports the causing message, while memory
/// exhaustion carries the failed allocation size and remediation guidance,
/// because the operator's next step is different in the two cases.
#[derive(Error, Debug)]
pub enum SortError {
    /// Ordinary initialization failure; the causing message is preserved.
    #[error("Sort routine initialization failed: {0}")]
    Init(String),

    /// The routine could not allocate its working memory.
    #[error(
        "Sort workspace allocation of {required_bytes} bytes failed: out of memory. \
         Reduce the event size or histogram dimensions, or raise the process \
         memory limit, then restart the run"
    )]
    ResourceExhausted {
        /// Size of the allocation that failed.
        required_bytes: usize,
    },

    /// A per-event `sort` call failed.
    #[error("Sort failed on event {events_seen}: {reason}")]
    Event {
        /// How many events had been received when the failure occurred.
        events_seen: u64,
        /// The routine's failure message.
        reason: String,
    },

    /// The end-of-run `finish` hook failed.
    #[error("Sort routine finalization failed: {0}")]
    Finish(String),

    /// An accepted event could not be queued for archiving.
    #[error("Event archiving failed: {0}")]
    Archive(String),
}

/// Sink for events the routine accepts for archiving.
pub trait EventAcceptor {
    /// Queue one event for re-encoding and storage.
    fn accept(&mut self, event: &Event) -> Result<(), SortError>;
}

/// Acceptor used when disk writing is turned off.
#[derive(Debug, Default)]
pub struct DiscardAcceptor;

impl EventAcceptor for DiscardAcceptor {
    fn accept(&mut self, _event: &Event) -> Result<(), SortError> {
        Ok(())
    }
}

/// The external analysis callback.
pub trait SortRoutine: Send {
    /// Called once before the first event of a run. Allocate histograms and
    /// working memory here.
    fn initialize(&mut self) -> Result<(), SortError>;

    /// Called once per decoded (and sampling-selected) event. Ownership of
    /// `event` lasts only for the duration of the call.
    fn sort(&mut self, event: &Event, out: &mut dyn EventAcceptor) -> Result<(), SortError>;

    /// Called once after the last event of a run.
    fn finish(&mut self) -> Result<(), SortError> {
        Ok(())
    }

    /// Named monitor value queried by external displays.
    fn monitor(&self, _name: &str) -> f64 {
        0.0
    }

    /// Parameters per event this routine expects.
    fn event_size(&self) -> usize;

    /// Raw buffer size the front end is configured for.
    fn buffer_size(&self) -> usize {
        8 * 1024
    }

    /// Informs the routine whether accepted events are actually written.
    fn set_write_enabled(&mut self, _enabled: bool) {}
}
