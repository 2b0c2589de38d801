//! Pluggable binary event-stream codecs.
//!
//! A codec turns the raw word stream produced by one hardware or tape
//! format into discrete [`Event`]s and back. The input side is driven one
//! status at a time: each `read_event` call consumes words from a
//! [`WordCursor`] over the current raw buffer and reports exactly one
//! [`EventInputStatus`]. Recoverable stream conditions (buffer boundaries,
//! run boundaries, unknown words) are statuses; a malformed stream is the
//! single checked [`DecodeError`] kind.
//!
//! Concrete formats:
//!
//! - [`l002`] — the word-tagged 16-bit format used by the standard tape
//!   family, in both directions.
//! - [`caen`] — the 32-bit CAEN ADC/TDC format whose stream interleaves
//!   fragments of concurrently open events; its decoder reassembles them
//!   through a bounded FIFO with eviction and two-phase end-of-run
//!   flushing.
//!
//! Formats that carry the shared 256-byte run header embed the [`header`]
//! sub-codec as a capability; nothing forces a format into that layout.

pub mod caen;
pub mod header;
pub mod l002;

use crate::run::RunContext;
use bytes::Buf;
use self::header::HeaderBlock;
use serde::Deserialize;
use thiserror::Error;

/// Parameter indices at or above this value denote scaler slots, which are
/// consumed but never stored into an event.
pub const MAX_PARAMETERS: usize = 2048;

/// One decoded physics event: a fixed-length array of parameter values
/// indexed by logical channel number.
///
/// `set` silently discards indices outside `0..size`; nothing is ever
/// written out of bounds. The array is reused across events via `clear`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    params: Box<[i32]>,
}

impl Event {
    /// Create a zeroed event of `size` parameters.
    pub fn new(size: usize) -> Self {
        Self {
            params: vec![0; size].into_boxed_slice(),
        }
    }

    /// Number of parameter slots.
    pub fn size(&self) -> usize {
        self.params.len()
    }

    /// Store a parameter value; out-of-range indices are discarded.
    pub fn set(&mut self, index: usize, value: i32) {
        if let Some(slot) = self.params.get_mut(index) {
            *slot = value;
        }
    }

    /// Read a parameter value; out-of-range indices read as 0.
    pub fn get(&self, index: usize) -> i32 {
        self.params.get(index).copied().unwrap_or(0)
    }

    /// The full parameter array.
    pub fn params(&self) -> &[i32] {
        &self.params
    }

    /// Zero all parameters for reuse.
    pub fn clear(&mut self) {
        self.params.fill(0);
    }

    /// Iterate over the populated (non-zero) parameters.
    pub fn populated(&self) -> impl Iterator<Item = (usize, i32)> + '_ {
        self.params
            .iter()
            .copied()
            .enumerate()
            .filter(|&(_, v)| v != 0)
    }

    /// Copy another event's parameters into this one (sizes may differ;
    /// excess source parameters are discarded).
    pub fn copy_from(&mut self, other: &Event) {
        let n = self.params.len().min(other.params.len());
        self.params[..n].copy_from_slice(&other.params[..n]);
        for slot in &mut self.params[n..] {
            *slot = 0;
        }
    }
}

/// Tagged result of one decode step. Exactly one status is produced per
/// `read_event` invocation; `Event` is the only status for which the out
/// array holds a complete event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventInputStatus {
    /// A complete event was stored into the out array.
    Event,
    /// A parameter word was consumed; the event is still accumulating.
    Partial,
    /// A scaler value or scaler block was consumed and kept out of the
    /// event array.
    Scaler,
    /// The buffer-end marker was seen.
    EndBuffer,
    /// The run-end marker was seen.
    EndRun,
    /// The stream ended without a boundary marker (end of file image or a
    /// truncated tail).
    EndFile,
    /// A word matched no classification; the caller may log and continue.
    UnknownWord,
    /// A pad or filler word was consumed; nothing happened.
    Ignore,
}

/// The single checked decode-error kind for malformed streams.
///
/// Terminates processing of the current buffer; the sorter logs it and
/// continues with the next buffer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("malformed event stream at byte {offset}: {reason}")]
pub struct DecodeError {
    /// Byte offset into the current buffer.
    pub offset: usize,
    /// What was wrong with the word sequence.
    pub reason: String,
}

impl DecodeError {
    /// Build an error at the cursor's current position.
    pub fn at(cursor: &WordCursor<'_>, reason: impl Into<String>) -> Self {
        Self {
            offset: cursor.position(),
            reason: reason.into(),
        }
    }
}

/// Big-endian word cursor over one raw buffer.
///
/// The cursor is owned by the daemon driving the decode; codecs keep only
/// format state between calls, never stream position.
#[derive(Debug)]
pub struct WordCursor<'a> {
    data: &'a [u8],
    start_len: usize,
}

impl<'a> WordCursor<'a> {
    /// Wrap a raw buffer payload.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            start_len: data.len(),
        }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len()
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.start_len - self.data.len()
    }

    /// Consume one big-endian 16-bit word, or `None` at end of data.
    pub fn u16(&mut self) -> Option<u16> {
        (self.data.remaining() >= 2).then(|| self.data.get_u16())
    }

    /// Consume one big-endian 32-bit word, or `None` at end of data.
    pub fn u32(&mut self) -> Option<u32> {
        (self.data.remaining() >= 4).then(|| self.data.get_u32())
    }

    /// Consume `n` raw bytes, or `None` if fewer remain.
    pub fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.data.len() >= n {
            let data: &'a [u8] = self.data;
            let (head, tail) = data.split_at(n);
            self.data = tail;
            Some(head)
        } else {
            None
        }
    }
}

/// Decoding side of a codec.
pub trait EventInput: Send {
    /// Read and validate the file header record from the cursor.
    ///
    /// Returns `Ok(false)` when the header key does not match the format's
    /// required constant; callers decide whether that is fatal.
    fn read_header(&mut self, src: &mut WordCursor<'_>) -> Result<bool, DecodeError>;

    /// The most recently read header block, for formats that carry one.
    fn header(&self) -> Option<&HeaderBlock> {
        None
    }

    /// Perform one decode step, consuming words from `src` and reporting
    /// exactly one status. On `EventInputStatus::Event` the out array holds
    /// a complete event; on `Partial`/`Scaler`/`Ignore`/`UnknownWord` the
    /// caller simply calls again.
    fn read_event(
        &mut self,
        src: &mut WordCursor<'_>,
        event: &mut Event,
    ) -> Result<EventInputStatus, DecodeError>;

    /// Whether a word is this format's run-end marker.
    fn is_end_run(&self, word: u32) -> bool;
}

/// Encoding side of a codec.
pub trait EventOutput: Send {
    /// Serialize the file header record for a run.
    fn header_bytes(&self, ctx: &RunContext) -> Vec<u8>;

    /// Append one event to the frame under construction. Returns `false`
    /// without writing when the event would overflow the data record; the
    /// caller seals the frame and retries on a fresh one.
    fn write_event(&mut self, frame: &mut Vec<u8>, event: &Event) -> bool;

    /// Terminate the frame with the buffer-end marker and pad it to the
    /// record length.
    fn end_buffer(&mut self, frame: &mut Vec<u8>);

    /// Terminate the frame with the run-end marker and pad it to the
    /// record length.
    fn end_run(&mut self, frame: &mut Vec<u8>);

    /// Whether a word is this format's run-end marker.
    fn is_end_run(&self, word: u32) -> bool;

    /// Whether a sealed frame carries the run-end marker, used by the
    /// storage daemon's caught-up detection.
    fn buffer_ends_run(&self, frame: &[u8]) -> bool;
}

/// Selectable stream formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamFormat {
    /// Word-tagged 16-bit tape family.
    L002,
    /// CAEN 32-bit ADC/TDC family with FIFO reassembly.
    Caen,
}

impl StreamFormat {
    /// Construct the decoding side for this format.
    pub fn make_input(self, event_size: usize) -> Box<dyn EventInput> {
        match self {
            StreamFormat::L002 => Box::new(l002::L002Input::new()),
            StreamFormat::Caen => Box::new(caen::CaenInput::new(event_size)),
        }
    }

    /// Construct the encoding side for this format.
    pub fn make_output(self, params_per_event: usize, record_length: usize) -> Box<dyn EventOutput> {
        match self {
            StreamFormat::L002 => Box::new(l002::L002Output::new(params_per_event, record_length)),
            StreamFormat::Caen => Box::new(caen::CaenOutput::new(params_per_event, record_length)),
        }
    }
}

impl std::str::FromStr for StreamFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "l002" => Ok(StreamFormat::L002),
            "caen" => Ok(StreamFormat::Caen),
            other => Err(format!("unknown stream format '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_discards_out_of_range_indices() {
        let mut event = Event::new(8);
        event.set(3, 42);
        event.set(8, 99);
        event.set(5000, 7);
        assert_eq!(event.get(3), 42);
        assert_eq!(event.get(8), 0);
        assert_eq!(event.populated().count(), 1);
    }

    #[test]
    fn test_cursor_is_big_endian() {
        let data = [0x12, 0x34, 0x00, 0x00, 0xAB, 0xCD];
        let mut cur = WordCursor::new(&data);
        assert_eq!(cur.u16(), Some(0x1234));
        assert_eq!(cur.u32(), Some(0x0000_ABCD));
        assert_eq!(cur.u16(), None);
        assert_eq!(cur.position(), 6);
    }

    #[test]
    fn test_format_from_str() {
        assert_eq!("l002".parse::<StreamFormat>(), Ok(StreamFormat::L002));
        assert_eq!("CAEN".parse::<StreamFormat>(), Ok(StreamFormat::Caen));
        assert!("xsys".parse::<StreamFormat>().is_err());
    }
}
