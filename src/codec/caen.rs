//! CAEN 32-bit ADC/TDC stream codec with out-of-order event reassembly.
//!
//! The hardware emits one block per module per trigger: a header word, the
//! converted channel words, then an end-of-block word tagged with a 24-bit
//! event number. Blocks belonging to the same event arrive interleaved with
//! blocks of other events, so the decoder reassembles fragments in a
//! fixed-capacity circular table keyed by event number.
//!
//! Reassembly rules:
//!
//! - While the table is filling, no event is emitted; decoding keeps
//!   consuming raw words.
//! - A new event number arriving at a full table evicts the oldest occupant
//!   (circular get cursor), which is emitted with whatever parameters had
//!   arrived — possibly incomplete, never re-requested — before the new
//!   event is accepted. Bounded memory and forward progress are traded for
//!   strict ordering.
//! - `STOP_PAD` and `END_PAD` enter a flush state: each call emits one
//!   buffered event in insertion order until the table is empty, then the
//!   decoder reports `EndBuffer` or `EndRun` respectively and returns to
//!   filling. No in-flight event is dropped at a run or buffer boundary.
//! - `SCALER_BLOCK` carries an out-of-band scaler array, surfaced as the
//!   transient `Scaler` status and kept out of the event table.

use super::header::{self, HeaderBlock};
use super::{DecodeError, Event, EventInput, EventInputStatus, EventOutput, WordCursor};
use crate::run::RunContext;
use bytes::BufMut;
use std::collections::HashMap;
use tracing::trace;

/// Selects the block-type bits of a data word.
pub const TYPE_MASK: u32 = 0x0700_0000;
/// Block type: converted channel datum.
pub const TYPE_PARAMETER: u32 = 0x0000_0000;
/// Block type: module block header.
pub const TYPE_HEADER: u32 = 0x0200_0000;
/// Block type: end of module block, low 24 bits carry the event number.
pub const TYPE_END_BLOCK: u32 = 0x0400_0000;

/// Acquisition stopped; flush the table, then end the buffer.
pub const STOP_PAD: u32 = 0x01DD_DDDD;
/// Run ended; flush the table, then end the run.
pub const END_PAD: u32 = 0x01EE_EEEE;
/// Filler word, skipped.
pub const BUFFER_PAD: u32 = 0x01FF_FFFF;
/// Out-of-band scaler dump follows (count word, then values).
pub const SCALER_BLOCK: u32 = 0x01CC_CCCC;
/// Hard end of buffer without a flush.
pub const END_OF_BUFFER: u32 = 0x01BB_BBBB;

/// Low 24 bits of an end-of-block word.
pub const EVENT_NUMBER_MASK: u32 = 0x00FF_FFFF;

/// In-flight events held before emission.
pub const DEFAULT_FIFO_CAPACITY: usize = 100;

const GEO_SHIFT: u32 = 27;
const GEO_MASK: u32 = 0x1F;
const CHANNEL_SHIFT: u32 = 16;
const CHANNEL_MASK: u32 = 0x1F;
const VALUE_MASK: u32 = 0x0FFF;
const CHANNELS_PER_MODULE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FifoStatus {
    Filling,
    Full,
    Flush,
    EndRunFlush,
}

#[derive(Debug)]
struct Slot {
    number: u32,
    params: Box<[i32]>,
}

/// Decoder with bounded-FIFO event reassembly.
#[derive(Debug)]
pub struct CaenInput {
    slots: Vec<Slot>,
    index: HashMap<u32, usize>,
    put_cursor: usize,
    get_cursor: usize,
    occupancy: usize,
    status: FifoStatus,
    /// Eviction staging: filled when a new event number displaces the
    /// oldest occupant, emitted before anything else happens.
    staged: Box<[i32]>,
    /// Parameters of the module block currently being parsed.
    fragment: Vec<(usize, i32)>,
    scalers: Vec<u32>,
    header: Option<HeaderBlock>,
}

impl CaenInput {
    /// Create a decoder for events of `event_size` parameters with the
    /// default table capacity.
    pub fn new(event_size: usize) -> Self {
        Self::with_capacity(event_size, DEFAULT_FIFO_CAPACITY)
    }

    /// Create a decoder with an explicit reassembly-table capacity.
    pub fn with_capacity(event_size: usize, capacity: usize) -> Self {
        assert!(capacity > 0, "reassembly table needs at least one slot");
        let slots = (0..capacity)
            .map(|_| Slot {
                number: 0,
                params: vec![0; event_size].into_boxed_slice(),
            })
            .collect();
        Self {
            slots,
            index: HashMap::with_capacity(capacity),
            put_cursor: 0,
            get_cursor: 0,
            occupancy: 0,
            status: FifoStatus::Filling,
            staged: vec![0; event_size].into_boxed_slice(),
            fragment: Vec::new(),
            scalers: Vec::new(),
            header: None,
        }
    }

    /// Scaler values from the most recent `SCALER_BLOCK`.
    pub fn scalers(&self) -> &[u32] {
        &self.scalers
    }

    /// Number of events currently buffered in the table.
    pub fn in_flight(&self) -> usize {
        self.occupancy
    }

    fn copy_out(params: &[i32], event: &mut Event) {
        event.clear();
        for (i, &v) in params.iter().enumerate() {
            if v != 0 {
                event.set(i, v);
            }
        }
    }

    /// Emit the oldest buffered event into `event` and free its slot.
    fn emit_oldest(&mut self, event: &mut Event) {
        let capacity = self.slots.len();
        let slot = &mut self.slots[self.get_cursor];
        self.index.remove(&slot.number);
        Self::copy_out(&slot.params, event);
        slot.params.fill(0);
        self.get_cursor = (self.get_cursor + 1) % capacity;
        self.occupancy -= 1;
    }

    /// Attach the just-parsed fragment to its event's slot, allocating a
    /// slot (and evicting the oldest occupant into staging if the table is
    /// full) when the event number is new.
    fn file_fragment(&mut self, number: u32) {
        let capacity = self.slots.len();
        let slot_idx = match self.index.get(&number) {
            Some(&idx) => idx,
            None => {
                if self.occupancy == capacity {
                    // Oldest occupant leaves with whatever it has.
                    let oldest = &mut self.slots[self.get_cursor];
                    trace!(evicted = oldest.number, incoming = number, "reassembly table full");
                    self.index.remove(&oldest.number);
                    self.staged.copy_from_slice(&oldest.params);
                    oldest.params.fill(0);
                    self.get_cursor = (self.get_cursor + 1) % capacity;
                    self.occupancy -= 1;
                    self.status = FifoStatus::Full;
                }
                let idx = self.put_cursor;
                let slot = &mut self.slots[idx];
                slot.number = number;
                slot.params.fill(0);
                self.index.insert(number, idx);
                self.put_cursor = (idx + 1) % capacity;
                self.occupancy += 1;
                idx
            }
        };
        let slot = &mut self.slots[slot_idx];
        for (index, value) in self.fragment.drain(..) {
            if let Some(p) = slot.params.get_mut(index) {
                *p = value;
            }
        }
    }
}

impl EventInput for CaenInput {
    fn read_header(&mut self, src: &mut WordCursor<'_>) -> Result<bool, DecodeError> {
        match header::read_header(src)? {
            Some(block) => {
                self.header = Some(block);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn header(&self) -> Option<&HeaderBlock> {
        self.header.as_ref()
    }

    fn read_event(
        &mut self,
        src: &mut WordCursor<'_>,
        event: &mut Event,
    ) -> Result<EventInputStatus, DecodeError> {
        loop {
            match self.status {
                FifoStatus::Full => {
                    // The evicted occupant goes out before anything else.
                    Self::copy_out(&self.staged, event);
                    self.status = FifoStatus::Filling;
                    return Ok(EventInputStatus::Event);
                }
                FifoStatus::Flush | FifoStatus::EndRunFlush => {
                    if self.occupancy > 0 {
                        self.emit_oldest(event);
                        return Ok(EventInputStatus::Event);
                    }
                    let ended_run = self.status == FifoStatus::EndRunFlush;
                    self.status = FifoStatus::Filling;
                    return Ok(if ended_run {
                        EventInputStatus::EndRun
                    } else {
                        EventInputStatus::EndBuffer
                    });
                }
                FifoStatus::Filling => {}
            }

            let Some(word) = src.u32() else {
                return Ok(EventInputStatus::EndFile);
            };

            match word {
                STOP_PAD => {
                    self.status = FifoStatus::Flush;
                    continue;
                }
                END_PAD => {
                    self.status = FifoStatus::EndRunFlush;
                    continue;
                }
                BUFFER_PAD => return Ok(EventInputStatus::Ignore),
                END_OF_BUFFER => return Ok(EventInputStatus::EndBuffer),
                SCALER_BLOCK => {
                    let count = src
                        .u32()
                        .ok_or_else(|| DecodeError::at(src, "scaler block without count"))?;
                    self.scalers.clear();
                    for _ in 0..count {
                        let value = src
                            .u32()
                            .ok_or_else(|| DecodeError::at(src, "truncated scaler block"))?;
                        self.scalers.push(value);
                    }
                    return Ok(EventInputStatus::Scaler);
                }
                _ => match word & TYPE_MASK {
                    TYPE_HEADER => {
                        // A module block restarts fragment accumulation.
                        self.fragment.clear();
                        return Ok(EventInputStatus::Partial);
                    }
                    TYPE_PARAMETER => {
                        let geo = ((word >> GEO_SHIFT) & GEO_MASK) as usize;
                        let channel = ((word >> CHANNEL_SHIFT) & CHANNEL_MASK) as usize;
                        let value = (word & VALUE_MASK) as i32;
                        self.fragment
                            .push((geo * CHANNELS_PER_MODULE + channel, value));
                        return Ok(EventInputStatus::Partial);
                    }
                    TYPE_END_BLOCK => {
                        let number = word & EVENT_NUMBER_MASK;
                        self.file_fragment(number);
                        if self.status == FifoStatus::Full {
                            // Emit the staged eviction on this same call.
                            continue;
                        }
                        return Ok(EventInputStatus::Partial);
                    }
                    other => {
                        return Err(DecodeError::at(
                            src,
                            format!("out-of-range block type 0x{:X}", other >> 24),
                        ));
                    }
                },
            }
        }
    }

    fn is_end_run(&self, word: u32) -> bool {
        word == END_PAD
    }
}

/// Encoder for the CAEN block format.
///
/// Events are written as one block per populated module (header word,
/// channel words, end-of-block word carrying a monotonically increasing
/// event number), matching what the hardware produces.
#[derive(Debug)]
pub struct CaenOutput {
    params_per_event: usize,
    record_length: usize,
    event_number: u32,
}

impl CaenOutput {
    /// Create an encoder producing records of `record_length` bytes.
    pub fn new(params_per_event: usize, record_length: usize) -> Self {
        Self {
            params_per_event,
            record_length,
            event_number: 0,
        }
    }

    fn seal(&self, frame: &mut Vec<u8>, marker: u32) {
        frame.put_u32(marker);
        while frame.len() + 4 <= self.record_length {
            frame.put_u32(BUFFER_PAD);
        }
    }
}

impl EventOutput for CaenOutput {
    fn header_bytes(&self, ctx: &RunContext) -> Vec<u8> {
        header::write_header(&HeaderBlock::for_run(
            ctx,
            self.params_per_event,
            self.record_length,
        ))
    }

    fn write_event(&mut self, frame: &mut Vec<u8>, event: &Event) -> bool {
        // Group populated channels by module.
        let mut modules: HashMap<usize, Vec<(usize, i32)>> = HashMap::new();
        for (index, value) in event.populated() {
            modules
                .entry(index / CHANNELS_PER_MODULE)
                .or_default()
                .push((index % CHANNELS_PER_MODULE, value));
        }
        if modules.is_empty() {
            return true;
        }

        let words: usize = modules.values().map(|chs| chs.len() + 2).sum();
        // Keep room for the terminal marker word the seal will append.
        if frame.len() + (words + 1) * 4 > self.record_length {
            return false;
        }

        let number = self.event_number & EVENT_NUMBER_MASK;
        self.event_number = self.event_number.wrapping_add(1);

        let mut geos: Vec<usize> = modules.keys().copied().collect();
        geos.sort_unstable();
        for geo in geos {
            let geo_bits = (geo as u32 & GEO_MASK) << GEO_SHIFT;
            frame.put_u32(TYPE_HEADER | geo_bits);
            for (channel, value) in &modules[&geo] {
                frame.put_u32(
                    geo_bits
                        | TYPE_PARAMETER
                        | ((*channel as u32 & CHANNEL_MASK) << CHANNEL_SHIFT)
                        | (*value as u32 & VALUE_MASK),
                );
            }
            frame.put_u32(TYPE_END_BLOCK | number);
        }
        true
    }

    fn end_buffer(&mut self, frame: &mut Vec<u8>) {
        self.seal(frame, STOP_PAD);
    }

    fn end_run(&mut self, frame: &mut Vec<u8>) {
        self.seal(frame, END_PAD);
    }

    fn is_end_run(&self, word: u32) -> bool {
        word == END_PAD
    }

    fn buffer_ends_run(&self, frame: &[u8]) -> bool {
        // Walk back over trailing pad words to the last meaningful one.
        let mut idx = frame.len() - frame.len() % 4;
        while idx >= 4 {
            let word = u32::from_be_bytes([
                frame[idx - 4],
                frame[idx - 3],
                frame[idx - 2],
                frame[idx - 1],
            ]);
            if word != BUFFER_PAD {
                return word == END_PAD;
            }
            idx -= 4;
        }
        false
    }
}
