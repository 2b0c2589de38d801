//! Word-tagged 16-bit event stream codec.
//!
//! The workhorse tape format: every 16-bit word is classified against three
//! sentinel markers (event end, buffer end, run end) and, failing those, a
//! parameter bit mask. A parameter word carries a channel index in its low
//! bits and is followed by the parameter value word; indices at or above
//! [`MAX_PARAMETERS`](super::MAX_PARAMETERS) address scaler slots whose
//! values are consumed and discarded. Zero words are record padding.
//!
//! Files open with the shared 256-byte header record (`codec::header`).

use super::header::{self, HeaderBlock};
use super::{DecodeError, Event, EventInput, EventInputStatus, EventOutput, WordCursor,
            MAX_PARAMETERS};
use crate::run::RunContext;
use bytes::BufMut;

/// Marks the end of one event's parameter words.
pub const EVENT_END: u16 = 0xFFFF;
/// Marks the end of a data record.
pub const BUFFER_END: u16 = 0xFFF0;
/// Marks the end of the run.
pub const RUN_END: u16 = 0xFF03;
/// Set on every parameter word.
pub const PARAMETER_FLAG: u16 = 0x8000;
/// Extracts the channel index from a parameter word.
pub const PARAMETER_MASK: u16 = 0x0FFF;

const PAD: u16 = 0x0000;

/// Decoder for the word-tagged format.
#[derive(Debug, Default)]
pub struct L002Input {
    header: Option<HeaderBlock>,
}

impl L002Input {
    /// Create a decoder with no header read yet.
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventInput for L002Input {
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
        let Some(word) = src.u16() else {
            return Ok(EventInputStatus::EndFile);
        };

        match word {
            EVENT_END => Ok(EventInputStatus::Event),
            BUFFER_END => Ok(EventInputStatus::EndBuffer),
            RUN_END => Ok(EventInputStatus::EndRun),
            PAD => Ok(EventInputStatus::Ignore),
            w if w & PARAMETER_FLAG != 0 => {
                let index = (w & PARAMETER_MASK) as usize;
                let value = src
                    .u16()
                    .ok_or_else(|| DecodeError::at(src, "parameter word without a value word"))?;
                if index < MAX_PARAMETERS {
                    event.set(index, i32::from(value));
                    Ok(EventInputStatus::Partial)
                } else {
                    // Scaler slot: consumed, never stored.
                    Ok(EventInputStatus::Scaler)
                }
            }
            _ => Ok(EventInputStatus::UnknownWord),
        }
    }

    fn is_end_run(&self, word: u32) -> bool {
        word as u16 == RUN_END
    }
}

/// Encoder for the word-tagged format.
#[derive(Debug)]
pub struct L002Output {
    params_per_event: usize,
    record_length: usize,
}

impl L002Output {
    /// Create an encoder producing records of `record_length` bytes.
    pub fn new(params_per_event: usize, record_length: usize) -> Self {
        Self {
            params_per_event,
            record_length,
        }
    }

    fn seal(&self, frame: &mut Vec<u8>, marker: u16) {
        frame.put_u16(marker);
        if frame.len() < self.record_length {
            frame.put_bytes(0, self.record_length - frame.len());
        }
    }
}

impl EventOutput for L002Output {
    fn header_bytes(&self, ctx: &RunContext) -> Vec<u8> {
        header::write_header(&HeaderBlock::for_run(
            ctx,
            self.params_per_event,
            self.record_length,
        ))
    }

    fn write_event(&mut self, frame: &mut Vec<u8>, event: &Event) -> bool {
        let words = event.populated().count() * 2 + 1;
        // Keep room for the terminal marker word the seal will append.
        if frame.len() + words * 2 + 2 > self.record_length {
            return false;
        }
        for (index, value) in event.populated() {
            frame.put_u16(PARAMETER_FLAG | (index as u16 & PARAMETER_MASK));
            frame.put_u16(value as u16);
        }
        frame.put_u16(EVENT_END);
        true
    }

    fn end_buffer(&mut self, frame: &mut Vec<u8>) {
        self.seal(frame, BUFFER_END);
    }

    fn end_run(&mut self, frame: &mut Vec<u8>) {
        self.seal(frame, RUN_END);
    }

    fn is_end_run(&self, word: u32) -> bool {
        word as u16 == RUN_END
    }

    fn buffer_ends_run(&self, frame: &[u8]) -> bool {
        // Walk back over the zero padding to the last meaningful word.
        let mut idx = frame.len();
        while idx >= 2 {
            let word = u16::from_be_bytes([frame[idx - 2], frame[idx - 1]]);
            if word != PAD {
                return word == RUN_END;
            }
            idx -= 2;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive(input: &mut L002Input, data: &[u8], event_size: usize) -> (Vec<Event>, EventInputStatus) {
        let mut cur = WordCursor::new(data);
        let mut event = Event::new(event_size);
        let mut events = Vec::new();
        loop {
            match input.read_event(&mut cur, &mut event).unwrap() {
                EventInputStatus::Event => {
                    events.push(event.clone());
                    event.clear();
                }
                EventInputStatus::Partial
                | EventInputStatus::Scaler
                | EventInputStatus::Ignore
                | EventInputStatus::UnknownWord => {}
                terminal => return (events, terminal),
            }
        }
    }

    #[test]
    fn test_k_events_then_end_buffer() {
        let mut out = L002Output::new(16, 256);
        let mut frame = Vec::new();
        let mut expected = Vec::new();
        for k in 0..3 {
            let mut event = Event::new(16);
            event.set(0, 100 + k);
            event.set(7, 7 * (k + 1));
            assert!(out.write_event(&mut frame, &event));
            expected.push(event);
        }
        out.end_buffer(&mut frame);
        assert_eq!(frame.len(), 256);

        let mut input = L002Input::new();
        let (events, terminal) = drive(&mut input, &frame, 16);
        assert_eq!(terminal, EventInputStatus::EndBuffer);
        assert_eq!(events, expected);
    }

    #[test]
    fn test_populated_indices_round_trip() {
        let mut event = Event::new(32);
        event.set(1, 0x0123);
        event.set(30, 0x0FFF);
        let mut out = L002Output::new(32, 512);
        let mut frame = Vec::new();
        out.write_event(&mut frame, &event);
        out.end_run(&mut frame);

        let mut input = L002Input::new();
        let (events, terminal) = drive(&mut input, &frame, 32);
        assert_eq!(terminal, EventInputStatus::EndRun);
        assert_eq!(events.len(), 1);
        let decoded: Vec<(usize, i32)> = events[0].populated().collect();
        assert_eq!(decoded, vec![(1, 0x0123), (30, 0x0FFF)]);
    }

    #[test]
    fn test_scaler_values_are_discarded() {
        let mut frame = Vec::new();
        // Parameter index 2048 addresses a scaler slot.
        frame.put_u16(PARAMETER_FLAG | 0x0800);
        frame.put_u16(1234);
        frame.put_u16(PARAMETER_FLAG | 3);
        frame.put_u16(55);
        frame.put_u16(EVENT_END);
        frame.put_u16(BUFFER_END);

        let mut input = L002Input::new();
        let (events, terminal) = drive(&mut input, &frame, 16);
        assert_eq!(terminal, EventInputStatus::EndBuffer);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].populated().collect::<Vec<_>>(), vec![(3, 55)]);
    }

    #[test]
    fn test_unknown_word_is_survivable() {
        let mut frame = Vec::new();
        frame.put_u16(0x7ABC); // no parameter flag, not a marker
        frame.put_u16(PARAMETER_FLAG | 1);
        frame.put_u16(9);
        frame.put_u16(EVENT_END);
        frame.put_u16(BUFFER_END);

        let mut input = L002Input::new();
        let mut cur = WordCursor::new(&frame);
        let mut event = Event::new(4);
        assert_eq!(
            input.read_event(&mut cur, &mut event).unwrap(),
            EventInputStatus::UnknownWord
        );
        let (events, terminal) = drive(&mut input, &frame[cur.position()..], 4);
        assert_eq!(terminal, EventInputStatus::EndBuffer);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_truncated_parameter_is_a_decode_error() {
        let mut frame = Vec::new();
        frame.put_u16(PARAMETER_FLAG | 5);
        // value word missing
        let mut input = L002Input::new();
        let mut cur = WordCursor::new(&frame);
        let mut event = Event::new(4);
        assert!(input.read_event(&mut cur, &mut event).is_err());
    }

    #[test]
    fn test_exhausted_stream_reports_end_file() {
        let mut input = L002Input::new();
        let mut cur = WordCursor::new(&[]);
        let mut event = Event::new(4);
        assert_eq!(
            input.read_event(&mut cur, &mut event).unwrap(),
            EventInputStatus::EndFile
        );
    }

    #[test]
    fn test_buffer_ends_run_scans_past_padding() {
        let mut out = L002Output::new(8, 128);
        let mut run_end_frame = Vec::new();
        out.end_run(&mut run_end_frame);
        assert!(out.buffer_ends_run(&run_end_frame));

        let mut plain_frame = Vec::new();
        out.end_buffer(&mut plain_frame);
        assert!(!out.buffer_ends_run(&plain_frame));
    }

    #[test]
    fn test_write_event_refuses_overflow() {
        let mut out = L002Output::new(8, 16);
        let mut frame = Vec::new();
        let mut event = Event::new(8);
        for i in 0..8 {
            event.set(i, 1 + i as i32);
        }
        // 8 populated params = 34 bytes with the event-end word; record is 16.
        assert!(!out.write_event(&mut frame, &event));
        assert!(frame.is_empty());
    }
}
