//! Shared 256-byte run-header record.
//!
//! Several tape formats open every file with the same fixed header record,
//! all multi-byte fields big-endian. This module is a composable capability
//! — a block type plus read/write functions — that those formats embed;
//! formats without this header simply don't use it.
//!
//! Record layout (256 bytes):
//!
//! | offset | size | field                       |
//! |--------|------|-----------------------------|
//! | 0      | 32   | ASCII format key            |
//! | 32     | 16   | ASCII date                  |
//! | 48     | 80   | ASCII run title             |
//! | 128    | 4    | run number (i32)            |
//! | 132    | 8    | reserved                    |
//! | 140    | 4    | secondary-header count      |
//! | 144    | 4    | record length               |
//! | 148    | 4    | block-image-record count    |
//! | 152    | 4    | image-record length (const) |
//! | 156    | 4    | parameters per event        |
//! | 160    | 4    | data-record length          |
//! | 164    | 92   | reserved                    |

use super::{DecodeError, WordCursor};
use crate::run::RunContext;
use bytes::BufMut;

/// Total size of the header record.
pub const HEADER_BYTES: usize = 256;

/// The ASCII key every valid header must open with.
pub const HEADER_KEY: &str = "L002";

/// Fixed image-record length written into every header.
pub const IMAGE_RECORD_LENGTH: i32 = 8192;

const KEY_FIELD: usize = 32;
const DATE_FIELD: usize = 16;
const TITLE_FIELD: usize = 80;
const RESERVED_MID: usize = 8;
const RESERVED_TAIL: usize = 92;

/// Parsed header record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderBlock {
    /// Run number the file belongs to.
    pub run_number: i32,
    /// Run title, trailing padding stripped.
    pub title: String,
    /// Header date field, trailing padding stripped.
    pub date: String,
    /// Number of secondary header records that follow.
    pub secondary_header_count: i32,
    /// Header record length.
    pub record_length: i32,
    /// Number of block image records.
    pub block_image_count: i32,
    /// Image record length.
    pub image_record_length: i32,
    /// Parameters per event in the data records.
    pub params_per_event: i32,
    /// Data record length in bytes.
    pub data_record_length: i32,
}

impl HeaderBlock {
    /// Build a header block for a run about to be written.
    pub fn for_run(ctx: &RunContext, params_per_event: usize, data_record_length: usize) -> Self {
        Self {
            run_number: ctx.number as i32,
            title: ctx.title.clone(),
            date: ctx.started_at.format("%d-%b-%y %H:%M").to_string(),
            secondary_header_count: 0,
            record_length: HEADER_BYTES as i32,
            block_image_count: 0,
            image_record_length: IMAGE_RECORD_LENGTH,
            params_per_event: params_per_event as i32,
            data_record_length: data_record_length as i32,
        }
    }
}

fn pad_ascii(out: &mut Vec<u8>, text: &str, width: usize) {
    let bytes = text.as_bytes();
    let n = bytes.len().min(width);
    out.put_slice(&bytes[..n]);
    out.put_bytes(b' ', width - n);
}

fn trim_ascii(field: &[u8]) -> String {
    String::from_utf8_lossy(field)
        .trim_end_matches([' ', '\0'])
        .to_string()
}

/// Read one header record from the cursor.
///
/// Always consumes exactly [`HEADER_BYTES`] (the record is fixed-size on
/// disk and on the wire). Returns `Ok(None)` when the ASCII key does not
/// match [`HEADER_KEY`] — validation failure is a value, not an error; the
/// caller decides whether it is fatal.
pub fn read_header(src: &mut WordCursor<'_>) -> Result<Option<HeaderBlock>, DecodeError> {
    if src.remaining() < HEADER_BYTES {
        return Err(DecodeError::at(
            src,
            format!("header record truncated: {} bytes left", src.remaining()),
        ));
    }

    let key = src.take(KEY_FIELD).ok_or_else(|| DecodeError::at(src, "header key"))?;
    let date = src.take(DATE_FIELD).ok_or_else(|| DecodeError::at(src, "header date"))?;
    let title = src.take(TITLE_FIELD).ok_or_else(|| DecodeError::at(src, "header title"))?;
    let run_number = src.u32().ok_or_else(|| DecodeError::at(src, "run number"))? as i32;
    let _ = src.take(RESERVED_MID);
    let secondary_header_count =
        src.u32().ok_or_else(|| DecodeError::at(src, "secondary count"))? as i32;
    let record_length = src.u32().ok_or_else(|| DecodeError::at(src, "record length"))? as i32;
    let block_image_count =
        src.u32().ok_or_else(|| DecodeError::at(src, "block image count"))? as i32;
    let image_record_length =
        src.u32().ok_or_else(|| DecodeError::at(src, "image record length"))? as i32;
    let params_per_event =
        src.u32().ok_or_else(|| DecodeError::at(src, "params per event"))? as i32;
    let data_record_length =
        src.u32().ok_or_else(|| DecodeError::at(src, "data record length"))? as i32;
    let _ = src.take(RESERVED_TAIL);

    let mut expected_key = Vec::with_capacity(KEY_FIELD);
    pad_ascii(&mut expected_key, HEADER_KEY, KEY_FIELD);
    if key != expected_key.as_slice() {
        return Ok(None);
    }

    Ok(Some(HeaderBlock {
        run_number,
        title: trim_ascii(title),
        date: trim_ascii(date),
        secondary_header_count,
        record_length,
        block_image_count,
        image_record_length,
        params_per_event,
        data_record_length,
    }))
}

/// Serialize one header record. The result is exactly [`HEADER_BYTES`].
pub fn write_header(block: &HeaderBlock) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_BYTES);
    pad_ascii(&mut out, HEADER_KEY, KEY_FIELD);
    pad_ascii(&mut out, &block.date, DATE_FIELD);
    pad_ascii(&mut out, &block.title, TITLE_FIELD);
    out.put_i32(block.run_number);
    out.put_bytes(0, RESERVED_MID);
    out.put_i32(block.secondary_header_count);
    out.put_i32(block.record_length);
    out.put_i32(block.block_image_count);
    out.put_i32(block.image_record_length);
    out.put_i32(block.params_per_event);
    out.put_i32(block.data_record_length);
    out.put_bytes(0, RESERVED_TAIL);
    debug_assert_eq!(out.len(), HEADER_BYTES);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block() -> HeaderBlock {
        HeaderBlock {
            run_number: 42,
            title: "Test Run".to_string(),
            date: "06-Aug-26 12:00".to_string(),
            secondary_header_count: 0,
            record_length: HEADER_BYTES as i32,
            block_image_count: 0,
            image_record_length: IMAGE_RECORD_LENGTH,
            params_per_event: 16,
            data_record_length: 8192,
        }
    }

    #[test]
    fn test_header_round_trip() {
        let bytes = write_header(&sample_block());
        assert_eq!(bytes.len(), HEADER_BYTES);
        // The key is the format's required constant, space-padded.
        assert_eq!(&bytes[..4], b"L002");
        assert!(bytes[4..32].iter().all(|&b| b == b' '));

        let mut cur = WordCursor::new(&bytes);
        let block = read_header(&mut cur).unwrap().expect("valid key");
        assert_eq!(cur.remaining(), 0);
        assert_eq!(block.run_number, 42);
        assert_eq!(block.title, "Test Run");
        assert_eq!(block.params_per_event, 16);
        assert_eq!(block.image_record_length, IMAGE_RECORD_LENGTH);
        assert_eq!(block, sample_block());
    }

    #[test]
    fn test_wrong_key_reports_invalid_not_error() {
        let mut bytes = write_header(&sample_block());
        bytes[0] = b'X';
        let mut cur = WordCursor::new(&bytes);
        assert_eq!(read_header(&mut cur).unwrap(), None);
        // The full record is still consumed.
        assert_eq!(cur.remaining(), 0);
    }

    #[test]
    fn test_truncated_header_is_a_decode_error() {
        let bytes = write_header(&sample_block());
        let mut cur = WordCursor::new(&bytes[..100]);
        assert!(read_header(&mut cur).is_err());
    }

    #[test]
    fn test_overlong_title_is_truncated() {
        let mut block = sample_block();
        block.title = "t".repeat(200);
        let bytes = write_header(&block);
        assert_eq!(bytes.len(), HEADER_BYTES);
        let mut cur = WordCursor::new(&bytes);
        let read = read_header(&mut cur).unwrap().expect("valid key");
        assert_eq!(read.title.len(), 80);
    }
}
