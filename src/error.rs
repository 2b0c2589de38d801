//! Custom error types for the acquisition engine.
//!
//! This module defines the primary error type, `DaqError`, for the entire
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different kinds of failures that can occur,
//! from configuration and I/O problems to decode errors raised by the codec
//! layer and failures propagated out of the user-supplied sort routine.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: wraps errors from the `config` crate (file parsing,
//!   missing sections, type mismatches in the TOML tree).
//! - **`Configuration`**: semantic configuration errors that parse fine but
//!   are logically invalid (zero ring capacity, empty file list, ...).
//! - **`Io`**: wraps `std::io::Error` for socket and file failures. Daemons
//!   log these and transition toward `Stop` rather than panicking.
//! - **`Decode`**: the single checked decode-error kind produced by the
//!   codec layer for malformed streams. The sorter logs it, abandons the
//!   current buffer and continues with the next one.
//! - **`Sort`**: failures raised by the external analysis routine. These are
//!   never swallowed; they travel up to the run controller.
//! - **`RingClosed`**: a ring buffer was closed while a daemon still wanted
//!   to move data through it; surfaces during shutdown ordering mistakes.
//!
//! Recoverable stream conditions (end of buffer, end of run, unknown words)
//! are *not* errors — they are `codec::EventInputStatus` values.

use crate::codec::DecodeError;
use crate::sort::SortError;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type DaqResult<T> = std::result::Result<T, DaqError>;

/// Top-level error type for the acquisition engine.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration file could not be loaded or deserialized.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Configuration loaded but failed semantic validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Socket or file I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed event stream detected by a codec.
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Failure propagated from the user-supplied sort routine.
    #[error("Sort routine error: {0}")]
    Sort(#[from] SortError),

    /// A ring buffer was closed while data still needed to flow through it.
    #[error("Ring buffer '{0}' is closed")]
    RingClosed(String),

    /// The output file was not open when a write was attempted.
    #[error("Event output file is not open")]
    OutputFileNotOpen,

    /// Offline replay was asked to proceed without any input files.
    #[error("No event input files configured for offline replay")]
    NoInputFiles,

    /// File header failed validation and the caller chose to treat it as fatal.
    #[error("Invalid event file header in '{0}'")]
    InvalidHeader(String),
}
