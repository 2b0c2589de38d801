//! # nudaq Core Library
//!
//! This crate is the acquisition core of a nuclear-physics data-taking
//! system: it ingests a continuous stream of raw instrumentation buffers
//! from front-end hardware, decodes them into discrete events (fixed-size
//! parameter arrays), feeds each event to a user-supplied analysis routine,
//! and optionally re-encodes and archives events to disk — both live
//! ("online") and replaying recorded files ("offline").
//!
//! ## Crate Structure
//!
//! - **`worker`**: the cooperatively cancellable thread primitive every
//!   daemon runs on — a tri-state `Run`/`Suspend`/`Stop` control polled at
//!   loop-iteration boundaries.
//! - **`ring`**: bounded, blocking ring buffers of reusable frames; the
//!   only channel raw buffers move through between threads.
//! - **`codec`**: pluggable binary event-stream codecs — the word-tagged
//!   tape format, the CAEN FIFO-reassembly format, and the shared 256-byte
//!   header record they embed.
//! - **`daemon`**: the three pipeline daemons — network receiver, sorter,
//!   and storage (online archiver / offline replay driver).
//! - **`sort`**: the contract the user-supplied analysis routine
//!   implements, and how its failures propagate.
//! - **`run`**: run context values, the controller callback contract, and
//!   the end-of-run stop/caught-up handshake.
//! - **`pipeline`**: the composition root wiring rings, codecs and daemons
//!   together with explicit dependency injection.
//! - **`config`**: TOML-backed settings for the whole engine.
//! - **`error`**: the central `DaqError` type.
//! - **`logging`**: `tracing` subscriber setup.
//! - **`mock`**: a simulated front end and a demo histogramming routine
//!   for hardware-free operation and tests.

pub mod codec;
pub mod config;
pub mod daemon;
pub mod error;
pub mod logging;
pub mod mock;
pub mod pipeline;
pub mod ring;
pub mod run;
pub mod sort;
pub mod worker;

pub use crate::error::{DaqError, DaqResult};
