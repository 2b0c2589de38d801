//! The three pipeline daemons.
//!
//! Each daemon is a [`Worker`](crate::worker::Worker) with an independent
//! loop: the [`receiver`](receiver::NetReceiver) pulls raw buffers off the
//! network, the [`sorter`](sorter::Sorter) decodes them into events and
//! drives the analysis routine, and the [`storage`](storage::StorageDaemon)
//! archives raw buffers to disk online or replays files offline. Buffers
//! move between them exclusively through ring buffers; control flows
//! exclusively through each daemon's `StateControl` and handle.
//!
//! Every blocking ring operation in a daemon loop uses a bounded timeout so
//! the cooperative state poll is never starved.

pub mod receiver;
pub mod sorter;
pub mod storage;

use std::time::Duration;

/// How long a daemon blocks on a ring before re-polling its state.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(100);
