//! Pipeline assembly and run orchestration.
//!
//! This module is the composition root: it constructs the rings, codecs
//! and daemons with explicit dependencies — no singletons, no process-wide
//! run state — and drives the run-boundary handshakes on behalf of the
//! controller.
//!
//! Online, raw buffers flow receiver → sorting ring → sorter, and (when
//! disk writing is enabled) receiver → storage ring → archiver, so the
//! archived stream is the unmodified front-end stream. Offline, the replay
//! driver feeds the sorting ring from files, and accepted events are
//! re-encoded by the sorter's write path into the storage ring, producing
//! a filtered output stream.

use crate::codec::StreamFormat;
use crate::config::Settings;
use crate::daemon::receiver::{NetReceiver, ReceiverHandle, ReceiverSnapshot};
use crate::daemon::sorter::{EventWriter, Sorter, SorterHandle, SorterSnapshot};
use crate::daemon::storage::{
    OfflineReplay, ReplayHandle, StorageDaemon, StorageHandle, StorageSnapshot,
};
use crate::error::{DaqError, DaqResult};
use crate::ring::RingBuffer;
use crate::run::{
    share_controller, EndRunHandshake, RunContext, RunController, SharedController, SystemClock,
};
use crate::sort::SortRoutine;
use crate::worker::{StateControl, Worker};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// Counter snapshots across the whole pipeline.
#[derive(Debug, Clone, Copy)]
pub struct PipelineStats {
    /// Receiver counters (zeroed offline).
    pub receiver: Option<ReceiverSnapshot>,
    /// Sorter counters.
    pub sorter: SorterSnapshot,
    /// Archiver counters, when disk writing is enabled.
    pub storage: Option<StorageSnapshot>,
}

fn file_stem(title: &str) -> String {
    title
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn output_path(settings: &Settings, ctx: &RunContext) -> PathBuf {
    settings
        .storage
        .output_dir
        .join(format!("run{:04}_{}.evt", ctx.number, file_stem(&ctx.title)))
}

/// Live acquisition pipeline: receiver, sorter and archiver threads plus
/// the run-boundary orchestration.
pub struct OnlinePipeline {
    settings: Settings,
    sorting: RingBuffer,
    storage: RingBuffer,
    receiver: Worker,
    sorter: Worker,
    archiver: Worker,
    receiver_handle: ReceiverHandle,
    sorter_handle: SorterHandle,
    storage_handle: StorageHandle,
    controller: SharedController,
    next_run_number: u32,
    run: Option<RunContext>,
}

impl OnlinePipeline {
    /// Build and spawn the three daemons. Workers start suspended; the
    /// first `begin_run` releases them.
    pub fn start(
        settings: Settings,
        format: StreamFormat,
        mut routine: Box<dyn SortRoutine>,
        controller: Box<dyn RunController>,
        first_run_number: u32,
    ) -> DaqResult<Self> {
        settings.validate()?;
        let write_enabled = settings.sorting.write_enabled;
        routine.set_write_enabled(write_enabled);
        let event_size = routine.event_size();
        let frame_bytes = settings.ring.frame_bytes.max(routine.buffer_size());

        let sorting = RingBuffer::new("sorting", settings.ring.sorting_capacity, frame_bytes);
        let storage = if write_enabled {
            RingBuffer::new("storage", settings.ring.storage_capacity, frame_bytes)
        } else {
            RingBuffer::disabled("storage")
        };

        let (net, receiver_handle) = NetReceiver::bind(
            &settings.acquisition,
            sorting.clone(),
            storage.clone(),
            frame_bytes,
        )?;
        // Online the archived stream is the raw front-end stream; the
        // sorter's re-encode path stays off.
        let (sorter, sorter_handle) = Sorter::new(
            sorting.clone(),
            format.make_input(event_size),
            None,
            routine,
            settings.sorting.sample_interval,
            frame_bytes,
        );
        let (storage_daemon, storage_handle) = StorageDaemon::new(
            storage.clone(),
            format.make_output(event_size, settings.storage.record_length),
            frame_bytes,
        );

        let receiver = net.spawn(StateControl::new())?;
        let sorter = sorter.spawn(StateControl::new())?;
        let archiver = storage_daemon.spawn(StateControl::new())?;
        // The receiver runs from the start so pre-run idle polls are
        // discarded as they arrive; the other daemons wait for begin_run.
        receiver.resume();
        info!(event_size, frame_bytes, write_enabled, "online pipeline assembled");

        Ok(Self {
            settings,
            sorting,
            storage,
            receiver,
            sorter,
            archiver,
            receiver_handle,
            sorter_handle,
            storage_handle,
            controller: share_controller(controller),
            next_run_number: first_run_number,
            run: None,
        })
    }

    /// Begin a run: clear sticky state, open the output file and write its
    /// header, run the routine's begin hook, then release the daemons.
    pub fn begin_run(&mut self, title: &str) -> DaqResult<RunContext> {
        let ctx = RunContext::begin_online(self.next_run_number, title);
        self.sorter_handle.reset_run_state();
        self.storage_handle.reset_reached_run_end();

        if self.settings.sorting.write_enabled {
            std::fs::create_dir_all(&self.settings.storage.output_dir)?;
            let path = output_path(&self.settings, &ctx);
            self.storage_handle.open_event_output_file(&path)?;
            self.storage_handle.write_header(&ctx)?;
        }

        // A failing begin hook aborts the run before any thread moves.
        self.sorter_handle.user_begin().map_err(DaqError::Sort)?;

        self.receiver_handle.begin_run();
        self.receiver.resume();
        self.sorter.resume();
        self.archiver.resume();
        self.run = Some(ctx.clone());
        Ok(ctx)
    }

    /// End the run: drive the stop handshake until the pipeline drains,
    /// then close files, notify the controller and advance the run number.
    ///
    /// `stop_frontend` re-issues the hardware stop command; it is called
    /// once per resend interval until both daemons report caught up.
    pub fn end_run(
        &mut self,
        stop_frontend: impl FnMut(),
        cancelled: impl Fn() -> bool,
    ) -> DaqResult<()> {
        let handshake = EndRunHandshake::new(SystemClock, self.settings.run.stop_resend_interval);
        let sorter_handle = self.sorter_handle.clone();
        let storage_handle = self.storage_handle.clone();
        let failed = self.sorter_handle.clone();
        let drained = handshake.wait_until_caught_up(
            stop_frontend,
            move || sorter_handle.caught_up() && storage_handle.caught_up_online(),
            // A dead sorter can never catch up; its recorded error ends the
            // wait and is returned below.
            move || cancelled() || failed.has_error(),
        );
        if !drained {
            warn!("end-of-run wait cancelled before the pipeline drained");
        }

        // The receiver keeps running between runs, discarding idle polls;
        // only the processing daemons pause.
        self.receiver_handle.end_run();
        self.sorter.suspend();
        self.archiver.suspend();

        let end_result = self.sorter_handle.user_end();
        self.controller.lock().at_sort_end();
        if self.settings.sorting.write_enabled {
            self.storage_handle.close_event_output_file()?;
            self.controller.lock().at_write_end();
        }

        if let Some(run) = self.run.as_mut() {
            run.finish();
        }
        if drained {
            // Run number advances only after a successful run end.
            self.next_run_number += 1;
        }
        self.sorting.reset();
        self.storage.reset();

        if let Some(err) = self.sorter_handle.take_error() {
            return Err(err);
        }
        end_result.map_err(DaqError::Sort)
    }

    /// Query a named monitor value from the analysis routine.
    pub fn monitor(&self, name: &str) -> f64 {
        self.sorter_handle.monitor(name)
    }

    /// The run currently in progress, if any.
    pub fn current_run(&self) -> Option<&RunContext> {
        self.run.as_ref()
    }

    /// Counter snapshots.
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            receiver: Some(self.receiver_handle.stats()),
            sorter: self.sorter_handle.stats(),
            storage: (!self.storage.is_disabled()).then(|| self.storage_handle.stats()),
        }
    }

    /// Address the receiver socket is bound to.
    pub fn receiver_addr(&self) -> std::net::SocketAddr {
        self.receiver_handle.local_addr()
    }

    /// Tear the pipeline down: close the rings to wake any blocked daemon,
    /// then stop and join all three workers.
    pub fn shutdown(mut self) {
        self.sorting.close();
        self.storage.close();
        self.receiver.stop_and_join();
        self.sorter.stop_and_join();
        self.archiver.stop_and_join();
        info!("online pipeline shut down");
    }
}

/// File-replay pipeline: replay driver and sorter threads (plus the
/// archiver when re-encoded output is enabled).
pub struct OfflinePipeline {
    settings: Settings,
    sorting: RingBuffer,
    storage: RingBuffer,
    replay: Worker,
    sorter: Worker,
    archiver: Option<Worker>,
    replay_handle: ReplayHandle,
    sorter_handle: SorterHandle,
    storage_handle: Option<StorageHandle>,
    controller: SharedController,
    run: Option<RunContext>,
}

impl OfflinePipeline {
    /// Build and spawn the replay pipeline over an ordered file list.
    pub fn start(
        settings: Settings,
        format: StreamFormat,
        mut routine: Box<dyn SortRoutine>,
        controller: Box<dyn RunController>,
        files: Vec<PathBuf>,
    ) -> DaqResult<Self> {
        settings.validate()?;
        if files.is_empty() {
            return Err(DaqError::NoInputFiles);
        }
        let write_enabled = settings.sorting.write_enabled;
        routine.set_write_enabled(write_enabled);
        let event_size = routine.event_size();
        let frame_bytes = settings.ring.frame_bytes.max(routine.buffer_size());
        let controller = share_controller(controller);

        let sorting = RingBuffer::new("sorting", settings.ring.sorting_capacity, frame_bytes);
        let storage = if write_enabled {
            RingBuffer::new("storage", settings.ring.storage_capacity, frame_bytes)
        } else {
            RingBuffer::disabled("storage")
        };

        // Offline the output stream is re-encoded from accepted events.
        let writer = write_enabled.then(|| {
            EventWriter::new(
                format.make_output(event_size, settings.storage.record_length),
                storage.clone(),
            )
        });
        let (sorter, sorter_handle) = Sorter::new(
            sorting.clone(),
            format.make_input(event_size),
            writer,
            routine,
            settings.sorting.sample_interval,
            frame_bytes,
        );
        let (replay, replay_handle) = OfflineReplay::new(
            files,
            sorting.clone(),
            settings.storage.record_length,
            SharedController::clone(&controller),
        );

        let (archiver, storage_handle) = if write_enabled {
            let (daemon, handle) = StorageDaemon::new(
                storage.clone(),
                format.make_output(event_size, settings.storage.record_length),
                frame_bytes,
            );
            (Some(daemon.spawn(StateControl::new())?), Some(handle))
        } else {
            (None, None)
        };

        let sorter = sorter.spawn(StateControl::new())?;
        let replay = replay.spawn(StateControl::new())?;
        info!(event_size, frame_bytes, write_enabled, "offline pipeline assembled");

        Ok(Self {
            settings,
            sorting,
            storage,
            replay,
            sorter,
            archiver,
            replay_handle,
            sorter_handle,
            storage_handle,
            controller,
            run: None,
        })
    }

    /// Begin the replay: run the begin hook, open the re-sort output file
    /// if enabled, then release the workers.
    pub fn begin(&mut self, title: &str) -> DaqResult<()> {
        let ctx = RunContext::begin_offline(0, title);
        self.sorter_handle.reset_run_state();

        if let Some(handle) = &self.storage_handle {
            std::fs::create_dir_all(&self.settings.storage.output_dir)?;
            let path = output_path(&self.settings, &ctx);
            handle.open_event_output_file(&path)?;
            handle.write_header(&ctx)?;
        }

        self.sorter_handle.user_begin().map_err(DaqError::Sort)?;

        self.sorter.resume();
        self.replay.resume();
        if let Some(archiver) = &self.archiver {
            archiver.resume();
        }
        self.run = Some(ctx);
        Ok(())
    }

    /// Whether every file has been replayed and the sorting ring drained.
    pub fn is_complete(&self) -> bool {
        self.replay_handle.is_complete() && self.sorting.is_empty()
    }

    /// Block until the replay completes or `cancelled` fires, polling at
    /// the given interval.
    pub fn wait_complete(&self, poll: Duration, cancelled: impl Fn() -> bool) -> bool {
        while !self.is_complete() {
            if cancelled() {
                return false;
            }
            std::thread::sleep(poll);
        }
        // One extra poll so an in-flight buffer finishes decoding.
        std::thread::sleep(poll);
        true
    }

    /// Abandon the replay immediately, irrespective of drain state.
    pub fn cancel(&self) {
        info!("offline sorting cancelled");
        self.sorter_handle.cancel_offline_sorting();
    }

    /// Finish the replay: run the end hooks, close the output file and
    /// notify the controller.
    pub fn finish(&mut self) -> DaqResult<()> {
        // Let the archiver drain what the sorter queued.
        while !self.storage.is_empty() {
            std::thread::sleep(Duration::from_millis(10));
        }
        self.sorter.suspend();
        self.replay.suspend();
        if let Some(archiver) = &self.archiver {
            archiver.suspend();
        }

        let end_result = self.sorter_handle.user_end();
        self.controller.lock().at_sort_end();
        if let Some(handle) = &self.storage_handle {
            handle.close_event_output_file()?;
            self.controller.lock().at_write_end();
        }
        if let Some(run) = self.run.as_mut() {
            run.finish();
        }

        if let Some(err) = self.sorter_handle.take_error() {
            return Err(err);
        }
        end_result.map_err(DaqError::Sort)
    }

    /// Query a named monitor value from the analysis routine.
    pub fn monitor(&self, name: &str) -> f64 {
        self.sorter_handle.monitor(name)
    }

    /// Counter snapshots.
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            receiver: None,
            sorter: self.sorter_handle.stats(),
            storage: self.storage_handle.as_ref().map(|h| h.stats()),
        }
    }

    /// Replay progress counters.
    pub fn replay_handle(&self) -> &ReplayHandle {
        &self.replay_handle
    }

    /// Tear the pipeline down.
    pub fn shutdown(mut self) {
        self.sorting.close();
        self.storage.close();
        self.replay.stop_and_join();
        self.sorter.stop_and_join();
        if let Some(mut archiver) = self.archiver.take() {
            archiver.stop_and_join();
        }
        info!("offline pipeline shut down");
    }
}

/// Convenience for tests and the CLI: an output file path for a run.
pub fn run_output_path(settings: &Settings, ctx: &RunContext) -> PathBuf {
    output_path(settings, ctx)
}
