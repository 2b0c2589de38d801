//! Storage daemon: raw-buffer archiving online, file replay offline.
//!
//! Online, the daemon drains the storage ring and appends each raw frame to
//! the currently open event output file; the controller opens the file and
//! writes its header at run begin, and closes it once the end-of-run
//! handshake reports the pipeline drained. The daemon tracks whether a
//! frame carrying the run-end marker has been written, which feeds the
//! `caught_up_online` predicate.
//!
//! Offline there is no network thread; the replay driver owns the ordered
//! input-file list, validates each file's header, slices the file into
//! data records and feeds them to the sorting ring, opening the next file
//! at EOF so the sorter never stalls between files. When the list is
//! exhausted the run controller's `open_next_file` is consulted once;
//! completion is signalled exactly once.

use super::POLL_INTERVAL;
use crate::codec::header::{self, HeaderBlock};
use crate::codec::{EventOutput, WordCursor};
use crate::error::{DaqError, DaqResult};
use crate::ring::{GetOutcome, PutOutcome, RawBuffer, RingBuffer};
use crate::run::{RunContext, SharedController};
use crate::worker::{StateControl, Worker};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Online archiver counters.
#[derive(Debug, Default)]
pub struct StorageStats {
    frames_written: AtomicU64,
    bytes_written: AtomicU64,
    files_opened: AtomicU64,
    dropped_frames: AtomicU64,
}

/// Point-in-time copy of the archiver counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageSnapshot {
    /// Raw frames appended to output files.
    pub frames_written: u64,
    /// Bytes appended.
    pub bytes_written: u64,
    /// Output files opened.
    pub files_opened: u64,
    /// Frames that arrived with no open output file.
    pub dropped_frames: u64,
}

impl StorageStats {
    fn snapshot(&self) -> StorageSnapshot {
        StorageSnapshot {
            frames_written: self.frames_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            files_opened: self.files_opened.load(Ordering::Relaxed),
            dropped_frames: self.dropped_frames.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
struct OutputFile {
    path: PathBuf,
    writer: BufWriter<File>,
}

type SharedOutput = Arc<Mutex<Option<OutputFile>>>;
type SharedCodec = Arc<Mutex<Box<dyn EventOutput>>>;

/// Controller-side view of the online archiver.
#[derive(Clone)]
pub struct StorageHandle {
    ring: RingBuffer,
    codec: SharedCodec,
    file: SharedOutput,
    stats: Arc<StorageStats>,
    reached_run_end: Arc<AtomicBool>,
}

impl StorageHandle {
    /// Create the event output file for a run.
    pub fn open_event_output_file(&self, path: &Path) -> DaqResult<()> {
        let file = File::create(path)?;
        let mut slot = self.file.lock();
        if let Some(previous) = slot.take() {
            warn!(path = %previous.path.display(), "output file replaced while open");
        }
        *slot = Some(OutputFile {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        });
        self.stats.files_opened.fetch_add(1, Ordering::Relaxed);
        info!(path = %path.display(), "event output file opened");
        Ok(())
    }

    /// Write the run header record, delegating to the output codec.
    pub fn write_header(&self, ctx: &RunContext) -> DaqResult<()> {
        let bytes = self.codec.lock().header_bytes(ctx);
        let mut slot = self.file.lock();
        let open = slot.as_mut().ok_or(DaqError::OutputFileNotOpen)?;
        open.writer.write_all(&bytes)?;
        self.stats
            .bytes_written
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Flush and close the event output file.
    pub fn close_event_output_file(&self) -> DaqResult<()> {
        let mut slot = self.file.lock();
        if let Some(mut open) = slot.take() {
            open.writer.flush()?;
            info!(path = %open.path.display(), "event output file closed");
        }
        Ok(())
    }

    /// End-of-run handshake predicate: the storage ring is drained and the
    /// end-of-run frame has been written. Trivially true when storage is
    /// disabled.
    pub fn caught_up_online(&self) -> bool {
        if self.ring.is_disabled() {
            return true;
        }
        self.ring.is_empty() && self.reached_run_end.load(Ordering::SeqCst)
    }

    /// Clear sticky end-of-run detection between runs.
    pub fn reset_reached_run_end(&self) {
        self.reached_run_end.store(false, Ordering::SeqCst);
    }

    /// Current counter values.
    pub fn stats(&self) -> StorageSnapshot {
        self.stats.snapshot()
    }
}

/// The online archiver daemon, pre-spawn.
pub struct StorageDaemon {
    ring: RingBuffer,
    codec: SharedCodec,
    file: SharedOutput,
    frame_bytes: usize,
    stats: Arc<StorageStats>,
    reached_run_end: Arc<AtomicBool>,
}

impl StorageDaemon {
    /// Build the archiver over the storage ring and an output codec.
    pub fn new(
        ring: RingBuffer,
        codec: Box<dyn EventOutput>,
        frame_bytes: usize,
    ) -> (Self, StorageHandle) {
        let codec: SharedCodec = Arc::new(Mutex::new(codec));
        let file: SharedOutput = Arc::new(Mutex::new(None));
        let stats = Arc::new(StorageStats::default());
        let reached_run_end = Arc::new(AtomicBool::new(false));
        let handle = StorageHandle {
            ring: ring.clone(),
            codec: Arc::clone(&codec),
            file: Arc::clone(&file),
            stats: Arc::clone(&stats),
            reached_run_end: Arc::clone(&reached_run_end),
        };
        (
            Self {
                ring,
                codec,
                file,
                frame_bytes,
                stats,
                reached_run_end,
            },
            handle,
        )
    }

    /// Spawn the daemon thread.
    pub fn spawn(self, state: Arc<StateControl>) -> std::io::Result<Worker> {
        let loop_state = Arc::clone(&state);
        Worker::spawn("storage", state, move || self.run_loop(&loop_state))
    }

    fn run_loop(self, state: &StateControl) {
        let mut frame = RawBuffer::with_capacity(self.frame_bytes);
        while state.check() {
            match self.ring.get_timeout(&mut frame, POLL_INTERVAL) {
                GetOutcome::Received(n) => {
                    if let Err(e) = self.archive(frame.as_slice()) {
                        error!(error = %e, bytes = n, "archive failed; stopping storage daemon");
                        state.set(crate::worker::WorkerState::Stop);
                        break;
                    }
                }
                GetOutcome::TimedOut => continue,
                GetOutcome::Closed | GetOutcome::Disabled => break,
            }
        }
        info!(stats = ?self.stats.snapshot(), "storage daemon exiting");
    }

    fn archive(&self, payload: &[u8]) -> DaqResult<()> {
        let mut slot = self.file.lock();
        let Some(open) = slot.as_mut() else {
            self.stats.dropped_frames.fetch_add(1, Ordering::Relaxed);
            warn!("raw frame received with no open output file");
            return Ok(());
        };
        open.writer.write_all(payload)?;
        self.stats.frames_written.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_written
            .fetch_add(payload.len() as u64, Ordering::Relaxed);
        if self.codec.lock().buffer_ends_run(payload) {
            debug!("run-end frame archived");
            self.reached_run_end.store(true, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Offline replay counters.
#[derive(Debug, Default)]
pub struct ReplayStats {
    files_replayed: AtomicU64,
    records_fed: AtomicU64,
}

/// Point-in-time copy of the replay counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplaySnapshot {
    /// Input files opened and replayed.
    pub files_replayed: u64,
    /// Data records fed to the sorting ring.
    pub records_fed: u64,
}

impl ReplayStats {
    fn snapshot(&self) -> ReplaySnapshot {
        ReplaySnapshot {
            files_replayed: self.files_replayed.load(Ordering::Relaxed),
            records_fed: self.records_fed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
struct OpenInput {
    path: PathBuf,
    reader: BufReader<File>,
    record_len: usize,
}

/// Controller-side view of the offline replay driver.
#[derive(Clone)]
pub struct ReplayHandle {
    files: Arc<Mutex<VecDeque<PathBuf>>>,
    complete: Arc<AtomicBool>,
    stats: Arc<ReplayStats>,
    first_header: Arc<Mutex<Option<HeaderBlock>>>,
}

impl ReplayHandle {
    /// Whether unopened files remain in the list.
    pub fn has_more_files(&self) -> bool {
        !self.files.lock().is_empty()
    }

    /// Append a file to the replay list.
    pub fn add_file(&self, path: PathBuf) {
        self.files.lock().push_back(path);
    }

    /// True once the whole list has been replayed.
    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::SeqCst)
    }

    /// Header of the first replayed file, once available.
    pub fn first_header(&self) -> Option<HeaderBlock> {
        self.first_header.lock().clone()
    }

    /// Current counter values.
    pub fn stats(&self) -> ReplaySnapshot {
        self.stats.snapshot()
    }
}

/// Offline role of the storage daemon: drives file sequencing.
pub struct OfflineReplay {
    files: Arc<Mutex<VecDeque<PathBuf>>>,
    sorting: RingBuffer,
    fallback_record_len: usize,
    controller: SharedController,
    current: Option<OpenInput>,
    complete: Arc<AtomicBool>,
    stats: Arc<ReplayStats>,
    first_header: Arc<Mutex<Option<HeaderBlock>>>,
}

impl OfflineReplay {
    /// Build the replay driver over an ordered file list.
    pub fn new(
        files: Vec<PathBuf>,
        sorting: RingBuffer,
        fallback_record_len: usize,
        controller: SharedController,
    ) -> (Self, ReplayHandle) {
        let files = Arc::new(Mutex::new(files.into_iter().collect::<VecDeque<_>>()));
        let complete = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(ReplayStats::default());
        let first_header = Arc::new(Mutex::new(None));
        let handle = ReplayHandle {
            files: Arc::clone(&files),
            complete: Arc::clone(&complete),
            stats: Arc::clone(&stats),
            first_header: Arc::clone(&first_header),
        };
        (
            Self {
                files,
                sorting,
                fallback_record_len,
                controller,
                current: None,
                complete,
                stats,
                first_header,
            },
            handle,
        )
    }

    /// Whether unopened files remain in the list.
    pub fn has_more_files(&self) -> bool {
        !self.files.lock().is_empty()
    }

    /// Open the next file from the list, reading and validating its
    /// header. Invalid files are logged and skipped. Returns `false` when
    /// the list is exhausted.
    pub fn open_event_input_list_file(&mut self) -> bool {
        loop {
            let Some(path) = self.files.lock().pop_front() else {
                return false;
            };
            match Self::open_file(&path, self.fallback_record_len) {
                Ok((open, block)) => {
                    info!(
                        path = %open.path.display(),
                        run = block.run_number,
                        record_len = open.record_len,
                        "replaying event file"
                    );
                    self.first_header.lock().get_or_insert(block);
                    self.stats.files_replayed.fetch_add(1, Ordering::Relaxed);
                    self.current = Some(open);
                    return true;
                }
                Err(e) => {
                    error!(path = %path.display(), error = %e, "skipping unreadable event file");
                }
            }
        }
    }

    /// Close the file currently being replayed.
    pub fn close_event_input_list_file(&mut self) {
        if let Some(open) = self.current.take() {
            debug!(path = %open.path.display(), "event input file closed");
        }
    }

    fn open_file(path: &Path, fallback_record_len: usize) -> DaqResult<(OpenInput, HeaderBlock)> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut header_bytes = [0u8; header::HEADER_BYTES];
        reader.read_exact(&mut header_bytes)?;
        let mut cursor = WordCursor::new(&header_bytes);
        let block = header::read_header(&mut cursor)?
            .ok_or_else(|| DaqError::InvalidHeader(path.display().to_string()))?;
        let record_len = if block.data_record_length > 0 {
            block.data_record_length as usize
        } else {
            fallback_record_len
        };
        Ok((
            OpenInput {
                path: path.to_path_buf(),
                reader,
                record_len,
            },
            block,
        ))
    }

    /// Spawn the replay thread.
    pub fn spawn(self, state: Arc<StateControl>) -> std::io::Result<Worker> {
        let loop_state = Arc::clone(&state);
        Worker::spawn("replay", state, move || self.run_loop(&loop_state))
    }

    fn run_loop(mut self, state: &StateControl) {
        let mut record = vec![0u8; self.max_record_len()];
        while state.check() {
            if self.complete.load(Ordering::SeqCst) {
                std::thread::sleep(POLL_INTERVAL);
                continue;
            }
            if self.current.is_none() && !self.advance() {
                continue;
            }
            if record.len() < self.max_record_len() {
                record.resize(self.max_record_len(), 0);
            }
            let Some(open) = self.current.as_mut() else {
                continue;
            };
            let want = open.record_len;
            match read_record(&mut open.reader, &mut record[..want]) {
                Ok(0) => {
                    // End of this file; the next one opens on the next
                    // iteration so the sorter never stalls between files.
                    self.close_event_input_list_file();
                }
                Ok(n) => {
                    self.stats.records_fed.fetch_add(1, Ordering::Relaxed);
                    if !feed(&self.sorting, &record[..n], state) {
                        break;
                    }
                }
                Err(e) => {
                    error!(error = %e, "read failed; abandoning file");
                    self.close_event_input_list_file();
                }
            }
        }
        info!(stats = ?self.stats.snapshot(), "replay driver exiting");
    }

    fn max_record_len(&self) -> usize {
        self.current
            .as_ref()
            .map_or(self.fallback_record_len, |o| o.record_len)
            .max(self.fallback_record_len)
    }

    /// Open the next file, consulting the controller once when the list is
    /// exhausted. Returns `false` if the replay is over.
    fn advance(&mut self) -> bool {
        if self.open_event_input_list_file() {
            return true;
        }
        let extended = self.controller.lock().open_next_file();
        if extended && self.open_event_input_list_file() {
            return true;
        }
        if !self.complete.swap(true, Ordering::SeqCst) {
            info!("event input list exhausted; replay complete");
        }
        false
    }
}

/// Fill `buf` from the reader, tolerating short reads. Returns the number
/// of bytes read; 0 means end of file.
fn read_record(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Blocking put that stays responsive to stop requests. Returns `false`
/// when the driver should exit.
fn feed(ring: &RingBuffer, payload: &[u8], state: &StateControl) -> bool {
    loop {
        match ring.put_timeout(payload, POLL_INTERVAL) {
            PutOutcome::Stored => return true,
            PutOutcome::Disabled => return true,
            PutOutcome::TimedOut => {
                if state.is_stopped() {
                    return false;
                }
            }
            PutOutcome::Closed => {
                warn!(ring = ring.name(), "sorting ring closed during replay");
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::l002::L002Output;
    use crate::codec::Event;
    use crate::run::{share_controller, NullController, RunContext};
    use crate::worker::WorkerState;
    use std::time::Duration;

    fn write_event_file(path: &Path, run_number: u32, values: &[i32], end_run: bool) {
        let ctx = RunContext::begin_offline(run_number, "replay test");
        let mut codec = L002Output::new(16, 128);
        let mut bytes = codec.header_bytes(&ctx);
        let mut frame = Vec::new();
        for &v in values {
            let mut event = Event::new(16);
            event.set(0, v);
            assert!(codec.write_event(&mut frame, &event));
        }
        if end_run {
            codec.end_run(&mut frame);
        } else {
            codec.end_buffer(&mut frame);
        }
        bytes.extend_from_slice(&frame);
        std::fs::write(path, bytes).unwrap();
    }

    #[test]
    fn test_online_archiver_appends_and_detects_run_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run0001.evt");
        let ring = RingBuffer::new("storage", 4, 512);
        let (daemon, handle) =
            StorageDaemon::new(ring.clone(), Box::new(L002Output::new(16, 128)), 512);

        handle.open_event_output_file(&path).unwrap();
        let ctx = RunContext::begin_online(1, "archive test");
        handle.write_header(&ctx).unwrap();
        assert!(!handle.caught_up_online());

        let state = StateControl::new();
        let mut worker = daemon.spawn(Arc::clone(&state)).unwrap();
        state.set(WorkerState::Run);

        let mut codec = L002Output::new(16, 128);
        let mut frame = Vec::new();
        let mut event = Event::new(16);
        event.set(4, 44);
        codec.write_event(&mut frame, &event);
        codec.end_buffer(&mut frame);
        ring.put(&frame);

        let mut run_end_frame = Vec::new();
        codec.end_run(&mut run_end_frame);
        ring.put(&run_end_frame);

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !handle.caught_up_online() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(handle.caught_up_online());
        worker.stop_and_join();
        handle.close_event_output_file().unwrap();

        let written = std::fs::read(&path).unwrap();
        assert_eq!(written.len(), header::HEADER_BYTES + 2 * 128);
        assert_eq!(&written[..4], b"L002");
        assert_eq!(handle.stats().frames_written, 2);
    }

    #[test]
    fn test_write_header_requires_open_file() {
        let ring = RingBuffer::disabled("storage-off");
        let (_daemon, handle) = StorageDaemon::new(ring, Box::new(L002Output::new(16, 128)), 512);
        let ctx = RunContext::begin_online(1, "no file");
        assert!(matches!(
            handle.write_header(&ctx),
            Err(DaqError::OutputFileNotOpen)
        ));
        // Disabled storage is always caught up.
        assert!(handle.caught_up_online());
    }

    #[test]
    fn test_replay_visits_files_in_list_order_and_completes_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = Vec::new();
        let parts: [&[i32]; 3] = [&[1, 2], &[3], &[4, 5]];
        for (i, values) in parts.into_iter().enumerate() {
            let path = dir.path().join(format!("part{i}.evt"));
            write_event_file(&path, 7, values, i == 2);
            paths.push(path);
        }

        let ring = RingBuffer::new("sorting", 64, 512);
        let (replay, handle) = OfflineReplay::new(
            paths,
            ring.clone(),
            512,
            share_controller(Box::new(NullController)),
        );
        assert!(handle.has_more_files());

        let state = StateControl::new();
        let mut worker = replay.spawn(Arc::clone(&state)).unwrap();
        state.set(WorkerState::Run);

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !handle.is_complete() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(handle.is_complete());
        assert!(!handle.has_more_files());
        assert_eq!(handle.stats().files_replayed, 3);
        // One data record per file.
        assert_eq!(handle.stats().records_fed, 3);
        assert_eq!(handle.first_header().map(|h| h.run_number), Some(7));
        worker.stop_and_join();

        // All three records arrived in list order.
        let mut scratch = RawBuffer::with_capacity(512);
        for _ in 0..3 {
            assert!(matches!(
                ring.get_timeout(&mut scratch, Duration::from_millis(100)),
                GetOutcome::Received(_)
            ));
        }
        assert_eq!(
            ring.get_timeout(&mut scratch, Duration::from_millis(50)),
            GetOutcome::TimedOut
        );
    }

    #[test]
    fn test_invalid_header_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("bad.evt");
        std::fs::write(&bad, vec![0u8; 400]).unwrap();
        let good = dir.path().join("good.evt");
        write_event_file(&good, 3, &[9], true);

        let ring = RingBuffer::new("sorting", 8, 512);
        let (mut replay, handle) = OfflineReplay::new(
            vec![bad, good],
            ring,
            512,
            share_controller(Box::new(NullController)),
        );

        assert!(replay.open_event_input_list_file());
        assert_eq!(handle.stats().files_replayed, 1);
        assert_eq!(handle.first_header().map(|h| h.run_number), Some(3));
        replay.close_event_input_list_file();
        assert!(!replay.has_more_files());
    }
}
