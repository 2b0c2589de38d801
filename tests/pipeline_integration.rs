//! End-to-end pipeline tests: a mock front end feeding the online
//! pipeline, and offline replay over recorded files, in both stream
//! formats.

use nudaq::codec::{Event, EventInput, EventInputStatus, EventOutput, StreamFormat, WordCursor};
use nudaq::config::Settings;
use nudaq::mock::{MockFrontEnd, SpectrumRoutine};
use nudaq::pipeline::{OfflinePipeline, OnlinePipeline};
use nudaq::run::NullController;
use serial_test::serial;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn test_settings(output_dir: &Path, write_enabled: bool) -> Settings {
    let mut settings = Settings::default();
    settings.acquisition.bind_address = "127.0.0.1:0".to_string();
    settings.acquisition.receive_timeout = Duration::from_millis(30);
    settings.run.stop_resend_interval = Duration::from_millis(100);
    settings.storage.output_dir = output_dir.to_path_buf();
    settings.storage.record_length = 1024;
    settings.ring.frame_bytes = 4096;
    settings.sorting.write_enabled = write_enabled;
    settings
}

/// Write one recorded event file: header, one data record per call chunk,
/// terminated by a buffer-end or run-end marker.
fn write_event_file(
    path: &Path,
    format: StreamFormat,
    run_number: u32,
    values: &[i32],
    end_run: bool,
) {
    let ctx = nudaq::run::RunContext::begin_offline(run_number, "recorded");
    let mut codec = format.make_output(16, 1024);
    let mut bytes = codec.header_bytes(&ctx);
    let mut frame = Vec::new();
    for &v in values {
        let mut event = Event::new(16);
        event.set(0, v);
        event.set(3, v + 1);
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

/// Decode every event out of a recorded file, asserting the header.
fn decode_event_file(path: &Path, format: StreamFormat) -> Vec<Vec<(usize, i32)>> {
    let bytes = std::fs::read(path).unwrap();
    let mut input = format.make_input(16);
    let mut cursor = WordCursor::new(&bytes);
    assert!(input.read_header(&mut cursor).unwrap(), "header key must match");

    let mut event = Event::new(16);
    let mut events = Vec::new();
    loop {
        match input.read_event(&mut cursor, &mut event).unwrap() {
            EventInputStatus::Event => {
                events.push(event.populated().collect());
                event.clear();
            }
            EventInputStatus::EndRun | EventInputStatus::EndFile => break,
            _ => {}
        }
    }
    events
}

#[test]
#[serial]
fn test_online_runs_end_to_end_with_archiving() {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path(), true);
    let mut pipeline = OnlinePipeline::start(
        settings,
        StreamFormat::L002,
        Box::new(SpectrumRoutine::new(16)),
        Box::new(NullController),
        1,
    )
    .unwrap();
    let addr = pipeline.receiver_addr();

    // First run.
    let ctx = pipeline.begin_run("Test Run").unwrap();
    assert_eq!(ctx.number, 1);

    let mut frontend = MockFrontEnd::connect(addr, StreamFormat::L002, 16, 1024).unwrap();
    for _ in 0..10 {
        frontend.send_buffer(20).unwrap();
    }
    frontend.send_run_end().unwrap();

    pipeline.end_run(|| {}, || false).unwrap();
    let stats = pipeline.stats();
    assert_eq!(stats.sorter.events_received, 200);
    assert_eq!(stats.sorter.events_sorted, 200);
    assert_eq!(pipeline.monitor("events"), 200.0);
    let receiver = stats.receiver.unwrap();
    assert_eq!(receiver.packets, 11);

    // The archived stream is the raw front-end stream, header first.
    let archive = dir.path().join("run0001_Test_Run.evt");
    let bytes = std::fs::read(&archive).unwrap();
    assert_eq!(&bytes[..4], b"L002");
    assert!(bytes.len() > 256);

    // Second run: the run number advanced by exactly one and the rings
    // are reused.
    let ctx = pipeline.begin_run("Second").unwrap();
    assert_eq!(ctx.number, 2);
    frontend.send_buffer(5).unwrap();
    frontend.send_run_end().unwrap();
    pipeline.end_run(|| {}, || false).unwrap();
    assert_eq!(pipeline.monitor("events"), 5.0);
    assert!(dir.path().join("run0002_Second.evt").exists());

    pipeline.shutdown();
}

#[test]
#[serial]
fn test_online_pre_run_idle_polls_are_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path(), false);
    let mut pipeline = OnlinePipeline::start(
        settings,
        StreamFormat::L002,
        Box::new(SpectrumRoutine::new(16)),
        Box::new(NullController),
        1,
    )
    .unwrap();
    let addr = pipeline.receiver_addr();

    let frontend = MockFrontEnd::connect(addr, StreamFormat::L002, 16, 1024).unwrap();
    // The receiver runs before the first begin_run precisely so idle polls
    // from the front end are discarded rather than queued.
    frontend.send_idle_poll().unwrap();
    frontend.send_idle_poll().unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while pipeline.stats().receiver.unwrap().discarded_pre_run < 2
        && std::time::Instant::now() < deadline
    {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(pipeline.stats().receiver.unwrap().discarded_pre_run, 2);

    // Idle polls never reached the sorting ring.
    pipeline.begin_run("gate check").unwrap();
    std::thread::sleep(Duration::from_millis(100));
    let stats = pipeline.stats();
    assert_eq!(stats.sorter.buffers, 0);
    assert_eq!(stats.receiver.unwrap().packets, 0);

    pipeline.shutdown();
}

#[test]
fn test_offline_replay_resorts_and_reencodes() {
    let dir = tempfile::tempdir().unwrap();
    let mut files = Vec::new();
    let chunks: [&[i32]; 3] = [&[10, 20], &[30], &[40, 50, 60]];
    for (i, values) in chunks.into_iter().enumerate() {
        let path = dir.path().join(format!("recorded{i}.evt"));
        write_event_file(&path, StreamFormat::L002, 5, values, i == 2);
        files.push(path);
    }

    let out_dir = dir.path().join("resorted");
    let settings = test_settings(&out_dir, true);
    let mut pipeline = OfflinePipeline::start(
        settings,
        StreamFormat::L002,
        Box::new(SpectrumRoutine::new(16)),
        Box::new(NullController),
        files,
    )
    .unwrap();

    pipeline.begin("resort").unwrap();
    assert!(pipeline.wait_complete(Duration::from_millis(50), || false));
    pipeline.finish().unwrap();

    let stats = pipeline.stats();
    assert_eq!(stats.sorter.events_received, 6);
    assert_eq!(stats.sorter.events_sorted, 6);
    assert_eq!(pipeline.replay_handle().stats().files_replayed, 3);

    // The re-encoded output replays to the same events.
    let resorted = decode_event_file(&out_dir.join("run0000_resort.evt"), StreamFormat::L002);
    assert_eq!(resorted.len(), 6);
    assert_eq!(resorted[0], vec![(0, 10), (3, 11)]);
    assert_eq!(resorted[5], vec![(0, 60), (3, 61)]);

    pipeline.shutdown();
}

#[test]
fn test_offline_replay_caen_format() {
    let dir = tempfile::tempdir().unwrap();
    let mut files = Vec::new();
    let chunks: [&[i32]; 2] = [&[1, 2], &[3, 4]];
    for (i, values) in chunks.into_iter().enumerate() {
        let path = dir.path().join(format!("caen{i}.evt"));
        write_event_file(&path, StreamFormat::Caen, 9, values, i == 1);
        files.push(path);
    }

    let settings = test_settings(dir.path(), false);
    let mut pipeline = OfflinePipeline::start(
        settings,
        StreamFormat::Caen,
        Box::new(SpectrumRoutine::new(16)),
        Box::new(NullController),
        files,
    )
    .unwrap();

    pipeline.begin("caen replay").unwrap();
    assert!(pipeline.wait_complete(Duration::from_millis(50), || false));
    pipeline.finish().unwrap();

    let stats = pipeline.stats();
    assert_eq!(stats.sorter.events_received, 4);
    assert_eq!(pipeline.replay_handle().first_header().map(|h| h.run_number), Some(9));

    pipeline.shutdown();
}

#[test]
fn test_offline_sampling_interval() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sampled.evt");
    write_event_file(
        &path,
        StreamFormat::L002,
        2,
        &[1, 2, 3, 4, 5, 6, 7, 8, 9],
        true,
    );

    let mut settings = test_settings(dir.path(), false);
    settings.sorting.sample_interval = 4;
    let mut pipeline = OfflinePipeline::start(
        settings,
        StreamFormat::L002,
        Box::new(SpectrumRoutine::new(16)),
        Box::new(NullController),
        vec![path],
    )
    .unwrap();

    pipeline.begin("sampled").unwrap();
    assert!(pipeline.wait_complete(Duration::from_millis(50), || false));
    pipeline.finish().unwrap();

    let stats = pipeline.stats();
    assert_eq!(stats.sorter.events_received, 9);
    // Events 1, 5 and 9 pass the 1-in-4 gate.
    assert_eq!(stats.sorter.events_sorted, 3);

    pipeline.shutdown();
}

#[test]
fn test_cancel_offline_sorting_abandons_replay() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("big.evt");
    let values: Vec<i32> = (1..=100).collect();
    write_event_file(&path, StreamFormat::L002, 1, &values, false);

    let settings = test_settings(dir.path(), false);
    let mut pipeline = OfflinePipeline::start(
        settings,
        StreamFormat::L002,
        Box::new(SpectrumRoutine::new(16)),
        Box::new(NullController),
        vec![path],
    )
    .unwrap();

    pipeline.begin("cancelled").unwrap();
    pipeline.cancel();
    // Cancellation is immediate: no drain gating, shutdown cannot hang.
    pipeline.finish().unwrap();
    pipeline.shutdown();
}

#[test]
fn test_empty_file_list_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path(), false);
    let result = OfflinePipeline::start(
        settings,
        StreamFormat::L002,
        Box::new(SpectrumRoutine::new(16)),
        Box::new(NullController),
        Vec::new(),
    );
    assert!(result.is_err());
}
