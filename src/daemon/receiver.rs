//! Network receiver daemon.
//!
//! Receives raw buffers from the front-end hardware — one UDP datagram per
//! buffer — and forwards them to the sorting ring always and the storage
//! ring when disk writing is enabled (the storage ring is a disabled ring
//! otherwise, so that path costs nothing). A socket receive timeout keeps
//! the loop responsive to state polls; `Stop` drops the socket on exit.

use super::POLL_INTERVAL;
use crate::config::AcquisitionSettings;
use crate::error::DaqResult;
use crate::ring::{PutOutcome, RawBuffer, RingBuffer};
use crate::worker::{StateControl, Worker};
use std::io::ErrorKind;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Receive-side counters, updated by the daemon and read by monitors.
#[derive(Debug, Default)]
pub struct ReceiverStats {
    packets: AtomicU64,
    bytes: AtomicU64,
    discarded_pre_run: AtomicU64,
}

/// Point-in-time copy of the receiver counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverSnapshot {
    /// Datagrams accepted and forwarded.
    pub packets: u64,
    /// Payload bytes accepted.
    pub bytes: u64,
    /// Idle-poll buffers dropped before the run began.
    pub discarded_pre_run: u64,
}

impl ReceiverStats {
    fn snapshot(&self) -> ReceiverSnapshot {
        ReceiverSnapshot {
            packets: self.packets.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            discarded_pre_run: self.discarded_pre_run.load(Ordering::Relaxed),
        }
    }
}

/// Controller-side view of a running receiver.
#[derive(Debug, Clone)]
pub struct ReceiverHandle {
    stats: Arc<ReceiverStats>,
    run_active: Arc<AtomicBool>,
    local_addr: std::net::SocketAddr,
}

impl ReceiverHandle {
    /// Buffers received from now on belong to a live run.
    pub fn begin_run(&self) {
        self.run_active.store(true, Ordering::SeqCst);
    }

    /// The run has ended; pre-run discarding resumes.
    pub fn end_run(&self) {
        self.run_active.store(false, Ordering::SeqCst);
    }

    /// Current counter values.
    pub fn stats(&self) -> ReceiverSnapshot {
        self.stats.snapshot()
    }

    /// Address the receive socket is bound to.
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }
}

/// The receiver daemon, pre-spawn.
#[derive(Debug)]
pub struct NetReceiver {
    socket: UdpSocket,
    sorting: RingBuffer,
    storage: RingBuffer,
    frame_bytes: usize,
    discard_pre_run: bool,
    stats: Arc<ReceiverStats>,
    run_active: Arc<AtomicBool>,
}

impl NetReceiver {
    /// Bind the receive socket and build the daemon.
    pub fn bind(
        settings: &AcquisitionSettings,
        sorting: RingBuffer,
        storage: RingBuffer,
        frame_bytes: usize,
    ) -> DaqResult<(Self, ReceiverHandle)> {
        let socket = UdpSocket::bind(&settings.bind_address)?;
        socket.set_read_timeout(Some(settings.receive_timeout))?;
        if let Some(peer) = &settings.frontend_address {
            socket.connect(peer)?;
        }
        let local_addr = socket.local_addr()?;
        info!(addr = %local_addr, "receiver socket bound");

        let stats = Arc::new(ReceiverStats::default());
        let run_active = Arc::new(AtomicBool::new(false));
        let handle = ReceiverHandle {
            stats: Arc::clone(&stats),
            run_active: Arc::clone(&run_active),
            local_addr,
        };
        Ok((
            Self {
                socket,
                sorting,
                storage,
                frame_bytes,
                discard_pre_run: settings.discard_pre_run,
                stats,
                run_active,
            },
            handle,
        ))
    }

    /// Spawn the daemon thread.
    pub fn spawn(self, state: Arc<StateControl>) -> std::io::Result<Worker> {
        let loop_state = Arc::clone(&state);
        Worker::spawn("net-receiver", state, move || self.run_loop(&loop_state))
    }

    fn run_loop(self, state: &StateControl) {
        let mut frame = RawBuffer::with_capacity(self.frame_bytes);
        while state.check() {
            let received = match self.socket.recv(frame.storage_mut()) {
                Ok(n) => n,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "receive failed; stopping receiver");
                    state.set(crate::worker::WorkerState::Stop);
                    break;
                }
            };
            frame.set_len(received);

            if frame.is_empty()
                && self.discard_pre_run
                && !self.run_active.load(Ordering::SeqCst)
            {
                // Idle polls from the front end before begin-of-run.
                self.stats.discarded_pre_run.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            self.stats.packets.fetch_add(1, Ordering::Relaxed);
            self.stats
                .bytes
                .fetch_add(received as u64, Ordering::Relaxed);

            if !forward(&self.sorting, frame.as_slice(), state) {
                break;
            }
            if !forward(&self.storage, frame.as_slice(), state) {
                break;
            }
        }
        let stats = self.stats.snapshot();
        info!(
            packets = stats.packets,
            bytes = stats.bytes,
            discarded = stats.discarded_pre_run,
            "receiver exiting"
        );
        // Socket closes when `self` drops.
    }
}

/// Blocking put that stays responsive to stop requests. Returns `false`
/// when the daemon should exit.
fn forward(ring: &RingBuffer, payload: &[u8], state: &StateControl) -> bool {
    loop {
        match ring.put_timeout(payload, POLL_INTERVAL) {
            PutOutcome::Stored | PutOutcome::Disabled => return true,
            PutOutcome::TimedOut => {
                // Back-pressure from a slow consumer; keep trying unless
                // the controller wants us gone.
                if state.is_stopped() {
                    return false;
                }
            }
            PutOutcome::Closed => {
                warn!(ring = ring.name(), "ring closed while forwarding");
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkerState;
    use serial_test::serial;
    use std::time::Duration;

    fn test_settings(bind: &str) -> AcquisitionSettings {
        AcquisitionSettings {
            bind_address: bind.to_string(),
            frontend_address: None,
            receive_timeout: Duration::from_millis(20),
            discard_pre_run: true,
        }
    }

    #[test]
    #[serial]
    fn test_forwards_datagrams_to_both_rings() {
        let sorting = RingBuffer::new("sorting", 4, 256);
        let storage = RingBuffer::new("storage", 4, 256);
        let (receiver, handle) = NetReceiver::bind(
            &test_settings("127.0.0.1:0"),
            sorting.clone(),
            storage.clone(),
            256,
        )
        .unwrap();
        let addr = handle.local_addr();

        let state = StateControl::new();
        let mut worker = receiver.spawn(Arc::clone(&state)).unwrap();
        handle.begin_run();
        state.set(WorkerState::Run);

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"raw-buffer-payload", addr).unwrap();

        let mut scratch = RawBuffer::with_capacity(256);
        assert_eq!(
            sorting.get_timeout(&mut scratch, Duration::from_secs(2)),
            crate::ring::GetOutcome::Received(18)
        );
        assert_eq!(scratch.as_slice(), b"raw-buffer-payload");
        assert_eq!(
            storage.get_timeout(&mut scratch, Duration::from_secs(2)),
            crate::ring::GetOutcome::Received(18)
        );

        assert_eq!(handle.stats().packets, 1);
        worker.stop_and_join();
    }

    #[test]
    #[serial]
    fn test_empty_buffers_discarded_before_run_start() {
        let sorting = RingBuffer::new("sorting", 4, 256);
        let storage = RingBuffer::disabled("storage-off");
        let (receiver, handle) = NetReceiver::bind(
            &test_settings("127.0.0.1:0"),
            sorting.clone(),
            storage,
            256,
        )
        .unwrap();
        let addr = handle.local_addr();

        let state = StateControl::new();
        let mut worker = receiver.spawn(Arc::clone(&state)).unwrap();
        state.set(WorkerState::Run);

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        // Idle polls before the run begins.
        sender.send_to(b"", addr).unwrap();
        sender.send_to(b"", addr).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while handle.stats().discarded_pre_run < 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(handle.stats().discarded_pre_run, 2);
        assert_eq!(handle.stats().packets, 0);
        assert!(sorting.is_empty());

        worker.stop_and_join();
    }
}
