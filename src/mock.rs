//! Mock front end and demo analysis routine.
//!
//! Provides a simulated data source for running the pipeline without real
//! front-end hardware: [`MockFrontEnd`] synthesizes well-formed raw buffers
//! through an output codec and transmits them over UDP exactly like the
//! real electronics, and [`SpectrumRoutine`] is a small histogramming sort
//! routine used by the `simulate` subcommand and the integration tests.

use crate::codec::{Event, EventOutput, StreamFormat};
use crate::error::DaqResult;
use crate::sort::{EventAcceptor, SortError, SortRoutine};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::net::{SocketAddr, UdpSocket};
use tracing::{debug, info};

/// Simulated front end: encodes synthetic events and sends one raw buffer
/// per UDP datagram to the receiver daemon.
pub struct MockFrontEnd {
    socket: UdpSocket,
    codec: Box<dyn EventOutput>,
    event_size: usize,
    rng: StdRng,
}

impl MockFrontEnd {
    /// Connect a mock front end to the receiver's address.
    pub fn connect(
        target: SocketAddr,
        format: StreamFormat,
        event_size: usize,
        record_length: usize,
    ) -> DaqResult<Self> {
        let socket = UdpSocket::bind("127.0.0.1:0")?;
        socket.connect(target)?;
        info!(%target, "mock front end connected");
        Ok(Self {
            socket,
            codec: format.make_output(event_size, record_length),
            event_size,
            rng: StdRng::seed_from_u64(0xDA0),
        })
    }

    /// Send one raw buffer containing `count` synthetic events.
    pub fn send_buffer(&mut self, count: usize) -> DaqResult<()> {
        let mut frame = Vec::new();
        let mut event = Event::new(self.event_size);
        for _ in 0..count {
            event.clear();
            // A plausible two-parameter coincidence with 12-bit values.
            let channel = self.rng.gen_range(0..self.event_size.min(8));
            event.set(channel, self.rng.gen_range(1..0x0FFF));
            event.set(0, self.rng.gen_range(1..0x0FFF));
            if !self.codec.write_event(&mut frame, &event) {
                break;
            }
        }
        self.codec.end_buffer(&mut frame);
        self.socket.send(&frame)?;
        debug!(events = count, bytes = frame.len(), "mock buffer sent");
        Ok(())
    }

    /// Send the run-end buffer.
    pub fn send_run_end(&mut self) -> DaqResult<()> {
        let mut frame = Vec::new();
        self.codec.end_run(&mut frame);
        self.socket.send(&frame)?;
        info!("mock run-end sent");
        Ok(())
    }

    /// Send an empty idle-poll datagram, as the real electronics do
    /// between runs.
    pub fn send_idle_poll(&self) -> DaqResult<()> {
        self.socket.send(&[])?;
        Ok(())
    }
}

/// Demo sort routine: accumulates a one-dimensional spectrum of parameter
/// zero and accepts every event for archiving.
pub struct SpectrumRoutine {
    event_size: usize,
    spectrum: Vec<u64>,
    total: u64,
}

impl SpectrumRoutine {
    /// Create a routine for events of `event_size` parameters.
    pub fn new(event_size: usize) -> Self {
        Self {
            event_size,
            spectrum: Vec::new(),
            total: 0,
        }
    }

    /// Total events accumulated into the spectrum.
    pub fn total(&self) -> u64 {
        self.total
    }
}

impl SortRoutine for SpectrumRoutine {
    fn initialize(&mut self) -> Result<(), SortError> {
        // 12-bit spectrum, one bin per ADC channel.
        self.spectrum = vec![0; 4096];
        self.total = 0;
        Ok(())
    }

    fn sort(&mut self, event: &Event, out: &mut dyn EventAcceptor) -> Result<(), SortError> {
        let value = event.get(0);
        if let Some(bin) = self.spectrum.get_mut(value as usize) {
            *bin += 1;
        }
        self.total += 1;
        out.accept(event)
    }

    fn monitor(&self, name: &str) -> f64 {
        match name {
            "events" => self.total as f64,
            "spectrum.mean" => {
                if self.total == 0 {
                    return 0.0;
                }
                let weighted: f64 = self
                    .spectrum
                    .iter()
                    .enumerate()
                    .map(|(bin, &n)| bin as f64 * n as f64)
                    .sum();
                weighted / self.total as f64
            }
            _ => 0.0,
        }
    }

    fn event_size(&self) -> usize {
        self.event_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::l002::L002Input;
    use crate::codec::{EventInput, EventInputStatus, WordCursor};
    use crate::sort::DiscardAcceptor;

    #[test]
    fn test_mock_buffers_decode_cleanly() {
        let sink = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut frontend = MockFrontEnd::connect(
            sink.local_addr().unwrap(),
            StreamFormat::L002,
            16,
            1024,
        )
        .unwrap();
        frontend.send_buffer(5).unwrap();

        let mut datagram = [0u8; 2048];
        let n = sink.recv(&mut datagram).unwrap();
        let mut input = L002Input::new();
        let mut cur = WordCursor::new(&datagram[..n]);
        let mut event = Event::new(16);
        let mut events = 0;
        loop {
            match input.read_event(&mut cur, &mut event).unwrap() {
                EventInputStatus::Event => {
                    events += 1;
                    event.clear();
                }
                EventInputStatus::EndBuffer => break,
                EventInputStatus::Partial | EventInputStatus::Ignore => {}
                other => panic!("unexpected status {other:?}"),
            }
        }
        assert_eq!(events, 5);
    }

    #[test]
    fn test_spectrum_routine_accumulates() {
        let mut routine = SpectrumRoutine::new(16);
        routine.initialize().unwrap();
        let mut event = Event::new(16);
        for v in [100, 100, 200] {
            event.clear();
            event.set(0, v);
            routine.sort(&event, &mut DiscardAcceptor).unwrap();
        }
        assert_eq!(routine.total(), 3);
        assert_eq!(routine.monitor("events"), 3.0);
        let mean = routine.monitor("spectrum.mean");
        assert!((mean - 133.33).abs() < 0.5);
    }
}
