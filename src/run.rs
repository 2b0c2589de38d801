//! Run lifecycle: context values, the controller contract, and the
//! end-of-run handshake.
//!
//! A [`RunContext`] is created at run begin, frozen at run end, and consumed
//! by the header writers — there is no process-wide mutable run state; each
//! daemon receives the context it needs explicitly.
//!
//! Ending an online run is a multi-step handshake: the controller signals
//! the front end to stop, then keeps re-issuing that stop command on a
//! fixed interval while polling the daemons' caught-up predicates, and only
//! closes rings and files once the pipeline has fully drained. The loop
//! runs against a [`Clock`] so the resend behavior is testable without real
//! waiting.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, info};

/// Immutable description of one acquisition run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    /// Run number, monotonically increasing across successive online runs.
    pub number: u32,
    /// Operator-supplied run title.
    pub title: String,
    /// When the run began.
    pub started_at: DateTime<Utc>,
    /// When the run ended; `None` while the run is live.
    pub ended_at: Option<DateTime<Utc>>,
    /// Live acquisition vs. file replay.
    pub online: bool,
}

impl RunContext {
    /// Begin an online run, stamping the start time.
    pub fn begin_online(number: u32, title: impl Into<String>) -> Self {
        let ctx = Self {
            number,
            title: title.into(),
            started_at: Utc::now(),
            ended_at: None,
            online: true,
        };
        info!(run = ctx.number, title = %ctx.title, "online run started");
        ctx
    }

    /// Begin an offline replay run.
    pub fn begin_offline(number: u32, title: impl Into<String>) -> Self {
        let ctx = Self {
            number,
            title: title.into(),
            started_at: Utc::now(),
            ended_at: None,
            online: false,
        };
        info!(run = ctx.number, title = %ctx.title, "offline replay started");
        ctx
    }

    /// Freeze the run at its end time. Further mutation is a bug.
    pub fn finish(&mut self) {
        if self.ended_at.is_none() {
            self.ended_at = Some(Utc::now());
            info!(run = self.number, "run ended");
        }
    }

    /// The run number the next successful online run will carry.
    pub fn next_number(&self) -> u32 {
        self.number + 1
    }
}

/// Callbacks the run controller supplies to the pipeline.
///
/// All failures inside these hooks belong to the controller; the pipeline
/// only reports through them.
pub trait RunController: Send {
    /// The sorter has drained and processed the last buffer of the run.
    fn at_sort_end(&mut self) {}

    /// The storage daemon has archived the last buffer of the run.
    fn at_write_end(&mut self) {}

    /// Offline only: the configured file list is exhausted. Return `true`
    /// if more files were queued, `false` to finish the replay.
    fn open_next_file(&mut self) -> bool {
        false
    }
}

/// A no-op controller for tests and the CLI default.
#[derive(Debug, Default)]
pub struct NullController;

impl RunController for NullController {}

/// Controller shared between the pipeline and the replay driver.
pub type SharedController = std::sync::Arc<parking_lot::Mutex<Box<dyn RunController>>>;

/// Wrap a controller for sharing.
pub fn share_controller(controller: Box<dyn RunController>) -> SharedController {
    std::sync::Arc::new(parking_lot::Mutex::new(controller))
}

/// Time source for the handshake loop.
pub trait Clock {
    /// Sleep for the given duration (or advance virtual time).
    fn sleep(&self, d: Duration);
}

/// Wall-clock implementation used in production.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn sleep(&self, d: Duration) {
        std::thread::sleep(d);
    }
}

/// End-of-run handshake driver.
///
/// `wait_until_caught_up` re-issues the hardware stop command every
/// `resend_interval` and polls the caught-up predicate between resends,
/// returning `true` once the pipeline reports drained or `false` if the
/// wait was cancelled.
#[derive(Debug)]
pub struct EndRunHandshake<C: Clock> {
    clock: C,
    resend_interval: Duration,
    poll_step: Duration,
}

impl<C: Clock> EndRunHandshake<C> {
    /// Build a handshake driver over the given clock.
    pub fn new(clock: C, resend_interval: Duration) -> Self {
        let poll_step = (resend_interval / 10).max(Duration::from_millis(10));
        Self {
            clock,
            resend_interval,
            poll_step,
        }
    }

    /// Drive the handshake until `caught_up` holds or `cancelled` fires.
    pub fn wait_until_caught_up(
        &self,
        mut resend_stop: impl FnMut(),
        mut caught_up: impl FnMut() -> bool,
        cancelled: impl Fn() -> bool,
    ) -> bool {
        loop {
            if cancelled() {
                debug!("end-of-run wait cancelled");
                return false;
            }
            resend_stop();
            let mut waited = Duration::ZERO;
            while waited < self.resend_interval {
                if caught_up() {
                    debug!("pipeline caught up");
                    return true;
                }
                if cancelled() {
                    debug!("end-of-run wait cancelled");
                    return false;
                }
                let step = self.poll_step.min(self.resend_interval - waited);
                self.clock.sleep(step);
                waited += step;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;

    /// Clock that only counts virtual time, never sleeps.
    #[derive(Default, Clone)]
    struct MockClock {
        elapsed_ms: Arc<AtomicU32>,
    }

    impl Clock for MockClock {
        fn sleep(&self, d: Duration) {
            self.elapsed_ms
                .fetch_add(d.as_millis() as u32, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_stop_command_reissued_until_caught_up() {
        let clock = MockClock::default();
        let elapsed = Arc::clone(&clock.elapsed_ms);
        let handshake = EndRunHandshake::new(clock, Duration::from_secs(3));

        let resends = AtomicU32::new(0);
        // Caught up only once four full resend intervals have elapsed.
        let done = handshake.wait_until_caught_up(
            || {
                resends.fetch_add(1, Ordering::SeqCst);
            },
            || elapsed.load(Ordering::SeqCst) >= 12_000,
            || false,
        );

        assert!(done);
        // One initial issue plus one per elapsed interval.
        assert_eq!(resends.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_cancellation_breaks_the_wait() {
        let handshake = EndRunHandshake::new(MockClock::default(), Duration::from_secs(3));
        let cancel = AtomicBool::new(false);
        let resends = AtomicU32::new(0);

        let done = handshake.wait_until_caught_up(
            || {
                // Cancel after the second resend; caught_up is held false.
                if resends.fetch_add(1, Ordering::SeqCst) >= 1 {
                    cancel.store(true, Ordering::SeqCst);
                }
            },
            || false,
            || cancel.load(Ordering::SeqCst),
        );

        assert!(!done);
        assert_eq!(resends.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_immediate_caught_up_returns_after_first_resend() {
        let handshake = EndRunHandshake::new(MockClock::default(), Duration::from_secs(3));
        let resends = AtomicU32::new(0);
        let done = handshake.wait_until_caught_up(
            || {
                resends.fetch_add(1, Ordering::SeqCst);
            },
            || true,
            || false,
        );
        assert!(done);
        assert_eq!(resends.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_run_context_freeze_and_numbering() {
        let mut ctx = RunContext::begin_online(41, "calibration");
        assert!(ctx.online);
        assert!(ctx.ended_at.is_none());
        ctx.finish();
        let frozen_end = ctx.ended_at;
        assert!(frozen_end.is_some());
        ctx.finish();
        assert_eq!(ctx.ended_at, frozen_end);
        assert_eq!(ctx.next_number(), 42);
    }
}
