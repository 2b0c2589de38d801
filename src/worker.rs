//! Cooperatively cancellable worker threads.
//!
//! Every daemon in the pipeline runs as a [`Worker`]: a named OS thread
//! whose loop polls a shared [`StateControl`] at each iteration boundary.
//! There is no preemptive cancellation anywhere in the crate — a `Stop`
//! request is honored at the next poll point, never mid-decode, so callers
//! can rely on in-flight buffer operations completing before a stop takes
//! effect.
//!
//! The tri-state contract:
//!
//! - `Run` — `check()` returns `true`, the loop continues.
//! - `Suspend` — `check()` blocks on a condition variable; entering
//!   `Suspend` never interrupts in-flight work, leaving it wakes the worker
//!   immediately.
//! - `Stop` — `check()` returns `false`, the loop exits and the thread
//!   terminates.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// Tri-state control for a cancellable worker.
///
/// The enum is the whole valid state space; there is no way to request an
/// invalid transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// The worker loop runs freely.
    Run,
    /// The worker parks at its next poll point until resumed.
    Suspend,
    /// The worker exits its loop at the next poll point.
    Stop,
}

/// Shared state cell between a worker thread and its controller.
///
/// Mutated only by the controller, observed only by the worker's own loop.
#[derive(Debug)]
pub struct StateControl {
    state: Mutex<WorkerState>,
    wakeup: Condvar,
}

impl StateControl {
    /// Create a control cell. Workers start suspended; the controller
    /// releases them once the run begins.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(WorkerState::Suspend),
            wakeup: Condvar::new(),
        })
    }

    /// Request a state transition.
    ///
    /// Transitions out of `Suspend` wake the worker immediately. A
    /// transition into `Suspend` takes effect at the worker's next poll.
    pub fn set(&self, next: WorkerState) {
        let mut state = self.state.lock();
        if *state != next {
            debug!(from = ?*state, to = ?next, "worker state transition");
            *state = next;
            self.wakeup.notify_all();
        }
    }

    /// Poll point, called by the worker's own loop at every iteration
    /// boundary. Blocks while suspended. Returns `true` to continue,
    /// `false` to exit the loop.
    pub fn check(&self) -> bool {
        let mut state = self.state.lock();
        while *state == WorkerState::Suspend {
            self.wakeup.wait(&mut state);
        }
        *state == WorkerState::Run
    }

    /// Current state without blocking.
    pub fn current(&self) -> WorkerState {
        *self.state.lock()
    }

    /// True once `Stop` has been requested.
    pub fn is_stopped(&self) -> bool {
        self.current() == WorkerState::Stop
    }
}

/// A named worker thread bound to a [`StateControl`].
#[derive(Debug)]
pub struct Worker {
    name: String,
    state: Arc<StateControl>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawn a worker thread. The body is expected to poll
    /// `state.check()` at each loop iteration boundary and return when it
    /// yields `false`.
    pub fn spawn<F>(name: &str, state: Arc<StateControl>, body: F) -> std::io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(body)?;
        Ok(Self {
            name: name.to_string(),
            state,
            handle: Some(handle),
        })
    }

    /// The worker's thread name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The shared control cell.
    pub fn control(&self) -> &Arc<StateControl> {
        &self.state
    }

    /// Let the worker run.
    pub fn resume(&self) {
        self.state.set(WorkerState::Run);
    }

    /// Park the worker at its next poll point.
    pub fn suspend(&self) {
        self.state.set(WorkerState::Suspend);
    }

    /// Request termination and join the thread.
    pub fn stop_and_join(&mut self) {
        self.state.set(WorkerState::Stop);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(worker = %self.name, "worker thread panicked");
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop_and_join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    #[test]
    fn test_stop_honored_at_next_poll() {
        let state = StateControl::new();
        let count = Arc::new(AtomicU64::new(0));
        let count_worker = Arc::clone(&count);
        let state_worker = Arc::clone(&state);

        let mut worker = Worker::spawn("test-stop", Arc::clone(&state), move || {
            while state_worker.check() {
                count_worker.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(1));
            }
        })
        .unwrap();

        state.set(WorkerState::Run);
        thread::sleep(Duration::from_millis(20));
        worker.stop_and_join();

        // The loop made progress and then terminated.
        assert!(count.load(Ordering::SeqCst) > 0);
        assert!(state.is_stopped());
    }

    #[test]
    fn test_suspend_blocks_and_resume_wakes() {
        let state = StateControl::new();
        let count = Arc::new(AtomicU64::new(0));
        let count_worker = Arc::clone(&count);
        let state_worker = Arc::clone(&state);

        let mut worker = Worker::spawn("test-suspend", Arc::clone(&state), move || {
            while state_worker.check() {
                count_worker.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(1));
            }
        })
        .unwrap();

        // Worker starts suspended; no iterations happen.
        thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        state.set(WorkerState::Run);
        thread::sleep(Duration::from_millis(20));
        let after_run = count.load(Ordering::SeqCst);
        assert!(after_run > 0);

        state.set(WorkerState::Suspend);
        thread::sleep(Duration::from_millis(20));
        let at_suspend = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        // At most one in-flight iteration completes after the suspend.
        assert!(count.load(Ordering::SeqCst) <= at_suspend + 1);

        // Resuming continues the same loop; no work is lost, the counter
        // keeps increasing from where it stopped.
        state.set(WorkerState::Run);
        thread::sleep(Duration::from_millis(20));
        assert!(count.load(Ordering::SeqCst) > at_suspend);

        worker.stop_and_join();
    }

    #[test]
    fn test_stop_while_suspended_wakes_and_exits() {
        let state = StateControl::new();
        let state_worker = Arc::clone(&state);

        let mut worker = Worker::spawn("test-stop-suspended", Arc::clone(&state), move || {
            while state_worker.check() {
                thread::sleep(Duration::from_millis(1));
            }
        })
        .unwrap();

        // Never resumed; stop must still wake the blocked check().
        worker.stop_and_join();
    }
}
