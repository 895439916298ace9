use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

#[derive(Debug)]
struct TimerState {
    deadline: Option<Instant>,
    running: bool,
}

#[derive(Debug)]
struct TimerShared {
    state: Mutex<TimerState>,
    wake: Condvar,
    interval: Duration,
}

impl TimerShared {
    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Single-shot timer behind the "may have become unresponsive" signal.
///
/// Each [`start`](Self::start) re-arms it for the full interval; if it is not
/// stopped in time the callback runs once on the timer thread.
#[derive(Debug, Clone)]
pub struct ResponsivenessTimer {
    shared: Arc<TimerShared>,
}

impl ResponsivenessTimer {
    /// Spawn the timer thread. The returned handle may be dropped to detach it.
    pub fn spawn<F>(interval: Duration, on_timeout: F) -> std::io::Result<(Self, JoinHandle<()>)>
    where
        F: Fn() + Send + 'static,
    {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                deadline: None,
                running: true,
            }),
            wake: Condvar::new(),
            interval,
        });

        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("ipclink-responsiveness".to_string())
            .spawn(move || run(&worker, on_timeout))?;

        Ok((Self { shared }, handle))
    }

    /// Arm (or re-arm) the timer for one full interval.
    pub fn start(&self) {
        let mut state = self.shared.lock();
        state.deadline = Some(Instant::now() + self.shared.interval);
        self.shared.wake.notify_one();
    }

    /// Disarm the timer.
    pub fn stop(&self) {
        let mut state = self.shared.lock();
        if state.deadline.take().is_some() {
            self.shared.wake.notify_one();
        }
    }

    /// Whether the timer is armed.
    pub fn is_active(&self) -> bool {
        self.shared.lock().deadline.is_some()
    }

    /// Stop the timer thread. Idempotent.
    pub fn shutdown(&self) {
        let mut state = self.shared.lock();
        state.running = false;
        state.deadline = None;
        self.shared.wake.notify_one();
    }
}

fn run<F: Fn()>(shared: &TimerShared, on_timeout: F) {
    let mut state = shared.lock();
    while state.running {
        match state.deadline {
            None => {
                state = shared.wake.wait(state).unwrap_or_else(PoisonError::into_inner);
            }
            Some(deadline) => {
                let now = Instant::now();
                if now < deadline {
                    state = shared
                        .wake
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                    continue;
                }
                state.deadline = None;
                drop(state);
                trace!("responsiveness timer fired");
                on_timeout();
                state = shared.lock();
            }
        }
    }
    debug!("responsiveness timer stopped");
}
