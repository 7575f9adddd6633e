use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

/// Granularity at which sleepers re-check the run state.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Process-wide lifecycle of a fuzzing run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunState {
    Idle = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl RunState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => RunState::Idle,
            1 => RunState::Running,
            2 => RunState::Stopping,
            _ => RunState::Stopped,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::Running => "running",
            RunState::Stopping => "stopping",
            RunState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Shared handle to the run state. Cloning yields another handle to the same flag.
///
/// `request_stop` is a single atomic update, so it is safe to call from a
/// signal-handling thread.
#[derive(Debug, Clone)]
pub struct RunControl {
    state: Arc<AtomicU8>,
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

impl RunControl {
    pub fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(RunState::Idle as u8)),
        }
    }

    pub fn state(&self) -> RunState {
        RunState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() == RunState::Running
    }

    /// `Idle -> Running`. Returns the current state if the run was not idle.
    pub fn start(&self) -> Result<(), RunState> {
        self.state
            .compare_exchange(
                RunState::Idle as u8,
                RunState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(RunState::from_u8)
    }

    /// Moves an idle or running state to `Stopping`.
    ///
    /// Returns `true` if this call performed the transition.
    pub fn request_stop(&self) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                match RunState::from_u8(raw) {
                    RunState::Idle | RunState::Running => Some(RunState::Stopping as u8),
                    RunState::Stopping | RunState::Stopped => None,
                }
            })
            .is_ok()
    }

    /// Final transition once every worker has been joined or abandoned.
    pub fn mark_stopped(&self) {
        self.state.store(RunState::Stopped as u8, Ordering::Release);
    }

    /// Sleeps for `duration`, waking early if the run leaves `Running`.
    ///
    /// Returns whether the run is still `Running` afterwards.
    pub fn sleep_while_running(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if !self.is_running() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_follows_idle_running_stopping_stopped() {
        let control = RunControl::new();
        assert_eq!(control.state(), RunState::Idle);
        assert!(control.start().is_ok());
        assert!(control.is_running());
        assert!(control.request_stop());
        assert_eq!(control.state(), RunState::Stopping);
        assert!(!control.request_stop(), "second stop request is a no-op");
        control.mark_stopped();
        assert_eq!(control.state(), RunState::Stopped);
    }

    #[test]
    fn start_after_stop_request_is_refused() {
        let control = RunControl::new();
        assert!(control.request_stop());
        assert_eq!(control.start(), Err(RunState::Stopping));
    }

    #[test]
    fn clones_observe_the_same_state() {
        let control = RunControl::new();
        let observer = control.clone();
        control.start().unwrap();
        assert!(observer.is_running());
        observer.request_stop();
        assert!(!control.is_running());
    }

    #[test]
    fn sleep_wakes_early_when_stop_is_requested() {
        let control = RunControl::new();
        control.start().unwrap();
        let stopper = control.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            stopper.request_stop();
        });

        let started = Instant::now();
        let still_running = control.sleep_while_running(Duration::from_secs(10));
        handle.join().unwrap();

        assert!(!still_running);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn sleep_returns_true_when_run_continues() {
        let control = RunControl::new();
        control.start().unwrap();
        assert!(control.sleep_while_running(Duration::from_millis(20)));
    }
}
