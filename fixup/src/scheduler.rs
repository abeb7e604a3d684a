//! Deferred device matching.
//!
//! After a module is patched the registry may already have given up on the
//! wireless provider. A single timer asks it to match again until one of the
//! patched services starts or the retry budget runs out.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use thiserror::Error;

use crate::catalog::{self, PCI_PROVIDER_CLASS, PLACEHOLDER_SERVICE, TARGETS};
use crate::engine::Engine;

/// Delay before the first fire, reset by every module load.
pub const INITIAL_DELAY: Duration = Duration::from_millis(1000);
/// Delay between two fires.
pub const RETRY_DELAY: Duration = Duration::from_millis(1000);
/// Time given to the registry to start services after the match requests.
pub const SETTLE_DELAY: Duration = Duration::from_millis(200);
/// Total number of fires.
pub const MATCHING_ATTEMPTS: u32 = 5;

pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("work loop unavailable")]
    WorkLoopUnavailable,

    #[error("failed to create timer: {0}")]
    TimerUnavailable(String),
}

/// A one-shot, re-armable timer.
pub trait TimerSource: Send + Sync {
    /// (Re)arm the timer; a pending timeout is replaced.
    fn set_timeout(&self, delay: Duration);

    /// Drop a pending timeout without firing it.
    fn cancel(&self);
}

/// Creates timers whose callbacks are serialized on one queue.
pub trait TimerQueue: Send + Sync {
    fn create_timer(&self, callback: TimerCallback) -> Result<Box<dyn TimerSource>, SchedulerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireOutcome {
    /// Nothing started yet, another fire is scheduled.
    Rearmed,
    /// A patched service is running. Terminal.
    Started,
    /// Retry budget exhausted. Terminal.
    Exhausted,
    /// Fired after a terminal outcome; nothing was done.
    Stopped,
}

/// Retry bookkeeping for the matching timer.
pub struct MatchingScheduler {
    timer: Mutex<Option<Box<dyn TimerSource>>>,
    attempts_left: AtomicU32,
    fires: AtomicUsize,
    finished: AtomicBool,
}

impl MatchingScheduler {
    pub fn new(attempts: u32) -> Self {
        Self {
            timer: Mutex::new(None),
            attempts_left: AtomicU32::new(attempts),
            fires: AtomicUsize::new(0),
            finished: AtomicBool::new(false),
        }
    }

    /// Arm (or re-arm) the timer with [`INITIAL_DELAY`], creating it on first use.
    ///
    /// A no-op once the scheduler reached a terminal outcome. A zero budget
    /// finishes without ever creating the timer.
    pub fn arm(
        &self,
        queue: &dyn TimerQueue,
        callback: impl FnOnce() -> TimerCallback,
    ) -> Result<(), SchedulerError> {
        if self.is_finished() {
            debug!("matching already finished, not re-arming");
            return Ok(());
        }
        if self.attempts_left() == 0 {
            self.finish();
            debug!("no matching attempts configured, timer stays disarmed");
            return Ok(());
        }

        let mut timer = self.timer.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_finished() {
            return Ok(());
        }
        if timer.is_none() {
            *timer = Some(queue.create_timer(callback())?);
        }
        if let Some(timer) = timer.as_ref() {
            timer.set_timeout(INITIAL_DELAY);
        }
        Ok(())
    }

    /// Account for one fire and decide whether to continue.
    ///
    /// The budget counts fires: with `N` attempts the timer fires at most `N` times.
    pub fn complete_fire(&self, any_started: bool) -> FireOutcome {
        self.fires.fetch_add(1, Ordering::AcqRel);

        if any_started {
            self.finish();
            return FireOutcome::Started;
        }

        let left = self
            .attempts_left
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .map_or(0, |previous| previous.saturating_sub(1));
        if left == 0 {
            self.finish();
            return FireOutcome::Exhausted;
        }

        let timer = self.timer.lock().unwrap_or_else(|e| e.into_inner());
        match timer.as_ref() {
            Some(timer) => {
                timer.set_timeout(RETRY_DELAY);
                FireOutcome::Rearmed
            }
            None => {
                self.finished.store(true, Ordering::Release);
                FireOutcome::Exhausted
            }
        }
    }

    /// Enter the terminal state and drop any timeout armed meanwhile.
    fn finish(&self) {
        self.finished.store(true, Ordering::Release);
        if let Some(timer) = self.timer.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            timer.cancel();
        }
    }

    pub fn fires(&self) -> usize {
        self.fires.load(Ordering::Acquire)
    }

    pub fn attempts_left(&self) -> u32 {
        self.attempts_left.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn is_armed(&self) -> bool {
        self.timer.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }
}

impl Engine {
    /// Timer body: clear the placeholder, request matching, then decide on a retry.
    pub fn start_matching(&self) -> FireOutcome {
        if self.scheduler.is_finished() {
            debug!("start_matching is called after matching finished, ignoring");
            return FireOutcome::Stopped;
        }
        debug!("start_matching is called");
        self.remove_placeholder();

        let config = self.snapshot(None);
        let helpers = self.kernel_helpers();

        if helpers.start_matching_symbol.is_some() {
            for (index, descriptor) in TARGETS.iter().enumerate() {
                if !catalog::is_enabled(index, &config) {
                    continue;
                }
                match self.registry.request_match_by_name(descriptor.identifier) {
                    Ok(()) => debug!("startMatching(symbol) successful for {}", descriptor.identifier),
                    Err(e) => warn!("startMatching(symbol) failed for {}: {}", descriptor.identifier, e),
                }
            }
        }

        if helpers.start_matching_dictionary.is_some() {
            match self.registry.request_match_by_provider_class(PCI_PROVIDER_CLASS) {
                Ok(()) => debug!("startMatching(dictionary) successful"),
                Err(e) => warn!("startMatching(dictionary) failed: {}", e),
            }
        }

        self.platform.sleep(SETTLE_DELAY);

        let outcome = self.scheduler.complete_fire(self.any_service_started());
        match outcome {
            FireOutcome::Rearmed => {
                debug!("no started services detected, scheduling one more attempt")
            }
            FireOutcome::Started => info!("a patched service has started, matching finished"),
            FireOutcome::Exhausted => {
                warn!("no service started after {} matching attempts", self.scheduler.fires())
            }
            FireOutcome::Stopped => {}
        }
        outcome
    }

    /// Detach the placeholder service and drop its catalogue personality.
    fn remove_placeholder(&self) {
        let Some(service) = self.registry.find_service(PLACEHOLDER_SERVICE) else {
            return;
        };
        if !service.has_provider {
            return;
        }

        let terminated = self.registry.terminate(&service);
        debug!("terminating {} with status {}", service.name, terminated);
        if !terminated || self.kernel_helpers().remove_drivers.is_none() {
            return;
        }

        if let (Some(bundle), Some(class)) = (&service.bundle_identifier, &service.io_class) {
            match self.registry.remove_driver_binding(bundle, class) {
                Ok(()) => debug!("removeDrivers successful for {}", bundle),
                Err(e) => error!("removeDrivers failed: {}", e),
            }
        }
    }
}

struct TimerState {
    deadline: Option<Instant>,
    shutdown: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    wake: Condvar,
}

/// Timer queue backed by one worker thread per timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadWorkLoop;

impl TimerQueue for ThreadWorkLoop {
    fn create_timer(&self, callback: TimerCallback) -> Result<Box<dyn TimerSource>, SchedulerError> {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                deadline: None,
                shutdown: false,
            }),
            wake: Condvar::new(),
        });

        let worker = shared.clone();
        thread::Builder::new()
            .name("brcmfx-matching".to_string())
            .spawn(move || timer_loop(&worker, &callback))
            .map_err(|e| SchedulerError::TimerUnavailable(e.to_string()))?;

        Ok(Box::new(ThreadTimer { shared }))
    }
}

fn timer_loop(shared: &TimerShared, callback: &TimerCallback) {
    let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
    loop {
        if state.shutdown {
            return;
        }
        match state.deadline {
            None => {
                state = shared.wake.wait(state).unwrap_or_else(|e| e.into_inner());
            }
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    state.deadline = None;
                    drop(state);
                    callback();
                    state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
                } else {
                    state = shared
                        .wake
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0;
                }
            }
        }
    }
}

struct ThreadTimer {
    shared: Arc<TimerShared>,
}

impl TimerSource for ThreadTimer {
    fn set_timeout(&self, delay: Duration) {
        let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        state.deadline = Some(Instant::now() + delay);
        self.shared.wake.notify_one();
    }

    fn cancel(&self) {
        let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        state.deadline = None;
        self.shared.wake.notify_one();
    }
}

impl Drop for ThreadTimer {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        state.shutdown = true;
        self.shared.wake.notify_one();
    }
}
