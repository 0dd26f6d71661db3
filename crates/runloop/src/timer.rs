//! Single shot timers delivered on the creating thread.
//!
//! The countdown itself runs on a small process wide tokio runtime. When it elapses
//! the expiry hops back to the creating thread through a [`ThreadHopper`], where a
//! per-arm liveness flag is checked before the listener runs. Re-arming or cancelling
//! clears the flag of the previous arm, so a stale expiry that is already in flight
//! is swallowed instead of firing.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use once_cell::sync::Lazy;
use tokio::runtime::{Builder, Runtime};
use tokio::task::JoinHandle;
use tracing::trace;

use crate::error::RunLoopError;
use crate::hopper::ThreadHopper;
use crate::utils::lock;

static TIMER_RUNTIME: Lazy<io::Result<Runtime>> =
    Lazy::new(|| Builder::new_multi_thread().worker_threads(1).thread_name("runloop-timer").enable_time().build());

fn timer_runtime() -> Result<&'static Runtime, RunLoopError> {
    TIMER_RUNTIME.as_ref().map_err(RunLoopError::runtime)
}

type Listener = Box<dyn FnMut() + Send>;

struct Arm {
    live: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// A one shot timer whose listener runs on the thread that created it.
pub struct Timer {
    hopper: ThreadHopper,
    listener: Arc<Mutex<Option<Listener>>>,
    arm: Option<Arm>,
}

impl Timer {
    /// Creates a timer bound to the calling thread's run loop.
    ///
    /// # Errors
    ///
    /// Returns [`RunLoopError::NoRunLoop`] if the calling thread has no initialized run loop.
    pub fn new() -> Result<Self, RunLoopError> {
        let mut hopper = ThreadHopper::new();
        hopper.initialize_on_current_thread()?;
        Ok(Self { hopper, listener: Arc::new(Mutex::new(None)), arm: None })
    }

    pub fn set_listener<F>(&mut self, listener: F)
    where
        F: FnMut() + Send + 'static,
    {
        *lock(&self.listener) = Some(Box::new(listener));
    }

    /// Arms the timer to fire once after `msec` milliseconds, replacing any previous arm.
    ///
    /// # Errors
    ///
    /// Returns [`RunLoopError::Runtime`] if the timer runtime could not be started.
    pub fn set_msec(&mut self, msec: u64) -> Result<(), RunLoopError> {
        self.cancel();

        let runtime = timer_runtime()?;
        let sender = self.hopper.sender().ok_or_else(|| RunLoopError::not_initialized("timer"))?;

        let live = Arc::new(AtomicBool::new(true));
        let expire = {
            let live = Arc::clone(&live);
            let listener = Arc::clone(&self.listener);
            move || {
                if live.swap(false, Ordering::AcqRel) {
                    times_up(&listener);
                }
            }
        };

        let task = runtime.spawn(async move {
            tokio::time::sleep(Duration::from_millis(msec)).await;
            sender.invoke_on_thread(expire);
        });

        trace!(msec, "timer armed");
        self.arm = Some(Arm { live, task });
        Ok(())
    }

    /// Disarms the timer. Idempotent; harmless if never armed or already fired.
    pub fn cancel(&mut self) {
        if let Some(arm) = self.arm.take()
            && arm.live.swap(false, Ordering::AcqRel)
        {
            arm.task.abort();
            trace!("timer cancelled");
        }
    }

    /// Whether an arm is pending, i.e. set and neither fired nor cancelled.
    pub fn is_armed(&self) -> bool {
        self.arm.as_ref().is_some_and(|arm| arm.live.load(Ordering::Acquire))
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer").field("armed", &self.is_armed()).finish_non_exhaustive()
    }
}

fn times_up(listener: &Mutex<Option<Listener>>) {
    // the listener runs unlocked so it may install a replacement
    let taken = lock(listener).take();
    if let Some(mut callback) = taken {
        callback();
        let mut slot = lock(listener);
        if slot.is_none() {
            *slot = Some(callback);
        }
    } else {
        trace!("timer fired without a listener");
    }
}
