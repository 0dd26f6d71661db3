//! Marshaling closures onto a registered home thread.
//!
//! A [`ThreadHopper`] is bound to the run loop of the thread that calls
//! [`ThreadHopper::initialize_on_current_thread`]. From then on any thread may call
//! [`ThreadHopper::invoke_on_thread`] (or the detachable [`HopSender::invoke_on_thread`])
//! to run a closure on that home thread.
//!
//! Delivery guarantees:
//!
//! - each closure runs exactly once, on the home thread, in submission order
//! - it never runs before `invoke_on_thread` has returned, even when invoked from the
//!   home thread itself
//! - closures still queued when the hopper is dropped are discarded, never run

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, ThreadId};

use tracing::{trace, warn};

use crate::error::RunLoopError;
use crate::run_loop::{Hop, RunLoopHandle};
use crate::utils::lock;

struct HopQueue {
    home: RunLoopHandle,
    pending: Mutex<VecDeque<Hop>>,
}

impl HopQueue {
    fn push(self: &Arc<Self>, hop: Hop) -> bool {
        lock(&self.pending).push_back(hop);

        let queue = Arc::downgrade(self);
        let posted = self.home.post(Box::new(move || {
            if let Some(queue) = queue.upgrade() {
                queue.run_one();
            }
        }));

        if !posted {
            warn!(home = ?self.home.thread_id(), "home run loop is gone, hop not delivered");
        }
        posted
    }

    fn run_one(&self) {
        let hop = lock(&self.pending).pop_front();
        if let Some(hop) = hop {
            hop();
        }
    }

    fn run_all(&self) {
        loop {
            let hop = lock(&self.pending).pop_front();
            match hop {
                Some(hop) => hop(),
                None => break,
            }
        }
    }
}

/// Per home thread registration for cross-thread invocations.
#[derive(Default)]
pub struct ThreadHopper {
    queue: Option<Arc<HopQueue>>,
}

impl ThreadHopper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the calling thread, which must have an initialized
    /// [`RunLoop`](crate::RunLoop), as the home thread.
    ///
    /// # Errors
    ///
    /// Returns [`RunLoopError::NoRunLoop`] if the calling thread has no run loop.
    ///
    /// # Panics
    ///
    /// Panics if this hopper was already initialized.
    pub fn initialize_on_current_thread(&mut self) -> Result<(), RunLoopError> {
        assert!(self.queue.is_none(), "ThreadHopper initialized twice");

        let home = RunLoopHandle::current().ok_or(RunLoopError::NoRunLoop)?;
        trace!(home = ?home.thread_id(), "thread hopper registered");
        self.queue = Some(Arc::new(HopQueue { home, pending: Mutex::new(VecDeque::new()) }));
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.queue.is_some()
    }

    pub fn home_thread(&self) -> Option<ThreadId> {
        self.queue.as_ref().map(|queue| queue.home.thread_id())
    }

    /// Schedules `f` on the home thread and returns immediately.
    ///
    /// Returns `false` if the hopper is not initialized or its home loop was shut down.
    pub fn invoke_on_thread<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        match &self.queue {
            Some(queue) => queue.push(Box::new(f)),
            None => {
                warn!("invoke_on_thread on an uninitialized thread hopper");
                false
            }
        }
    }

    /// A detachable, cloneable sender that stops delivering once this hopper is dropped.
    pub fn sender(&self) -> Option<HopSender> {
        self.queue.as_ref().map(|queue| HopSender { queue: Arc::downgrade(queue) })
    }

    /// Runs every pending hop right now. Must be called on the home thread.
    ///
    /// # Panics
    ///
    /// Panics when called from any other thread.
    pub fn process_outstanding_requests(&self) {
        let Some(queue) = &self.queue else {
            return;
        };
        assert_eq!(
            queue.home.thread_id(),
            thread::current().id(),
            "process_outstanding_requests called off the home thread"
        );
        queue.run_all();
    }
}

impl fmt::Debug for ThreadHopper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadHopper").field("home", &self.home_thread()).finish()
    }
}

/// A `Send + Sync` way to reach a [`ThreadHopper`]'s home thread without owning it.
#[derive(Clone)]
pub struct HopSender {
    queue: Weak<HopQueue>,
}

impl HopSender {
    /// Same contract as [`ThreadHopper::invoke_on_thread`]; returns `false` once the
    /// hopper has been dropped.
    pub fn invoke_on_thread<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        match self.queue.upgrade() {
            Some(queue) => queue.push(Box::new(f)),
            None => false,
        }
    }
}

impl fmt::Debug for HopSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HopSender").field("alive", &(self.queue.strong_count() > 0)).finish()
    }
}
