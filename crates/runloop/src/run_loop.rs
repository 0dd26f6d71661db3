//! Single threaded cooperative dispatcher.
//!
//! A [`RunLoop`] is bound to the thread that calls [`RunLoop::init`]. Work arrives
//! through a mutex and condition variable guarded FIFO queue from any thread, either as
//! an application [`Event`] or as a hop (a boxed closure posted by a
//! [`ThreadHopper`](crate::ThreadHopper) or [`Timer`](crate::Timer)). [`RunLoop::run`]
//! dispatches items in arrival order with the queue lock released, so a callback may
//! freely call back into the loop (send more events, stop it) without deadlocking.
//!
//! Once a stop request is observed, `run` performs exactly one more drain pass over
//! whatever is still queued, so an event sent concurrently with `stop()` is never lost.
//!
//! Other threads talk to a loop through a cloneable [`RunLoopHandle`]. The loop also
//! publishes its handle in a thread local slot for the lifetime of `init`..`shutdown`,
//! which is how hoppers and timers find the run loop of the thread that creates them.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, ThreadId};

use tracing::{debug, trace};

use crate::event::Event;
use crate::utils::lock;

pub(crate) type Hop = Box<dyn FnOnce() + Send>;

enum Work {
    Event(Event),
    Hop(Hop),
}

#[derive(Default)]
struct Queue {
    items: VecDeque<Work>,
    stopped: bool,
    running: bool,
    closed: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    wakeup: Condvar,
    thread: ThreadId,
}

impl Shared {
    fn push(&self, work: Work) -> bool {
        let mut queue = lock(&self.queue);
        if queue.closed {
            return false;
        }
        queue.items.push_back(work);
        self.wakeup.notify_all();
        true
    }

    fn stop(&self) {
        let mut queue = lock(&self.queue);
        queue.stopped = true;
        self.wakeup.notify_all();
    }

    /// Blocks until there is work to dispatch. Returns `None` once a stop was requested.
    fn next(&self) -> Option<Work> {
        let mut queue = lock(&self.queue);
        loop {
            if queue.stopped {
                return None;
            }
            if let Some(work) = queue.items.pop_front() {
                return Some(work);
            }
            queue = self.wakeup.wait(queue).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

thread_local! {
    static CURRENT: RefCell<Option<RunLoopHandle>> = const { RefCell::new(None) };
}

/// A thread safe reference to a run loop, used to feed and stop it from anywhere.
#[derive(Clone)]
pub struct RunLoopHandle {
    shared: Arc<Shared>,
}

impl RunLoopHandle {
    /// Returns the handle of the run loop initialized on the calling thread, if any.
    pub fn current() -> Option<Self> {
        CURRENT.with(|current| current.borrow().clone())
    }

    /// Queues `event` for the loop's event callback.
    ///
    /// Returns `false` only once the loop has been shut down.
    pub fn send_event(&self, event: Event) -> bool {
        self.shared.push(Work::Event(event))
    }

    /// Requests the loop to stop. Safe from any thread, including from inside a
    /// dispatched callback, and idempotent.
    pub fn stop(&self) {
        self.shared.stop();
    }

    /// The thread the loop is bound to.
    pub fn thread_id(&self) -> ThreadId {
        self.shared.thread
    }

    pub fn is_current_thread(&self) -> bool {
        thread::current().id() == self.shared.thread
    }

    /// Whether `run()` is currently dispatching on the loop's thread.
    pub fn is_running(&self) -> bool {
        lock(&self.shared.queue).running
    }

    pub(crate) fn post(&self, hop: Hop) -> bool {
        self.shared.push(Work::Hop(hop))
    }

    fn same_loop(&self, other: &Arc<Shared>) -> bool {
        Arc::ptr_eq(&self.shared, other)
    }
}

impl fmt::Debug for RunLoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunLoopHandle").field("thread", &self.shared.thread).finish_non_exhaustive()
    }
}

/// The cooperative dispatcher owned by one thread.
///
/// ```
/// use micro_runloop::{Event, RunLoop};
///
/// let mut run_loop = RunLoop::new();
/// run_loop.init();
///
/// let handle = run_loop.handle().unwrap();
/// let stopper = handle.clone();
/// run_loop.set_callbacks(move |event: Event| {
///     if event.downcast_ref::<&str>() == Some(&"quit") {
///         stopper.stop();
///     }
/// });
///
/// std::thread::spawn(move || {
///     handle.send_event(Event::new("quit"));
/// });
///
/// run_loop.run();
/// run_loop.shutdown();
/// ```
#[derive(Default)]
pub struct RunLoop {
    shared: Option<Arc<Shared>>,
    on_event: Option<Box<dyn FnMut(Event)>>,
}

impl RunLoop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds the loop to the calling thread.
    ///
    /// # Panics
    ///
    /// Panics if the loop is already initialized, or if another run loop is already
    /// initialized on this thread.
    pub fn init(&mut self) {
        assert!(self.shared.is_none(), "RunLoop::init called twice without shutdown()");

        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue::default()),
            wakeup: Condvar::new(),
            thread: thread::current().id(),
        });

        CURRENT.with(|current| {
            let mut current = current.borrow_mut();
            assert!(current.is_none(), "a run loop is already initialized on this thread");
            *current = Some(RunLoopHandle { shared: Arc::clone(&shared) });
        });

        trace!(thread = ?shared.thread, "run loop initialized");
        self.shared = Some(shared);
    }

    /// Registers the handler that receives every [`Event`] sent to this loop.
    pub fn set_callbacks<F>(&mut self, on_event: F)
    where
        F: FnMut(Event) + 'static,
    {
        self.on_event = Some(Box::new(on_event));
    }

    /// Returns a handle for feeding the loop from other threads, `None` before `init()`.
    pub fn handle(&self) -> Option<RunLoopHandle> {
        self.shared.as_ref().map(|shared| RunLoopHandle { shared: Arc::clone(shared) })
    }

    /// Dispatches queued work in FIFO order until [`stop`](Self::stop) is observed.
    ///
    /// # Panics
    ///
    /// Panics if called before `init()` or from a thread other than the init thread.
    pub fn run(&mut self) {
        let Some(shared) = self.shared.clone() else {
            panic!("RunLoop::run called before init()");
        };
        assert_eq!(shared.thread, thread::current().id(), "RunLoop::run called off its init thread");

        lock(&shared.queue).running = true;
        trace!("run loop running");

        while let Some(work) = shared.next() {
            self.dispatch(work);
        }

        // one more pass for anything that raced with the stop request
        let remaining = std::mem::take(&mut lock(&shared.queue).items);
        trace!(remaining = remaining.len(), "run loop stopping, final drain");
        for work in remaining {
            self.dispatch(work);
        }

        let mut queue = lock(&shared.queue);
        queue.running = false;
        queue.stopped = false;
    }

    /// Requests `run()` to return. Idempotent, callable from inside a callback.
    pub fn stop(&self) {
        if let Some(shared) = &self.shared {
            shared.stop();
        }
    }

    /// Queues an event; returns `false` if the loop is not initialized.
    pub fn send_event(&self, event: Event) -> bool {
        self.shared.as_ref().is_some_and(|shared| shared.push(Work::Event(event)))
    }

    /// Releases the loop. Pending work is discarded and further sends are refused.
    pub fn shutdown(&mut self) {
        let Some(shared) = self.shared.take() else {
            return;
        };

        let discarded = {
            let mut queue = lock(&shared.queue);
            queue.closed = true;
            std::mem::take(&mut queue.items)
        };
        if !discarded.is_empty() {
            debug!(discarded = discarded.len(), "run loop shut down with pending work");
        }
        drop(discarded);

        CURRENT.with(|current| {
            let mut current = current.borrow_mut();
            if current.as_ref().is_some_and(|handle| handle.same_loop(&shared)) {
                *current = None;
            }
        });
        trace!("run loop shut down");
    }

    fn dispatch(&mut self, work: Work) {
        match work {
            Work::Event(event) => match self.on_event.as_mut() {
                Some(on_event) => on_event(event),
                None => trace!("no event callback registered, event dropped"),
            },
            Work::Hop(hop) => hop(),
        }
    }
}

impl Drop for RunLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for RunLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunLoop")
            .field("initialized", &self.shared.is_some())
            .field("has_callbacks", &self.on_event.is_some())
            .finish()
    }
}
