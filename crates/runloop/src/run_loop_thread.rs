//! A worker thread that owns one [`RunLoop`] for its whole lifecycle.
//!
//! The thread moves through `Allocated -> Running -> Stopping -> Stopped`. Every
//! transition is validated and an illegal one (stopping a thread that never ran,
//! running twice, reusing a stopped thread) panics: these are programmer errors,
//! not runtime conditions.
//!
//! [`RunLoopThread::run`] returns as soon as the worker has called `at_start`, it does
//! not wait for the loop itself. [`RunLoopThread::stop`] behaves differently depending
//! on the caller: on the loop's own thread it merely asks the loop to return, anywhere
//! else it blocks until `at_end` has run and the thread has exited.

use std::fmt;
use std::io;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};

use tracing::{error, trace};

use crate::event::Event;
use crate::run_loop::{RunLoop, RunLoopHandle};
use crate::utils::lock;

/// Lifecycle of a [`RunLoopThread`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ThreadState {
    Allocated,
    Running,
    Stopping,
    Stopped,
}

type StartEndCallback = Box<dyn FnOnce() + Send>;
type EventCallback = Box<dyn FnMut(Event) + Send>;

#[derive(Default)]
struct Callbacks {
    at_start: Option<StartEndCallback>,
    at_end: Option<StartEndCallback>,
    on_event: Option<EventCallback>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Starting,
    Running,
    Exited,
}

/// What the worker publishes back to the owning side.
struct Status {
    phase: Phase,
    handle: Option<RunLoopHandle>,
    thread: Option<ThreadId>,
}

struct Liveness {
    status: Mutex<Status>,
    changed: Condvar,
}

impl Liveness {
    fn publish(&self, update: impl FnOnce(&mut Status)) {
        let mut status = lock(&self.status);
        update(&mut status);
        self.changed.notify_all();
    }

    fn wait_while(&self, phase: Phase) -> Phase {
        let status = lock(&self.status);
        let status = self
            .changed
            .wait_while(status, |status| status.phase == phase)
            .unwrap_or_else(PoisonError::into_inner);
        status.phase
    }
}

/// Marks the worker as exited however it leaves, including by unwinding out of a callback.
struct ExitGuard(Arc<Liveness>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.publish(|status| {
            status.phase = Phase::Exited;
            status.handle = None;
        });
    }
}

struct Control {
    state: ThreadState,
    join_handle: Option<JoinHandle<()>>,
}

/// Owns a worker thread running a [`RunLoop`]'s init/run/shutdown sequence.
///
/// All methods take `&self`, so the thread can be shared (for instance behind an
/// `Arc`) with callbacks that need to stop it from the loop thread itself.
pub struct RunLoopThread {
    control: Mutex<Control>,
    callbacks: Mutex<Callbacks>,
    liveness: Arc<Liveness>,
}

impl RunLoopThread {
    pub fn new() -> Self {
        Self {
            control: Mutex::new(Control { state: ThreadState::Allocated, join_handle: None }),
            callbacks: Mutex::new(Callbacks::default()),
            liveness: Arc::new(Liveness {
                status: Mutex::new(Status { phase: Phase::Starting, handle: None, thread: None }),
                changed: Condvar::new(),
            }),
        }
    }

    /// Sets the callbacks handed to the worker on [`run`](Self::run).
    ///
    /// `at_start` runs on the worker after its loop is initialized and before `run()`
    /// returns to the caller; `at_end` runs on the worker once the loop has stopped.
    pub fn set_callbacks<S, E, F>(&self, at_start: S, at_end: E, on_event: F)
    where
        S: FnOnce() + Send + 'static,
        E: FnOnce() + Send + 'static,
        F: FnMut(Event) + Send + 'static,
    {
        let mut callbacks = lock(&self.callbacks);
        callbacks.at_start = Some(Box::new(at_start));
        callbacks.at_end = Some(Box::new(at_end));
        callbacks.on_event = Some(Box::new(on_event));
    }

    pub fn state(&self) -> ThreadState {
        lock(&self.control).state
    }

    /// True while the worker's loop is up and no stop has been requested through this thread.
    pub fn running(&self) -> bool {
        self.state() == ThreadState::Running && lock(&self.liveness.status).phase == Phase::Running
    }

    /// The worker's run loop handle, available between `run()` and the loop's shutdown.
    pub fn handle(&self) -> Option<RunLoopHandle> {
        lock(&self.liveness.status).handle.clone()
    }

    /// Spawns the worker and blocks until its `at_start` callback has returned.
    ///
    /// # Panics
    ///
    /// Panics if the thread was already run.
    pub fn run(&self) -> io::Result<()> {
        let mut control = lock(&self.control);
        validate_state_change(&mut control.state, ThreadState::Running);

        let callbacks = std::mem::take(&mut *lock(&self.callbacks));
        let liveness = Arc::clone(&self.liveness);
        let spawned = thread::Builder::new().name("runloop".into()).spawn(move || thread_main(&liveness, callbacks));

        match spawned {
            Ok(join_handle) => control.join_handle = Some(join_handle),
            Err(e) => {
                error!(cause = %e, "failed to spawn run loop thread");
                control.state = ThreadState::Stopped;
                return Err(e);
            }
        }
        drop(control);

        self.liveness.wait_while(Phase::Starting);
        Ok(())
    }

    /// Stops the worker's loop.
    ///
    /// From the loop thread this only requests the stop and returns immediately. From
    /// any other thread it blocks until `at_end` has run and the worker has exited.
    /// Stopping an already stopped thread is a no-op returning `true`.
    ///
    /// # Panics
    ///
    /// Panics if the thread was never run.
    pub fn stop(&self) -> bool {
        if self.is_loop_thread() {
            if let Some(handle) = self.handle() {
                handle.stop();
            }
            return true;
        }

        let join_handle = {
            let mut control = lock(&self.control);
            if control.state > ThreadState::Running {
                return true;
            }
            validate_state_change(&mut control.state, ThreadState::Stopping);
            control.join_handle.take()
        };

        if let Some(handle) = self.handle() {
            handle.stop();
        }
        self.liveness.wait_while(Phase::Running);
        reap(join_handle);

        validate_state_change(&mut lock(&self.control).state, ThreadState::Stopped);
        true
    }

    /// Waits for the worker thread to exit.
    ///
    /// Returns `false` without blocking if the thread never ran or if called from the
    /// loop thread itself (which would deadlock).
    pub fn join(&self) -> bool {
        if self.is_loop_thread() {
            error!("join() called from the run loop's own thread");
            return false;
        }

        let join_handle = {
            let mut control = lock(&self.control);
            match control.state {
                ThreadState::Allocated => return false,
                ThreadState::Stopping | ThreadState::Stopped => return true,
                ThreadState::Running => control.join_handle.take(),
            }
        };

        reap(join_handle);

        let mut control = lock(&self.control);
        if control.state == ThreadState::Running {
            validate_state_change(&mut control.state, ThreadState::Stopped);
        }
        true
    }

    /// Forwards an event to the worker's loop. Returns `false` when it is not running.
    pub fn send_event(&self, event: Event) -> bool {
        self.handle().is_some_and(|handle| handle.send_event(event))
    }

    fn is_loop_thread(&self) -> bool {
        lock(&self.liveness.status).thread == Some(thread::current().id())
    }
}

impl Default for RunLoopThread {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RunLoopThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunLoopThread").field("state", &self.state()).finish_non_exhaustive()
    }
}

fn thread_main(liveness: &Arc<Liveness>, callbacks: Callbacks) {
    let _exit = ExitGuard(Arc::clone(liveness));
    let Callbacks { at_start, at_end, on_event } = callbacks;

    let mut run_loop = RunLoop::new();
    run_loop.init();
    if let Some(on_event) = on_event {
        run_loop.set_callbacks(on_event);
    }
    liveness.publish(|status| {
        status.thread = Some(thread::current().id());
        status.handle = run_loop.handle();
    });

    if let Some(at_start) = at_start {
        at_start();
    }
    liveness.publish(|status| status.phase = Phase::Running);
    trace!("run loop thread started");

    run_loop.run();

    if let Some(at_end) = at_end {
        at_end();
    }
    run_loop.shutdown();
    trace!("run loop thread finished");
}

fn reap(join_handle: Option<JoinHandle<()>>) {
    if let Some(join_handle) = join_handle
        && join_handle.join().is_err()
    {
        error!("run loop thread panicked");
    }
}

fn validate_state_change(state: &mut ThreadState, next: ThreadState) {
    use ThreadState::*;

    match (*state, next) {
        (Allocated, Running) | (Running, Stopping | Stopped) | (Stopping, Stopped) => {}
        (Allocated, Stopping | Stopped) => panic!("stopping runloopthread that hasn't been started"),
        (Allocated, _) => panic!("internal error: runloopthread expecting run() call"),
        (Running, Running) => panic!("attempted double run of runloopthread"),
        (Running, _) => panic!("internal error: running runloopthread expected stop()"),
        (Stopping | Stopped, Running) => panic!("attempted re-run of runloopthread"),
        (Stopping, Stopping) => panic!("double stop() of runloopthread"),
        (_, _) => panic!("unexpected use of stopped runloopthread"),
    }
    *state = next;
}
