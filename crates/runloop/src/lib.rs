//! Cooperative single threaded run loops and the primitives built on them.
//!
//! This crate provides the dispatch substrate for callback driven components that must
//! behave as if they were single threaded while the work they wait on completes on
//! threads they do not control.
//!
//! # Components
//!
//! - [`Event`]: an opaque, `Send` payload envelope
//! - [`RunLoop`]: a dispatcher bound to one OS thread, draining a thread safe FIFO of
//!   events and hops; [`RunLoopHandle`] feeds or stops it from anywhere
//! - [`RunLoopThread`]: owns a worker thread running one run loop's whole lifecycle,
//!   with synchronous `run` / `stop` / `join`
//! - [`ThreadHopper`]: lets any thread schedule a closure on a registered home thread
//! - [`Timer`]: a one shot delayed callback delivered on the creating thread
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicU32, Ordering};
//! use micro_runloop::{Event, RunLoopThread};
//!
//! let sum = Arc::new(AtomicU32::new(0));
//! let thread = RunLoopThread::new();
//!
//! let total = Arc::clone(&sum);
//! thread.set_callbacks(
//!     || {},
//!     || {},
//!     move |event: Event| {
//!         if let Some(n) = event.downcast_ref::<u32>() {
//!             total.fetch_add(*n, Ordering::SeqCst);
//!         }
//!     },
//! );
//!
//! thread.run().unwrap();
//! for n in 1..=4_u32 {
//!     thread.send_event(Event::new(n));
//! }
//! thread.stop();
//! thread.join();
//!
//! assert_eq!(sum.load(Ordering::SeqCst), 10);
//! ```

mod error;
mod event;
mod hopper;
mod run_loop;
mod run_loop_thread;
mod timer;
mod utils;

pub use error::RunLoopError;
pub use event::Event;
pub use hopper::{HopSender, ThreadHopper};
pub use run_loop::{RunLoop, RunLoopHandle};
pub use run_loop_thread::{RunLoopThread, ThreadState};
pub use timer::Timer;
