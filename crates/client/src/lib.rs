//! Callback driven asynchronous HTTP transactions.
//!
//! This crate runs HTTP request/response exchanges as state machines bound to a
//! [`micro_runloop`] run loop thread. A [`Transaction`] reports its whole lifecycle
//! (connecting, redirects, send and receive progress, status, body bytes, completion
//! or failure) to a [`Listener`] on the thread that initiated it, while the network
//! work happens elsewhere. [`SyncTransaction`] wraps the same machinery in a blocking
//! call for code that has no run loop of its own.
//!
//! # Layers
//!
//! - [`transaction`]: the state machine, its driver, cancellation and the id keyed
//!   [`Registry`] through which asynchronous completions find their transaction
//! - [`backend`]: the native step abstraction ([`Backend`], [`Session`], [`Step`]) and
//!   the bundled tokio implementation
//! - [`codec`]: HTTP/1.1 request encoding and response decoding used by that backend
//! - [`protocol`]: request, response and body types around the `http` crate
//!
//! # Example
//!
//! ```no_run
//! use micro_http_client::{Listener, ResponseHeader, Transaction};
//! use micro_runloop::{RunLoop, RunLoopHandle};
//!
//! struct Printer {
//!     run_loop: RunLoopHandle,
//! }
//!
//! impl Listener for Printer {
//!     fn on_response_status(&mut self, head: &ResponseHeader) {
//!         println!("status: {}", head.status());
//!     }
//!
//!     fn on_response_body_bytes(&mut self, bytes: &[u8]) {
//!         print!("{}", String::from_utf8_lossy(bytes));
//!     }
//!
//!     fn on_closed(&mut self) {
//!         self.run_loop.stop();
//!     }
//!
//!     fn on_error(&mut self, message: &str) {
//!         eprintln!("failed: {message}");
//!         self.run_loop.stop();
//!     }
//! }
//!
//! let mut run_loop = RunLoop::new();
//! run_loop.init();
//! let handle = run_loop.handle().unwrap();
//!
//! let request = http::Request::get("http://127.0.0.1:8080/simple").body(Default::default()).unwrap();
//! let mut transaction = Transaction::new(request);
//! transaction.set_timeout_sec(10.0);
//! transaction.initiate(Printer { run_loop: handle }).unwrap();
//!
//! run_loop.run();
//! ```

pub mod backend;
pub mod codec;
pub mod protocol;
pub mod transaction;

mod config;
mod listener;
mod sync_transaction;
mod utils;

pub use backend::{Backend, Session, Step, TokioBackend};
pub use config::{ClientConfig, DEFAULT_BUFFER_SIZE, DEFAULT_MAX_REDIRECTS, DEFAULT_TIMEOUT, DEFAULT_USER_AGENT};
pub use listener::{Listener, ResponseCollector};
pub use protocol::{Body, ClientError, Response, ResponseHeader};
pub use sync_transaction::{FinalStatus, SyncTransaction};
pub use transaction::{Canceller, Notifier, Progress, Registry, Transaction, TransactionId};
