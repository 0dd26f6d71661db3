//! The native step abstraction the transaction state machine drives.
//!
//! A [`Backend`] opens one [`Session`] per connection attempt. Every session
//! operation is a *step* that reports [`Step::Complete`], [`Step::Pending`] or
//! [`Step::Failed`]:
//!
//! - `Complete` lets the state machine advance immediately, on the same call stack
//! - `Pending` means the native work was started (or is still running); the backend
//!   calls [`Notifier::notify`] from whatever thread finishes it, and the state
//!   machine re-invokes the same step on its home thread to collect the result
//! - `Failed` ends the transaction with `on_error`
//!
//! Sessions never call listener code and never see the transaction itself, only a
//! [`Notifier`] that carries its id. A notification for a transaction that no longer
//! exists is dropped, so a backend may notify late without any risk.
//!
//! The bundled [`TokioBackend`] speaks plain HTTP/1.1 over tokio sockets.

mod tokio_backend;

use std::sync::Arc;

use bytes::Bytes;
use http::Uri;
use once_cell::sync::Lazy;

use crate::protocol::{PayloadSize, RequestHeader, ResponseHeader};

pub use crate::transaction::Notifier;
pub use tokio_backend::TokioBackend;

/// The result of attempting one native step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step<T> {
    Complete(T),
    Pending,
    Failed(String),
}

impl<T> Step<T> {
    pub fn failed<S: ToString>(reason: S) -> Self {
        Step::Failed(reason.to_string())
    }

    #[inline]
    pub fn is_pending(&self) -> bool {
        matches!(self, Step::Pending)
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Step<U> {
        match self {
            Step::Complete(value) => Step::Complete(f(value)),
            Step::Pending => Step::Pending,
            Step::Failed(reason) => Step::Failed(reason),
        }
    }
}

/// One connection's worth of native HTTP work, owned by the transaction's home thread.
#[cfg_attr(test, mockall::automock)]
pub trait Session: Send {
    /// Resolves the host and establishes the connection.
    fn connect(&mut self) -> Step<()>;

    /// Prepares the request head; `payload_size` announces how the body will be framed.
    fn open_request(&mut self, head: RequestHeader, payload_size: PayloadSize) -> Step<()>;

    /// Puts the request head on the wire.
    fn send_request(&mut self) -> Step<()>;

    /// Writes one body chunk.
    fn write_body(&mut self, chunk: Bytes) -> Step<()>;

    /// Finishes the request body.
    fn end_request(&mut self) -> Step<()>;

    /// Waits for the response status line and headers.
    fn receive_headers(&mut self) -> Step<(ResponseHeader, PayloadSize)>;

    /// Reads the next piece of the response body; `None` once the body is complete.
    fn read_body(&mut self) -> Step<Option<Bytes>>;

    /// Releases every native handle. Nothing is notified afterwards.
    fn close(&mut self);
}

/// Opens sessions for a transaction.
pub trait Backend: Send + Sync {
    fn open(&self, url: &Uri, notifier: Notifier) -> Box<dyn Session>;
}

static DEFAULT_BACKEND: Lazy<Arc<TokioBackend>> = Lazy::new(|| Arc::new(TokioBackend::new()));

/// The process wide tokio backend used when a transaction is not given one.
pub fn default_backend() -> Arc<dyn Backend> {
    Arc::clone(&*DEFAULT_BACKEND) as Arc<dyn Backend>
}
