//! Blocking transactions on a private run loop thread.

use std::fmt;
use std::sync::{Arc, Mutex};

use http::Request;
use micro_runloop::RunLoopThread;
use tracing::{debug, warn};

use crate::backend::{Backend, default_backend};
use crate::config::ClientConfig;
use crate::listener::{Listener, ResponseCollector};
use crate::protocol::{Body, Response, ResponseHeader};
use crate::transaction::{Registry, Transaction};
use crate::utils::lock;

/// How a [`SyncTransaction`] ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalStatus {
    Ok,
    TimedOut,
    Cancelled,
    Error(String),
}

impl FinalStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, FinalStatus::Ok)
    }
}

impl fmt::Display for FinalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinalStatus::Ok => f.write_str("ok"),
            FinalStatus::TimedOut => f.write_str("timed out"),
            FinalStatus::Cancelled => f.write_str("cancelled"),
            FinalStatus::Error(message) => write!(f, "error: {message}"),
        }
    }
}

#[derive(Default)]
struct Execution {
    thread: Option<Arc<RunLoopThread>>,
    status: Option<FinalStatus>,
    response: Option<Response>,
}

/// Runs one [`Transaction`] to completion and blocks the caller meanwhile.
///
/// [`execute`](Self::execute) spins up a [`RunLoopThread`], creates and initiates the
/// transaction on it with itself attached as the listener, and returns once a terminal
/// callback has stopped that thread. The handle is reference counted because the
/// listener it attaches must outlive the hop onto the private thread.
///
/// ```no_run
/// use micro_http_client::{FinalStatus, SyncTransaction};
///
/// let request = http::Request::get("http://127.0.0.1:8080/simple").body(Default::default()).unwrap();
/// let transaction = SyncTransaction::alloc(request);
/// transaction.set_timeout_sec(5.0);
///
/// let (response, status) = transaction.execute();
/// assert_eq!(status, FinalStatus::Ok);
/// println!("{}", String::from_utf8_lossy(response.body()));
/// ```
pub struct SyncTransaction {
    request: Mutex<Option<Request<Body>>>,
    config: Mutex<ClientConfig>,
    registry: Arc<Registry>,
    backend: Arc<dyn Backend>,
    execution: Mutex<Execution>,
}

impl SyncTransaction {
    pub fn alloc(request: Request<Body>) -> Arc<Self> {
        Self::alloc_with_parts(request, Registry::global(), default_backend())
    }

    pub fn alloc_with_parts(request: Request<Body>, registry: Arc<Registry>, backend: Arc<dyn Backend>) -> Arc<Self> {
        Arc::new(Self {
            request: Mutex::new(Some(request)),
            config: Mutex::new(ClientConfig::default()),
            registry,
            backend,
            execution: Mutex::new(Execution::default()),
        })
    }

    pub fn set_config(&self, config: ClientConfig) {
        *lock(&self.config) = config;
    }

    pub fn set_timeout_sec(&self, secs: f64) {
        if !lock(&self.config).set_timeout_sec(secs) {
            warn!(secs, "invalid timeout ignored");
        }
    }

    pub fn set_user_agent<S: Into<String>>(&self, user_agent: S) {
        lock(&self.config).user_agent = user_agent.into();
    }

    pub fn set_follow_redirects(&self, follow_redirects: bool) {
        lock(&self.config).follow_redirects = follow_redirects;
    }

    /// Performs the request, blocking until it ends.
    ///
    /// The response holds whatever was received, also when the status is not
    /// [`FinalStatus::Ok`]. A sync transaction runs once; later calls report an error.
    pub fn execute(self: &Arc<Self>) -> (Response, FinalStatus) {
        let Some(request) = lock(&self.request).take() else {
            return (Response::default(), FinalStatus::Error("transaction already executed".to_string()));
        };
        let config = lock(&self.config).clone();

        let thread = Arc::new(RunLoopThread::new());
        lock(&self.execution).thread = Some(Arc::clone(&thread));

        let slot: Arc<Mutex<Option<Transaction>>> = Arc::default();
        let at_start = {
            let this = Arc::clone(self);
            let slot = Arc::clone(&slot);
            move || this.start(request, config, &slot)
        };
        let at_end = move || {
            let transaction = lock(&slot).take();
            drop(transaction);
        };
        thread.set_callbacks(at_start, at_end, |_| {});

        if let Err(e) = thread.run() {
            lock(&self.execution).thread = None;
            return (Response::default(), FinalStatus::Error(format!("can't start transaction thread: {e}")));
        }
        thread.join();

        let mut execution = lock(&self.execution);
        execution.thread = None;
        let status = execution.status.take().unwrap_or_else(|| FinalStatus::Error("transaction ended without an outcome".to_string()));
        let response = execution.response.take().unwrap_or_default();
        debug!(%status, http_status = %response.status(), "sync transaction finished");
        (response, status)
    }

    /// Runs on the private thread, whose run loop is initialized but not yet running.
    fn start(self: &Arc<Self>, request: Request<Body>, config: ClientConfig, slot: &Mutex<Option<Transaction>>) {
        let mut transaction = Transaction::with_parts(request, Arc::clone(&self.registry), Arc::clone(&self.backend));
        transaction.set_config(config);

        let listener = Attached { owner: Arc::clone(self), collector: ResponseCollector::new() };
        match transaction.initiate(listener) {
            Ok(()) => *lock(slot) = Some(transaction),
            Err(e) => self.conclude(FinalStatus::Error(e.to_string()), None),
        }
    }

    /// Records the outcome and stops the private thread; only the first call counts.
    fn conclude(&self, status: FinalStatus, response: Option<Response>) {
        let thread = {
            let mut execution = lock(&self.execution);
            if execution.status.is_some() {
                return;
            }
            execution.status = Some(status);
            execution.response = response;
            execution.thread.clone()
        };
        if let Some(thread) = thread {
            thread.stop();
        }
    }
}

impl fmt::Debug for SyncTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncTransaction").field("config", &*lock(&self.config)).finish_non_exhaustive()
    }
}

/// The listener a [`SyncTransaction`] attaches to its transaction.
struct Attached {
    owner: Arc<SyncTransaction>,
    collector: ResponseCollector,
}

impl Attached {
    fn conclude(&mut self, status: FinalStatus) {
        let collector = std::mem::take(&mut self.collector);
        self.owner.conclude(status, Some(collector.into_response()));
    }
}

impl Listener for Attached {
    fn on_response_status(&mut self, head: &ResponseHeader) {
        self.collector.on_response_status(head);
    }

    fn on_response_body_bytes(&mut self, bytes: &[u8]) {
        self.collector.on_response_body_bytes(bytes);
    }

    fn on_closed(&mut self) {
        self.conclude(FinalStatus::Ok);
    }

    fn on_timeout(&mut self) {
        self.conclude(FinalStatus::TimedOut);
    }

    fn on_cancel(&mut self) {
        self.conclude(FinalStatus::Cancelled);
    }

    fn on_error(&mut self, message: &str) {
        self.conclude(FinalStatus::Error(message.to_string()));
    }
}
