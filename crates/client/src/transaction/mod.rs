//! Asynchronous HTTP transactions.
//!
//! A [`Transaction`] is bound to the thread that calls [`Transaction::initiate`], its
//! *home thread*, which must run a [`RunLoop`](micro_runloop::RunLoop). All state machine
//! work and every listener callback happens there. Native steps that go pending are
//! resumed through the [`Registry`]: the backend notifies by id, the notification hops
//! to the home thread, and only there is the id resolved to the live transaction.
//!
//! The driver ([`Core::process`]) runs states back to back until one suspends or the
//! transaction ends. Listener notes produced by a state are delivered after the machine
//! lock is released, and the driver rechecks for cancellation and teardown before each
//! one, so a listener may cancel or drop the transaction from inside any callback.

mod machine;
mod progress;
mod registry;

pub use progress::Progress;
pub use registry::{Notifier, Registry, TransactionId};

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, ThreadId};

use http::{Request, Uri};
use micro_runloop::{ThreadHopper, Timer};
use once_cell::sync::OnceCell;
use tracing::{debug, trace, warn};

use crate::backend::{Backend, default_backend};
use crate::config::ClientConfig;
use crate::listener::Listener;
use crate::protocol::{Body, ClientError};
use crate::utils::lock;
use machine::{Advance, Machine, Note, Outcome};

#[derive(Debug)]
enum Terminal {
    Closed,
    TimedOut,
    Cancelled,
    Failed(String),
}

struct Core {
    id: TransactionId,
    registry: Arc<Registry>,
    hopper: OnceCell<ThreadHopper>,
    cancelled: AtomicBool,
    driving: AtomicBool,
    completed: AtomicBool,
    terminated: AtomicBool,
    detached: AtomicBool,
    machine: Mutex<Machine>,
    listener: Mutex<Option<Box<dyn Listener>>>,
}

/// Clears the driving flag however the driver leaves.
struct Driving<'a>(&'a AtomicBool);

impl Drop for Driving<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Core {
    fn home_thread(&self) -> Option<ThreadId> {
        self.hopper.get().and_then(ThreadHopper::home_thread)
    }

    fn is_finished(&self) -> bool {
        self.terminated.load(Ordering::Acquire) || self.detached.load(Ordering::Acquire)
    }

    fn interrupted(&self) -> bool {
        self.is_finished() || self.cancel_pending()
    }

    /// A cancel only counts until `on_complete` has been dispatched.
    fn cancel_pending(&self) -> bool {
        self.cancelled.load(Ordering::Acquire) && !self.completed.load(Ordering::Acquire)
    }

    /// Runs the state machine until it suspends or the transaction ends.
    ///
    /// Re-entrant calls (from a listener callback) return immediately; the running
    /// driver picks up whatever they were meant to trigger.
    fn process(self: &Arc<Self>) {
        if self.driving.swap(true, Ordering::AcqRel) {
            return;
        }
        let _driving = Driving(&self.driving);

        loop {
            if self.is_finished() {
                return;
            }
            if self.cancel_pending() {
                self.finish(Terminal::Cancelled);
                return;
            }

            let mut notes = Vec::new();
            let advance = lock(&self.machine).step(&mut notes);
            if self.deliver_all(notes) {
                continue;
            }

            match advance {
                Advance::Continue => {}
                Advance::Suspend => return,
                Advance::Finished(Outcome::Done) => {
                    self.registry.resume_on_home(self.id, |core| core.finish(Terminal::Closed));
                    return;
                }
                Advance::Finished(Outcome::TimedOut) => {
                    self.finish(Terminal::TimedOut);
                    return;
                }
                Advance::Finished(Outcome::Failed(reason)) => {
                    self.finish(Terminal::Failed(reason));
                    return;
                }
            }
        }
    }

    /// Delivers `notes` in order; returns `true` if a callback cancelled or tore down
    /// the transaction, in which case the remaining notes are dropped.
    fn deliver_all(&self, notes: Vec<Note>) -> bool {
        for note in notes {
            if self.interrupted() {
                return true;
            }
            if let Note::Complete = note {
                self.completed.store(true, Ordering::Release);
            }
            self.with_listener(|listener| dispatch(note, listener));
        }
        self.interrupted()
    }

    fn with_listener(&self, f: impl FnOnce(&mut dyn Listener)) {
        // taken out so the callback runs with no lock held
        let taken = lock(&self.listener).take();
        let Some(mut listener) = taken else {
            trace!(id = self.id, "no listener attached");
            return;
        };

        f(listener.as_mut());

        if !self.detached.load(Ordering::Acquire) {
            let mut slot = lock(&self.listener);
            if slot.is_none() {
                *slot = Some(listener);
            }
        }
    }

    /// Tears down and reports `terminal`. Only the first call has any effect.
    fn finish(&self, terminal: Terminal) {
        if self.detached.load(Ordering::Acquire) || self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        lock(&self.machine).teardown();
        debug!(id = self.id, outcome = ?terminal, "transaction finished");

        self.with_listener(|listener| match terminal {
            Terminal::Closed => listener.on_closed(),
            Terminal::TimedOut => listener.on_timeout(),
            Terminal::Cancelled => listener.on_cancel(),
            Terminal::Failed(reason) => listener.on_error(&reason),
        });
    }

    fn cancel(self: &Arc<Self>) {
        if self.completed.load(Ordering::Acquire) || self.is_finished() {
            trace!(id = self.id, "cancel after completion ignored");
            return;
        }
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(id = self.id, "transaction cancelled");

        match self.home_thread() {
            Some(home) if home == thread::current().id() => self.process(),
            Some(_) => self.registry.resume_on_home(self.id, Core::process),
            // not initiated yet: initiate() reports the cancellation
            None => {}
        }
    }

    fn times_up(self: &Arc<Self>) {
        if self.is_finished() {
            return;
        }
        if lock(&self.machine).time_out() {
            debug!(id = self.id, "transaction timed out");
            self.process();
        }
    }
}

fn dispatch(note: Note, listener: &mut dyn Listener) {
    match note {
        Note::Connecting => listener.on_connecting(),
        Note::Connected => listener.on_connected(),
        Note::Redirect(url) => listener.on_redirect(&url),
        Note::RequestSent => listener.on_request_sent(),
        Note::ResponseStatus(head) => listener.on_response_status(&head),
        Note::SendProgress(progress) => listener.on_send_progress(progress),
        Note::ReceiveProgress(progress) => listener.on_receive_progress(progress),
        Note::BodyBytes(bytes) => listener.on_response_body_bytes(&bytes),
        Note::Complete => listener.on_complete(),
    }
}

/// One asynchronous HTTP request/response exchange.
///
/// Create it, adjust its settings, then [`initiate`](Self::initiate) it on a thread
/// that runs a [`RunLoop`](micro_runloop::RunLoop). Callbacks arrive on that thread
/// while it dispatches. Dropping the transaction detaches it: the connection is closed,
/// the listener is released and no further callback is made.
///
/// ```no_run
/// use micro_http_client::{Listener, Transaction};
/// use micro_runloop::RunLoop;
///
/// struct Print;
///
/// impl Listener for Print {
///     fn on_response_body_bytes(&mut self, bytes: &[u8]) {
///         print!("{}", String::from_utf8_lossy(bytes));
///     }
/// }
///
/// let mut run_loop = RunLoop::new();
/// run_loop.init();
///
/// let request = http::Request::get("http://127.0.0.1:8080/").body(Default::default()).unwrap();
/// let mut transaction = Transaction::new(request);
/// transaction.initiate(Print).unwrap();
/// run_loop.run();
/// ```
pub struct Transaction {
    core: Arc<Core>,
    request: Request<Body>,
}

impl Transaction {
    /// A transaction using the process wide registry and the default tokio backend.
    pub fn new(request: Request<Body>) -> Self {
        Self::with_parts(request, Registry::global(), default_backend())
    }

    pub fn with_parts(request: Request<Body>, registry: Arc<Registry>, backend: Arc<dyn Backend>) -> Self {
        let core = Arc::new_cyclic(|weak| {
            let id = registry.insert(Weak::clone(weak));
            let notifier = Notifier::new(Arc::clone(&registry), id);
            Core {
                id,
                registry: Arc::clone(&registry),
                hopper: OnceCell::new(),
                cancelled: AtomicBool::new(false),
                driving: AtomicBool::new(false),
                completed: AtomicBool::new(false),
                terminated: AtomicBool::new(false),
                detached: AtomicBool::new(false),
                machine: Mutex::new(Machine::new(&request, backend, notifier)),
                listener: Mutex::new(None),
            }
        });
        trace!(id = core.id, method = %request.method(), url = %request.uri(), "transaction created");
        Self { core, request }
    }

    pub fn id(&self) -> TransactionId {
        self.core.id
    }

    /// The request as it was given.
    pub fn request(&self) -> &Request<Body> {
        &self.request
    }

    /// The url currently being fetched; differs from the request's once a redirect
    /// has been followed.
    pub fn url(&self) -> Uri {
        lock(&self.core.machine).uri().clone()
    }

    pub fn config(&self) -> ClientConfig {
        lock(&self.core.machine).config.clone()
    }

    pub fn set_config(&mut self, config: ClientConfig) {
        lock(&self.core.machine).config = config;
    }

    pub fn timeout_sec(&self) -> f64 {
        lock(&self.core.machine).config.timeout_sec()
    }

    /// Bounds how long any single native step may stay pending.
    pub fn set_timeout_sec(&mut self, secs: f64) {
        if !lock(&self.core.machine).config.set_timeout_sec(secs) {
            warn!(id = self.core.id, secs, "invalid timeout ignored");
        }
    }

    pub fn user_agent(&self) -> String {
        lock(&self.core.machine).config.user_agent.clone()
    }

    pub fn set_user_agent<S: Into<String>>(&mut self, user_agent: S) {
        lock(&self.core.machine).config.user_agent = user_agent.into();
    }

    pub fn set_follow_redirects(&mut self, follow_redirects: bool) {
        lock(&self.core.machine).config.follow_redirects = follow_redirects;
    }

    /// A `Send + Sync` handle that can cancel this transaction from any thread.
    pub fn canceller(&self) -> Canceller {
        Canceller { core: Arc::downgrade(&self.core) }
    }

    /// Binds the transaction to the calling thread and starts it.
    ///
    /// The first steps run before this returns, so callbacks such as `on_connecting`,
    /// or `on_error` for a request that can't be sent at all, may already have been
    /// delivered. A transaction cancelled before `initiate` reports `on_cancel` here.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::AlreadyInitiated`] on a second call, and
    /// [`ClientError::RunLoop`] if the calling thread has no initialized run loop.
    pub fn initiate<L: Listener + 'static>(&mut self, listener: L) -> Result<(), ClientError> {
        self.initiate_boxed(Box::new(listener))
    }

    /// [`initiate`](Self::initiate) for an already boxed listener.
    ///
    /// # Errors
    ///
    /// Same as [`initiate`](Self::initiate).
    pub fn initiate_boxed(&mut self, listener: Box<dyn Listener>) -> Result<(), ClientError> {
        let core = &self.core;
        if core.hopper.get().is_some() {
            return Err(ClientError::AlreadyInitiated);
        }

        let mut hopper = ThreadHopper::new();
        hopper.initialize_on_current_thread()?;
        let mut timer = Timer::new()?;
        let weak = Arc::downgrade(core);
        timer.set_listener(move || {
            if let Some(core) = weak.upgrade() {
                core.times_up();
            }
        });

        if let Some(sender) = hopper.sender() {
            core.registry.bind_home(core.id, sender);
        }
        core.hopper.set(hopper).map_err(|_hopper| ClientError::AlreadyInitiated)?;
        lock(&core.machine).timer = Some(timer);
        *lock(&core.listener) = Some(listener);

        debug!(id = core.id, method = %self.request.method(), url = %self.request.uri(), "transaction initiated");
        core.process();
        Ok(())
    }

    /// Stops the transaction; the listener hears `on_cancel` exactly once.
    ///
    /// Ignored once the transaction has completed or ended, and on repeated calls.
    /// Called on the home thread outside any callback, `on_cancel` is delivered before
    /// this returns. Called from inside a callback, it is delivered as soon as that
    /// callback returns. Called from another thread, it is delivered asynchronously on
    /// the home thread.
    pub fn cancel(&self) {
        self.core.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.core.is_finished()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        let core = &self.core;
        if core.home_thread().is_some_and(|home| home != thread::current().id()) {
            warn!(id = core.id, "transaction dropped off its home thread");
        }

        core.registry.remove(core.id);
        core.detached.store(true, Ordering::Release);
        lock(&core.machine).teardown();
        let listener = lock(&core.listener).take();
        drop(listener);
        trace!(id = core.id, "transaction detached");
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.core.id)
            .field("method", self.request.method())
            .field("url", self.request.uri())
            .field("state", &lock(&self.core.machine).state())
            .finish_non_exhaustive()
    }
}

/// Cancels a [`Transaction`] from any thread. Does nothing once it is gone.
#[derive(Clone)]
pub struct Canceller {
    core: Weak<Core>,
}

impl Canceller {
    pub fn cancel(&self) {
        if let Some(core) = self.core.upgrade() {
            core.cancel();
        }
    }
}

impl fmt::Debug for Canceller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Canceller").field("alive", &(self.core.strong_count() > 0)).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockSession, Session, Step};
    use crate::protocol::{PayloadSize, ResponseHeader};
    use bytes::Bytes;
    use http::{Method, StatusCode};
    use micro_runloop::{RunLoop, RunLoopHandle};
    use std::collections::VecDeque;

    #[derive(Default)]
    struct Scripted {
        sessions: Mutex<VecDeque<MockSession>>,
        opened: Mutex<Vec<Uri>>,
        notifiers: Mutex<Vec<Notifier>>,
    }

    impl Scripted {
        fn new(sessions: impl IntoIterator<Item = MockSession>) -> Arc<Self> {
            let scripted = Self::default();
            lock(&scripted.sessions).extend(sessions);
            Arc::new(scripted)
        }

        fn empty() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn opened(&self) -> Vec<String> {
            lock(&self.opened).iter().map(ToString::to_string).collect()
        }

        fn notifier(&self) -> Notifier {
            lock(&self.notifiers).last().cloned().expect("no session opened")
        }
    }

    impl Backend for Scripted {
        fn open(&self, url: &Uri, notifier: Notifier) -> Box<dyn Session> {
            lock(&self.opened).push(url.clone());
            lock(&self.notifiers).push(notifier);
            Box::new(lock(&self.sessions).pop_front().expect("no scripted session left"))
        }
    }

    #[derive(Clone, Default)]
    struct Recorder {
        events: Arc<Mutex<Vec<String>>>,
        stopper: Option<RunLoopHandle>,
        cancel_on_status: Option<Canceller>,
        // raises the cancel flag the way a foreign thread that already passed the
        // completion check would
        late_cancel: Option<Weak<Core>>,
    }

    impl Recorder {
        fn stopping(run_loop: &RunLoop) -> Self {
            Self { stopper: run_loop.handle(), ..Self::default() }
        }

        fn push<S: Into<String>>(&self, event: S) {
            lock(&self.events).push(event.into());
        }

        fn finish<S: Into<String>>(&self, event: S) {
            self.push(event);
            if let Some(stopper) = &self.stopper {
                stopper.stop();
            }
        }

        fn events(&self) -> Vec<String> {
            lock(&self.events).clone()
        }
    }

    impl Listener for Recorder {
        fn on_connecting(&mut self) {
            self.push("connecting");
        }

        fn on_connected(&mut self) {
            self.push("connected");
        }

        fn on_redirect(&mut self, new_url: &Uri) {
            self.push(format!("redirect {new_url}"));
        }

        fn on_request_sent(&mut self) {
            self.push("request_sent");
        }

        fn on_response_status(&mut self, head: &ResponseHeader) {
            self.push(format!("status {}", head.status().as_u16()));
            if let Some(canceller) = &self.cancel_on_status {
                canceller.cancel();
            }
        }

        fn on_response_body_bytes(&mut self, bytes: &[u8]) {
            self.push(format!("body {}", String::from_utf8_lossy(bytes)));
        }

        fn on_send_progress(&mut self, progress: Progress) {
            self.push(format!("send {}", progress.percent));
        }

        fn on_receive_progress(&mut self, progress: Progress) {
            self.push(format!("receive {}", progress.percent));
        }

        fn on_complete(&mut self) {
            self.push("complete");
            if let Some(core) = self.late_cancel.as_ref().and_then(Weak::upgrade) {
                core.cancelled.store(true, Ordering::Release);
            }
        }

        fn on_closed(&mut self) {
            self.finish("closed");
        }

        fn on_timeout(&mut self) {
            self.finish("timeout");
        }

        fn on_cancel(&mut self) {
            self.finish("cancel");
        }

        fn on_error(&mut self, message: &str) {
            self.finish(format!("error {message}"));
        }
    }

    fn response_head(status: u16, location: Option<&str>, length: usize) -> ResponseHeader {
        let mut head = http::Response::new(());
        *head.status_mut() = StatusCode::from_u16(status).unwrap();
        head.headers_mut().insert(http::header::CONTENT_LENGTH, length.into());
        if let Some(location) = location {
            head.headers_mut().insert(http::header::LOCATION, location.parse().unwrap());
        }
        head.into()
    }

    fn prepared_session_with<C>(connect: C) -> MockSession
    where
        C: FnMut() -> Step<()> + Send + 'static,
    {
        let mut session = MockSession::new();
        session.expect_connect().returning(connect);
        session.expect_open_request().returning(|_, _| Step::Complete(()));
        session.expect_send_request().returning(|| Step::Complete(()));
        session.expect_write_body().returning(|_| Step::Complete(()));
        session.expect_end_request().returning(|| Step::Complete(()));
        session.expect_close().return_const(());
        session
    }

    fn prepared_session() -> MockSession {
        prepared_session_with(|| Step::Complete(()))
    }

    fn respond(mut session: MockSession, body: &'static [u8]) -> MockSession {
        session
            .expect_receive_headers()
            .returning(move || Step::Complete((response_head(200, None, body.len()), PayloadSize::Length(body.len() as u64))));
        let mut chunks: VecDeque<_> = [Some(Bytes::from_static(body)), None].into();
        session.expect_read_body().returning(move || Step::Complete(chunks.pop_front().flatten()));
        session
    }

    fn ok_session(body: &'static [u8]) -> MockSession {
        respond(prepared_session(), body)
    }

    fn redirect_session(status: u16, location: &'static str) -> MockSession {
        let mut session = prepared_session();
        session
            .expect_receive_headers()
            .returning(move || Step::Complete((response_head(status, Some(location), 0), PayloadSize::Empty)));
        session
    }

    fn transaction(method: Method, url: &str, body: Body, backend: &Arc<Scripted>) -> Transaction {
        let request = Request::builder().method(method).uri(url).body(body).unwrap();
        Transaction::with_parts(request, Arc::new(Registry::new()), Arc::clone(backend) as Arc<dyn Backend>)
    }

    /// Runs everything queued on the loop, including work queued while draining.
    fn drain(run_loop: &mut RunLoop) {
        for _ in 0..4 {
            run_loop.stop();
            run_loop.run();
        }
    }

    fn setup() -> RunLoop {
        let mut run_loop = RunLoop::new();
        run_loop.init();
        run_loop
    }

    #[test]
    fn test_synchronous_get() {
        let mut run_loop = setup();
        let backend = Scripted::new([ok_session(b"hello")]);
        let recorder = Recorder::default();

        let mut transaction = transaction(Method::GET, "http://example.test/simple", Body::Empty, &backend);
        transaction.initiate(recorder.clone()).unwrap();

        // everything up to on_complete happens inside initiate, on_closed is deferred
        assert_eq!(recorder.events().last().unwrap(), "complete");
        drain(&mut run_loop);

        assert_eq!(
            recorder.events(),
            vec![
                "connecting",
                "connected",
                "request_sent",
                "status 200",
                "receive 0",
                "receive 100",
                "body hello",
                "complete",
                "closed"
            ]
        );
        assert_eq!(backend.opened(), vec!["http://example.test/simple"]);
        assert!(transaction.is_finished());
    }

    #[test]
    fn test_pending_step_resumes_on_notify() {
        let mut run_loop = setup();
        let mut calls = 0;
        let session = prepared_session_with(move || {
            calls += 1;
            if calls == 1 { Step::Pending } else { Step::Complete(()) }
        });
        let backend = Scripted::new([respond(session, b"late")]);
        let recorder = Recorder::default();

        let mut transaction = transaction(Method::GET, "http://example.test/late", Body::Empty, &backend);
        transaction.initiate(recorder.clone()).unwrap();
        assert_eq!(recorder.events(), vec!["connecting"]);

        let notifier = backend.notifier();
        assert_eq!(notifier.transaction_id(), transaction.id());
        std::thread::spawn(move || notifier.notify()).join().unwrap();
        // resumption only happens on the home thread
        assert_eq!(recorder.events(), vec!["connecting"]);

        drain(&mut run_loop);
        let events = recorder.events();
        assert_eq!(events.iter().filter(|event| *event == "connecting").count(), 1);
        assert!(events.contains(&"body late".to_string()));
        assert_eq!(events.last().unwrap(), "closed");
    }

    #[test]
    fn test_spurious_notify_is_harmless() {
        let mut run_loop = setup();
        let session = prepared_session_with(|| Step::Pending);
        let backend = Scripted::new([session]);
        let recorder = Recorder::default();

        let mut transaction = transaction(Method::GET, "http://example.test/", Body::Empty, &backend);
        transaction.initiate(recorder.clone()).unwrap();

        let notifier = backend.notifier();
        notifier.notify();
        notifier.notify();
        drain(&mut run_loop);

        assert_eq!(recorder.events(), vec!["connecting"]);
        assert!(!transaction.is_finished());
    }

    #[test]
    fn test_timeout() {
        let mut run_loop = setup();
        let backend = Scripted::new([prepared_session_with(|| Step::Pending)]);
        let recorder = Recorder::stopping(&run_loop);

        let mut transaction = transaction(Method::GET, "http://example.test/slow", Body::Empty, &backend);
        transaction.set_timeout_sec(0.05);
        assert!((transaction.timeout_sec() - 0.05).abs() < 1e-9);
        transaction.initiate(recorder.clone()).unwrap();
        run_loop.run();

        assert_eq!(recorder.events(), vec!["connecting", "timeout"]);
        transaction.cancel();
        drain(&mut run_loop);
        assert_eq!(recorder.events(), vec!["connecting", "timeout"]);
    }

    #[test]
    fn test_connect_failure() {
        let _run_loop = setup();
        let backend = Scripted::new([prepared_session_with(|| Step::failed("connection refused"))]);
        let recorder = Recorder::default();

        let mut transaction = transaction(Method::GET, "http://example.test/", Body::Empty, &backend);
        transaction.initiate(recorder.clone()).unwrap();

        assert_eq!(recorder.events(), vec!["connecting", "error connection refused"]);
    }

    #[test]
    fn test_unsupported_method() {
        let _run_loop = setup();
        let backend = Scripted::empty();
        let recorder = Recorder::default();

        let mut transaction = transaction(Method::PATCH, "http://example.test/", Body::Empty, &backend);
        transaction.initiate(recorder.clone()).unwrap();

        assert_eq!(recorder.events(), vec!["error unsupported method: PATCH"]);
        assert!(backend.opened().is_empty());
    }

    #[test]
    fn test_initiate_twice() {
        let _run_loop = setup();
        let backend = Scripted::new([prepared_session_with(|| Step::Pending)]);

        let mut transaction = transaction(Method::GET, "http://example.test/", Body::Empty, &backend);
        transaction.initiate(Recorder::default()).unwrap();
        assert!(matches!(transaction.initiate(Recorder::default()), Err(ClientError::AlreadyInitiated)));
    }

    #[test]
    fn test_initiate_without_run_loop() {
        let backend = Scripted::empty();
        let mut transaction = transaction(Method::GET, "http://example.test/", Body::Empty, &backend);
        assert!(matches!(transaction.initiate(Recorder::default()), Err(ClientError::RunLoop { .. })));
    }

    #[test]
    fn test_cancel_inside_status_callback() {
        let mut run_loop = setup();
        let backend = Scripted::new([ok_session(b"never seen")]);

        let mut transaction = transaction(Method::GET, "http://example.test/", Body::Empty, &backend);
        let recorder = Recorder { cancel_on_status: Some(transaction.canceller()), ..Recorder::default() };
        transaction.initiate(recorder.clone()).unwrap();
        drain(&mut run_loop);

        assert_eq!(recorder.events(), vec!["connecting", "connected", "request_sent", "status 200", "cancel"]);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let mut run_loop = setup();
        let backend = Scripted::new([prepared_session_with(|| Step::Pending)]);
        let recorder = Recorder::default();

        let mut transaction = transaction(Method::GET, "http://example.test/", Body::Empty, &backend);
        transaction.initiate(recorder.clone()).unwrap();

        transaction.cancel();
        assert_eq!(recorder.events(), vec!["connecting", "cancel"]);
        transaction.cancel();
        transaction.canceller().cancel();
        drain(&mut run_loop);
        assert_eq!(recorder.events(), vec!["connecting", "cancel"]);
    }

    #[test]
    fn test_cancel_before_initiate() {
        let _run_loop = setup();
        let backend = Scripted::empty();
        let recorder = Recorder::default();

        let mut transaction = transaction(Method::GET, "http://example.test/", Body::Empty, &backend);
        transaction.cancel();
        transaction.initiate(recorder.clone()).unwrap();

        assert_eq!(recorder.events(), vec!["cancel"]);
        assert!(backend.opened().is_empty());
    }

    #[test]
    fn test_cancel_from_another_thread() {
        let mut run_loop = setup();
        let backend = Scripted::new([prepared_session_with(|| Step::Pending)]);
        let recorder = Recorder::stopping(&run_loop);

        let mut transaction = transaction(Method::GET, "http://example.test/", Body::Empty, &backend);
        transaction.initiate(recorder.clone()).unwrap();

        let canceller = transaction.canceller();
        std::thread::spawn(move || canceller.cancel()).join().unwrap();
        assert_eq!(recorder.events(), vec!["connecting"]);

        run_loop.run();
        assert_eq!(recorder.events(), vec!["connecting", "cancel"]);
    }

    #[test]
    fn test_cancel_after_complete_is_ignored() {
        let mut run_loop = setup();
        let backend = Scripted::new([ok_session(b"done")]);
        let recorder = Recorder::default();

        let mut transaction = transaction(Method::GET, "http://example.test/", Body::Empty, &backend);
        transaction.initiate(recorder.clone()).unwrap();
        transaction.cancel();
        drain(&mut run_loop);

        let events = recorder.events();
        assert!(!events.contains(&"cancel".to_string()));
        assert_eq!(events.last().unwrap(), "closed");
    }

    #[test]
    fn test_cancel_racing_completion_is_ignored() {
        let mut run_loop = setup();
        let backend = Scripted::new([ok_session(b"done")]);

        let mut transaction = transaction(Method::GET, "http://example.test/", Body::Empty, &backend);
        let recorder = Recorder { late_cancel: Some(Arc::downgrade(&transaction.core)), ..Recorder::default() };
        transaction.initiate(recorder.clone()).unwrap();
        drain(&mut run_loop);

        let events = recorder.events();
        assert!(!events.contains(&"cancel".to_string()));
        assert_eq!(&events[events.len() - 2..], ["complete", "closed"]);
    }

    #[test]
    fn test_pending_receive_steps_resume() {
        let mut run_loop = setup();
        let mut session = prepared_session();
        let mut header_calls = 0;
        session.expect_receive_headers().returning(move || {
            header_calls += 1;
            if header_calls == 1 {
                Step::Pending
            } else {
                Step::Complete((response_head(200, None, 4), PayloadSize::Length(4)))
            }
        });
        let mut reads: VecDeque<_> =
            [Step::Pending, Step::Complete(Some(Bytes::from_static(b"slow"))), Step::Pending, Step::Complete(None)].into();
        session.expect_read_body().returning(move || reads.pop_front().unwrap_or(Step::Complete(None)));
        let backend = Scripted::new([session]);
        let recorder = Recorder::default();

        let mut transaction = transaction(Method::GET, "http://example.test/slow", Body::Empty, &backend);
        transaction.initiate(recorder.clone()).unwrap();
        assert_eq!(recorder.events(), vec!["connecting", "connected"]);

        let notifier = backend.notifier();
        notifier.notify();
        drain(&mut run_loop);
        assert_eq!(recorder.events().last().unwrap(), "status 200");

        notifier.notify();
        drain(&mut run_loop);
        assert_eq!(recorder.events().last().unwrap(), "body slow");

        notifier.notify();
        drain(&mut run_loop);
        let events = recorder.events();
        assert_eq!(&events[events.len() - 5..], ["receive 0", "receive 100", "body slow", "complete", "closed"]);
        assert!(transaction.is_finished());
    }

    #[test]
    fn test_drop_detaches() {
        let mut run_loop = setup();
        let backend = Scripted::new([prepared_session_with(|| Step::Pending)]);
        let recorder = Recorder::default();
        let registry = Arc::new(Registry::new());

        let request = Request::get("http://example.test/").body(Body::Empty).unwrap();
        let mut transaction = Transaction::with_parts(request, Arc::clone(&registry), Arc::clone(&backend) as Arc<dyn Backend>);
        transaction.initiate(recorder.clone()).unwrap();
        let canceller = transaction.canceller();
        assert_eq!(registry.len(), 1);

        drop(transaction);
        assert!(registry.is_empty());

        backend.notifier().notify();
        canceller.cancel();
        drain(&mut run_loop);
        assert_eq!(recorder.events(), vec!["connecting"]);
    }

    #[test]
    fn test_redirect_post_becomes_get() {
        let mut run_loop = setup();
        let first = {
            let mut session = MockSession::new();
            session.expect_connect().returning(|| Step::Complete(()));
            session
                .expect_open_request()
                .withf(|head, size| *head.method() == Method::POST && *size == PayloadSize::Length(3))
                .returning(|_, _| Step::Complete(()));
            session.expect_send_request().returning(|| Step::Complete(()));
            session.expect_write_body().times(1).returning(|_| Step::Complete(()));
            session.expect_end_request().returning(|| Step::Complete(()));
            session
                .expect_receive_headers()
                .returning(|| Step::Complete((response_head(303, Some("/landing"), 0), PayloadSize::Empty)));
            session.expect_close().times(1).return_const(());
            session
        };
        let second = {
            let mut session = MockSession::new();
            session.expect_connect().returning(|| Step::Complete(()));
            session
                .expect_open_request()
                .withf(|head, size| *head.method() == Method::GET && *size == PayloadSize::Empty)
                .returning(|_, _| Step::Complete(()));
            session.expect_send_request().returning(|| Step::Complete(()));
            session.expect_close().return_const(());
            respond(session, b"landed")
        };
        let backend = Scripted::new([first, second]);
        let recorder = Recorder::default();

        let mut transaction = transaction(Method::POST, "http://example.test/form", Body::from("a=1"), &backend);
        transaction.initiate(recorder.clone()).unwrap();
        drain(&mut run_loop);

        assert_eq!(backend.opened(), vec!["http://example.test/form", "http://example.test/landing"]);
        let events = recorder.events();
        assert!(events.contains(&"redirect http://example.test/landing".to_string()));
        assert_eq!(events.iter().filter(|event| *event == "connecting").count(), 2);
        assert!(events.contains(&"body landed".to_string()));
        assert_eq!(events.last().unwrap(), "closed");
        assert_eq!(transaction.url(), "http://example.test/landing");
        assert_eq!(transaction.request().uri(), "http://example.test/form");
    }

    #[test]
    fn test_too_many_redirects() {
        let _run_loop = setup();
        let backend = Scripted::new([redirect_session(302, "/again"), redirect_session(302, "/again")]);
        let recorder = Recorder::default();

        let mut transaction = transaction(Method::GET, "http://example.test/loop", Body::Empty, &backend);
        transaction.set_config(ClientConfig::default().with_max_redirects(1));
        transaction.initiate(recorder.clone()).unwrap();

        let events = recorder.events();
        assert_eq!(backend.opened().len(), 2);
        assert!(events.last().unwrap().starts_with("error too many redirects"));
    }

    #[test]
    fn test_redirects_not_followed() {
        let mut run_loop = setup();
        let mut session = redirect_session(302, "/elsewhere");
        session.expect_read_body().returning(|| Step::Complete(None));
        let backend = Scripted::new([session]);
        let recorder = Recorder::default();

        let mut transaction = transaction(Method::GET, "http://example.test/", Body::Empty, &backend);
        transaction.set_follow_redirects(false);
        transaction.initiate(recorder.clone()).unwrap();
        drain(&mut run_loop);

        let events = recorder.events();
        assert!(events.contains(&"status 302".to_string()));
        assert_eq!(events.last().unwrap(), "closed");
    }

    #[test]
    fn test_send_progress() {
        let mut run_loop = setup();
        let backend = Scripted::new([ok_session(b"")]);
        let recorder = Recorder::default();

        let body = Body::from(vec![b'x'; 64 * 1024]);
        let mut transaction = transaction(Method::PUT, "http://example.test/upload", body, &backend);
        transaction.set_config(ClientConfig::default().with_buffer_size(16 * 1024));
        transaction.initiate(recorder.clone()).unwrap();
        drain(&mut run_loop);

        let sent: Vec<_> = recorder.events().into_iter().filter(|event| event.starts_with("send ")).collect();
        assert_eq!(sent, vec!["send 0", "send 25", "send 50", "send 75", "send 100"]);

        let received: Vec<_> = recorder.events().into_iter().filter(|event| event.starts_with("receive ")).collect();
        assert_eq!(received, vec!["receive 0", "receive 100"]);
    }
}
