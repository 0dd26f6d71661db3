//! The transaction state machine.
//!
//! [`Machine::step`] runs one state and reports how the driver should continue. It
//! never calls listener code: everything a listener must hear about is pushed as a
//! [`Note`] and delivered by the driver after the machine lock is released.

use bytes::Bytes;
use http::header::{self, HeaderValue};
use http::{HeaderMap, Method, Request, StatusCode, Uri, Version};
use micro_runloop::Timer;
use std::sync::Arc;
use tracing::{debug, trace};
use url::Url;

use super::Notifier;
use super::progress::{Progress, ProgressTracker};
use crate::backend::{Backend, Session, Step};
use crate::config::ClientConfig;
use crate::protocol::{Body, PayloadSize, RequestHeader, ResponseHeader, Upload};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum TranState {
    Connect,
    OpenRequest,
    SendRequest,
    SendRequestWithBody,
    PostGetData,
    PostSendData,
    PostComplete,
    ReceiveHeaders,
    ReceiveData,
    WriteData,
    Done,
    TimedOut,
    Error,
}

/// Something the listener must be told, in order.
#[derive(Debug)]
pub(super) enum Note {
    Connecting,
    Connected,
    Redirect(Uri),
    RequestSent,
    ResponseStatus(ResponseHeader),
    SendProgress(Progress),
    ReceiveProgress(Progress),
    BodyBytes(Bytes),
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum Outcome {
    Done,
    TimedOut,
    Failed(String),
}

#[derive(Debug, PartialEq, Eq)]
pub(super) enum Advance {
    /// Run the next state right away.
    Continue,
    /// A native step is pending; wait for a notification or the timer.
    Suspend,
    Finished(Outcome),
}

pub(super) fn is_supported(method: &Method) -> bool {
    [Method::GET, Method::HEAD, Method::POST, Method::PUT, Method::TRACE, Method::OPTIONS, Method::DELETE].contains(method)
}

/// Settles a native step inside [`Machine::step`]: yields the value, or returns the
/// suspension / failure from the enclosing function.
macro_rules! ready {
    ($machine:ident, $step:expr) => {{
        let step = $step;
        match $machine.settle(step) {
            Ok(Some(value)) => value,
            Ok(None) => return Advance::Suspend,
            Err(reason) => return $machine.fail(reason),
        }
    }};
}

pub(super) struct Machine {
    state: TranState,
    entered: bool,
    pub(super) config: ClientConfig,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
    backend: Arc<dyn Backend>,
    notifier: Notifier,
    session: Option<Box<dyn Session>>,
    pub(super) timer: Option<Timer>,
    waiting: bool,
    prepared: Option<(RequestHeader, PayloadSize)>,
    upload: Option<Upload>,
    chunk_to_post: Option<Bytes>,
    received: Option<Option<Bytes>>,
    send_progress: ProgressTracker,
    receive_progress: ProgressTracker,
    redirects: usize,
}

impl Machine {
    pub(super) fn new(request: &Request<Body>, backend: Arc<dyn Backend>, notifier: Notifier) -> Self {
        Self {
            state: TranState::Connect,
            entered: false,
            config: ClientConfig::default(),
            method: request.method().clone(),
            uri: request.uri().clone(),
            headers: request.headers().clone(),
            body: request.body().clone(),
            backend,
            notifier,
            session: None,
            timer: None,
            waiting: false,
            prepared: None,
            upload: None,
            chunk_to_post: None,
            received: None,
            send_progress: ProgressTracker::default(),
            receive_progress: ProgressTracker::default(),
            redirects: 0,
        }
    }

    pub(super) fn state(&self) -> TranState {
        self.state
    }

    /// The url currently being fetched, which changes when a redirect is followed.
    pub(super) fn uri(&self) -> &Uri {
        &self.uri
    }

    pub(super) fn step(&mut self, notes: &mut Vec<Note>) -> Advance {
        trace!(state = ?self.state, "step");
        match self.state {
            TranState::Connect => {
                if !self.entered {
                    if !is_supported(&self.method) {
                        return self.fail(format!("unsupported method: {}", self.method));
                    }
                    if self.uri.host().is_none() {
                        return self.fail(format!("invalid url: {}", self.uri));
                    }
                    self.entered = true;
                    notes.push(Note::Connecting);
                    self.session = Some(self.backend.open(&self.uri, self.notifier.clone()));
                }
                ready!(self, self.with_session(|session| session.connect()));
                self.goto(TranState::OpenRequest)
            }

            TranState::OpenRequest => {
                if !self.entered {
                    self.entered = true;
                    match self.prepare() {
                        Ok(prepared) => self.prepared = Some(prepared),
                        Err(reason) => return self.fail(reason),
                    }
                }
                let Some((head, payload_size)) = self.prepared.clone() else {
                    return self.fail("request head was not prepared".to_string());
                };
                ready!(self, self.with_session(|session| session.open_request(head, payload_size)));
                let next = if self.upload.is_some() { TranState::SendRequestWithBody } else { TranState::SendRequest };
                self.prepared = None;
                self.goto(next)
            }

            TranState::SendRequest | TranState::SendRequestWithBody => {
                if !self.entered {
                    self.entered = true;
                    notes.push(Note::Connected);
                }
                ready!(self, self.with_session(|session| session.send_request()));
                if self.state == TranState::SendRequest {
                    self.goto(TranState::ReceiveHeaders)
                } else {
                    self.goto(TranState::PostGetData)
                }
            }

            TranState::PostGetData => {
                notes.extend(self.send_progress.reports().into_iter().flatten().map(Note::SendProgress));
                let buffer_size = self.config.buffer_size;
                let next_chunk = self.upload.as_mut().map_or(Ok(None), |upload| upload.next_chunk(buffer_size));
                match next_chunk {
                    Ok(chunk) => self.chunk_to_post = chunk,
                    Err(e) => return self.fail(format!("can't read request body: {e}")),
                }
                self.goto(TranState::PostSendData)
            }

            TranState::PostSendData => {
                let Some(chunk) = self.chunk_to_post.clone() else {
                    return self.goto(TranState::PostComplete);
                };
                let sent = chunk.len() as u64;
                ready!(self, self.with_session(|session| session.write_body(chunk)));
                self.chunk_to_post = None;
                self.send_progress.add(sent);
                self.goto(TranState::PostGetData)
            }

            TranState::PostComplete => {
                ready!(self, self.with_session(|session| session.end_request()));
                self.upload = None;
                self.goto(TranState::ReceiveHeaders)
            }

            TranState::ReceiveHeaders => {
                let (head, payload_size) = ready!(self, self.with_session(|session| session.receive_headers()));
                if let Some(location) = self.redirect_location(&head) {
                    return self.follow_redirect(head.status(), &location, notes);
                }

                debug!(status = %head.status(), ?payload_size, url = %self.uri, "response head received");
                self.receive_progress.expect(payload_size.known_length());
                notes.push(Note::RequestSent);
                notes.push(Note::ResponseStatus(head));
                self.goto(TranState::ReceiveData)
            }

            TranState::ReceiveData => {
                let chunk = ready!(self, self.with_session(|session| session.read_body()));
                self.received = Some(chunk);
                self.goto(TranState::WriteData)
            }

            TranState::WriteData => match self.received.take().flatten() {
                Some(bytes) => {
                    self.receive_progress.add(bytes.len() as u64);
                    notes.extend(self.receive_progress.reports().into_iter().flatten().map(Note::ReceiveProgress));
                    notes.push(Note::BodyBytes(bytes));
                    self.goto(TranState::ReceiveData)
                }
                None => {
                    notes.extend(self.receive_progress.reports().into_iter().flatten().map(Note::ReceiveProgress));
                    notes.push(Note::Complete);
                    self.state = TranState::Done;
                    Advance::Finished(Outcome::Done)
                }
            },

            TranState::Done => Advance::Finished(Outcome::Done),
            TranState::TimedOut => Advance::Finished(Outcome::TimedOut),
            TranState::Error => Advance::Finished(Outcome::Failed("transaction already failed".to_string())),
        }
    }

    /// Moves to `TimedOut` unless the machine already reached a terminal state.
    pub(super) fn time_out(&mut self) -> bool {
        if matches!(self.state, TranState::Done | TranState::TimedOut | TranState::Error) {
            return false;
        }
        self.state = TranState::TimedOut;
        self.waiting = false;
        true
    }

    /// Releases the session and disarms the timer.
    pub(super) fn teardown(&mut self) {
        self.close_session();
        if let Some(timer) = self.timer.as_mut() {
            timer.cancel();
        }
        self.waiting = false;
        self.upload = None;
        self.chunk_to_post = None;
    }

    fn goto(&mut self, state: TranState) -> Advance {
        self.state = state;
        self.entered = false;
        Advance::Continue
    }

    fn fail(&mut self, reason: String) -> Advance {
        debug!(state = ?self.state, reason = %reason, "transaction failed");
        self.state = TranState::Error;
        Advance::Finished(Outcome::Failed(reason))
    }

    fn with_session<T>(&mut self, f: impl FnOnce(&mut dyn Session) -> Step<T>) -> Step<T> {
        match self.session.as_deref_mut() {
            Some(session) => f(session),
            None => Step::failed("session is closed"),
        }
    }

    fn close_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close();
        }
    }

    /// `Ok(Some(_))` when the step completed, `Ok(None)` when it went pending.
    fn settle<T>(&mut self, step: Step<T>) -> Result<Option<T>, String> {
        match step {
            Step::Complete(value) => {
                self.stop_waiting();
                Ok(Some(value))
            }
            Step::Pending => {
                self.start_waiting()?;
                Ok(None)
            }
            Step::Failed(reason) => {
                self.stop_waiting();
                Err(reason)
            }
        }
    }

    fn start_waiting(&mut self) -> Result<(), String> {
        if self.waiting {
            return Ok(());
        }
        let msec = u64::try_from(self.config.timeout.as_millis()).unwrap_or(u64::MAX);
        if let Some(timer) = self.timer.as_mut() {
            timer.set_msec(msec).map_err(|e| format!("can't arm timeout: {e}"))?;
        }
        self.waiting = true;
        Ok(())
    }

    fn stop_waiting(&mut self) {
        if self.waiting {
            if let Some(timer) = self.timer.as_mut() {
                timer.cancel();
            }
            self.waiting = false;
        }
    }

    fn prepare(&mut self) -> Result<(RequestHeader, PayloadSize), String> {
        let sends_body = matches!(self.method, Method::POST | Method::PUT) || !self.body.is_empty();
        let payload_size = if sends_body {
            let (upload, total) = Upload::open(&self.body).map_err(|e| format!("can't read request body: {e}"))?;
            self.upload = Some(upload);
            self.send_progress.expect(Some(total));
            self.send_progress.restart();
            PayloadSize::Length(total)
        } else {
            PayloadSize::Empty
        };

        let mut head = Request::new(());
        *head.method_mut() = self.method.clone();
        *head.uri_mut() = self.uri.clone();
        *head.version_mut() = Version::HTTP_11;
        *head.headers_mut() = self.headers.clone();

        let headers = head.headers_mut();
        if !headers.contains_key(header::HOST) {
            let authority = self.uri.authority().map_or("", |authority| authority.as_str());
            let host = HeaderValue::from_str(authority).map_err(|e| format!("invalid host {authority}: {e}"))?;
            headers.insert(header::HOST, host);
        }
        if !headers.contains_key(header::USER_AGENT) {
            let user_agent = HeaderValue::from_str(&self.config.user_agent).map_err(|e| format!("invalid user agent: {e}"))?;
            headers.insert(header::USER_AGENT, user_agent);
        }
        headers.insert(header::CONNECTION, HeaderValue::from_static("close"));

        Ok((RequestHeader::from(head), payload_size))
    }

    fn redirect_location(&self, head: &ResponseHeader) -> Option<String> {
        let redirect = matches!(
            head.status(),
            StatusCode::MOVED_PERMANENTLY
                | StatusCode::FOUND
                | StatusCode::SEE_OTHER
                | StatusCode::TEMPORARY_REDIRECT
                | StatusCode::PERMANENT_REDIRECT
        );
        if !(self.config.follow_redirects && redirect) {
            return None;
        }
        head.location().map(str::to_string)
    }

    fn follow_redirect(&mut self, status: StatusCode, location: &str, notes: &mut Vec<Note>) -> Advance {
        if self.redirects >= self.config.max_redirects {
            return self.fail(format!("too many redirects (limit {})", self.config.max_redirects));
        }
        let next = match resolve(&self.uri, location) {
            Ok(next) => next,
            Err(reason) => return self.fail(reason),
        };
        self.redirects += 1;
        debug!(%status, from = %self.uri, to = %next, "following redirect");

        let to_get = status == StatusCode::SEE_OTHER
            || (matches!(status, StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND) && self.method == Method::POST);
        if to_get {
            self.method = Method::GET;
            self.body = Body::Empty;
            self.headers.remove(header::CONTENT_TYPE);
            self.headers.remove(header::CONTENT_LENGTH);
        }
        if next.authority() != self.uri.authority() {
            self.headers.remove(header::HOST);
        }

        self.close_session();
        self.upload = None;
        self.uri = next.clone();
        notes.push(Note::Redirect(next));
        self.goto(TranState::Connect)
    }
}

/// Resolves a possibly relative `Location` against the url that produced it.
fn resolve(base: &Uri, location: &str) -> Result<Uri, String> {
    let base = Url::parse(&base.to_string()).map_err(|e| format!("invalid url {base}: {e}"))?;
    let next = base.join(location).map_err(|e| format!("invalid redirect location {location}: {e}"))?;
    Uri::try_from(next.as_str()).map_err(|e| format!("invalid redirect location {next}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supported_methods() {
        for method in [Method::GET, Method::HEAD, Method::POST, Method::PUT, Method::TRACE, Method::OPTIONS, Method::DELETE] {
            assert!(is_supported(&method), "{method}");
        }
        assert!(!is_supported(&Method::PATCH));
        assert!(!is_supported(&Method::CONNECT));
    }

    #[test]
    fn test_resolve_location() {
        let base: Uri = "http://127.0.0.1:8080/a/b?x=1".parse().unwrap();
        assert_eq!(resolve(&base, "/simple").unwrap(), "http://127.0.0.1:8080/simple");
        assert_eq!(resolve(&base, "c").unwrap(), "http://127.0.0.1:8080/a/c");
        assert_eq!(resolve(&base, "http://example.com/z").unwrap(), "http://example.com/z");
    }
}
