//! Plain HTTP/1.1 over tokio sockets.
//!
//! Each [`Session`] owns a connection task on a shared multi threaded runtime. The
//! session turns every step into a command for that task; the task runs it to
//! completion, parks the outcome in a slot and notifies the transaction, which then
//! polls the same step again and collects the outcome. One command is in flight at a
//! time.

use std::fmt;
use std::io;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use http::Uri;
use once_cell::sync::Lazy;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::runtime::{Builder, Runtime};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace};

use crate::backend::{Backend, Notifier, Session, Step};
use crate::codec::{RequestEncoder, ResponseDecoder};
use crate::protocol::{Message, PayloadItem, PayloadSize, RequestHeader, ResponseHeader};
use crate::utils::lock;

const READ_CAPACITY: usize = 8 * 1024;

static IO_RUNTIME: Lazy<io::Result<Runtime>> = Lazy::new(|| {
    Builder::new_multi_thread().worker_threads(2).thread_name("micro-http-io").enable_all().build()
});

/// The default [`Backend`]: one TCP connection per session, no TLS.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioBackend;

impl TokioBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Backend for TokioBackend {
    fn open(&self, url: &Uri, notifier: Notifier) -> Box<dyn Session> {
        Box::new(TokioSession::new(url.clone(), notifier))
    }
}

enum Command {
    Connect,
    Send(RequestHeader, PayloadSize),
    Write(Bytes),
    End,
    ReceiveHeaders,
    Read,
}

enum Outcome {
    Done,
    Head(ResponseHeader, PayloadSize),
    Body(Option<Bytes>),
    Failed(String),
}

type Slot = Arc<Mutex<Option<Outcome>>>;

struct TokioSession {
    url: Uri,
    notifier: Notifier,
    commands: Option<UnboundedSender<Command>>,
    task: Option<JoinHandle<()>>,
    slot: Slot,
    in_flight: bool,
    prepared: Option<(RequestHeader, PayloadSize)>,
    announced_body: bool,
}

impl TokioSession {
    fn new(url: Uri, notifier: Notifier) -> Self {
        Self {
            url,
            notifier,
            commands: None,
            task: None,
            slot: Arc::new(Mutex::new(None)),
            in_flight: false,
            prepared: None,
            announced_body: false,
        }
    }

    fn start(&mut self) -> Result<&UnboundedSender<Command>, String> {
        if self.task.is_none() {
            let runtime = IO_RUNTIME.as_ref().map_err(|e| format!("io runtime unavailable: {e}"))?;
            let (sender, receiver) = mpsc::unbounded_channel();
            let task = runtime.spawn(drive(self.url.clone(), receiver, Arc::clone(&self.slot), self.notifier.clone()));
            self.commands = Some(sender);
            self.task = Some(task);
        }
        self.commands.as_ref().ok_or_else(|| "session is closed".to_string())
    }

    /// Starts `command` unless one is already running; completes once its outcome is parked.
    fn poll(&mut self, command: impl FnOnce() -> Command) -> Step<Outcome> {
        if self.in_flight {
            return self.collect();
        }
        self.begin(command())
    }

    fn collect(&mut self) -> Step<Outcome> {
        match lock(&self.slot).take() {
            Some(outcome) => {
                self.in_flight = false;
                Step::Complete(outcome)
            }
            None => Step::Pending,
        }
    }

    fn begin(&mut self, command: Command) -> Step<Outcome> {
        let sent = match self.start() {
            Ok(commands) => commands.send(command).is_ok(),
            Err(reason) => return Step::Failed(reason),
        };
        if !sent {
            return Step::failed("connection task has ended");
        }
        self.in_flight = true;
        Step::Pending
    }
}

fn settle<T>(step: Step<Outcome>, accept: impl FnOnce(Outcome) -> Option<T>) -> Step<T> {
    match step {
        Step::Complete(Outcome::Failed(reason)) => Step::Failed(reason),
        Step::Complete(outcome) => match accept(outcome) {
            Some(value) => Step::Complete(value),
            None => Step::failed("unexpected connection outcome"),
        },
        Step::Pending => Step::Pending,
        Step::Failed(reason) => Step::Failed(reason),
    }
}

fn done(outcome: Outcome) -> Option<()> {
    matches!(outcome, Outcome::Done).then_some(())
}

impl Session for TokioSession {
    fn connect(&mut self) -> Step<()> {
        let step = self.poll(|| Command::Connect);
        settle(step, done)
    }

    fn open_request(&mut self, head: RequestHeader, payload_size: PayloadSize) -> Step<()> {
        self.announced_body = matches!(payload_size, PayloadSize::Length(_));
        self.prepared = Some((head, payload_size));
        Step::Complete(())
    }

    fn send_request(&mut self) -> Step<()> {
        if self.in_flight {
            return settle(self.collect(), done);
        }
        let Some((head, payload_size)) = self.prepared.take() else {
            return Step::failed("request was not opened");
        };
        settle(self.begin(Command::Send(head, payload_size)), done)
    }

    fn write_body(&mut self, chunk: Bytes) -> Step<()> {
        let step = self.poll(|| Command::Write(chunk));
        settle(step, done)
    }

    fn end_request(&mut self) -> Step<()> {
        if !self.announced_body {
            return Step::Complete(());
        }
        let step = self.poll(|| Command::End);
        settle(step, done)
    }

    fn receive_headers(&mut self) -> Step<(ResponseHeader, PayloadSize)> {
        let step = self.poll(|| Command::ReceiveHeaders);
        settle(step, |outcome| match outcome {
            Outcome::Head(head, size) => Some((head, size)),
            _ => None,
        })
    }

    fn read_body(&mut self) -> Step<Option<Bytes>> {
        let step = self.poll(|| Command::Read);
        settle(step, |outcome| match outcome {
            Outcome::Body(chunk) => Some(chunk),
            _ => None,
        })
    }

    fn close(&mut self) {
        self.commands = None;
        if let Some(task) = self.task.take() {
            task.abort();
            trace!(url = %self.url, "connection task aborted");
        }
        self.in_flight = false;
    }
}

impl Drop for TokioSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for TokioSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioSession").field("url", &self.url).field("in_flight", &self.in_flight).finish_non_exhaustive()
    }
}

struct Connection {
    reader: FramedRead<OwnedReadHalf, ResponseDecoder>,
    writer: FramedWrite<OwnedWriteHalf, RequestEncoder>,
}

async fn drive(url: Uri, mut commands: UnboundedReceiver<Command>, slot: Slot, notifier: Notifier) {
    let mut connection = None;
    while let Some(command) = commands.recv().await {
        let outcome = execute(&url, &mut connection, command).await.unwrap_or_else(Outcome::Failed);
        let failed = matches!(outcome, Outcome::Failed(_));
        if let Outcome::Failed(reason) = &outcome {
            debug!(url = %url, reason = %reason, "connection step failed");
        }

        *lock(&slot) = Some(outcome);
        notifier.notify();
        if failed {
            break;
        }
    }
}

async fn execute(url: &Uri, connection: &mut Option<Connection>, command: Command) -> Result<Outcome, String> {
    if let Command::Connect = command {
        *connection = Some(connect(url).await?);
        return Ok(Outcome::Done);
    }

    let Some(Connection { reader, writer }) = connection.as_mut() else {
        return Err("not connected".into());
    };

    match command {
        Command::Connect => Ok(Outcome::Done),

        Command::Send(head, payload_size) => {
            *reader.decoder_mut() = ResponseDecoder::new(head.expects_empty_response());
            writer.send(Message::Header((head, payload_size))).await.map_err(|e| format!("can't send request: {e}"))?;
            Ok(Outcome::Done)
        }

        Command::Write(chunk) => {
            writer.send(Message::from(chunk)).await.map_err(|e| format!("can't send request body: {e}"))?;
            Ok(Outcome::Done)
        }

        Command::End => {
            writer.send(Message::Payload(PayloadItem::Eof)).await.map_err(|e| format!("can't finish request body: {e}"))?;
            Ok(Outcome::Done)
        }

        Command::ReceiveHeaders => match reader.next().await {
            Some(Ok(Message::Header((head, payload_size)))) => {
                trace!(status = %head.status(), ?payload_size, "response head received");
                Ok(Outcome::Head(head, payload_size))
            }
            Some(Ok(Message::Payload(_))) => Err("response payload before its head".into()),
            Some(Err(e)) => Err(format!("can't read response head: {e}")),
            None => Err("connection closed before a response arrived".into()),
        },

        Command::Read => match reader.next().await {
            Some(Ok(Message::Payload(PayloadItem::Chunk(bytes)))) => Ok(Outcome::Body(Some(bytes))),
            Some(Ok(Message::Payload(PayloadItem::Eof))) => Ok(Outcome::Body(None)),
            Some(Ok(Message::Header(_))) => Err("unexpected second response head".into()),
            Some(Err(e)) => Err(format!("can't read response body: {e}")),
            None => Err("connection closed inside the response body".into()),
        },
    }
}

async fn connect(url: &Uri) -> Result<Connection, String> {
    match url.scheme_str() {
        Some("http") | None => {}
        Some(scheme) => return Err(format!("unsupported url scheme: {scheme}")),
    }
    let host = url.host().ok_or_else(|| format!("url has no host: {url}"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let port = url.port_u16().unwrap_or(80);

    let stream = TcpStream::connect((host, port)).await.map_err(|e| format!("can't connect to {host}:{port}: {e}"))?;
    stream.set_nodelay(true).map_err(|e| format!("can't configure socket: {e}"))?;
    trace!(host, port, "connected");

    let (reader, writer) = stream.into_split();
    Ok(Connection {
        reader: FramedRead::with_capacity(reader, ResponseDecoder::default(), READ_CAPACITY),
        writer: FramedWrite::new(writer, RequestEncoder::new()),
    })
}
