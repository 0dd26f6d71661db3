#![allow(dead_code, reason = "each test binary uses a different subset")]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use http::Uri;
use micro_http_client::{Listener, Progress, ResponseHeader};
use micro_runloop::RunLoopHandle;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, warn};

pub const SIMPLE_BODY: &str = "hello world!\n";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().with_max_level(tracing::Level::DEBUG).try_init();
}

/// A small HTTP/1.1 server on an ephemeral port, one response per connection.
///
/// Routes: `/simple`, `/echo[?DelaySec=n]`, `/redirect`, `/redirect-loop`,
/// `/see-other`, `/notfound`, `/binary`, `/chunked`, `/until-close`.
pub struct TestServer {
    addr: SocketAddr,
    _runtime: Runtime,
}

impl TestServer {
    pub fn start() -> Self {
        init_tracing();
        let runtime = Builder::new_multi_thread().worker_threads(2).thread_name("test-server").enable_all().build().unwrap();
        let listener = runtime.block_on(TcpListener::bind("127.0.0.1:0")).unwrap();
        let addr = listener.local_addr().unwrap();

        runtime.spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        tokio::spawn(async move {
                            if let Err(e) = serve(stream).await {
                                warn!(cause = %e, "test server connection failed");
                            }
                        });
                    }
                    Err(e) => warn!(cause = %e, "test server accept failed"),
                }
            }
        });

        Self { addr, _runtime: runtime }
    }

    pub fn url(&self, path_and_query: &str) -> String {
        format!("http://{}{}", self.addr, path_and_query)
    }
}

struct Incoming {
    method: String,
    path: String,
    query: Option<String>,
    content_type: Option<String>,
    user_agent: Option<String>,
    body: Vec<u8>,
}

async fn read_request(stream: &mut TcpStream) -> std::io::Result<Option<Incoming>> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0_u8; 4096];

    let (head_len, mut incoming, content_length) = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut request = httparse::Request::new(&mut headers);
        if let httparse::Status::Complete(head_len) = request.parse(&buf).map_err(std::io::Error::other)? {
            let target = request.path.unwrap_or("/");
            let (path, query) = match target.split_once('?') {
                Some((path, query)) => (path.to_string(), Some(query.to_string())),
                None => (target.to_string(), None),
            };
            let header = |name: &str| {
                request
                    .headers
                    .iter()
                    .find(|header| header.name.eq_ignore_ascii_case(name))
                    .map(|header| String::from_utf8_lossy(header.value).to_string())
            };
            let content_length = header("content-length").and_then(|value| value.parse::<usize>().ok()).unwrap_or(0);
            let incoming = Incoming {
                method: request.method.unwrap_or("GET").to_string(),
                path,
                query,
                content_type: header("content-type"),
                user_agent: header("user-agent"),
                body: Vec::new(),
            };
            break (head_len, incoming, content_length);
        }
    };

    let mut body = buf.split_off(head_len);
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    incoming.body = body;
    Ok(Some(incoming))
}

fn response(status: &str, headers: &[(&str, String)], body: &[u8], head_only: bool) -> Vec<u8> {
    let mut out = format!("HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n", body.len()).into_bytes();
    for (name, value) in headers {
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    if !head_only {
        out.extend_from_slice(body);
    }
    out
}

async fn serve(mut stream: TcpStream) -> std::io::Result<()> {
    let Some(incoming) = read_request(&mut stream).await? else {
        return Ok(());
    };
    debug!(method = %incoming.method, path = %incoming.path, body = incoming.body.len(), "test server request");
    let head_only = incoming.method == "HEAD";
    let text_plain = ("Content-Type", mime::TEXT_PLAIN.to_string());

    let bytes = match incoming.path.as_str() {
        "/simple" => response("200 OK", &[text_plain], SIMPLE_BODY.as_bytes(), head_only),

        "/echo" => {
            let delay = incoming
                .query
                .as_deref()
                .and_then(|query| query.split('&').find_map(|pair| pair.strip_prefix("DelaySec=")))
                .and_then(|secs| secs.parse::<u64>().ok())
                .unwrap_or(0);
            if delay > 0 {
                tokio::time::sleep(Duration::from_secs(delay)).await;
            }
            let content_type = incoming.content_type.unwrap_or_else(|| mime::APPLICATION_OCTET_STREAM.to_string());
            let headers = [
                ("Content-Type", content_type),
                ("X-Echo-Method", incoming.method.clone()),
                ("X-Echo-User-Agent", incoming.user_agent.unwrap_or_default()),
            ];
            response("200 OK", &headers, &incoming.body, head_only)
        }

        "/redirect" => response("302 Found", &[("Location", "/simple".to_string())], b"", head_only),
        "/redirect-loop" => response("302 Found", &[("Location", "/redirect-loop".to_string())], b"", head_only),
        "/see-other" => response("303 See Other", &[("Location", "/echo".to_string())], b"", head_only),
        "/notfound" => response("404 Not Found", &[text_plain], b"not found", head_only),

        "/binary" => {
            let body: Vec<u8> = (0..=255_u8).collect();
            response("200 OK", &[("Content-Type", mime::APPLICATION_OCTET_STREAM.to_string())], &body, head_only)
        }

        "/chunked" => {
            let mut out = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n".to_vec();
            for part in ["Hello", ", ", "chunked world!"] {
                out.extend_from_slice(format!("{:x}\r\n{part}\r\n", part.len()).as_bytes());
            }
            out.extend_from_slice(b"0\r\n\r\n");
            out
        }

        "/until-close" => b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\nread until the server hangs up".to_vec(),

        _ => response("404 Not Found", &[], b"", head_only),
    };

    stream.write_all(&bytes).await?;
    stream.shutdown().await
}

/// Records callbacks as strings and stops a run loop on the terminal one.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<String>>>,
    body: Arc<Mutex<Vec<u8>>>,
    received: Arc<Mutex<Vec<Progress>>>,
    sent: Arc<Mutex<Vec<Progress>>>,
    stopper: Option<RunLoopHandle>,
}

impl Recorder {
    pub fn stopping(handle: Option<RunLoopHandle>) -> Self {
        Self { stopper: handle, ..Self::default() }
    }

    fn push<S: Into<String>>(&self, event: S) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(event.into());
    }

    fn finish<S: Into<String>>(&self, event: S) {
        self.push(event);
        if let Some(stopper) = &self.stopper {
            stopper.stop();
        }
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// The events without the per chunk noise.
    pub fn milestones(&self) -> Vec<String> {
        self.events().into_iter().filter(|event| !event.starts_with("body") && !event.starts_with("progress")).collect()
    }

    pub fn body(&self) -> Vec<u8> {
        self.body.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn received(&self) -> Vec<Progress> {
        self.received.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn sent(&self) -> Vec<Progress> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn terminal_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| {
                matches!(event.as_str(), "closed" | "timeout" | "cancel") || event.starts_with("error")
            })
            .count()
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
        self.push(format!("redirect {}", new_url.path()));
    }

    fn on_request_sent(&mut self) {
        self.push("request_sent");
    }

    fn on_response_status(&mut self, head: &ResponseHeader) {
        self.push(format!("status {}", head.status().as_u16()));
    }

    fn on_response_body_bytes(&mut self, bytes: &[u8]) {
        self.push("body");
        self.body.lock().unwrap_or_else(PoisonError::into_inner).extend_from_slice(bytes);
    }

    fn on_send_progress(&mut self, progress: Progress) {
        self.push("progress");
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).push(progress);
    }

    fn on_receive_progress(&mut self, progress: Progress) {
        self.push("progress");
        self.received.lock().unwrap_or_else(PoisonError::into_inner).push(progress);
    }

    fn on_complete(&mut self) {
        self.push("complete");
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
